// SPDX-License-Identifier: MIT OR Apache-2.0

//! `filter`: drops items failing a predicate.
//!
//! On the plain path a rejected item costs one extra `request(1)` upstream.
//! When the upstream calls `try_on_next` the rejection is reported through
//! the return value instead, so no replacement is requested. Fused, the
//! predicate runs inside `poll`, skipping rejected items.

use super::Flowable;
use crate::core::error::{FlowError, FlowResult};
use crate::core::operator::FuseableBase;
use crate::core::protocol::{
    ConditionalSubscriber, FusionMode, Publisher, QueueSubscription, Subscriber, SubscriberRef,
    Subscription, Upstream,
};
use std::sync::{Arc, Weak};

type Predicate<T> = Arc<dyn Fn(&T) -> FlowResult<bool> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flowable<T> {
        self.try_filter(move |v| Ok(predicate(v)))
    }

    /// Like [`filter`](Self::filter); an `Err` cancels upstream and fails the flow
    pub fn try_filter(
        &self,
        predicate: impl Fn(&T) -> FlowResult<bool> + Send + Sync + 'static,
    ) -> Flowable<T> {
        Flowable::new(FilterPublisher {
            source: self.clone(),
            predicate: Arc::new(predicate),
        })
    }
}

struct FilterPublisher<T> {
    source: Flowable<T>,
    predicate: Predicate<T>,
}

impl<T: Send + 'static> Publisher<T> for FilterPublisher<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let filter = Arc::new_cyclic(|this| FilterSubscriber {
            this: this.clone(),
            base: FuseableBase::new(subscriber),
            predicate: Arc::clone(&self.predicate),
        });
        self.source.subscribe(SubscriberRef::Conditional(filter));
    }
}

struct FilterSubscriber<T> {
    this: Weak<FilterSubscriber<T>>,
    base: FuseableBase<T, T>,
    predicate: Predicate<T>,
}

impl<T: Send + 'static> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.base.on_subscribe(subscription) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.base.downstream().on_subscribe(Upstream::Queue(this));
        }
    }

    fn on_next(&self, item: T) {
        if !self.try_on_next(item) {
            self.base.request(1);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.base.on_error(error);
    }

    fn on_complete(&self) {
        self.base.on_complete();
    }

    fn on_available(&self) {
        self.base.downstream().on_available();
    }
}

impl<T: Send + 'static> ConditionalSubscriber<T> for FilterSubscriber<T> {
    fn try_on_next(&self, item: T) -> bool {
        if self.base.is_done() {
            return false;
        }
        match (self.predicate)(&item) {
            Ok(true) => self.base.downstream().try_on_next(item),
            Ok(false) => false,
            Err(e) => {
                self.base.fail(e);
                true
            }
        }
    }
}

impl<T: Send + 'static> Subscription for FilterSubscriber<T> {
    fn request(&self, n: i64) {
        self.base.request(n);
    }

    fn cancel(&self) {
        self.base.cancel();
    }
}

impl<T: Send + 'static> QueueSubscription<T> for FilterSubscriber<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        self.base.transitive_boundary_fusion(mode)
    }

    fn poll(&self) -> FlowResult<Option<T>> {
        let async_mode = self.base.source_mode() == FusionMode::ASYNC;
        loop {
            let Some(item) = self.base.poll_upstream()? else {
                return Ok(None);
            };
            if (self.predicate)(&item)? {
                return Ok(Some(item));
            }
            if async_mode {
                self.base.request(1);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.base.upstream_is_empty()
    }

    fn clear(&self) {
        self.base.clear_upstream();
    }
}
