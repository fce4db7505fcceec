// SPDX-License-Identifier: MIT OR Apache-2.0

//! Side-effect operators: `do_on_next`, `do_on_request`, `do_on_cancel`.

use super::Flowable;
use crate::core::error::{FlowError, FlowResult};
use crate::core::operator::FuseableBase;
use crate::core::subscription::SubscriptionSlot;
use crate::core::protocol::{
    ConditionalSubscriber, FusionMode, Publisher, QueueSubscription, Subscriber, SubscriberRef,
    Subscription, Upstream,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Action<T> = Arc<dyn Fn(&T) + Send + Sync>;
type RequestAction = Arc<dyn Fn(i64) + Send + Sync>;
type CancelAction = Arc<dyn Fn() + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// Run `action` for every item before it moves downstream
    pub fn do_on_next(&self, action: impl Fn(&T) + Send + Sync + 'static) -> Flowable<T> {
        Flowable::new(DoOnNextPublisher {
            source: self.clone(),
            action: Arc::new(action),
        })
    }

    /// Run `action` once when the downstream cancels
    pub fn do_on_cancel(&self, action: impl Fn() + Send + Sync + 'static) -> Flowable<T> {
        self.peek_subscription(None, Some(Arc::new(action)))
    }

    /// Observe every `request(n)` travelling upstream
    pub fn do_on_request(&self, action: impl Fn(i64) + Send + Sync + 'static) -> Flowable<T> {
        self.peek_subscription(Some(Arc::new(action)), None)
    }

    fn peek_subscription(
        &self,
        on_request: Option<RequestAction>,
        on_cancel: Option<CancelAction>,
    ) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let peek = Arc::new_cyclic(|this| SubscriptionPeek {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                on_request: on_request.clone(),
                on_cancel: on_cancel.clone(),
                cancelled: AtomicBool::new(false),
            });
            source.subscribe(SubscriberRef::Plain(peek));
        })
    }
}

struct DoOnNextPublisher<T> {
    source: Flowable<T>,
    action: Action<T>,
}

impl<T: Send + 'static> Publisher<T> for DoOnNextPublisher<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let peek = Arc::new_cyclic(|this| DoOnNextSubscriber {
            this: this.clone(),
            base: FuseableBase::new(subscriber),
            action: Arc::clone(&self.action),
        });
        self.source.subscribe(SubscriberRef::Conditional(peek));
    }
}

struct DoOnNextSubscriber<T> {
    this: Weak<DoOnNextSubscriber<T>>,
    base: FuseableBase<T, T>,
    action: Action<T>,
}

impl<T: Send + 'static> Subscriber<T> for DoOnNextSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.base.on_subscribe(subscription) {
            if let Some(this) = self.this.upgrade() {
                self.base.downstream().on_subscribe(Upstream::Queue(this));
            }
        }
    }

    fn on_next(&self, item: T) {
        if self.base.is_done() {
            return;
        }
        (self.action)(&item);
        self.base.downstream().on_next(item);
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

impl<T: Send + 'static> ConditionalSubscriber<T> for DoOnNextSubscriber<T> {
    fn try_on_next(&self, item: T) -> bool {
        if self.base.is_done() {
            return false;
        }
        (self.action)(&item);
        self.base.downstream().try_on_next(item)
    }
}

impl<T: Send + 'static> Subscription for DoOnNextSubscriber<T> {
    fn request(&self, n: i64) {
        self.base.request(n);
    }

    fn cancel(&self) {
        self.base.cancel();
    }
}

impl<T: Send + 'static> QueueSubscription<T> for DoOnNextSubscriber<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        self.base.transitive_boundary_fusion(mode)
    }

    fn poll(&self) -> FlowResult<Option<T>> {
        let item = self.base.poll_upstream()?;
        if let Some(v) = &item {
            (self.action)(v);
        }
        Ok(item)
    }

    fn is_empty(&self) -> bool {
        self.base.upstream_is_empty()
    }

    fn clear(&self) {
        self.base.clear_upstream();
    }
}

struct SubscriptionPeek<T> {
    this: Weak<SubscriptionPeek<T>>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionSlot<T>,
    on_request: Option<RequestAction>,
    on_cancel: Option<CancelAction>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for SubscriptionPeek<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set_once(subscription) {
            if let Some(this) = self.this.upgrade() {
                self.downstream.on_subscribe(Upstream::Plain(this));
            }
        }
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Subscription for SubscriptionPeek<T> {
    fn request(&self, n: i64) {
        if let Some(action) = &self.on_request {
            action(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(action) = &self.on_cancel {
                action();
            }
            self.upstream.cancel();
        }
    }
}
