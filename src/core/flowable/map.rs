// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Flowable;
use crate::core::error::{FlowError, FlowResult};
use crate::core::operator::FuseableBase;
use crate::core::protocol::{
    ConditionalSubscriber, FusionMode, Publisher, QueueSubscription, Subscriber, SubscriberRef,
    Subscription, Upstream,
};
use std::sync::{Arc, Weak};

type Mapper<T, R> = Arc<dyn Fn(T) -> FlowResult<R> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// Transform every item
    pub fn map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> Flowable<R> {
        self.try_map(move |v| Ok(mapper(v)))
    }

    /// Transform every item; an `Err` cancels upstream and fails the flow
    pub fn try_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> FlowResult<R> + Send + Sync + 'static,
    ) -> Flowable<R> {
        Flowable::new(MapPublisher {
            source: self.clone(),
            mapper: Arc::new(mapper),
        })
    }
}

struct MapPublisher<T, R> {
    source: Flowable<T>,
    mapper: Mapper<T, R>,
}

impl<T: Send + 'static, R: Send + 'static> Publisher<R> for MapPublisher<T, R> {
    fn subscribe(&self, subscriber: SubscriberRef<R>) {
        let map = Arc::new_cyclic(|this| MapSubscriber {
            this: this.clone(),
            base: FuseableBase::new(subscriber),
            mapper: Arc::clone(&self.mapper),
        });
        self.source.subscribe(SubscriberRef::Conditional(map));
    }
}

struct MapSubscriber<T, R> {
    this: Weak<MapSubscriber<T, R>>,
    base: FuseableBase<T, R>,
    mapper: Mapper<T, R>,
}

impl<T: Send + 'static, R: Send + 'static> MapSubscriber<T, R> {
    fn apply(&self, item: T) -> Result<R, FlowError> {
        (self.mapper)(item)
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for MapSubscriber<T, R> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.base.on_subscribe(subscription) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.base.downstream().on_subscribe(Upstream::Queue(this));
        }
    }

    fn on_next(&self, item: T) {
        if self.base.is_done() {
            return;
        }
        match self.apply(item) {
            Ok(v) => self.base.downstream().on_next(v),
            Err(e) => self.base.fail(e),
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

impl<T: Send + 'static, R: Send + 'static> ConditionalSubscriber<T> for MapSubscriber<T, R> {
    fn try_on_next(&self, item: T) -> bool {
        if self.base.is_done() {
            return true;
        }
        match self.apply(item) {
            Ok(v) => self.base.downstream().try_on_next(v),
            Err(e) => {
                self.base.fail(e);
                true
            }
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscription for MapSubscriber<T, R> {
    fn request(&self, n: i64) {
        self.base.request(n);
    }

    fn cancel(&self) {
        self.base.cancel();
    }
}

impl<T: Send + 'static, R: Send + 'static> QueueSubscription<R> for MapSubscriber<T, R> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        self.base.transitive_boundary_fusion(mode)
    }

    fn poll(&self) -> FlowResult<Option<R>> {
        match self.base.poll_upstream()? {
            Some(v) => self.apply(v).map(Some),
            None => Ok(None),
        }
    }

    fn is_empty(&self) -> bool {
        self.base.upstream_is_empty()
    }

    fn clear(&self) {
        self.base.clear_upstream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::FusionMode;
    use crate::core::testing::{check_double_on_subscribe, ErrorCapture};
    use serial_test::serial;

    #[test]
    fn test_map_values() {
        Flowable::range(1, 3)
            .map(|v| v * 10)
            .test()
            .assert_result(&[10, 20, 30]);
    }

    #[test]
    fn test_mapper_failure_cancels_upstream() {
        let ts = Flowable::range(1, 10)
            .try_map(|v| {
                if v == 3 {
                    Err(FlowError::callback("mapper failed"))
                } else {
                    Ok(v)
                }
            })
            .test();
        ts.assert_failure("mapper failed", &[1, 2]);
    }

    #[test]
    fn test_map_sync_fused() {
        Flowable::range(1, 3)
            .map(|v| v + 1)
            .test_fused(FusionMode::ANY, 0)
            .assert_fusion_mode(FusionMode::SYNC)
            .assert_result(&[2, 3, 4]);
    }

    #[test]
    fn test_map_refuses_boundary_fusion() {
        Flowable::range(1, 3)
            .map(|v| v + 1)
            .test_fused(FusionMode::ANY | FusionMode::BOUNDARY, i64::MAX)
            .assert_fusion_mode(FusionMode::NONE)
            .assert_result(&[2, 3, 4]);
    }

    #[test]
    fn test_fused_poll_failure() {
        Flowable::range(1, 3)
            .try_map(|_| Err::<i32, _>(FlowError::callback("poll failed")))
            .test_fused(FusionMode::SYNC, 0)
            .assert_failure("poll failed", &[]);
    }

    #[test]
    #[serial]
    fn test_error_after_failure_is_undeliverable() {
        let capture = ErrorCapture::install();
        let ts = Flowable::from_subscribe_fn(|s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::plain(crate::core::subscription::BooleanSubscription::new()));
            s.on_next(1);
            s.on_error(FlowError::other("upstream late"));
        })
        .try_map(|_| Err::<i32, _>(FlowError::callback("first")))
        .test();
        ts.assert_failure("first", &[]);
        capture.assert_undeliverable(0, "upstream late");
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        check_double_on_subscribe(|f: Flowable<i32>| f.map(|v| v));
    }
}
