// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous sources.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::error::{FlowError, FlowResult};
use crate::core::protocol::{
    FusionMode, Publisher, QueueSubscription, SubscriberRef, Subscription, Upstream, UNBOUNDED,
};
use crate::core::subscription::{
    backpressure, validate, BooleanSubscription, EmptySubscription, ScalarSubscription,
};
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

impl<T: Send + 'static> Flowable<T> {
    /// Emit every item of `items`, honouring backpressure
    ///
    /// Offers `SYNC` fusion when fusion is enabled in [`FlowConfig`].
    pub fn from_iter<C>(items: C) -> Self
    where
        C: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        C::IntoIter: Send + 'static,
    {
        Flowable::new(IterPublisher { items })
    }

    /// Emit `value` once requested, then complete
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let scalar = Arc::new(ScalarSubscription::new(subscriber.clone(), value.clone()));
            subscriber.on_subscribe(Upstream::Queue(scalar));
        })
    }

    pub fn empty() -> Self {
        Flowable::from_subscribe_fn(|subscriber: SubscriberRef<T>| {
            EmptySubscription::complete(&subscriber)
        })
    }

    pub fn error(error: FlowError) -> Self {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            EmptySubscription::error(&subscriber, error.clone())
        })
    }

    /// Never signals anything but the subscription
    pub fn never() -> Self {
        Flowable::from_subscribe_fn(|subscriber: SubscriberRef<T>| {
            subscriber.on_subscribe(Upstream::plain(BooleanSubscription::new()))
        })
    }

    /// Build a fresh source for every subscriber
    pub fn defer(supplier: impl Fn() -> FlowResult<Flowable<T>> + Send + Sync + 'static) -> Self {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| match supplier() {
            Ok(source) => source.subscribe(subscriber),
            Err(e) => EmptySubscription::error(&subscriber, e),
        })
    }
}

impl Flowable<i32> {
    /// Emit `count` consecutive integers starting at `start`
    pub fn range(start: i32, count: i32) -> Self {
        if count < 0 {
            return Flowable::error(FlowError::invalid_parameter(
                "count",
                format!("count >= 0 required but it was {}", count),
            ));
        }
        if i64::from(start) + i64::from(count) - 1 > i64::from(i32::MAX) {
            return Flowable::error(FlowError::invalid_parameter(
                "count",
                "Integer overflow",
            ));
        }
        Flowable::from_iter((0..count).map(move |i| start + i))
    }
}

struct IterPublisher<C> {
    items: C,
}

impl<C> Publisher<C::Item> for IterPublisher<C>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::IntoIter: Send + 'static,
    C::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<C::Item>) {
        let mut iter = self.items.clone().into_iter().peekable();
        if iter.peek().is_none() {
            EmptySubscription::complete(&subscriber);
            return;
        }
        let subscription = Arc::new(IterSubscription {
            downstream: subscriber.clone(),
            iter: Mutex::new(iter),
            requested: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            fuseable: FlowConfig::global().fuse_enabled,
        });
        subscriber.on_subscribe(Upstream::Queue(subscription));
    }
}

/// Emits from an iterator; the drain loop is owned by whoever moved
/// `requested` away from zero
struct IterSubscription<I: Iterator> {
    downstream: SubscriberRef<I::Item>,
    iter: Mutex<Peekable<I>>,
    requested: AtomicI64,
    cancelled: AtomicBool,
    fuseable: bool,
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    /// Next item and whether it was the last one
    fn next(&self) -> Option<(I::Item, bool)> {
        let mut iter = self.iter.lock().ok()?;
        let item = iter.next()?;
        let last = iter.peek().is_none();
        Some((item, last))
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fast_path(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            match self.next() {
                Some((item, last)) => {
                    self.downstream.on_next(item);
                    if last {
                        if !self.is_cancelled() {
                            self.downstream.on_complete();
                        }
                        return;
                    }
                }
                None => {
                    if !self.is_cancelled() {
                        self.downstream.on_complete();
                    }
                    return;
                }
            }
        }
    }

    fn slow_path(&self, mut requested: i64) {
        let mut emitted = 0i64;
        loop {
            while emitted != requested {
                if self.is_cancelled() {
                    return;
                }
                let Some((item, last)) = self.next() else {
                    if !self.is_cancelled() {
                        self.downstream.on_complete();
                    }
                    return;
                };
                if self.downstream.try_on_next(item) {
                    emitted += 1;
                }
                if last {
                    if !self.is_cancelled() {
                        self.downstream.on_complete();
                    }
                    return;
                }
            }

            requested = self.requested.load(Ordering::Acquire);
            if emitted == requested {
                requested = backpressure::produced(&self.requested, emitted);
                if requested == 0 {
                    return;
                }
                emitted = 0;
            }
        }
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    fn request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        if backpressure::add(&self.requested, n) == 0 {
            if n == UNBOUNDED {
                self.fast_path();
            } else {
                self.slow_path(n);
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<I> QueueSubscription<I::Item> for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        if self.fuseable && mode.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> FlowResult<Option<I::Item>> {
        Ok(self.iter.lock().ok().and_then(|mut iter| iter.next()))
    }

    fn is_empty(&self) -> bool {
        self.iter
            .lock()
            .map(|mut iter| iter.peek().is_none())
            .unwrap_or(true)
    }

    fn clear(&self) {
        if let Ok(mut iter) = self.iter.lock() {
            while iter.next().is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::FusionMode;
    use crate::core::testing::{ErrorCapture, TestSubscriber};
    use serial_test::serial;

    #[test]
    fn test_range_backpressured() {
        let ts = Flowable::range(1, 5).test_with_request(2);
        ts.assert_values(&[1, 2]).assert_not_complete();
        ts.request(2);
        ts.assert_values(&[1, 2, 3, 4]).assert_not_complete();
        ts.request(1);
        ts.assert_result(&[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_range_exact_request_completes() {
        Flowable::range(1, 3).test_with_request(3).assert_result(&[1, 2, 3]);
    }

    #[test]
    fn test_range_zero_count_is_empty() {
        Flowable::range(7, 0).test().assert_result(&[]);
    }

    #[test]
    fn test_range_overflow() {
        Flowable::range(i32::MAX, 2)
            .test()
            .assert_failure("Integer overflow", &[]);
    }

    #[test]
    fn test_range_sync_fused() {
        let ts = Flowable::range(1, 4).test_fused(FusionMode::ANY, 0);
        ts.assert_fusion_mode(FusionMode::SYNC).assert_result(&[1, 2, 3, 4]);
    }

    #[test]
    fn test_request_from_on_next_does_not_recurse() {
        let ts = TestSubscriber::<i32>::with_request(1).on_next_hook(|ts, _| ts.request(1));
        Flowable::range(1, 100_000).subscribe(ts.as_subscriber());
        ts.assert_value_count(100_000).assert_complete();
    }

    #[test]
    fn test_cancel_in_on_next_stops_emission() {
        let ts = TestSubscriber::<i32>::new().on_next_hook(|ts, v| {
            if *v == 3 {
                ts.cancel();
            }
        });
        Flowable::range(1, 10).subscribe(ts.as_subscriber());
        ts.assert_values(&[1, 2, 3]).assert_not_complete();
    }

    #[test]
    fn test_just_and_empty() {
        Flowable::just("a").test().assert_result(&["a"]);
        let ts = Flowable::just(1).test_with_request(0);
        ts.assert_empty();
        ts.request(1);
        ts.assert_result(&[1]);
        Flowable::<i32>::empty().test().assert_result(&[]);
        Flowable::<i32>::never().test().assert_empty();
    }

    #[test]
    fn test_error_and_defer() {
        Flowable::<i32>::error(FlowError::other("bad"))
            .test()
            .assert_failure("bad", &[]);
        Flowable::<i32>::defer(|| Err(FlowError::callback("no source")))
            .test()
            .assert_failure("no source", &[]);
        Flowable::defer(|| Ok(Flowable::from_iter(vec![1, 2])))
            .test()
            .assert_result(&[1, 2]);
    }

    #[test]
    #[serial]
    fn test_invalid_request_is_reported() {
        let capture = ErrorCapture::install();
        let ts = Flowable::range(1, 3).test_with_request(0);
        ts.request(-1);
        ts.assert_empty();
        capture.assert_error(0, "n > 0 required but it was -1");
    }
}
