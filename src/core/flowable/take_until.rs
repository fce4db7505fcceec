// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Flowable;
use crate::core::error::FlowError;
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED};
use crate::core::subscription::{HalfSerializer, SubscriptionSlot};
use std::sync::{Arc, Weak};

impl<T: Send + 'static> Flowable<T> {
    /// Relay items until `other` emits an item or completes
    ///
    /// Errors from either side terminate the flow; `other` is subscribed
    /// before the main source.
    pub fn take_until<U: Send + 'static>(&self, other: &Flowable<U>) -> Flowable<T> {
        let (source, other) = (self.clone(), other.clone());
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let main = Arc::new_cyclic(|this| TakeUntilMain {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                other: SubscriptionSlot::new(),
                serializer: HalfSerializer::new(),
            });
            if let Some(this) = main.this.upgrade() {
                main.downstream.on_subscribe(Upstream::Plain(this));
            }
            other.subscribe(SubscriberRef::Plain(Arc::new(TakeUntilOther {
                main: Arc::clone(&main),
            })));
            source.subscribe(SubscriberRef::Plain(main));
        })
    }
}

struct TakeUntilMain<T, U> {
    this: Weak<TakeUntilMain<T, U>>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionSlot<T>,
    other: SubscriptionSlot<U>,
    serializer: HalfSerializer,
}

impl<T: Send + 'static, U: Send + 'static> TakeUntilMain<T, U> {
    fn other_fired(&self) {
        self.upstream.cancel();
        self.serializer.on_complete(&self.downstream);
    }

    fn other_failed(&self, error: FlowError) {
        self.upstream.cancel();
        self.serializer.on_error(&self.downstream, error);
    }
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for TakeUntilMain<T, U> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        self.upstream.deferred_set_once(subscription);
    }

    fn on_next(&self, item: T) {
        self.serializer.on_next(&self.downstream, item);
    }

    fn on_error(&self, error: FlowError) {
        self.other.cancel();
        self.serializer.on_error(&self.downstream, error);
    }

    fn on_complete(&self) {
        self.other.cancel();
        self.serializer.on_complete(&self.downstream);
    }
}

impl<T: Send + 'static, U: Send + 'static> Subscription for TakeUntilMain<T, U> {
    fn request(&self, n: i64) {
        self.upstream.deferred_request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.other.cancel();
    }
}

struct TakeUntilOther<T, U> {
    main: Arc<TakeUntilMain<T, U>>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<U> for TakeUntilOther<T, U> {
    fn on_subscribe(&self, subscription: Upstream<U>) {
        if self.main.other.set_once(subscription.clone()) {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, _item: U) {
        self.main.other.cancel();
        self.main.other_fired();
    }

    fn on_error(&self, error: FlowError) {
        self.main.other_failed(error);
    }

    fn on_complete(&self) {
        self.main.other_fired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::{check_double_on_subscribe, race, ErrorCapture, TestSubscriber};
    use serial_test::serial;
    use std::sync::Mutex;

    /// Hand-driven source keeping its subscriber for the test to signal
    struct Manual<T> {
        subscriber: Arc<Mutex<Option<SubscriberRef<T>>>>,
        upstream: Arc<BooleanSubscription>,
    }

    impl<T: Send + 'static> Manual<T> {
        fn new() -> Self {
            Self {
                subscriber: Arc::new(Mutex::new(None)),
                upstream: Arc::new(BooleanSubscription::new()),
            }
        }

        fn flowable(&self) -> Flowable<T> {
            let (slot, upstream) = (Arc::clone(&self.subscriber), Arc::clone(&self.upstream));
            Flowable::from_subscribe_fn(move |s: SubscriberRef<T>| {
                s.on_subscribe(Upstream::Plain(upstream.clone()));
                *slot.lock().unwrap() = Some(s);
            })
        }

        fn get(&self) -> SubscriberRef<T> {
            self.subscriber.lock().unwrap().clone().unwrap()
        }
    }

    #[test]
    fn test_take_until_other_item() {
        let (main, other) = (Manual::<&str>::new(), Manual::<&str>::new());
        let ts = main.flowable().take_until(&other.flowable()).test();
        main.get().on_next("one");
        main.get().on_next("two");
        other.get().on_next("three");
        main.get().on_next("four");
        ts.assert_result(&["one", "two"]);
        assert!(main.upstream.is_cancelled());
        assert!(other.upstream.is_cancelled());
    }

    #[test]
    fn test_take_until_other_completed() {
        let (main, other) = (Manual::<&str>::new(), Manual::<&str>::new());
        let ts = main.flowable().take_until(&other.flowable()).test();
        main.get().on_next("one");
        other.get().on_complete();
        main.get().on_next("two");
        ts.assert_result(&["one"]);
        assert!(main.upstream.is_cancelled());
    }

    #[test]
    fn test_take_until_source_completed() {
        let other = Manual::<i32>::new();
        Flowable::range(1, 3)
            .take_until(&other.flowable())
            .test()
            .assert_result(&[1, 2, 3]);
        assert!(other.upstream.is_cancelled());
    }

    #[test]
    fn test_take_until_errors() {
        Flowable::<i32>::error(FlowError::other("main"))
            .take_until(&Flowable::<i32>::never())
            .test()
            .assert_failure("main", &[]);

        let main = Manual::<i32>::new();
        let ts = main
            .flowable()
            .take_until(&Flowable::<i32>::error(FlowError::other("other")))
            .test();
        ts.assert_failure("other", &[]);
        assert!(main.upstream.is_cancelled());
    }

    #[test]
    fn test_backpressure_passes_through() {
        let ts = Flowable::range(1, 10)
            .take_until(&Flowable::<i32>::never())
            .test_with_request(0);
        ts.assert_empty();
        ts.request(3);
        ts.assert_values(&[1, 2, 3]).assert_not_complete();
        ts.cancel();
    }

    #[test]
    fn test_complete_races_item() {
        for _ in 0..200 {
            let (main, other) = (Manual::<i32>::new(), Manual::<i32>::new());
            let ts = TestSubscriber::new();
            main.flowable()
                .take_until(&other.flowable())
                .subscribe(ts.as_subscriber());
            let (m, o) = (main.get(), other.get());
            race(move || m.on_next(1), move || o.on_complete());
            ts.assert_complete().assert_no_errors();
        }
    }

    #[test]
    #[serial]
    fn test_both_fail_reports_second() {
        let capture = ErrorCapture::install();
        let (main, other) = (Manual::<i32>::new(), Manual::<i32>::new());
        let ts = main.flowable().take_until(&other.flowable()).test();
        other.get().on_error(FlowError::other("first"));
        main.get().on_error(FlowError::other("second"));
        ts.assert_failure("first", &[]);
        capture.assert_error(0, "second");
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        check_double_on_subscribe(|f: Flowable<i32>| f.take_until(&Flowable::<i32>::never()));
    }
}
