// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-item timeout.
//!
//! Every item restarts a timer on a worker. When the timer fires before the
//! next signal the upstream is cancelled and the flow either fails with
//! [`FlowError::Timeout`] or switches to a fallback source. Outstanding
//! demand moves to the fallback through a [`SubscriptionArbiter`].
//!
//! Items and timers race on an index: an item advances it, a timer only
//! fires if the index is still the one it was started for. `u64::MAX`
//! marks the terminated state.

use super::Flowable;
use crate::core::disposable::{Disposable, DisposableSlot};
use crate::core::error::{self, FlowError};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream};
use crate::core::scheduler::{SchedulerRef, WorkerRef};
use crate::core::subscription::{SubscriptionArbiter, SubscriptionSlot};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const TERMINATED: u64 = u64::MAX;

impl<T: Send + 'static> Flowable<T> {
    /// Fail with a `Timeout` error when an item takes longer than `timeout`
    pub fn timeout(&self, timeout: Duration, scheduler: SchedulerRef) -> Flowable<T> {
        self.timeout_inner(timeout, scheduler, None)
    }

    /// Switch to `fallback` when an item takes longer than `timeout`
    pub fn timeout_with_fallback(
        &self,
        timeout: Duration,
        scheduler: SchedulerRef,
        fallback: Flowable<T>,
    ) -> Flowable<T> {
        self.timeout_inner(timeout, scheduler, Some(fallback))
    }

    fn timeout_inner(
        &self,
        timeout: Duration,
        scheduler: SchedulerRef,
        fallback: Option<Flowable<T>>,
    ) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let parent = Arc::new_cyclic(|this| TimeoutSubscriber {
                this: this.clone(),
                downstream: subscriber,
                worker: scheduler.create_worker(),
                timeout,
                fallback: fallback.clone(),
                main: SubscriptionSlot::new(),
                arbiter: Arc::new(SubscriptionArbiter::new(false)),
                timer: DisposableSlot::new(),
                index: AtomicU64::new(0),
                consumed: AtomicI64::new(0),
            });
            parent
                .downstream
                .on_subscribe(Upstream::Plain(parent.clone()));
            parent.start_timer(0);
            source.subscribe(SubscriberRef::Plain(parent));
        })
    }
}

struct TimeoutSubscriber<T> {
    this: Weak<TimeoutSubscriber<T>>,
    downstream: SubscriberRef<T>,
    worker: WorkerRef,
    timeout: Duration,
    fallback: Option<Flowable<T>>,
    main: SubscriptionSlot<T>,
    arbiter: Arc<SubscriptionArbiter<T>>,
    timer: DisposableSlot,
    index: AtomicU64,
    /// Items delivered by the main source, settled with the arbiter on switch
    consumed: AtomicI64,
}

impl<T: Send + 'static> TimeoutSubscriber<T> {
    fn start_timer(&self, index: u64) {
        let this = self.this.clone();
        let handle = self.worker.schedule_after(
            Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.on_timeout(index);
                }
            }),
            self.timeout,
        );
        self.timer.set(handle);
    }

    fn on_timeout(&self, index: u64) {
        if self
            .index
            .compare_exchange(index, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.main.cancel();
        match &self.fallback {
            None => {
                log::debug!("Flow timed out after {:?}", self.timeout);
                self.downstream.on_error(FlowError::timeout(self.timeout));
                self.worker.dispose();
            }
            Some(fallback) => {
                log::debug!("Flow timed out after {:?}, switching to fallback", self.timeout);
                self.arbiter
                    .produced(self.consumed.swap(0, Ordering::AcqRel));
                self.worker.dispose();
                fallback.subscribe(SubscriberRef::Plain(Arc::new(FallbackSubscriber {
                    downstream: self.downstream.clone(),
                    arbiter: Arc::clone(&self.arbiter),
                })));
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for TimeoutSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.main.set_once(subscription.clone()) {
            self.arbiter.set_subscription(subscription);
        }
    }

    fn on_next(&self, item: T) {
        let index = self.index.load(Ordering::Acquire);
        if index == TERMINATED
            || self
                .index
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        if let Some(timer) = self.timer.get() {
            timer.dispose();
        }
        self.consumed.fetch_add(1, Ordering::AcqRel);
        self.downstream.on_next(item);
        self.start_timer(index + 1);
    }

    fn on_error(&self, error: FlowError) {
        if self.index.swap(TERMINATED, Ordering::AcqRel) == TERMINATED {
            error::on_error(error);
            return;
        }
        self.timer.dispose();
        self.downstream.on_error(error);
        self.worker.dispose();
    }

    fn on_complete(&self) {
        if self.index.swap(TERMINATED, Ordering::AcqRel) != TERMINATED {
            self.timer.dispose();
            self.downstream.on_complete();
            self.worker.dispose();
        }
    }
}

impl<T: Send + 'static> Subscription for TimeoutSubscriber<T> {
    fn request(&self, n: i64) {
        self.arbiter.request(n);
    }

    fn cancel(&self) {
        self.index.store(TERMINATED, Ordering::Release);
        self.arbiter.cancel();
        self.main.cancel();
        self.worker.dispose();
    }
}

struct FallbackSubscriber<T> {
    downstream: SubscriberRef<T>,
    arbiter: Arc<SubscriptionArbiter<T>>,
}

impl<T: Send + 'static> Subscriber<T> for FallbackSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        self.arbiter.set_subscription(subscription);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::TestScheduler;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::{check_double_on_subscribe, ErrorCapture};
    use serial_test::serial;
    use std::sync::Mutex;

    type Captured = Arc<Mutex<Option<SubscriberRef<i32>>>>;

    fn manual() -> (Flowable<i32>, Captured, Arc<BooleanSubscription>) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let upstream = Arc::new(BooleanSubscription::new());
        let (c, u) = (Arc::clone(&captured), Arc::clone(&upstream));
        let flow = Flowable::from_subscribe_fn(move |s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::Plain(u.clone()));
            *c.lock().unwrap() = Some(s);
        });
        (flow, captured, upstream)
    }

    fn emit(captured: &Captured, value: i32) {
        captured.lock().unwrap().clone().unwrap().on_next(value);
    }

    #[test]
    fn test_timeout_between_items() {
        let scheduler = TestScheduler::new();
        let (flow, captured, upstream) = manual();
        let ts = flow
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_millis(500));
        emit(&captured, 1);
        scheduler.advance_time_by(Duration::from_millis(900));
        emit(&captured, 2);
        ts.assert_values(&[1, 2]).assert_not_complete();
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_failure(
            "The source did not signal an event for 1s and has been terminated.",
            &[1, 2],
        );
        assert!(upstream.is_cancelled());
    }

    #[test]
    fn test_timeout_before_first_item() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::<i32>::never()
            .timeout(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_millis(10));
        ts.assert_error_matches(|e| matches!(e, FlowError::Timeout { .. }));
    }

    #[test]
    fn test_completion_stops_timer() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 3)
            .timeout(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_result(&[1, 2, 3]);
    }

    #[test]
    fn test_fallback_takes_over() {
        let scheduler = TestScheduler::new();
        let (flow, captured, upstream) = manual();
        let ts = flow
            .timeout_with_fallback(
                Duration::from_secs(1),
                Arc::new(scheduler.clone()),
                Flowable::range(10, 3),
            )
            .test();
        emit(&captured, 1);
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_result(&[1, 10, 11, 12]);
        assert!(upstream.is_cancelled());
    }

    #[test]
    fn test_fallback_receives_outstanding_demand() {
        let scheduler = TestScheduler::new();
        let (flow, captured, _) = manual();
        let ts = flow
            .timeout_with_fallback(
                Duration::from_secs(1),
                Arc::new(scheduler.clone()),
                Flowable::range(10, 10),
            )
            .test_with_request(5);
        emit(&captured, 1);
        emit(&captured, 2);
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_values(&[1, 2, 10, 11, 12]).assert_not_complete();
    }

    #[test]
    fn test_late_item_after_timeout_is_dropped() {
        let scheduler = TestScheduler::new();
        let (flow, captured, _) = manual();
        let ts = flow
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_secs(1));
        emit(&captured, 1);
        ts.assert_value_count(0);
    }

    #[test]
    #[serial]
    fn test_error_after_timeout_is_undeliverable() {
        let capture = ErrorCapture::install();
        let scheduler = TestScheduler::new();
        let (flow, captured, _) = manual();
        let ts = flow
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_secs(1));
        captured
            .lock()
            .unwrap()
            .clone()
            .unwrap()
            .on_error(FlowError::other("late"));
        ts.assert_error_matches(|e| matches!(e, FlowError::Timeout { .. }));
        capture.assert_undeliverable(0, "late");
    }

    #[test]
    fn test_cancel_disposes_timer() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::<i32>::never()
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        ts.cancel();
        scheduler.advance_time_by(Duration::from_secs(2));
        ts.assert_empty();
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        let scheduler: SchedulerRef = Arc::new(TestScheduler::new());
        check_double_on_subscribe(move |f: Flowable<i32>| {
            f.timeout(Duration::from_secs(1), scheduler)
        });
    }
}
