// SPDX-License-Identifier: MIT OR Apache-2.0

//! Clock driven sources: `interval` and `timer`.

use super::Flowable;
use crate::core::disposable::{Disposable, DisposableSlot};
use crate::core::error::FlowError;
use crate::core::protocol::{SubscriberRef, Subscription, Upstream};
use crate::core::scheduler::{schedule_periodic, SchedulerRef, WorkerRef};
use crate::core::subscription::{backpressure, validate, DeferredScalarSubscription};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

impl Flowable<u64> {
    /// Emit `0, 1, 2, ...` every `period`, starting after one `period`
    pub fn interval(period: Duration, scheduler: SchedulerRef) -> Flowable<u64> {
        Self::interval_with(period, period, scheduler)
    }

    /// Emit `0, 1, 2, ...` after `initial`, then every `period`
    ///
    /// A tick without outstanding demand fails the flow with
    /// `MissingBackpressure`.
    pub fn interval_with(
        initial: Duration,
        period: Duration,
        scheduler: SchedulerRef,
    ) -> Flowable<u64> {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<u64>| {
            let worker = scheduler.create_worker();
            let ticker = Arc::new(IntervalSubscription {
                downstream: subscriber,
                worker: Arc::clone(&worker),
                requested: AtomicI64::new(0),
                count: AtomicU64::new(0),
                task: DisposableSlot::new(),
            });
            ticker
                .downstream
                .on_subscribe(Upstream::Plain(ticker.clone()));
            let t = Arc::clone(&ticker);
            let handle = schedule_periodic(&worker, Box::new(move || t.tick()), initial, period);
            ticker.task.replace(handle);
        })
    }

    /// Emit `0` after `delay`, then complete
    pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Flowable<u64> {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<u64>| {
            let timer = Arc::new(TimerSubscription {
                scalar: DeferredScalarSubscription::new(subscriber),
                task: DisposableSlot::new(),
            });
            timer
                .scalar
                .downstream()
                .on_subscribe(Upstream::Plain(timer.clone()));
            let t = Arc::clone(&timer);
            let handle = scheduler.schedule_direct(Box::new(move || t.scalar.complete(0)), delay);
            timer.task.replace(handle);
        })
    }
}

struct IntervalSubscription {
    downstream: SubscriberRef<u64>,
    worker: WorkerRef,
    requested: AtomicI64,
    count: AtomicU64,
    task: DisposableSlot,
}

impl IntervalSubscription {
    fn tick(&self) {
        if self.task.is_disposed() {
            return;
        }
        let count = self.count.load(Ordering::Acquire);
        if self.requested.load(Ordering::Acquire) == 0 {
            self.stop();
            self.downstream.on_error(FlowError::missing_backpressure(format!(
                "Can't deliver value {} due to lack of requests",
                count
            )));
            return;
        }
        self.count.store(count + 1, Ordering::Release);
        self.downstream.on_next(count);
        backpressure::produced(&self.requested, 1);
    }

    fn stop(&self) {
        self.task.dispose();
        self.worker.dispose();
    }
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
        }
    }

    fn cancel(&self) {
        self.stop();
    }
}

struct TimerSubscription {
    scalar: DeferredScalarSubscription<u64>,
    task: DisposableSlot,
}

impl Subscription for TimerSubscription {
    fn request(&self, n: i64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.task.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::TestScheduler;

    #[test]
    fn test_interval_ticks() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::interval(Duration::from_secs(1), Arc::new(scheduler.clone())).test();
        ts.assert_empty();
        scheduler.advance_time_by(Duration::from_secs(3));
        ts.assert_values(&[0, 1, 2]).assert_not_complete();
        ts.cancel();
        scheduler.advance_time_by(Duration::from_secs(3));
        ts.assert_value_count(3);
    }

    #[test]
    fn test_interval_initial_delay() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::interval_with(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Arc::new(scheduler.clone()),
        )
        .test();
        scheduler.advance_time_by(Duration::from_millis(100));
        ts.assert_values(&[0]);
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_values(&[0, 1]);
    }

    #[test]
    fn test_interval_without_demand_fails() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::interval(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test_with_request(1);
        scheduler.advance_time_by(Duration::from_secs(2));
        ts.assert_failure("Can't deliver value 1 due to lack of requests", &[0]);
    }

    #[test]
    fn test_interval_with_take() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::interval(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .take(3)
            .test();
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_result(&[0, 1, 2]);
    }

    #[test]
    fn test_timer() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::timer(Duration::from_secs(5), Arc::new(scheduler.clone())).test();
        scheduler.advance_time_by(Duration::from_secs(4));
        ts.assert_empty();
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_result(&[0]);
    }

    #[test]
    fn test_timer_waits_for_request() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::timer(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test_with_request(0);
        scheduler.advance_time_by(Duration::from_secs(1));
        ts.assert_empty();
        ts.request(1);
        ts.assert_result(&[0]);
    }
}
