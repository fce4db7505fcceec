// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduler-driven and externally terminated [`Single`] operators.

use super::{Single, SingleObserverRef};
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError};
use crate::core::flowable::Flowable;
use crate::core::protocol::{SingleObserver, Subscriber, SubscriberRef, Upstream, UNBOUNDED};
use crate::core::scheduler::SchedulerRef;
use crate::core::subscription::SubscriptionSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

impl<T: Send + 'static> Single<T> {
    /// Fail with a `Timeout` error if no signal arrives within `timeout`
    pub fn timeout(&self, timeout: Duration, scheduler: SchedulerRef) -> Single<T> {
        self.timeout_inner(timeout, scheduler, None)
    }

    /// Switch to `fallback` if no signal arrives within `timeout`
    pub fn timeout_with_fallback(
        &self,
        timeout: Duration,
        scheduler: SchedulerRef,
        fallback: Single<T>,
    ) -> Single<T> {
        self.timeout_inner(timeout, scheduler, Some(fallback))
    }

    fn timeout_inner(
        &self,
        timeout: Duration,
        scheduler: SchedulerRef,
        fallback: Option<Single<T>>,
    ) -> Single<T> {
        let source = self.clone();
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let state = Arc::new(TimeoutObserver {
                downstream: observer,
                upstream: DisposableSlot::new(),
                timer: DisposableSlot::new(),
                fallback_upstream: Arc::new(DisposableSlot::new()),
                fallback: fallback.clone(),
                timeout,
                done: AtomicBool::new(false),
            });
            state.downstream.on_subscribe(state.clone());
            let weak: Weak<TimeoutObserver<T>> = Arc::downgrade(&state);
            let timer = scheduler.schedule_direct(
                Box::new(move || {
                    if let Some(state) = weak.upgrade() {
                        state.fire();
                    }
                }),
                timeout,
            );
            state.timer.replace(timer);
            source.subscribe(state);
        })
    }

    /// Signal the value `delay` later on `scheduler`; errors pass through at once
    pub fn delay(&self, delay: Duration, scheduler: SchedulerRef) -> Single<T> {
        let source = self.clone();
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let serial = Arc::new(DisposableSlot::new());
            observer.on_subscribe(serial.clone());
            source.subscribe(Arc::new(DelayObserver {
                downstream: observer,
                serial,
                scheduler: Arc::clone(&scheduler),
                delay,
            }));
        })
    }

    /// Subscribe to the source from a task on `scheduler`
    pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Single<T> {
        let source = self.clone();
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let parent = Arc::new(SubscribeOnObserver {
                downstream: observer,
                upstream: DisposableSlot::new(),
                task: DisposableSlot::new(),
            });
            parent.downstream.on_subscribe(parent.clone());
            let (p, s) = (Arc::clone(&parent), source.clone());
            let task = scheduler.schedule_direct(Box::new(move || s.subscribe(p)), Duration::ZERO);
            parent.task.replace(task);
        })
    }

    /// Fail with a `Cancelled` error when `other` emits or completes first
    pub fn take_until<U: Send + 'static>(&self, other: &Flowable<U>) -> Single<T> {
        let (source, other) = (self.clone(), other.clone());
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let main = Arc::new(TakeUntilMain {
                downstream: observer,
                upstream: DisposableSlot::new(),
                other: SubscriptionSlot::new(),
                done: AtomicBool::new(false),
            });
            main.downstream.on_subscribe(main.clone());
            other.subscribe(SubscriberRef::Plain(Arc::new(TakeUntilOther {
                main: Arc::clone(&main),
                once: AtomicBool::new(false),
            })));
            source.subscribe(main);
        })
    }
}

struct TimeoutObserver<T> {
    downstream: SingleObserverRef<T>,
    upstream: DisposableSlot,
    timer: DisposableSlot,
    fallback_upstream: Arc<DisposableSlot>,
    fallback: Option<Single<T>>,
    timeout: Duration,
    done: AtomicBool,
}

impl<T: Send + 'static> TimeoutObserver<T> {
    fn fire(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.dispose();
        match &self.fallback {
            Some(fallback) => {
                log::debug!("Single timed out after {:?}, switching to fallback", self.timeout);
                fallback.subscribe(Arc::new(FallbackObserver {
                    downstream: Arc::clone(&self.downstream),
                    upstream: Arc::clone(&self.fallback_upstream),
                }));
            }
            None => self.downstream.on_error(FlowError::timeout(self.timeout)),
        }
    }
}

impl<T: Send + 'static> SingleObserver<T> for TimeoutObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.timer.dispose();
            self.downstream.on_success(value);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.timer.dispose();
        self.downstream.on_error(error);
    }
}

impl<T: Send + 'static> Disposable for TimeoutObserver<T> {
    fn dispose(&self) {
        self.done.store(true, Ordering::Release);
        self.timer.dispose();
        self.upstream.dispose();
        self.fallback_upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

struct FallbackObserver<T> {
    downstream: SingleObserverRef<T>,
    upstream: Arc<DisposableSlot>,
}

impl<T: Send> SingleObserver<T> for FallbackObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct DelayObserver<T> {
    downstream: SingleObserverRef<T>,
    serial: Arc<DisposableSlot>,
    scheduler: SchedulerRef,
    delay: Duration,
}

impl<T: Send + 'static> SingleObserver<T> for DelayObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.serial.replace(disposable);
    }

    fn on_success(&self, value: T) {
        let downstream = Arc::clone(&self.downstream);
        let timer = self
            .scheduler
            .schedule_direct(Box::new(move || downstream.on_success(value)), self.delay);
        self.serial.replace(timer);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct SubscribeOnObserver<T> {
    downstream: SingleObserverRef<T>,
    upstream: DisposableSlot,
    task: DisposableSlot,
}

impl<T: Send> SingleObserver<T> for SubscribeOnObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

impl<T: Send> Disposable for SubscribeOnObserver<T> {
    fn dispose(&self) {
        self.task.dispose();
        self.upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

struct TakeUntilMain<T, U> {
    downstream: SingleObserverRef<T>,
    upstream: DisposableSlot,
    other: SubscriptionSlot<U>,
    done: AtomicBool,
}

impl<T: Send, U: Send + 'static> TakeUntilMain<T, U> {
    fn other_signalled(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.dispose();
        self.downstream
            .on_error(FlowError::cancelled("The other source signalled before the value"));
    }

    fn other_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.upstream.dispose();
        self.downstream.on_error(error);
    }
}

impl<T: Send, U: Send + 'static> SingleObserver<T> for TakeUntilMain<T, U> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.other.cancel();
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_success(value);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.other.cancel();
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.downstream.on_error(error);
    }
}

impl<T: Send, U: Send + 'static> Disposable for TakeUntilMain<T, U> {
    fn dispose(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.dispose();
        self.other.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

struct TakeUntilOther<T, U> {
    main: Arc<TakeUntilMain<T, U>>,
    once: AtomicBool,
}

impl<T: Send, U: Send + 'static> Subscriber<U> for TakeUntilOther<T, U> {
    fn on_subscribe(&self, subscription: Upstream<U>) {
        if self.main.other.set_once(subscription.clone()) {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, _item: U) {
        if !self.once.swap(true, Ordering::AcqRel) {
            self.main.other.cancel();
            self.main.other_signalled();
        }
    }

    fn on_error(&self, error: FlowError) {
        self.main.other_error(error);
    }

    fn on_complete(&self) {
        if !self.once.swap(true, Ordering::AcqRel) {
            self.main.other_signalled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::{schedulers, TestScheduler};
    use crate::core::testing::ErrorCapture;
    use serial_test::serial;

    #[test]
    fn test_timeout_fires_on_virtual_time() {
        let scheduler = TestScheduler::new();
        let to = Single::<i32>::never()
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        to.assert_empty();
        scheduler.advance_time_by(Duration::from_secs(1));
        to.assert_error_matches(|e| matches!(e, FlowError::Timeout { .. }));
    }

    #[test]
    fn test_timeout_fallback() {
        let scheduler = TestScheduler::new();
        let to = Single::<i32>::never()
            .timeout_with_fallback(
                Duration::from_millis(100),
                Arc::new(scheduler.clone()),
                Single::just(9),
            )
            .test();
        scheduler.advance_time_by(Duration::from_millis(100));
        to.assert_result(&[9]);
    }

    #[test]
    fn test_value_beats_timeout() {
        let scheduler = TestScheduler::new();
        let to = Single::just(1)
            .timeout(Duration::from_secs(1), Arc::new(scheduler.clone()))
            .test();
        to.assert_result(&[1]);
        scheduler.advance_time_by(Duration::from_secs(5));
        to.assert_result(&[1]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_delay() {
        let scheduler = TestScheduler::new();
        let to = Single::just(3)
            .delay(Duration::from_millis(50), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_millis(49));
        to.assert_empty();
        scheduler.advance_time_by(Duration::from_millis(1));
        to.assert_result(&[3]);
    }

    #[test]
    fn test_subscribe_on_thread() {
        let value = Single::from_fn(|| {
            Ok(std::thread::current()
                .name()
                .unwrap_or_default()
                .to_string())
        })
        .subscribe_on(schedulers::new_thread())
        .blocking_get()
        .unwrap();
        assert!(value.contains("new-thread"), "ran on {}", value);
    }

    #[test]
    fn test_take_until_other_item_cancels() {
        Single::<i32>::never()
            .take_until(&Flowable::just(1))
            .test()
            .assert_error_matches(|e| matches!(e, FlowError::Cancelled { .. }));
    }

    #[test]
    fn test_take_until_main_wins() {
        Single::just(1)
            .take_until(&Flowable::<i32>::never())
            .test()
            .assert_result(&[1]);
    }

    #[test]
    #[serial]
    fn test_take_until_other_error_after_done_is_undeliverable() {
        let capture = ErrorCapture::install();
        let main = Single::<i32>::never();
        let other = Flowable::from_subscribe_fn(|s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::plain(crate::core::subscription::BooleanSubscription::new()));
            s.on_complete();
            s.on_error(FlowError::other("late other"));
        });
        main.take_until(&other)
            .test()
            .assert_error_matches(|e| matches!(e, FlowError::Cancelled { .. }));
        capture.assert_undeliverable(0, "late other");
    }
}
