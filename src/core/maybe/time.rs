// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Maybe, MaybeObserverRef};
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError};
use crate::core::flowable::Flowable;
use crate::core::protocol::{MaybeObserver, Subscriber, SubscriberRef, Upstream, UNBOUNDED};
use crate::core::scheduler::SchedulerRef;
use crate::core::subscription::SubscriptionSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Terminal-once gate shared by the operators below
struct Gate<T> {
    downstream: MaybeObserverRef<T>,
    upstream: DisposableSlot,
    done: AtomicBool,
}

impl<T: Send> Gate<T> {
    fn new(downstream: MaybeObserverRef<T>) -> Self {
        Self {
            downstream,
            upstream: DisposableSlot::new(),
            done: AtomicBool::new(false),
        }
    }

    fn enter(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn success(&self, value: T) {
        if self.enter() {
            self.downstream.on_success(value);
        }
    }

    fn error(&self, e: FlowError) {
        if self.enter() {
            self.upstream.dispose();
            self.downstream.on_error(e);
        } else {
            error::on_error(e);
        }
    }

    fn complete(&self) {
        if self.enter() {
            self.upstream.dispose();
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Maybe<T> {
    /// Fail with a `Timeout` error if no signal arrives within `timeout`
    pub fn timeout(&self, timeout: Duration, scheduler: SchedulerRef) -> Maybe<T> {
        let source = self.clone();
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            let state = Arc::new(TimeoutObserver {
                gate: Gate::new(observer),
                timer: DisposableSlot::new(),
                timeout,
            });
            state.gate.downstream.on_subscribe(state.clone());
            let weak: Weak<TimeoutObserver<T>> = Arc::downgrade(&state);
            let timer = scheduler.schedule_direct(
                Box::new(move || {
                    if let Some(state) = weak.upgrade() {
                        state.gate.error(FlowError::timeout(state.timeout));
                    }
                }),
                timeout,
            );
            state.timer.replace(timer);
            source.subscribe(state);
        })
    }

    /// Complete empty as soon as `other` emits or completes
    pub fn take_until<U: Send + 'static>(&self, other: &Flowable<U>) -> Maybe<T> {
        let (source, other) = (self.clone(), other.clone());
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            let main = Arc::new(TakeUntilMain {
                gate: Gate::new(observer),
                other: SubscriptionSlot::new(),
            });
            main.gate.downstream.on_subscribe(main.clone());
            other.subscribe(SubscriberRef::Plain(Arc::new(TakeUntilOther {
                main: Arc::clone(&main),
            })));
            source.subscribe(main);
        })
    }
}

struct TimeoutObserver<T> {
    gate: Gate<T>,
    timer: DisposableSlot,
    timeout: Duration,
}

impl<T: Send + 'static> MaybeObserver<T> for TimeoutObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.gate.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.timer.dispose();
        self.gate.success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.timer.dispose();
        self.gate.error(error);
    }

    fn on_complete(&self) {
        self.timer.dispose();
        self.gate.complete();
    }
}

impl<T: Send + 'static> Disposable for TimeoutObserver<T> {
    fn dispose(&self) {
        self.gate.done.store(true, Ordering::Release);
        self.timer.dispose();
        self.gate.upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.gate.upstream.is_disposed()
    }
}

struct TakeUntilMain<T, U> {
    gate: Gate<T>,
    other: SubscriptionSlot<U>,
}

impl<T: Send, U: Send + 'static> MaybeObserver<T> for TakeUntilMain<T, U> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.gate.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.other.cancel();
        self.gate.success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.other.cancel();
        self.gate.error(error);
    }

    fn on_complete(&self) {
        self.other.cancel();
        self.gate.complete();
    }
}

impl<T: Send, U: Send + 'static> Disposable for TakeUntilMain<T, U> {
    fn dispose(&self) {
        self.gate.done.store(true, Ordering::Release);
        self.gate.upstream.dispose();
        self.other.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.gate.upstream.is_disposed()
    }
}

struct TakeUntilOther<T, U> {
    main: Arc<TakeUntilMain<T, U>>,
}

impl<T: Send, U: Send + 'static> Subscriber<U> for TakeUntilOther<T, U> {
    fn on_subscribe(&self, subscription: Upstream<U>) {
        if self.main.other.set_once(subscription.clone()) {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, _item: U) {
        self.main.other.cancel();
        self.main.gate.complete();
    }

    fn on_error(&self, error: FlowError) {
        self.main.gate.error(error);
    }

    fn on_complete(&self) {
        self.main.gate.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::TestScheduler;

    #[test]
    fn test_timeout() {
        let scheduler = TestScheduler::new();
        let to = Maybe::<i32>::never()
            .timeout(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_millis(10));
        to.assert_error_matches(|e| matches!(e, FlowError::Timeout { .. }));

        let to = Maybe::<i32>::empty()
            .timeout(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .test();
        scheduler.advance_time_by(Duration::from_millis(10));
        to.assert_result(&[]);
    }

    #[test]
    fn test_take_until_other_completes_main() {
        Maybe::<i32>::never()
            .take_until(&Flowable::<i32>::empty())
            .test()
            .assert_result(&[]);
        Maybe::<i32>::never()
            .take_until(&Flowable::just(1))
            .test()
            .assert_result(&[]);
    }

    #[test]
    fn test_take_until_other_error() {
        Maybe::<i32>::never()
            .take_until(&Flowable::<i32>::error(FlowError::other("other")))
            .test()
            .assert_failure("other", &[]);
    }

    #[test]
    fn test_take_until_main_success() {
        Maybe::just(3)
            .take_until(&Flowable::<i32>::never())
            .test()
            .assert_result(&[3]);
    }
}
