// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resubscription on error.
//!
//! The downstream keeps one subscription across attempts: a
//! [`SubscriptionArbiter`] carries the outstanding demand over, minus what
//! the failed attempt already delivered. Synchronous failures resubscribe in
//! a loop rather than recursively.

use super::Flowable;
use crate::core::disposable::{Disposable, DisposableSlot};
use crate::core::error::{FlowError, RetryPolicy};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream};
use crate::core::scheduler::{SchedulerRef, WorkerRef};
use crate::core::subscription::SubscriptionArbiter;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

impl<T: Send + 'static> Flowable<T> {
    /// Resubscribe up to `times` times after any error
    pub fn retry(&self, times: usize) -> Flowable<T> {
        self.retry_inner(RetryPolicy::immediate(times), None, false)
    }

    /// Resubscribe after retriable errors, waiting on `scheduler` as the
    /// policy's backoff dictates
    pub fn retry_with(&self, policy: RetryPolicy, scheduler: SchedulerRef) -> Flowable<T> {
        self.retry_inner(policy, Some(scheduler), true)
    }

    fn retry_inner(
        &self,
        policy: RetryPolicy,
        scheduler: Option<SchedulerRef>,
        retriable_only: bool,
    ) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let parent = Arc::new_cyclic(|this| RetrySubscriber {
                this: this.clone(),
                downstream: subscriber,
                source: source.clone(),
                arbiter: SubscriptionArbiter::new(false),
                policy: policy.clone(),
                retriable_only,
                worker: scheduler.as_ref().map(|s| s.create_worker()),
                delay: DisposableSlot::new(),
                attempts: AtomicUsize::new(0),
                produced: AtomicI64::new(0),
                wip: AtomicUsize::new(0),
            });
            parent
                .downstream
                .on_subscribe(Upstream::Plain(parent.clone()));
            parent.subscribe_next();
        })
    }
}

struct RetrySubscriber<T> {
    this: Weak<RetrySubscriber<T>>,
    downstream: SubscriberRef<T>,
    source: Flowable<T>,
    arbiter: SubscriptionArbiter<T>,
    policy: RetryPolicy,
    retriable_only: bool,
    worker: Option<WorkerRef>,
    delay: DisposableSlot,
    attempts: AtomicUsize,
    /// Items delivered by the current attempt
    produced: AtomicI64,
    wip: AtomicUsize,
}

impl<T: Send + 'static> RetrySubscriber<T> {
    fn subscribe_next(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut missed = 1;
        loop {
            if self.arbiter.is_cancelled() {
                return;
            }
            let produced = self.produced.swap(0, Ordering::AcqRel);
            if produced != 0 {
                self.arbiter.produced(produced);
            }
            self.source.subscribe(SubscriberRef::Plain(this.clone()));
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn allowed(&self, attempts: usize, error: &FlowError) -> bool {
        if self.retriable_only {
            self.policy.should_retry(attempts, error)
        } else {
            attempts < self.policy.max_attempts
        }
    }

    fn resubscribe_after(&self, delay: Duration) {
        match &self.worker {
            Some(worker) if !delay.is_zero() => {
                let this = self.this.clone();
                let handle = worker.schedule_after(
                    Box::new(move || {
                        if let Some(this) = this.upgrade() {
                            this.subscribe_next();
                        }
                    }),
                    delay,
                );
                self.delay.set(handle);
            }
            _ => self.subscribe_next(),
        }
    }

    fn stop_worker(&self) {
        self.delay.dispose();
        if let Some(worker) = &self.worker {
            worker.dispose();
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for RetrySubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        self.arbiter.set_subscription(subscription);
    }

    fn on_next(&self, item: T) {
        self.produced.fetch_add(1, Ordering::AcqRel);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        let attempts = self.attempts.load(Ordering::Acquire);
        if !self.allowed(attempts, &error) {
            self.stop_worker();
            self.downstream.on_error(error);
            return;
        }
        let attempt = attempts + 1;
        self.attempts.store(attempt, Ordering::Release);
        let delay = self.policy.delay_for(attempt);
        log::debug!(
            "Resubscribing after error (attempt {} of {}, delay {:?}): {}",
            attempt,
            self.policy.max_attempts,
            delay,
            error
        );
        self.resubscribe_after(delay);
    }

    fn on_complete(&self) {
        self.stop_worker();
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Subscription for RetrySubscriber<T> {
    fn request(&self, n: i64) {
        self.arbiter.request(n);
    }

    fn cancel(&self) {
        self.arbiter.cancel();
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackoffStrategy;
    use crate::core::scheduler::TestScheduler;
    use crate::core::testing::TestSubscriber;

    /// Emits `1, 2` then fails for the first `failures` subscriptions,
    /// afterwards emits `1, 2, 3` and completes
    fn flaky(failures: usize, error: fn(String) -> FlowError) -> (Flowable<i32>, Arc<AtomicUsize>) {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&subscriptions);
        let flow = Flowable::defer(move || {
            let n = s.fetch_add(1, Ordering::SeqCst);
            Ok(Flowable::range(1, 3).try_map(move |v| {
                if v == 3 && n < failures {
                    Err(error(format!("failure {}", n)))
                } else {
                    Ok(v)
                }
            }))
        });
        (flow, subscriptions)
    }

    #[test]
    fn test_retry_until_success() {
        let (flow, subscriptions) = flaky(2, FlowError::other);
        flow.retry(2).test().assert_result(&[1, 2, 1, 2, 1, 2, 3]);
        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let (flow, subscriptions) = flaky(5, FlowError::other);
        flow.retry(1).test().assert_failure("failure 1", &[1, 2, 1, 2]);
        assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_zero_passes_error() {
        let (flow, _) = flaky(1, FlowError::other);
        flow.retry(0).test().assert_failure("failure 0", &[1, 2]);
    }

    #[test]
    fn test_retry_keeps_outstanding_demand() {
        let (flow, _) = flaky(1, FlowError::other);
        let ts = flow.retry(1).test_with_request(3);
        ts.assert_values(&[1, 2, 1]).assert_not_complete();
        ts.request(10);
        ts.assert_result(&[1, 2, 1, 2, 3]);
    }

    #[test]
    fn test_retry_many_synchronous_failures() {
        let (flow, _) = flaky(10_000, FlowError::other);
        let ts = flow.retry(10_000).test();
        ts.assert_value_count(20_003).assert_complete();
    }

    #[test]
    fn test_cancel_stops_resubscription() {
        let (flow, subscriptions) = flaky(usize::MAX, FlowError::other);
        let ts = TestSubscriber::new().on_next_hook(|ts, _| ts.cancel());
        flow.retry(100).subscribe(ts.as_subscriber());
        ts.assert_value_count(1).assert_not_complete();
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    }

    fn backoff_policy() -> RetryPolicy {
        RetryPolicy::new(
            2,
            BackoffStrategy::Exponential,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_retry_with_backoff_waits_on_scheduler() {
        let scheduler = TestScheduler::new();
        let (flow, subscriptions) = flaky(2, FlowError::other);
        let ts = flow
            .retry_with(backoff_policy(), Arc::new(scheduler.clone()))
            .test();
        ts.assert_values(&[1, 2]).assert_not_complete();
        scheduler.advance_time_by(Duration::from_millis(99));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
        scheduler.advance_time_by(Duration::from_millis(1));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
        scheduler.advance_time_by(Duration::from_millis(200));
        ts.assert_result(&[1, 2, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn test_retry_with_skips_non_retriable() {
        let scheduler = TestScheduler::new();
        let (flow, subscriptions) = flaky(1, |m| FlowError::invalid_parameter("p", m));
        flow.retry_with(backoff_policy(), Arc::new(scheduler.clone()))
            .test()
            .assert_error_matches(|e| matches!(e, FlowError::InvalidParameter { .. }));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_with_cancel_drops_pending_attempt() {
        let scheduler = TestScheduler::new();
        let (flow, subscriptions) = flaky(1, FlowError::other);
        let ts = flow
            .retry_with(backoff_policy(), Arc::new(scheduler.clone()))
            .test();
        ts.cancel();
        scheduler.advance_time_by(Duration::from_secs(1));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
        ts.assert_values(&[1, 2]).assert_not_complete();
    }
}
