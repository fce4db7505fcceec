// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boolean quantifiers: `any`, `all`, `is_empty`.
//!
//! Each consumes the upstream unbounded and stops at the first item that
//! decides the answer, cancelling the upstream. The answer is emitted once
//! the downstream requested it.

use super::Flowable;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED};
use crate::core::subscription::{DeferredScalarSubscription, SubscriptionSlot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Decider<T> = Arc<dyn Fn(&T) -> FlowResult<bool> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// `true` as soon as an item matches, `false` if none does
    pub fn any(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flowable<bool> {
        self.try_any(move |v| Ok(predicate(v)))
    }

    pub fn try_any(
        &self,
        predicate: impl Fn(&T) -> FlowResult<bool> + Send + Sync + 'static,
    ) -> Flowable<bool> {
        self.quantify(Arc::new(predicate), true)
    }

    /// `false` as soon as an item fails `predicate`, `true` otherwise
    pub fn all(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flowable<bool> {
        self.quantify(Arc::new(move |v: &T| Ok(!predicate(v))), false)
    }

    /// Whether the source completes without items
    pub fn is_empty(&self) -> Flowable<bool> {
        self.quantify(Arc::new(|_: &T| Ok(true)), false)
    }

    /// `decide` returning `true` ends the flow with `verdict`; completion
    /// yields `!verdict`
    fn quantify(&self, decide: Decider<T>, verdict: bool) -> Flowable<bool> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<bool>| {
            let parent = Arc::new_cyclic(|this| QuantifierSubscriber {
                this: this.clone(),
                scalar: DeferredScalarSubscription::new(subscriber),
                upstream: SubscriptionSlot::new(),
                decide: Arc::clone(&decide),
                verdict,
                done: AtomicBool::new(false),
            });
            source.subscribe(SubscriberRef::Plain(parent));
        })
    }
}

struct QuantifierSubscriber<T> {
    this: Weak<QuantifierSubscriber<T>>,
    scalar: DeferredScalarSubscription<bool>,
    upstream: SubscriptionSlot<T>,
    decide: Decider<T>,
    verdict: bool,
    done: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for QuantifierSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.scalar.downstream().on_subscribe(Upstream::Plain(this));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.decide)(&item) {
            Ok(false) => {}
            Ok(true) => {
                if self.done.swap(true, Ordering::AcqRel) {
                    return;
                }
                self.upstream.cancel();
                self.scalar.complete(self.verdict);
            }
            Err(e) => {
                if self.done.swap(true, Ordering::AcqRel) {
                    error::on_error(e);
                    return;
                }
                self.upstream.cancel();
                self.scalar.downstream().on_error(e);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.scalar.downstream().on_error(error);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.scalar.complete(!self.verdict);
        }
    }
}

impl<T: Send + 'static> Subscription for QuantifierSubscriber<T> {
    fn request(&self, n: i64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::ErrorCapture;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_any() {
        Flowable::range(1, 5).any(|v| *v == 3).test().assert_result(&[true]);
        Flowable::range(1, 5).any(|v| *v > 9).test().assert_result(&[false]);
        Flowable::<i32>::empty().any(|_| true).test().assert_result(&[false]);
    }

    #[test]
    fn test_all_and_is_empty() {
        Flowable::range(1, 5).all(|v| *v > 0).test().assert_result(&[true]);
        Flowable::range(1, 5).all(|v| *v < 3).test().assert_result(&[false]);
        Flowable::<i32>::empty().is_empty().test().assert_result(&[true]);
        Flowable::just(1).is_empty().test().assert_result(&[false]);
    }

    #[test]
    fn test_any_short_circuits() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        Flowable::range(1, 100)
            .do_on_next(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .any(|v| *v == 2)
            .test()
            .assert_result(&[true]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_answer_waits_for_request() {
        let ts = Flowable::range(1, 3).any(|v| *v == 1).test_with_request(0);
        ts.assert_empty();
        ts.request(1);
        ts.assert_result(&[true]);
    }

    #[test]
    fn test_predicate_failure() {
        Flowable::range(1, 3)
            .try_any(|v| {
                if *v == 2 {
                    Err(FlowError::callback("predicate 2"))
                } else {
                    Ok(false)
                }
            })
            .test()
            .assert_failure("predicate 2", &[]);
    }

    #[test]
    #[serial]
    fn test_error_after_match_is_undeliverable() {
        let capture = ErrorCapture::install();
        Flowable::from_subscribe_fn(|s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::plain(BooleanSubscription::new()));
            s.on_next(1);
            s.on_error(FlowError::other("late"));
        })
        .any(|_| true)
        .test()
        .assert_result(&[true]);
        capture.assert_undeliverable(0, "late");
    }

    #[test]
    #[serial]
    fn test_error_after_predicate_failure_is_undeliverable() {
        let capture = ErrorCapture::install();
        let upstream = Arc::new(BooleanSubscription::new());
        let u = Arc::clone(&upstream);
        let ts = Flowable::from_subscribe_fn(move |s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::Plain(u.clone()));
            s.on_next(1);
            s.on_error(FlowError::other("upstream failed"));
        })
        .try_any(|_| Err(FlowError::callback("predicate failed")))
        .test();
        ts.assert_failure("predicate failed", &[]);
        assert!(upstream.is_cancelled());
        assert_eq!(capture.len(), 1);
        capture.assert_undeliverable(0, "upstream failed");
    }
}
