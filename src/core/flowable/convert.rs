// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Single`/`Maybe` to `Flowable` bridges.
//!
//! The value is held in a [`DeferredScalarSubscription`] until the
//! downstream requests it.

use super::Flowable;
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::FlowError;
use crate::core::maybe::Maybe;
use crate::core::protocol::{MaybeObserver, SingleObserver, SubscriberRef, Subscription, Upstream};
use crate::core::single::Single;
use crate::core::subscription::DeferredScalarSubscription;
use std::sync::{Arc, Weak};

impl<T: Send + 'static> Flowable<T> {
    pub fn from_single(single: Single<T>) -> Flowable<T> {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            single.subscribe(ScalarBridge::new(subscriber));
        })
    }

    pub fn from_maybe(maybe: Maybe<T>) -> Flowable<T> {
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            maybe.subscribe(ScalarBridge::new(subscriber));
        })
    }
}

struct ScalarBridge<T> {
    this: Weak<ScalarBridge<T>>,
    scalar: DeferredScalarSubscription<T>,
    upstream: DisposableSlot,
}

impl<T: Send + 'static> ScalarBridge<T> {
    fn new(downstream: SubscriberRef<T>) -> Arc<Self> {
        Arc::new_cyclic(|this| ScalarBridge {
            this: this.clone(),
            scalar: DeferredScalarSubscription::new(downstream),
            upstream: DisposableSlot::new(),
        })
    }

    fn subscribed(&self, disposable: DisposableRef) {
        if self.upstream.set_once(disposable) {
            if let Some(this) = self.this.upgrade() {
                self.scalar.downstream().on_subscribe(Upstream::Plain(this));
            }
        }
    }
}

impl<T: Send + 'static> Subscription for ScalarBridge<T> {
    fn request(&self, n: i64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.upstream.dispose();
    }
}

impl<T: Send + 'static> SingleObserver<T> for ScalarBridge<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.subscribed(disposable);
    }

    fn on_success(&self, value: T) {
        self.scalar.complete(value);
    }

    fn on_error(&self, error: FlowError) {
        self.scalar.downstream().on_error(error);
    }
}

impl<T: Send + 'static> MaybeObserver<T> for ScalarBridge<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.subscribed(disposable);
    }

    fn on_success(&self, value: T) {
        self.scalar.complete(value);
    }

    fn on_error(&self, error: FlowError) {
        self.scalar.downstream().on_error(error);
    }

    fn on_complete(&self) {
        self.scalar.complete_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_single_error() {
        Flowable::from_single(Single::<i32>::error(FlowError::other("boom")))
            .test()
            .assert_failure("boom", &[]);
    }

    #[test]
    fn test_cancel_disposes_source() {
        let ts = Flowable::from_single(Single::<i32>::never()).test_with_request(0);
        ts.cancel();
        ts.assert_empty();
    }
}
