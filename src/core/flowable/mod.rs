// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Flowable
//!
//! A backpressured stream of `0..N` items followed by an optional terminal
//! signal. Each operator returns a new [`Flowable`] wrapping a publisher
//! that subscribes to its source when it is itself subscribed.
//!
//! ```text
//! range(1, 5) ─▶ filter(even) ─▶ map(x10) ─▶ subscriber
//!      ◀──────────── request(n) / cancel ───────────┘
//! ```
//!
//! Operator modules:
//!
//! | Module | Operators |
//! |--------|-----------|
//! | `source` | `range`, `from_iter`, `just`, `empty`, `error`, `never`, `defer` |
//! | `map`, `filter`, `peek` | synchronous pass-through, fuseable |
//! | `any`, `reduce` | aggregation into `Single`/`Maybe` |
//! | `take`, `take_until` | truncation |
//! | `publish`, `flat_map`, `zip` | multi-source coordination |
//! | `timeout`, `time`, `schedule_on` | scheduler driven |
//! | `using`, `retry`, `convert`, `blocking` | resources, resubscription, bridges |

mod any;
pub(crate) mod blocking;
mod convert;
mod filter;
mod flat_map;
mod map;
mod peek;
mod publish;
mod reduce;
mod retry;
mod schedule_on;
mod source;
mod take;
mod take_until;
mod time;
mod timeout;
mod using;
mod zip;

pub use blocking::BlockingIter;
pub use using::UsingMode;

use crate::core::disposable::{Disposable, DisposableRef};
use crate::core::error::{self, FlowError};
use crate::core::protocol::{FusionMode, Publisher, Subscriber, SubscriberRef, Upstream, UNBOUNDED};
use crate::core::subscription::SubscriptionSlot;
use crate::core::testing::TestSubscriber;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A backpressured, possibly asynchronous sequence of items
pub struct Flowable<T> {
    source: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flowable<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T> Publisher<T> for Flowable<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.source.subscribe(subscriber);
    }
}

struct FnPublisher<F>(F);

impl<T, F> Publisher<T> for FnPublisher<F>
where
    F: Fn(SubscriberRef<T>) + Send + Sync,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        (self.0)(subscriber)
    }
}

impl<T: Send + 'static> Flowable<T> {
    pub fn new(publisher: impl Publisher<T> + 'static) -> Self {
        Self {
            source: Arc::new(publisher),
        }
    }

    pub fn from_publisher(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { source: publisher }
    }

    /// Wrap a raw subscribe function; it must follow the protocol itself
    pub fn from_subscribe_fn(f: impl Fn(SubscriberRef<T>) + Send + Sync + 'static) -> Self {
        Self::new(FnPublisher(f))
    }

    pub fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.source.subscribe(subscriber);
    }

    /// Subscribe with callbacks, requesting everything
    pub fn subscribe_with(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> DisposableRef {
        let subscriber = Arc::new(LambdaSubscriber {
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
            on_complete: Box::new(on_complete),
        });
        self.subscribe(SubscriberRef::Plain(subscriber.clone()));
        subscriber
    }
}

impl<T: Clone + Send + 'static> Flowable<T> {
    /// Subscribe a [`TestSubscriber`] requesting everything
    pub fn test(&self) -> TestSubscriber<T> {
        self.test_with_request(UNBOUNDED)
    }

    pub fn test_with_request(&self, initial: i64) -> TestSubscriber<T> {
        let ts = TestSubscriber::with_request(initial);
        self.subscribe(ts.as_subscriber());
        ts
    }

    /// Subscribe a [`TestSubscriber`] that asks for `mode` fusion
    pub fn test_fused(&self, mode: FusionMode, initial: i64) -> TestSubscriber<T> {
        let ts = TestSubscriber::with_fusion(mode, initial);
        self.subscribe(ts.as_subscriber());
        ts
    }
}

struct LambdaSubscriber<T> {
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
    on_next: Box<dyn Fn(T) + Send + Sync>,
    on_error: Box<dyn Fn(FlowError) + Send + Sync>,
    on_complete: Box<dyn Fn() + Send + Sync>,
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set_once(subscription.clone()) {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) {
            (self.on_next)(item);
        }
    }

    fn on_error(&self, e: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(e);
            return;
        }
        (self.on_error)(e);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
    }
}

impl<T: Send + 'static> Disposable for LambdaSubscriber<T> {
    fn dispose(&self) {
        self.upstream.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_with_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (s1, s2) = (Arc::clone(&seen), Arc::clone(&seen));
        let handle = Flowable::range(1, 3).subscribe_with(
            move |v| s1.lock().unwrap().push(v),
            |e| panic!("unexpected {}", e),
            move || s2.lock().unwrap().push(-1),
        );
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, -1]);
        assert!(!handle.is_disposed());
        handle.dispose();
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_dispose_stops_never() {
        let handle = Flowable::<i32>::never().subscribe_with(|_| {}, |_| {}, || {});
        handle.dispose();
        assert!(handle.is_disposed());
    }
}
