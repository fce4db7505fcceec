// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Reactive Streams Protocol
//!
//! The call interface between a producer and its consumer.
//!
//! ## Rules every participant follows
//!
//! 1. A [`Publisher`] calls `on_subscribe` exactly once before anything else.
//! 2. `on_next` is only called while the consumer has outstanding demand
//!    (`request(n)` accumulated and not yet satisfied).
//! 3. Signals to one subscriber are serialized: never two threads at once.
//! 4. At most one of `on_error` / `on_complete` is delivered, and nothing
//!    follows it.
//! 5. `request(n)` with `n <= 0` is a protocol violation reported through
//!    the error hook; `i64::MAX` means unbounded.
//! 6. After `cancel()` late signals may still race in and are dropped.
//!
//! ```text
//! Publisher ──subscribe──▶ Subscriber
//!     ◀──────request(n) / cancel()──── Subscription
//!     ───on_next* (on_error | on_complete)?──▶
//! ```

pub mod fusion;

pub use fusion::{FusionMode, QueueSubscription};

use crate::core::disposable::Disposable;
use crate::core::error::FlowError;
use std::sync::Arc;

/// Unbounded demand sentinel
pub const UNBOUNDED: i64 = i64::MAX;

/// Demand and cancellation handle of one producer/consumer edge
pub trait Subscription: Send + Sync {
    fn request(&self, n: i64);

    fn cancel(&self);
}

/// Consumer side of the protocol
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Upstream<T>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: FlowError);

    fn on_complete(&self);

    /// Wake-up sent instead of `on_next` once `ASYNC` fusion was granted
    ///
    /// Only subscribers that requested `ASYNC` fusion ever receive it.
    fn on_available(&self) {}
}

/// A subscriber that can report whether it consumed a value
///
/// Rejected values do not count against demand, so a filtering chain does
/// not have to ask upstream for a replacement item.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
    fn try_on_next(&self, item: T) -> bool;
}

/// The subscription a consumer receives, optionally fuseable
pub enum Upstream<T> {
    Plain(Arc<dyn Subscription>),
    Queue(Arc<dyn QueueSubscription<T>>),
}

impl<T> Clone for Upstream<T> {
    fn clone(&self) -> Self {
        match self {
            Upstream::Plain(s) => Upstream::Plain(Arc::clone(s)),
            Upstream::Queue(q) => Upstream::Queue(Arc::clone(q)),
        }
    }
}

impl<T> Upstream<T> {
    pub fn plain(subscription: impl Subscription + 'static) -> Self {
        Upstream::Plain(Arc::new(subscription))
    }

    #[inline]
    pub fn request(&self, n: i64) {
        match self {
            Upstream::Plain(s) => s.request(n),
            Upstream::Queue(q) => q.request(n),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        match self {
            Upstream::Plain(s) => s.cancel(),
            Upstream::Queue(q) => q.cancel(),
        }
    }

    /// The fuseable view, if the producer offers one
    pub fn queue(&self) -> Option<&Arc<dyn QueueSubscription<T>>> {
        match self {
            Upstream::Plain(_) => None,
            Upstream::Queue(q) => Some(q),
        }
    }
}

impl<T> Subscription for Upstream<T>
where
    T: 'static,
{
    fn request(&self, n: i64) {
        Upstream::request(self, n)
    }

    fn cancel(&self) {
        Upstream::cancel(self)
    }
}

/// The subscriber a producer emits to, optionally conditional
pub enum SubscriberRef<T> {
    Plain(Arc<dyn Subscriber<T>>),
    Conditional(Arc<dyn ConditionalSubscriber<T>>),
}

impl<T> Clone for SubscriberRef<T> {
    fn clone(&self) -> Self {
        match self {
            SubscriberRef::Plain(s) => SubscriberRef::Plain(Arc::clone(s)),
            SubscriberRef::Conditional(s) => SubscriberRef::Conditional(Arc::clone(s)),
        }
    }
}

impl<T> SubscriberRef<T> {
    pub fn plain<S>(subscriber: Arc<S>) -> Self
    where
        S: Subscriber<T> + 'static,
    {
        SubscriberRef::Plain(subscriber)
    }

    pub fn conditional<S>(subscriber: Arc<S>) -> Self
    where
        S: ConditionalSubscriber<T> + 'static,
    {
        SubscriberRef::Conditional(subscriber)
    }

    #[inline]
    pub fn is_conditional(&self) -> bool {
        matches!(self, SubscriberRef::Conditional(_))
    }

    #[inline]
    pub fn on_subscribe(&self, subscription: Upstream<T>) {
        match self {
            SubscriberRef::Plain(s) => s.on_subscribe(subscription),
            SubscriberRef::Conditional(s) => s.on_subscribe(subscription),
        }
    }

    #[inline]
    pub fn on_next(&self, item: T) {
        match self {
            SubscriberRef::Plain(s) => s.on_next(item),
            SubscriberRef::Conditional(s) => s.on_next(item),
        }
    }

    /// Conditional delivery; a plain subscriber always accepts
    #[inline]
    pub fn try_on_next(&self, item: T) -> bool {
        match self {
            SubscriberRef::Plain(s) => {
                s.on_next(item);
                true
            }
            SubscriberRef::Conditional(s) => s.try_on_next(item),
        }
    }

    #[inline]
    pub fn on_error(&self, error: FlowError) {
        match self {
            SubscriberRef::Plain(s) => s.on_error(error),
            SubscriberRef::Conditional(s) => s.on_error(error),
        }
    }

    #[inline]
    pub fn on_complete(&self) {
        match self {
            SubscriberRef::Plain(s) => s.on_complete(),
            SubscriberRef::Conditional(s) => s.on_complete(),
        }
    }

    #[inline]
    pub fn on_available(&self) {
        match self {
            SubscriberRef::Plain(s) => s.on_available(),
            SubscriberRef::Conditional(s) => s.on_available(),
        }
    }
}

/// Producer side of the protocol
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: SubscriberRef<T>);
}

/// A materialized protocol signal
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    Next(T),
    Error(FlowError),
    Complete,
}

impl<T> Signal<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// Replay the signal to a subscriber
    pub fn deliver(self, subscriber: &SubscriberRef<T>) {
        match self {
            Signal::Next(v) => subscriber.on_next(v),
            Signal::Error(e) => subscriber.on_error(e),
            Signal::Complete => subscriber.on_complete(),
        }
    }
}

/// Consumer of a source that produces exactly one value or an error
pub trait SingleObserver<T>: Send + Sync {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>);

    fn on_success(&self, value: T);

    fn on_error(&self, error: FlowError);
}

/// Producer of exactly one value or an error
pub trait SingleSource<T>: Send + Sync {
    fn subscribe(&self, observer: Arc<dyn SingleObserver<T>>);
}

/// Consumer of a source that produces at most one value
pub trait MaybeObserver<T>: Send + Sync {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>);

    fn on_success(&self, value: T);

    fn on_error(&self, error: FlowError);

    fn on_complete(&self);
}

/// Producer of zero or one value, or an error
pub trait MaybeSource<T>: Send + Sync {
    fn subscribe(&self, observer: Arc<dyn MaybeObserver<T>>);
}

/// Consumer of a source that only completes or fails
pub trait CompletableObserver: Send + Sync {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>);

    fn on_complete(&self);

    fn on_error(&self, error: FlowError);
}

/// Producer of a bare completion or an error
pub trait CompletableSource: Send + Sync {
    fn subscribe(&self, observer: Arc<dyn CompletableObserver>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Counting {
        requested: AtomicI64,
        cancelled: AtomicUsize,
    }

    impl Subscription for Counting {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Recorder(Mutex<Vec<Signal<i32>>>);

    impl Subscriber<i32> for Recorder {
        fn on_subscribe(&self, subscription: Upstream<i32>) {
            subscription.request(1);
        }

        fn on_next(&self, item: i32) {
            self.0.lock().unwrap().push(Signal::Next(item));
        }

        fn on_error(&self, error: FlowError) {
            self.0.lock().unwrap().push(Signal::Error(error));
        }

        fn on_complete(&self) {
            self.0.lock().unwrap().push(Signal::Complete);
        }
    }

    #[test]
    fn test_plain_subscriber_accepts_everything() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sref = SubscriberRef::plain(Arc::clone(&recorder));
        assert!(!sref.is_conditional());
        assert!(sref.try_on_next(5));
        Signal::Complete.deliver(&sref);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![Signal::Next(5), Signal::Complete]
        );
    }

    #[test]
    fn test_upstream_forwards_request_and_cancel() {
        let counting = Arc::new(Counting {
            requested: AtomicI64::new(0),
            cancelled: AtomicUsize::new(0),
        });
        let upstream: Upstream<i32> = Upstream::Plain(counting.clone());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        recorder.on_subscribe(upstream.clone());
        upstream.cancel();
        assert_eq!(counting.requested.load(Ordering::SeqCst), 1);
        assert_eq!(counting.cancelled.load(Ordering::SeqCst), 1);
        assert!(upstream.queue().is_none());
    }

    #[test]
    fn test_signal_terminal() {
        assert!(!Signal::Next(1).is_terminal());
        assert!(Signal::<i32>::Complete.is_terminal());
        assert!(Signal::<i32>::Error(FlowError::other("x")).is_terminal());
    }
}
