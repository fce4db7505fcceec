// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Test Tooling
//!
//! Consumers and helpers for exercising operators:
//!
//! - [`TestSubscriber`]: records `Flowable` signals, with configurable
//!   initial request and fusion mode
//! - [`TestObserver`]: records `Single`/`Maybe` signals
//! - [`ErrorCapture`]: collects errors routed to the global hook
//! - [`race`]: runs two closures released by a barrier on two threads
//!
//! Assertions panic with a description of what was recorded.

mod observer;
mod subscriber;

pub use observer::TestObserver;
pub use subscriber::TestSubscriber;

use crate::core::error::{self, FlowError};
use crate::core::flowable::Flowable;
use crate::core::protocol::{SubscriberRef, Upstream};
use crate::core::subscription::BooleanSubscription;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Idempotent logger setup for tests
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `a` and `b` on two threads, released at the same instant
pub fn race<A, B>(a: A, b: B)
where
    A: FnOnce() + Send,
    B: FnOnce() + Send,
{
    let barrier = Barrier::new(2);
    thread::scope(|scope| {
        let handle = scope.spawn(|| {
            barrier.wait();
            b();
        });
        barrier.wait();
        a();
        if let Err(payload) = handle.join() {
            std::panic::resume_unwind(payload);
        }
    });
}

/// Collects errors routed to the global hook until dropped
///
/// Tests using it must be `#[serial]`.
pub struct ErrorCapture {
    errors: Arc<Mutex<Vec<FlowError>>>,
}

impl ErrorCapture {
    pub fn install() -> Self {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        error::set_error_handler(Arc::new(move |e| {
            if let Ok(mut errors) = sink.lock() {
                errors.push(e);
            }
        }))
        .expect("error hook is locked down");
        Self { errors }
    }

    pub fn errors(&self) -> Vec<FlowError> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assert the error at `index` mentions `message`
    pub fn assert_error(&self, index: usize, message: &str) {
        let errors = self.errors();
        let error = errors
            .get(index)
            .unwrap_or_else(|| panic!("no error at {}; captured: {:?}", index, errors));
        assert!(
            error.to_string().contains(message),
            "error {} was '{}', expected it to contain '{}'",
            index,
            error,
            message
        );
    }

    /// Assert the error at `index` is an undeliverable wrapper around `message`
    pub fn assert_undeliverable(&self, index: usize, message: &str) {
        let errors = self.errors();
        match errors.get(index) {
            Some(FlowError::Undeliverable { cause }) => assert!(
                cause.to_string().contains(message),
                "undeliverable cause was '{}', expected '{}'",
                cause,
                message
            ),
            other => panic!("expected an undeliverable error at {}, got {:?}", index, other),
        }
    }

    pub fn assert_none(&self) {
        let errors = self.errors();
        assert!(errors.is_empty(), "unexpected hook errors: {:?}", errors);
    }
}

impl Drop for ErrorCapture {
    fn drop(&mut self) {
        let _ = error::reset_error_handler();
    }
}

/// Verify that an operator cancels and reports a second upstream
///
/// Installs an [`ErrorCapture`], so the calling test must be `#[serial]`.
pub fn check_double_on_subscribe<T, R, F>(compose: F)
where
    T: Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(Flowable<T>) -> Flowable<R>,
{
    let capture = ErrorCapture::install();
    let first = Arc::new(BooleanSubscription::new());
    let second = Arc::new(BooleanSubscription::new());

    let (f, s) = (Arc::clone(&first), Arc::clone(&second));
    let source = Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
        subscriber.on_subscribe(Upstream::Plain(f.clone()));
        subscriber.on_subscribe(Upstream::Plain(s.clone()));
    });
    compose(source).subscribe(TestSubscriber::<R>::new().as_subscriber());

    assert!(!first.is_cancelled(), "first upstream must stay active");
    assert!(second.is_cancelled(), "second upstream must be cancelled");
    capture.assert_error(0, "Subscription already set!");
}

/// Signals recorded by [`TestSubscriber`] and [`TestObserver`]
pub struct Recorded<T> {
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<FlowError>>,
    completions: AtomicUsize,
    subscriptions: AtomicUsize,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }
}

impl<T: Clone> Recorded<T> {
    pub(crate) fn record_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_value(&self, value: T) {
        if let Ok(mut values) = self.values.lock() {
            values.push(value);
        }
    }

    pub(crate) fn record_error(&self, error: FlowError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
        self.mark_done();
    }

    pub(crate) fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::AcqRel);
        self.mark_done();
    }

    fn mark_done(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.done_signal.notify_all();
        }
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn value_count(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn errors(&self) -> Vec<FlowError> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.completions() > 0 || !self.errors().is_empty()
    }

    /// Block until a terminal signal arrives
    pub fn await_done(&self, timeout: Duration) -> &Self {
        let Ok(done) = self.done.lock() else {
            return self;
        };
        let (done, _) = self
            .done_signal
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        assert!(*done, "no terminal signal within {:?}", timeout);
        drop(done);
        self
    }

    /// Block until at least `count` values arrived or the flow ended
    pub fn await_count(&self, count: usize, timeout: Duration) -> &Self {
        let deadline = Instant::now() + timeout;
        while self.value_count() < count && !self.is_terminated() {
            assert!(
                Instant::now() < deadline,
                "received {} of {} values within {:?}",
                self.value_count(),
                count,
                timeout
            );
            thread::sleep(Duration::from_millis(1));
        }
        self
    }

    pub fn assert_subscribed(&self) -> &Self {
        assert!(
            self.subscriptions.load(Ordering::Acquire) > 0,
            "not subscribed"
        );
        self
    }

    pub fn assert_value_count(&self, count: usize) -> &Self {
        assert_eq!(self.value_count(), count, "value count");
        self
    }

    pub fn assert_complete(&self) -> &Self {
        match self.completions() {
            0 => panic!("not completed; errors: {:?}", self.errors()),
            1 => self,
            n => panic!("multiple completions: {}", n),
        }
    }

    pub fn assert_not_complete(&self) -> &Self {
        assert_eq!(self.completions(), 0, "completed unexpectedly");
        self
    }

    pub fn assert_no_errors(&self) -> &Self {
        let errors = self.errors();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        self
    }

    pub fn assert_not_terminated(&self) -> &Self {
        self.assert_not_complete().assert_no_errors()
    }

    /// Exactly one error whose message equals `message`
    pub fn assert_error_message(&self, message: &str) -> &Self {
        let errors = self.errors();
        assert_eq!(errors.len(), 1, "expected one error, got {:?}", errors);
        assert_eq!(errors[0].message(), message);
        self
    }

    /// Exactly one error satisfying `predicate`
    pub fn assert_error_matches(&self, predicate: impl Fn(&FlowError) -> bool) -> &Self {
        let errors = self.errors();
        assert_eq!(errors.len(), 1, "expected one error, got {:?}", errors);
        assert!(predicate(&errors[0]), "error did not match: {:?}", errors[0]);
        self
    }
}

impl<T: Clone + PartialEq + Debug> Recorded<T> {
    pub fn assert_values(&self, expected: &[T]) -> &Self {
        assert_eq!(self.values(), expected, "values");
        self
    }

    pub fn assert_value(&self, expected: T) -> &Self {
        self.assert_values(std::slice::from_ref(&expected))
    }

    /// Exactly `expected`, then completion, without errors
    pub fn assert_result(&self, expected: &[T]) -> &Self {
        self.assert_subscribed()
            .assert_values(expected)
            .assert_no_errors()
            .assert_complete()
    }

    /// Exactly `expected`, then one error with `message`
    pub fn assert_failure(&self, message: &str, expected: &[T]) -> &Self {
        self.assert_subscribed()
            .assert_values(expected)
            .assert_error_message(message)
            .assert_not_complete()
    }

    /// Subscribed, with no signals at all
    pub fn assert_empty(&self) -> &Self {
        self.assert_subscribed()
            .assert_values(&[])
            .assert_not_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_race_runs_both() {
        let count = AtomicUsize::new(0);
        race(
            || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            || {
                count.fetch_add(10, Ordering::SeqCst);
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    #[serial]
    fn test_capture_resets_on_drop() {
        {
            let capture = ErrorCapture::install();
            error::on_error(FlowError::other("captured"));
            capture.assert_undeliverable(0, "captured");
        }
        assert!(!error::has_error_handler());
    }
}
