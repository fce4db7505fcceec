// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Completable
//!
//! A source without values: it either completes or fails. Like `Single` and
//! `Maybe`, observers receive a [`Disposable`] in place of a subscription.

mod create;
mod ops;

pub use create::CompletableEmitter;

use crate::core::disposable::{BooleanDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::flowable::blocking::Latch;
use crate::core::protocol::{CompletableObserver, CompletableSource};
use crate::core::testing::TestObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type CompletableObserverRef = Arc<dyn CompletableObserver>;

pub struct Completable {
    source: Arc<dyn CompletableSource>,
}

impl Clone for Completable {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

struct FnSource<F>(F);

impl<F> CompletableSource for FnSource<F>
where
    F: Fn(CompletableObserverRef) + Send + Sync,
{
    fn subscribe(&self, observer: CompletableObserverRef) {
        (self.0)(observer)
    }
}

impl Completable {
    pub fn new(source: impl CompletableSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Wrap a raw subscribe function
    pub fn from_subscribe_fn(f: impl Fn(CompletableObserverRef) + Send + Sync + 'static) -> Self {
        Self::new(FnSource(f))
    }

    pub fn subscribe(&self, observer: CompletableObserverRef) {
        self.source.subscribe(observer);
    }

    pub fn complete() -> Self {
        Self::from_subscribe_fn(|observer: CompletableObserverRef| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_complete();
        })
    }

    pub fn error(error: FlowError) -> Self {
        Self::from_subscribe_fn(move |observer: CompletableObserverRef| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_error(error.clone());
        })
    }

    pub fn never() -> Self {
        Self::from_subscribe_fn(|observer: CompletableObserverRef| {
            observer.on_subscribe(Arc::new(BooleanDisposable::new()));
        })
    }

    /// Run `action` for each subscriber; `Ok` completes, `Err` fails
    pub fn from_fn(action: impl Fn() -> FlowResult<()> + Send + Sync + 'static) -> Self {
        Self::from_subscribe_fn(move |observer: CompletableObserverRef| {
            let d = Arc::new(BooleanDisposable::new());
            observer.on_subscribe(d.clone());
            if d.is_disposed() {
                return;
            }
            match action() {
                Ok(()) if d.is_disposed() => {}
                Ok(()) => observer.on_complete(),
                Err(e) if d.is_disposed() => error::on_error(e),
                Err(e) => observer.on_error(e),
            }
        })
    }

    pub fn subscribe_with(
        &self,
        on_complete: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
    ) -> DisposableRef {
        let observer = Arc::new(CallbackObserver {
            upstream: DisposableSlot::new(),
            done: AtomicBool::new(false),
            on_complete: Box::new(on_complete),
            on_error: Box::new(on_error),
        });
        self.subscribe(observer.clone());
        observer
    }

    /// Wait until the source terminates
    pub fn blocking_await(&self) -> FlowResult<()> {
        let latch: Arc<Latch<()>> = Latch::new();
        self.subscribe(latch.clone());
        latch.wait_optional().map(|_| ())
    }

    /// Wait at most `timeout`; a `Timeout` error disposes the source
    pub fn blocking_await_timeout(&self, timeout: Duration) -> FlowResult<()> {
        let latch: Arc<Latch<()>> = Latch::new();
        self.subscribe(latch.clone());
        latch.wait_optional_timeout(timeout).map(|_| ())
    }

    pub fn test(&self) -> TestObserver<()> {
        let observer = TestObserver::new();
        self.subscribe(observer.as_completable_observer());
        observer
    }
}

struct CallbackObserver {
    upstream: DisposableSlot,
    done: AtomicBool,
    on_complete: Box<dyn Fn() + Send + Sync>,
    on_error: Box<dyn Fn(FlowError) + Send + Sync>,
}

impl CompletableObserver for CallbackObserver {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
    }

    fn on_error(&self, e: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(e);
            return;
        }
        (self.on_error)(e);
    }
}

impl Disposable for CallbackObserver {
    fn dispose(&self) {
        self.upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::schedulers;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_sources() {
        Completable::complete().test().assert_result(&[]);
        Completable::error(FlowError::other("bad"))
            .test()
            .assert_failure("bad", &[]);
        Completable::never().test().assert_empty();
    }

    #[test]
    fn test_from_fn_runs_per_subscriber() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let completable = Completable::from_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        completable.test().assert_result(&[]);
        completable.test().assert_result(&[]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        Completable::from_fn(|| Err(FlowError::callback("action failed")))
            .test()
            .assert_failure("action failed", &[]);
    }

    #[test]
    fn test_subscribe_with() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&seen), Arc::clone(&seen));
        Completable::complete().subscribe_with(
            move || a.lock().unwrap().push("complete".to_string()),
            move |e| b.lock().unwrap().push(e.to_string()),
        );
        let c = Arc::clone(&seen);
        Completable::error(FlowError::other("failed")).subscribe_with(
            || panic!("unexpected completion"),
            move |e| c.lock().unwrap().push(e.to_string()),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["complete", "failed"]);
    }

    #[test]
    fn test_blocking_await() {
        Completable::complete().blocking_await().unwrap();
        let err = Completable::error(FlowError::callback("nope"))
            .blocking_await()
            .unwrap_err();
        assert_eq!(err.message(), "nope");
    }

    #[test]
    fn test_blocking_await_async_source() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        Completable::from_fn(move || {
            r.store(true, Ordering::SeqCst);
            Ok(())
        })
        .subscribe_on(schedulers::computation())
        .blocking_await()
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_blocking_await_timeout_disposes() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&disposed);
        let err = Completable::never()
            .do_on_dispose(move || {
                d.fetch_add(1, Ordering::SeqCst);
            })
            .blocking_await_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }
}
