// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Single
//!
//! A source of exactly one value or an error. Observers receive a
//! [`Disposable`] instead of a subscription: there is no demand to signal.

mod ops;
mod time;

use crate::core::disposable::{BooleanDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::flowable::blocking::Latch;
use crate::core::protocol::{SingleObserver, SingleSource};
use crate::core::testing::TestObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type SingleObserverRef<T> = Arc<dyn SingleObserver<T>>;

pub struct Single<T> {
    source: Arc<dyn SingleSource<T>>,
}

impl<T> Clone for Single<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

struct FnSource<F>(F);

impl<T, F> SingleSource<T> for FnSource<F>
where
    F: Fn(SingleObserverRef<T>) + Send + Sync,
{
    fn subscribe(&self, observer: SingleObserverRef<T>) {
        (self.0)(observer)
    }
}

impl<T: Send + 'static> Single<T> {
    pub fn new(source: impl SingleSource<T> + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Wrap a raw subscribe function
    pub fn from_subscribe_fn(f: impl Fn(SingleObserverRef<T>) + Send + Sync + 'static) -> Self {
        Self::new(FnSource(f))
    }

    pub fn subscribe(&self, observer: SingleObserverRef<T>) {
        self.source.subscribe(observer);
    }

    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_success(value.clone());
        })
    }

    pub fn error(error: FlowError) -> Self {
        Self::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_error(error.clone());
        })
    }

    /// Compute the value for each subscriber
    pub fn from_fn(f: impl Fn() -> FlowResult<T> + Send + Sync + 'static) -> Self {
        Self::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let d = Arc::new(BooleanDisposable::new());
            observer.on_subscribe(d.clone());
            if d.is_disposed() {
                return;
            }
            match f() {
                Ok(v) => {
                    if !d.is_disposed() {
                        observer.on_success(v);
                    }
                }
                Err(e) => {
                    if d.is_disposed() {
                        error::on_error(e);
                    } else {
                        observer.on_error(e);
                    }
                }
            }
        })
    }

    pub fn never() -> Self {
        Self::from_subscribe_fn(|observer: SingleObserverRef<T>| {
            observer.on_subscribe(Arc::new(BooleanDisposable::new()));
        })
    }

    pub fn subscribe_with(
        &self,
        on_success: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
    ) -> DisposableRef {
        let observer = Arc::new(CallbackObserver {
            upstream: DisposableSlot::new(),
            done: AtomicBool::new(false),
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        });
        self.subscribe(observer.clone());
        observer
    }

    /// Wait for the value
    pub fn blocking_get(&self) -> FlowResult<T> {
        let latch = Latch::new();
        self.subscribe(latch.clone());
        latch.wait()
    }

    /// Wait for the value at most `timeout`, disposing the source on expiry
    pub fn blocking_get_timeout(&self, timeout: Duration) -> FlowResult<T> {
        let latch = Latch::new();
        self.subscribe(latch.clone());
        latch.wait_timeout(timeout)
    }
}

impl<T: Clone + Send + 'static> Single<T> {
    pub fn test(&self) -> TestObserver<T> {
        let observer = TestObserver::new();
        self.subscribe(observer.as_single_observer());
        observer
    }
}

struct CallbackObserver<T> {
    upstream: DisposableSlot,
    done: AtomicBool,
    on_success: Box<dyn Fn(T) + Send + Sync>,
    on_error: Box<dyn Fn(FlowError) + Send + Sync>,
}

impl<T: Send> SingleObserver<T> for CallbackObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_success)(value);
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

impl<T: Send> Disposable for CallbackObserver<T> {
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
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_sources() {
        Single::just(5).test().assert_result(&[5]);
        Single::<i32>::error(FlowError::other("bad"))
            .test()
            .assert_failure("bad", &[]);
        Single::from_fn(|| Ok("computed")).test().assert_result(&["computed"]);
        Single::<i32>::never().test().assert_empty();
    }

    #[test]
    fn test_from_fn_runs_per_subscriber() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let single = Single::from_fn(move || Ok(c.fetch_add(1, Ordering::SeqCst)));
        single.test().assert_result(&[0]);
        single.test().assert_result(&[1]);
    }

    #[test]
    fn test_blocking_get() {
        assert_eq!(Single::just(3).blocking_get().unwrap(), 3);
        let err = Single::<i32>::error(FlowError::callback("nope"))
            .blocking_get()
            .unwrap_err();
        assert_eq!(err.message(), "nope");
    }

    #[test]
    fn test_blocking_get_timeout() {
        let err = Single::<i32>::never()
            .blocking_get_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
    }
}
