// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Maybe
//!
//! A source of at most one value: success, plain completion or an error.

mod ops;
mod time;
mod using;

use crate::core::disposable::{BooleanDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::flowable::blocking::Latch;
use crate::core::protocol::{MaybeObserver, MaybeSource};
use crate::core::testing::TestObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type MaybeObserverRef<T> = Arc<dyn MaybeObserver<T>>;

pub struct Maybe<T> {
    source: Arc<dyn MaybeSource<T>>,
}

impl<T> Clone for Maybe<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

struct FnSource<F>(F);

impl<T, F> MaybeSource<T> for FnSource<F>
where
    F: Fn(MaybeObserverRef<T>) + Send + Sync,
{
    fn subscribe(&self, observer: MaybeObserverRef<T>) {
        (self.0)(observer)
    }
}

impl<T: Send + 'static> Maybe<T> {
    pub fn new(source: impl MaybeSource<T> + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Wrap a raw subscribe function
    pub fn from_subscribe_fn(f: impl Fn(MaybeObserverRef<T>) + Send + Sync + 'static) -> Self {
        Self::new(FnSource(f))
    }

    pub fn subscribe(&self, observer: MaybeObserverRef<T>) {
        self.source.subscribe(observer);
    }

    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_success(value.clone());
        })
    }

    pub fn empty() -> Self {
        Self::from_subscribe_fn(|observer: MaybeObserverRef<T>| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_complete();
        })
    }

    pub fn error(error: FlowError) -> Self {
        Self::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            observer.on_subscribe(BooleanDisposable::disposed());
            observer.on_error(error.clone());
        })
    }

    pub fn never() -> Self {
        Self::from_subscribe_fn(|observer: MaybeObserverRef<T>| {
            observer.on_subscribe(Arc::new(BooleanDisposable::new()));
        })
    }

    /// Compute the optional value for each subscriber
    pub fn from_fn(f: impl Fn() -> FlowResult<Option<T>> + Send + Sync + 'static) -> Self {
        Self::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            let d = Arc::new(BooleanDisposable::new());
            observer.on_subscribe(d.clone());
            if d.is_disposed() {
                return;
            }
            match f() {
                Ok(_) if d.is_disposed() => {}
                Ok(Some(v)) => observer.on_success(v),
                Ok(None) => observer.on_complete(),
                Err(e) if d.is_disposed() => error::on_error(e),
                Err(e) => observer.on_error(e),
            }
        })
    }

    pub fn subscribe_with(
        &self,
        on_success: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> DisposableRef {
        let observer = Arc::new(CallbackObserver {
            upstream: DisposableSlot::new(),
            done: AtomicBool::new(false),
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
            on_complete: Box::new(on_complete),
        });
        self.subscribe(observer.clone());
        observer
    }

    /// Wait for the outcome; `None` when the source completed empty
    pub fn blocking_get(&self) -> FlowResult<Option<T>> {
        let latch = Latch::new();
        self.subscribe(latch.clone());
        latch.wait_optional()
    }

    pub fn blocking_get_timeout(&self, timeout: Duration) -> FlowResult<Option<T>> {
        let latch = Latch::new();
        self.subscribe(latch.clone());
        latch.wait_optional_timeout(timeout)
    }
}

impl<T: Clone + Send + 'static> Maybe<T> {
    pub fn test(&self) -> TestObserver<T> {
        let observer = TestObserver::new();
        self.subscribe(observer.as_maybe_observer());
        observer
    }
}

struct CallbackObserver<T> {
    upstream: DisposableSlot,
    done: AtomicBool,
    on_success: Box<dyn Fn(T) + Send + Sync>,
    on_error: Box<dyn Fn(FlowError) + Send + Sync>,
    on_complete: Box<dyn Fn() + Send + Sync>,
}

impl<T: Send> MaybeObserver<T> for CallbackObserver<T> {
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

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
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
    use std::sync::Mutex;

    #[test]
    fn test_sources() {
        Maybe::just(1).test().assert_result(&[1]);
        Maybe::<i32>::empty().test().assert_result(&[]);
        Maybe::<i32>::error(FlowError::other("e"))
            .test()
            .assert_failure("e", &[]);
        Maybe::<i32>::never().test().assert_empty();
        Maybe::from_fn(|| Ok(None::<i32>)).test().assert_result(&[]);
        Maybe::from_fn(|| Ok(Some(4))).test().assert_result(&[4]);
    }

    #[test]
    fn test_subscribe_with_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&seen), Arc::clone(&seen));
        Maybe::<i32>::empty().subscribe_with(
            move |v| a.lock().unwrap().push(v),
            |e| panic!("unexpected {}", e),
            move || b.lock().unwrap().push(0),
        );
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_blocking_get() {
        assert_eq!(Maybe::just(2).blocking_get().unwrap(), Some(2));
        assert_eq!(Maybe::<i32>::empty().blocking_get().unwrap(), None);
        let err = Maybe::<i32>::never()
            .blocking_get_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
    }
}
