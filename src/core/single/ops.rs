// SPDX-License-Identifier: MIT OR Apache-2.0

//! Value transformations, combination and resubscription for [`Single`].

use super::{Single, SingleObserverRef};
use crate::core::disposable::{CompositeDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::flowable::Flowable;
use crate::core::protocol::SingleObserver;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

impl<T: Send + 'static> Single<T> {
    pub fn map<R: Send + 'static>(&self, mapper: impl Fn(T) -> R + Send + Sync + 'static) -> Single<R> {
        self.try_map(move |v| Ok(mapper(v)))
    }

    /// Transform the value; an `Err` becomes the error signal
    pub fn try_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> FlowResult<R> + Send + Sync + 'static,
    ) -> Single<R> {
        let source = self.clone();
        let mapper: Arc<dyn Fn(T) -> FlowResult<R> + Send + Sync> = Arc::new(mapper);
        Single::from_subscribe_fn(move |observer: SingleObserverRef<R>| {
            source.subscribe(Arc::new(MapObserver {
                downstream: observer,
                mapper: Arc::clone(&mapper),
            }));
        })
    }

    /// Continue with the `Single` produced from the value
    pub fn flat_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> FlowResult<Single<R>> + Send + Sync + 'static,
    ) -> Single<R> {
        let source = self.clone();
        let mapper: Arc<dyn Fn(T) -> FlowResult<Single<R>> + Send + Sync> = Arc::new(mapper);
        Single::from_subscribe_fn(move |observer: SingleObserverRef<R>| {
            let serial = Arc::new(DisposableSlot::new());
            observer.on_subscribe(serial.clone());
            source.subscribe(Arc::new(FlatMapObserver {
                downstream: observer,
                serial,
                mapper: Arc::clone(&mapper),
            }));
        })
    }

    /// Combine with the value of `other` once both succeeded
    ///
    /// The first error wins and disposes the other side.
    pub fn zip_with<U, R>(
        &self,
        other: &Single<U>,
        zipper: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Single<R>
    where
        U: Send + 'static,
        R: Send + 'static,
    {
        let (left, right) = (self.clone(), other.clone());
        let zipper: Arc<dyn Fn(T, U) -> R + Send + Sync> = Arc::new(zipper);
        Single::from_subscribe_fn(move |observer: SingleObserverRef<R>| {
            let coordinator = Arc::new(ZipCoordinator {
                downstream: observer,
                values: Mutex::new((None, None)),
                done: AtomicBool::new(false),
                set: Arc::new(CompositeDisposable::new()),
                zipper: Arc::clone(&zipper),
            });
            coordinator.downstream.on_subscribe(coordinator.set.clone());
            left.subscribe(Arc::new(ZipLeft(Arc::clone(&coordinator))));
            right.subscribe(Arc::new(ZipRight(coordinator)));
        })
    }

    /// Resubscribe after an error, at most `times` times
    pub fn retry(&self, times: usize) -> Single<T> {
        let source = self.clone();
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            let serial = Arc::new(DisposableSlot::new());
            observer.on_subscribe(serial.clone());
            let retry = Arc::new_cyclic(|this| RetryObserver {
                this: this.clone(),
                source: source.clone(),
                downstream: observer,
                serial,
                remaining: AtomicUsize::new(times),
            });
            retry.source.subscribe(retry.clone());
        })
    }

    /// Run `action` once when the downstream disposes
    pub fn do_on_dispose(&self, action: impl Fn() + Send + Sync + 'static) -> Single<T> {
        let source = self.clone();
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(action);
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            source.subscribe(Arc::new(DisposePeek {
                downstream: observer,
                upstream: Arc::new(DisposableSlot::new()),
                action: Arc::clone(&action),
                fired: Arc::new(AtomicBool::new(false)),
            }));
        })
    }

    /// The value as a one-item [`Flowable`], emitted on request
    pub fn to_flowable(&self) -> Flowable<T> {
        Flowable::from_single(self.clone())
    }
}

struct MapObserver<T, R> {
    downstream: SingleObserverRef<R>,
    mapper: Arc<dyn Fn(T) -> FlowResult<R> + Send + Sync>,
}

impl<T: Send, R: Send> SingleObserver<T> for MapObserver<T, R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.downstream.on_subscribe(disposable);
    }

    fn on_success(&self, value: T) {
        match (self.mapper)(value) {
            Ok(v) => self.downstream.on_success(v),
            Err(e) => self.downstream.on_error(e),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct FlatMapObserver<T, R> {
    downstream: SingleObserverRef<R>,
    serial: Arc<DisposableSlot>,
    mapper: Arc<dyn Fn(T) -> FlowResult<Single<R>> + Send + Sync>,
}

impl<T: Send, R: Send + 'static> SingleObserver<T> for FlatMapObserver<T, R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.serial.replace(disposable);
    }

    fn on_success(&self, value: T) {
        if self.serial.is_disposed() {
            return;
        }
        match (self.mapper)(value) {
            Ok(inner) => inner.subscribe(Arc::new(InnerObserver {
                downstream: Arc::clone(&self.downstream),
                serial: Arc::clone(&self.serial),
            })),
            Err(e) => self.downstream.on_error(e),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct InnerObserver<R> {
    downstream: SingleObserverRef<R>,
    serial: Arc<DisposableSlot>,
}

impl<R: Send> SingleObserver<R> for InnerObserver<R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.serial.replace(disposable);
    }

    fn on_success(&self, value: R) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct ZipCoordinator<T, U, R> {
    downstream: SingleObserverRef<R>,
    values: Mutex<(Option<T>, Option<U>)>,
    done: AtomicBool,
    set: Arc<CompositeDisposable>,
    zipper: Arc<dyn Fn(T, U) -> R + Send + Sync>,
}

impl<T, U, R> ZipCoordinator<T, U, R> {
    fn try_emit(&self) {
        let pair = match self.values.lock() {
            Ok(mut values) => match (values.0.take(), values.1.take()) {
                (Some(t), Some(u)) => Some((t, u)),
                (t, u) => {
                    *values = (t, u);
                    None
                }
            },
            Err(_) => None,
        };
        if let Some((t, u)) = pair {
            if !self.done.swap(true, Ordering::AcqRel) {
                self.downstream.on_success((self.zipper)(t, u));
            }
        }
    }

    fn fail(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.set.dispose();
        self.downstream.on_error(error);
    }
}

struct ZipLeft<T, U, R>(Arc<ZipCoordinator<T, U, R>>);
struct ZipRight<T, U, R>(Arc<ZipCoordinator<T, U, R>>);

impl<T: Send, U: Send, R: Send> SingleObserver<T> for ZipLeft<T, U, R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.0.set.add(disposable);
    }

    fn on_success(&self, value: T) {
        if let Ok(mut values) = self.0.values.lock() {
            values.0 = Some(value);
        }
        self.0.try_emit();
    }

    fn on_error(&self, error: FlowError) {
        self.0.fail(error);
    }
}

impl<T: Send, U: Send, R: Send> SingleObserver<U> for ZipRight<T, U, R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.0.set.add(disposable);
    }

    fn on_success(&self, value: U) {
        if let Ok(mut values) = self.0.values.lock() {
            values.1 = Some(value);
        }
        self.0.try_emit();
    }

    fn on_error(&self, error: FlowError) {
        self.0.fail(error);
    }
}

struct RetryObserver<T> {
    this: Weak<RetryObserver<T>>,
    source: Single<T>,
    downstream: SingleObserverRef<T>,
    serial: Arc<DisposableSlot>,
    remaining: AtomicUsize,
}

impl<T: Send + 'static> SingleObserver<T> for RetryObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.serial.replace(disposable);
    }

    fn on_success(&self, value: T) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        if self.serial.is_disposed() {
            error::on_error(error);
            return;
        }
        let left = self.remaining.load(Ordering::Acquire);
        if left == 0 {
            self.downstream.on_error(error);
            return;
        }
        self.remaining.store(left - 1, Ordering::Release);
        log::debug!("Resubscribing single after error, {} attempts left", left - 1);
        if let Some(this) = self.this.upgrade() {
            self.source.subscribe(this);
        }
    }
}

struct DisposePeek<T> {
    downstream: SingleObserverRef<T>,
    upstream: Arc<DisposableSlot>,
    action: Arc<dyn Fn() + Send + Sync>,
    fired: Arc<AtomicBool>,
}

struct DisposeHandle {
    upstream: Arc<DisposableSlot>,
    action: Arc<dyn Fn() + Send + Sync>,
    fired: Arc<AtomicBool>,
}

impl Disposable for DisposeHandle {
    fn dispose(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.action)();
        }
        self.upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

impl<T: Send> SingleObserver<T> for DisposePeek<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        if self.upstream.set_once(disposable) {
            self.downstream.on_subscribe(Arc::new(DisposeHandle {
                upstream: Arc::clone(&self.upstream),
                action: Arc::clone(&self.action),
                fired: Arc::clone(&self.fired),
            }));
        }
    }

    fn on_success(&self, value: T) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_failure() {
        Single::just(2).map(|v| v * 21).test().assert_result(&[42]);
        Single::just(2)
            .try_map(|_| Err::<i32, _>(FlowError::callback("no map")))
            .test()
            .assert_failure("no map", &[]);
    }

    #[test]
    fn test_flat_map() {
        Single::just(3)
            .flat_map(|v| Ok(Single::just(v + 1)))
            .test()
            .assert_result(&[4]);
        Single::just(3)
            .flat_map(|_| Ok(Single::<i32>::error(FlowError::other("inner"))))
            .test()
            .assert_failure("inner", &[]);
    }

    #[test]
    fn test_zip_with() {
        Single::just(1)
            .zip_with(&Single::just("a"), |n, s| format!("{}{}", s, n))
            .test()
            .assert_result(&["a1".to_string()]);
    }

    #[test]
    fn test_zip_error_disposes_other() {
        let to = Single::<i32>::error(FlowError::other("left"))
            .zip_with(&Single::<i32>::never(), |a, b| a + b)
            .test();
        to.assert_failure("left", &[]);
    }

    #[test]
    fn test_retry_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        Single::from_fn(move || {
            if a.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FlowError::callback("flaky"))
            } else {
                Ok(7)
            }
        })
        .retry(5)
        .test()
        .assert_result(&[7]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        Single::<i32>::error(FlowError::callback("always"))
            .retry(2)
            .test()
            .assert_failure("always", &[]);
    }

    #[test]
    fn test_do_on_dispose_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let to = Single::<i32>::never()
            .do_on_dispose(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .test();
        to.dispose();
        to.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_to_flowable_waits_for_request() {
        let ts = Single::just(5).to_flowable().test_with_request(0);
        ts.assert_empty();
        ts.request(1);
        ts.assert_result(&[5]);
    }
}
