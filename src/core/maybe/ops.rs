// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Maybe, MaybeObserverRef};
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{FlowError, FlowResult};
use crate::core::flowable::Flowable;
use crate::core::protocol::MaybeObserver;
use crate::core::single::{Single, SingleObserverRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Mapper<T, R> = Arc<dyn Fn(T) -> FlowResult<R> + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&T) -> FlowResult<bool> + Send + Sync>;

impl<T: Send + 'static> Maybe<T> {
    pub fn map<R: Send + 'static>(&self, mapper: impl Fn(T) -> R + Send + Sync + 'static) -> Maybe<R> {
        self.try_map(move |v| Ok(mapper(v)))
    }

    pub fn try_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> FlowResult<R> + Send + Sync + 'static,
    ) -> Maybe<R> {
        let source = self.clone();
        let mapper: Mapper<T, R> = Arc::new(mapper);
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<R>| {
            source.subscribe(Arc::new(MapObserver {
                downstream: observer,
                mapper: Arc::clone(&mapper),
            }));
        })
    }

    /// Complete empty when the value fails `predicate`
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Maybe<T> {
        self.try_filter(move |v| Ok(predicate(v)))
    }

    pub fn try_filter(
        &self,
        predicate: impl Fn(&T) -> FlowResult<bool> + Send + Sync + 'static,
    ) -> Maybe<T> {
        let source = self.clone();
        let predicate: Predicate<T> = Arc::new(predicate);
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            source.subscribe(Arc::new(FilterObserver {
                downstream: observer,
                predicate: Arc::clone(&predicate),
            }));
        })
    }

    /// Run `action` once when the downstream disposes
    pub fn do_on_dispose(&self, action: impl Fn() + Send + Sync + 'static) -> Maybe<T> {
        let source = self.clone();
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(action);
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            source.subscribe(Arc::new(DisposePeek {
                downstream: observer,
                upstream: Arc::new(DisposableSlot::new()),
                action: Arc::clone(&action),
                fired: Arc::new(AtomicBool::new(false)),
            }));
        })
    }

    /// Signal `default` when the source completes empty
    pub fn to_single(&self, default: T) -> Single<T>
    where
        T: Clone + Sync,
    {
        let source = self.clone();
        Single::from_subscribe_fn(move |observer: SingleObserverRef<T>| {
            source.subscribe(Arc::new(ToSingleObserver {
                downstream: observer,
                default: default.clone(),
            }));
        })
    }

    pub fn to_flowable(&self) -> Flowable<T> {
        Flowable::from_maybe(self.clone())
    }
}

struct MapObserver<T, R> {
    downstream: MaybeObserverRef<R>,
    mapper: Mapper<T, R>,
}

impl<T: Send, R: Send> MaybeObserver<T> for MapObserver<T, R> {
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

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct FilterObserver<T> {
    downstream: MaybeObserverRef<T>,
    predicate: Predicate<T>,
}

impl<T: Send> MaybeObserver<T> for FilterObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.downstream.on_subscribe(disposable);
    }

    fn on_success(&self, value: T) {
        match (self.predicate)(&value) {
            Ok(true) => self.downstream.on_success(value),
            Ok(false) => self.downstream.on_complete(),
            Err(e) => self.downstream.on_error(e),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DisposePeek<T> {
    downstream: MaybeObserverRef<T>,
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

impl<T: Send> MaybeObserver<T> for DisposePeek<T> {
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

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct ToSingleObserver<T> {
    downstream: SingleObserverRef<T>,
    default: T,
}

impl<T: Clone + Send + Sync> MaybeObserver<T> for ToSingleObserver<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.downstream.on_subscribe(disposable);
    }

    fn on_success(&self, value: T) {
        self.downstream.on_success(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_success(self.default.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_map_filter() {
        Maybe::just(4).map(|v| v * 2).test().assert_result(&[8]);
        Maybe::just(3).filter(|v| v % 2 == 0).test().assert_result(&[]);
        Maybe::just(4).filter(|v| v % 2 == 0).test().assert_result(&[4]);
        Maybe::<i32>::empty().map(|v| v + 1).test().assert_result(&[]);
    }

    #[test]
    fn test_filter_failure() {
        Maybe::just(1)
            .try_filter(|_| Err(FlowError::callback("bad predicate")))
            .test()
            .assert_failure("bad predicate", &[]);
    }

    #[test]
    fn test_to_single_default() {
        Maybe::<i32>::empty().to_single(-1).test().assert_result(&[-1]);
        Maybe::just(5).to_single(-1).test().assert_result(&[5]);
    }

    #[test]
    fn test_to_flowable() {
        Maybe::just(5).to_flowable().test().assert_result(&[5]);
        Maybe::<i32>::empty().to_flowable().test().assert_result(&[]);
    }

    #[test]
    fn test_do_on_dispose() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let to = Maybe::<i32>::never()
            .do_on_dispose(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .test();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        to.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
