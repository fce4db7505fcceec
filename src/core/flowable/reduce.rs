// SPDX-License-Identifier: MIT OR Apache-2.0

//! Folding aggregations: `reduce` into a `Maybe`, `reduce_with` and
//! `to_list` into a `Single`.

use super::Flowable;
use crate::core::disposable::Disposable;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::maybe::{Maybe, MaybeObserverRef};
use crate::core::protocol::{Subscriber, SubscriberRef, Upstream, UNBOUNDED};
use crate::core::single::{Single, SingleObserverRef};
use crate::core::subscription::SubscriptionSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Reducer<A, T> = Arc<dyn Fn(A, T) -> FlowResult<A> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// Fold the items pairwise; empty when the source is empty
    pub fn reduce(&self, reducer: impl Fn(T, T) -> T + Send + Sync + 'static) -> Maybe<T> {
        self.try_reduce(move |a, b| Ok(reducer(a, b)))
    }

    pub fn try_reduce(
        &self,
        reducer: impl Fn(T, T) -> FlowResult<T> + Send + Sync + 'static,
    ) -> Maybe<T> {
        let source = self.clone();
        let reducer: Reducer<T, T> = Arc::new(reducer);
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            let fold = Fold::new(
                None,
                Some(identity::<T>),
                Arc::clone(&reducer),
                Sink::Maybe(observer),
            );
            source.subscribe(SubscriberRef::Plain(fold));
        })
    }

    /// Fold the items into `seed`; the seed itself for an empty source
    pub fn reduce_with<A>(
        &self,
        seed: A,
        reducer: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Single<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        self.try_reduce_with(seed, move |a, v| Ok(reducer(a, v)))
    }

    pub fn try_reduce_with<A>(
        &self,
        seed: A,
        reducer: impl Fn(A, T) -> FlowResult<A> + Send + Sync + 'static,
    ) -> Single<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        let source = self.clone();
        let reducer: Reducer<A, T> = Arc::new(reducer);
        Single::from_subscribe_fn(move |observer: SingleObserverRef<A>| {
            let fold = Fold::new(
                Some(seed.clone()),
                None,
                Arc::clone(&reducer),
                Sink::Single(observer),
            );
            source.subscribe(SubscriberRef::Plain(fold));
        })
    }

    /// Collect every item
    pub fn to_list(&self) -> Single<Vec<T>> {
        let source = self.clone();
        let push: Reducer<Vec<T>, T> = Arc::new(|mut list, v| {
            list.push(v);
            Ok(list)
        });
        Single::from_subscribe_fn(move |observer: SingleObserverRef<Vec<T>>| {
            let fold = Fold::new(Some(Vec::new()), None, Arc::clone(&push), Sink::Single(observer));
            source.subscribe(SubscriberRef::Plain(fold));
        })
    }
}

fn identity<T>(v: T) -> T {
    v
}

enum Sink<A> {
    Maybe(MaybeObserverRef<A>),
    Single(SingleObserverRef<A>),
}

impl<A> Sink<A> {
    fn error(&self, e: FlowError) {
        match self {
            Sink::Maybe(o) => o.on_error(e),
            Sink::Single(o) => o.on_error(e),
        }
    }
}

struct Fold<A, T> {
    this: Weak<Fold<A, T>>,
    acc: Mutex<Option<A>>,
    /// Turns the first item into the accumulator when there is no seed
    first: Option<fn(T) -> A>,
    reducer: Reducer<A, T>,
    sink: Sink<A>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<A: Send + 'static, T: Send + 'static> Fold<A, T> {
    fn new(
        seed: Option<A>,
        first: Option<fn(T) -> A>,
        reducer: Reducer<A, T>,
        sink: Sink<A>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Fold {
            this: this.clone(),
            acc: Mutex::new(seed),
            first,
            reducer,
            sink,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        })
    }
}

impl<A: Send + 'static, T: Send + 'static> Fold<A, T> {
    fn step(&self, acc: Option<A>, item: T) -> FlowResult<A> {
        match (acc, self.first) {
            (Some(a), _) => (self.reducer)(a, item),
            (None, Some(first)) => Ok(first(item)),
            (None, None) => Err(FlowError::other("Fold accumulator missing")),
        }
    }
}

impl<A: Send + 'static, T: Send + 'static> Subscriber<T> for Fold<A, T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            match &self.sink {
                Sink::Maybe(o) => o.on_subscribe(this),
                Sink::Single(o) => o.on_subscribe(this),
            }
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut acc) = self.acc.lock() else {
            return;
        };
        match self.step(acc.take(), item) {
            Ok(next) => *acc = Some(next),
            Err(e) => {
                drop(acc);
                self.done.store(true, Ordering::Release);
                self.upstream.cancel();
                self.sink.error(e);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        if let Ok(mut acc) = self.acc.lock() {
            acc.take();
        }
        self.sink.error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let acc = self.acc.lock().ok().and_then(|mut a| a.take());
        match (&self.sink, acc) {
            (Sink::Maybe(o), Some(v)) => o.on_success(v),
            (Sink::Maybe(o), None) => o.on_complete(),
            (Sink::Single(o), Some(v)) => o.on_success(v),
            (Sink::Single(o), None) => {
                o.on_error(FlowError::no_such_element("The source is empty"))
            }
        }
    }
}

impl<A: Send + 'static, T: Send + 'static> Disposable for Fold<A, T> {
    fn dispose(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_cancelled()
    }
}
