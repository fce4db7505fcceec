// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Completable, CompletableObserverRef};
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError};
use crate::core::flowable::Flowable;
use crate::core::protocol::{
    CompletableObserver, Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED,
};
use crate::core::scheduler::SchedulerRef;
use crate::core::subscription::{validate, SubscriptionSlot};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

impl Completable {
    /// Run `action` once when the downstream disposes
    pub fn do_on_dispose(&self, action: impl Fn() + Send + Sync + 'static) -> Completable {
        let source = self.clone();
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(action);
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            source.subscribe(Arc::new(DisposePeek {
                downstream: observer,
                upstream: Arc::new(DisposableSlot::new()),
                action: Arc::clone(&action),
                fired: Arc::new(AtomicBool::new(false)),
            }));
        })
    }

    /// Subscribe to the source on `scheduler`
    pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Completable {
        let source = self.clone();
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            let parent = Arc::new(SubscribeOnObserver {
                downstream: observer,
                upstream: DisposableSlot::new(),
                task: DisposableSlot::new(),
            });
            parent.downstream.on_subscribe(parent.clone());
            let (p, s) = (Arc::clone(&parent), source.clone());
            let task = scheduler.schedule_direct(Box::new(move || s.subscribe(p)), Duration::ZERO);
            parent.task.replace(task);
        })
    }

    /// Dispose the source on `scheduler` instead of the disposing thread
    ///
    /// Signals arriving after the downstream disposed are dropped; errors
    /// go to the error hook.
    pub fn unsubscribe_on(&self, scheduler: SchedulerRef) -> Completable {
        let source = self.clone();
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            source.subscribe(Arc::new_cyclic(|this| UnsubscribeOnObserver {
                this: this.clone(),
                downstream: observer,
                upstream: Arc::new(DisposableSlot::new()),
                scheduler: Arc::clone(&scheduler),
                disposed: AtomicBool::new(false),
            }));
        })
    }

    /// Run every source in order, failing at the end if any of them failed
    ///
    /// Several failures are combined into one composite error.
    pub fn concat_delay_error(sources: impl IntoIterator<Item = Completable>) -> Completable {
        let sources: Arc<Vec<Completable>> = Arc::new(sources.into_iter().collect());
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            let parent = Arc::new_cyclic(|this| ConcatObserver {
                this: this.clone(),
                downstream: observer,
                sources: Arc::clone(&sources),
                index: AtomicUsize::new(0),
                wip: AtomicUsize::new(0),
                current: Arc::new(DisposableSlot::new()),
                errors: Mutex::new(None),
            });
            parent.downstream.on_subscribe(Arc::new(ConcatHandle {
                current: Arc::clone(&parent.current),
            }));
            parent.subscribe_next();
        })
    }

    /// A [`Flowable`] that emits nothing and mirrors the terminal signal
    pub fn to_flowable<T: Send + 'static>(&self) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            source.subscribe(Arc::new_cyclic(|this| FlowableBridge {
                this: this.clone(),
                downstream: subscriber,
                upstream: DisposableSlot::new(),
            }));
        })
    }
}

impl<T: Send + 'static> Flowable<T> {
    /// Drop every item and keep only the terminal signal
    pub fn ignore_elements(&self) -> Completable {
        let source = self.clone();
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            source.subscribe(SubscriberRef::plain(Arc::new_cyclic(|this| {
                IgnoreElementsSubscriber {
                    this: this.clone(),
                    downstream: observer,
                    upstream: SubscriptionSlot::new(),
                }
            })));
        })
    }
}

struct DisposePeek {
    downstream: CompletableObserverRef,
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

impl CompletableObserver for DisposePeek {
    fn on_subscribe(&self, disposable: DisposableRef) {
        if self.upstream.set_once(disposable) {
            self.downstream.on_subscribe(Arc::new(DisposeHandle {
                upstream: Arc::clone(&self.upstream),
                action: Arc::clone(&self.action),
                fired: Arc::clone(&self.fired),
            }));
        }
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

struct SubscribeOnObserver {
    downstream: CompletableObserverRef,
    upstream: DisposableSlot,
    task: DisposableSlot,
}

impl CompletableObserver for SubscribeOnObserver {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.upstream.set_once(disposable);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

impl Disposable for SubscribeOnObserver {
    fn dispose(&self) {
        self.task.dispose();
        self.upstream.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}

struct UnsubscribeOnObserver {
    this: Weak<UnsubscribeOnObserver>,
    downstream: CompletableObserverRef,
    upstream: Arc<DisposableSlot>,
    scheduler: SchedulerRef,
    disposed: AtomicBool,
}

impl CompletableObserver for UnsubscribeOnObserver {
    fn on_subscribe(&self, disposable: DisposableRef) {
        if !self.upstream.set_once(disposable) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(this);
        }
    }

    fn on_complete(&self) {
        if !self.disposed.load(Ordering::Acquire) {
            self.downstream.on_complete();
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.disposed.load(Ordering::Acquire) {
            error::on_error(error);
            return;
        }
        self.downstream.on_error(error);
    }
}

impl Disposable for UnsubscribeOnObserver {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = Arc::clone(&self.upstream);
        self.scheduler
            .schedule_direct(Box::new(move || upstream.dispose()), Duration::ZERO);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct ConcatObserver {
    this: Weak<ConcatObserver>,
    downstream: CompletableObserverRef,
    sources: Arc<Vec<Completable>>,
    index: AtomicUsize,
    wip: AtomicUsize,
    current: Arc<DisposableSlot>,
    errors: Mutex<Option<FlowError>>,
}

impl ConcatObserver {
    /// Subscribe to the next source; synchronous completions loop here
    /// instead of recursing
    fn subscribe_next(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut missed = 1;
        loop {
            if self.current.is_disposed() {
                return;
            }
            let index = self.index.fetch_add(1, Ordering::AcqRel);
            match self.sources.get(index) {
                Some(source) => source.subscribe(this.clone()),
                None => {
                    match self.errors.lock().ok().and_then(|mut e| e.take()) {
                        Some(e) => self.downstream.on_error(e),
                        None => self.downstream.on_complete(),
                    }
                    return;
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl CompletableObserver for ConcatObserver {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.current.replace(disposable);
    }

    fn on_complete(&self) {
        self.subscribe_next();
    }

    fn on_error(&self, error: FlowError) {
        if let Ok(mut errors) = self.errors.lock() {
            let combined = match errors.take() {
                Some(first) => FlowError::composite(first, error),
                None => error,
            };
            *errors = Some(combined);
        }
        self.subscribe_next();
    }
}

struct ConcatHandle {
    current: Arc<DisposableSlot>,
}

impl Disposable for ConcatHandle {
    fn dispose(&self) {
        self.current.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.current.is_disposed()
    }
}

struct FlowableBridge<T> {
    this: Weak<FlowableBridge<T>>,
    downstream: SubscriberRef<T>,
    upstream: DisposableSlot,
}

impl<T: Send + 'static> CompletableObserver for FlowableBridge<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        if !self.upstream.set_once(disposable) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }
}

impl<T: Send + 'static> Subscription for FlowableBridge<T> {
    fn request(&self, n: i64) {
        validate(n);
    }

    fn cancel(&self) {
        self.upstream.dispose();
    }
}

struct IgnoreElementsSubscriber<T> {
    this: Weak<IgnoreElementsSubscriber<T>>,
    downstream: CompletableObserverRef,
    upstream: SubscriptionSlot<T>,
}

impl<T: Send + 'static> Subscriber<T> for IgnoreElementsSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(this);
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, _item: T) {}

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Disposable for IgnoreElementsSubscriber<T> {
    fn dispose(&self) {
        self.upstream.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_cancelled()
    }
}
