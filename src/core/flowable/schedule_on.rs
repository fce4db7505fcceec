// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thread hopping: `subscribe_on` moves the subscription side effects onto
//! a worker, `observe_on` moves signal delivery onto one.
//!
//! `observe_on` holds a bounded queue of `prefetch` items and replenishes
//! upstream demand in batches of three quarters of it. It fuses with a
//! queue-offering upstream (asking with `BOUNDARY`, since polling happens on
//! the worker) and offers `ASYNC` fusion to its own downstream.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{
    FusionMode, QueueSubscription, Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED,
};
use crate::core::scheduler::{SchedulerRef, WorkerRef};
use crate::core::subscription::{backpressure, validate, SubscriptionSlot};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

impl<T: Send + 'static> Flowable<T> {
    /// Subscribe to the source on a worker of `scheduler`
    pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let worker = scheduler.create_worker();
            let parent = Arc::new(SubscribeOnSubscriber {
                downstream: subscriber,
                worker: Arc::clone(&worker),
                upstream: SubscriptionSlot::new(),
            });
            parent.downstream.on_subscribe(Upstream::Plain(parent.clone()));
            let source = source.clone();
            worker.schedule(Box::new(move || {
                source.subscribe(SubscriberRef::Plain(parent));
            }));
        })
    }

    /// Deliver signals on a worker of `scheduler`, prefetching
    /// [`FlowConfig::buffer_size`] items
    pub fn observe_on(&self, scheduler: SchedulerRef) -> Flowable<T> {
        self.observe_on_with(scheduler, FlowConfig::buffer_size())
    }

    pub fn observe_on_with(&self, scheduler: SchedulerRef, prefetch: usize) -> Flowable<T> {
        let source = self.clone();
        let prefetch = prefetch.max(1);
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let parent = Arc::new_cyclic(|this| ObserveOnSubscriber {
                this: this.clone(),
                downstream: subscriber,
                worker: scheduler.create_worker(),
                prefetch,
                limit: (prefetch - (prefetch >> 2)) as i64,
                upstream: SubscriptionSlot::new(),
                queue: ArrayQueue::new(prefetch),
                source_mode: AtomicU8::new(FusionMode::NONE.bits()),
                output_fused: AtomicBool::new(false),
                requested: CachePadded::new(AtomicI64::new(0)),
                consumed: AtomicI64::new(0),
                wip: CachePadded::new(AtomicUsize::new(0)),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
            });
            source.subscribe(SubscriberRef::Plain(parent));
        })
    }
}

struct SubscribeOnSubscriber<T> {
    downstream: SubscriberRef<T>,
    worker: WorkerRef,
    upstream: SubscriptionSlot<T>,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        self.upstream.deferred_set_once(subscription);
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
        self.worker.dispose();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.worker.dispose();
    }
}

impl<T: Send + 'static> Subscription for SubscribeOnSubscriber<T> {
    fn request(&self, n: i64) {
        self.upstream.deferred_request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.worker.dispose();
    }
}

struct ObserveOnSubscriber<T> {
    this: Weak<ObserveOnSubscriber<T>>,
    downstream: SubscriberRef<T>,
    worker: WorkerRef,
    prefetch: usize,
    limit: i64,
    upstream: SubscriptionSlot<T>,
    queue: ArrayQueue<T>,
    source_mode: AtomicU8,
    output_fused: AtomicBool,
    requested: CachePadded<AtomicI64>,
    /// Items taken since the last upstream replenishment
    consumed: AtomicI64,
    wip: CachePadded<AtomicUsize>,
    done: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

impl<T: Send + 'static> ObserveOnSubscriber<T> {
    fn mode(&self) -> FusionMode {
        FusionMode::from_bits(self.source_mode.load(Ordering::Acquire))
    }

    fn upstream_queue(&self) -> Option<Arc<dyn QueueSubscription<T>>> {
        self.upstream.get().and_then(|u| u.queue().cloned())
    }

    fn poll_next(&self) -> FlowResult<Option<T>> {
        if self.mode().is_none() {
            return Ok(self.queue.pop());
        }
        match self.upstream_queue() {
            Some(queue) => queue.poll(),
            None => Ok(None),
        }
    }

    fn queue_is_empty(&self) -> bool {
        if self.mode().is_none() {
            return self.queue.is_empty();
        }
        self.upstream_queue().map_or(true, |q| q.is_empty())
    }

    fn clear_queue(&self) {
        if self.mode().is_none() {
            while self.queue.pop().is_some() {}
        } else if let Some(queue) = self.upstream_queue() {
            queue.clear();
        }
    }

    /// Count one consumed item, replenishing upstream every `limit` items
    fn replenish(&self) {
        if self.mode() == FusionMode::SYNC {
            return;
        }
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed == self.limit {
            self.consumed.store(0, Ordering::Release);
            self.upstream.request(consumed);
        }
    }

    fn schedule(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.worker.schedule(Box::new(move || this.run()));
        }
    }

    fn run(&self) {
        if self.output_fused.load(Ordering::Acquire) {
            self.run_backfused();
        } else if self.mode() == FusionMode::SYNC {
            self.run_sync();
        } else {
            self.run_async();
        }
    }

    fn take_error(&self) -> Option<FlowError> {
        self.error.lock().ok().and_then(|mut e| e.take())
    }

    fn fail(&self, e: FlowError) {
        self.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
        self.clear_queue();
        self.downstream.on_error(e);
        self.worker.dispose();
    }

    fn check_terminated(&self, done: bool, empty: bool) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            self.clear_queue();
            return true;
        }
        if !done {
            return false;
        }
        if let Some(e) = self.take_error() {
            self.cancelled.store(true, Ordering::Release);
            self.clear_queue();
            self.downstream.on_error(e);
            self.worker.dispose();
            return true;
        }
        if empty {
            self.cancelled.store(true, Ordering::Release);
            self.downstream.on_complete();
            self.worker.dispose();
            return true;
        }
        false
    }

    fn run_async(&self) {
        let mut missed = 1;
        loop {
            let requested = self.requested.load(Ordering::Acquire);
            let mut emitted = 0i64;
            while emitted != requested {
                let done = self.done.load(Ordering::Acquire);
                let item = match self.poll_next() {
                    Ok(item) => item,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                };
                if self.check_terminated(done, item.is_none()) {
                    return;
                }
                let Some(item) = item else {
                    break;
                };
                self.downstream.on_next(item);
                emitted += 1;
                self.replenish();
            }
            if emitted == requested
                && self.check_terminated(self.done.load(Ordering::Acquire), self.queue_is_empty())
            {
                return;
            }
            if emitted != 0 && requested != UNBOUNDED {
                backpressure::produced(&self.requested, emitted);
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn run_sync(&self) {
        let mut missed = 1;
        loop {
            let requested = self.requested.load(Ordering::Acquire);
            let mut emitted = 0i64;
            while emitted != requested {
                let item = match self.poll_next() {
                    Ok(item) => item,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                };
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                match item {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                    }
                    None => {
                        self.cancelled.store(true, Ordering::Release);
                        self.downstream.on_complete();
                        self.worker.dispose();
                        return;
                    }
                }
            }
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if self.queue_is_empty() {
                self.cancelled.store(true, Ordering::Release);
                self.downstream.on_complete();
                self.worker.dispose();
                return;
            }
            if emitted != 0 && requested != UNBOUNDED {
                backpressure::produced(&self.requested, emitted);
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    /// Downstream polls us; only announce availability and terminal events
    fn run_backfused(&self) {
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let done = self.done.load(Ordering::Acquire);
            self.downstream.on_available();
            if done {
                self.cancelled.store(true, Ordering::Release);
                match self.take_error() {
                    Some(e) => self.downstream.on_error(e),
                    None => self.downstream.on_complete(),
                }
                self.worker.dispose();
                return;
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOnSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Some(queue) = subscription.queue() {
            let granted = queue.request_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
            if granted == FusionMode::SYNC {
                log::debug!("observe_on fused synchronously with upstream");
                self.source_mode.store(granted.bits(), Ordering::Release);
                self.done.store(true, Ordering::Release);
                self.downstream.on_subscribe(Upstream::Queue(this));
                return;
            }
            if granted == FusionMode::ASYNC {
                log::debug!("observe_on fused asynchronously with upstream");
                self.source_mode.store(granted.bits(), Ordering::Release);
                self.downstream.on_subscribe(Upstream::Queue(this));
                subscription.request(self.prefetch as i64);
                return;
            }
        }
        self.downstream.on_subscribe(Upstream::Queue(this));
        subscription.request(self.prefetch as i64);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.queue.push(item).is_err() {
            self.upstream.cancel();
            self.on_error(FlowError::missing_backpressure("Queue is full?!"));
            return;
        }
        self.schedule();
    }

    fn on_error(&self, error: FlowError) {
        if self.done.load(Ordering::Acquire) {
            error::on_error(error);
            return;
        }
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error);
        }
        self.done.store(true, Ordering::Release);
        self.schedule();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.schedule();
        }
    }

    fn on_available(&self) {
        self.schedule();
    }
}

impl<T: Send + 'static> Subscription for ObserveOnSubscriber<T> {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
            self.schedule();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        self.worker.dispose();
        if !self.output_fused.load(Ordering::Acquire)
            && self.wip.fetch_add(1, Ordering::AcqRel) == 0
        {
            self.clear_queue();
        }
    }
}

impl<T: Send + 'static> QueueSubscription<T> for ObserveOnSubscriber<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        if mode.contains(FusionMode::ASYNC) {
            self.output_fused.store(true, Ordering::Release);
            return FusionMode::ASYNC;
        }
        FusionMode::NONE
    }

    fn poll(&self) -> FlowResult<Option<T>> {
        let item = self.poll_next()?;
        if item.is_some() {
            self.replenish();
        }
        Ok(item)
    }

    fn is_empty(&self) -> bool {
        self.queue_is_empty()
    }

    fn clear(&self) {
        self.clear_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::{schedulers, TestScheduler};
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::check_double_on_subscribe;
    use serial_test::serial;
    use std::time::Duration;

    fn current_thread_name() -> String {
        std::thread::current().name().unwrap_or_default().to_string()
    }

    #[test]
    fn test_subscribe_on_runs_on_worker() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let n = Arc::clone(&names);
        let source = Flowable::defer(move || {
            n.lock().unwrap().push(current_thread_name());
            Ok(Flowable::range(1, 3))
        });
        let ts = source.subscribe_on(schedulers::computation()).test();
        ts.await_done(Duration::from_secs(5)).assert_result(&[1, 2, 3]);
        assert!(names.lock().unwrap()[0].contains("computation"));
    }

    #[test]
    fn test_subscribe_on_waits_for_worker() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 2)
            .subscribe_on(Arc::new(scheduler.clone()))
            .test();
        ts.assert_empty();
        scheduler.trigger_actions();
        ts.assert_result(&[1, 2]);
    }

    #[test]
    fn test_subscribe_on_request_before_subscription() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 5)
            .subscribe_on(Arc::new(scheduler.clone()))
            .test_with_request(0);
        ts.request(2);
        scheduler.trigger_actions();
        ts.assert_values(&[1, 2]).assert_not_complete();
        ts.request(3);
        ts.assert_result(&[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_observe_on_delivers_on_worker() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let n = Arc::clone(&names);
        let ts = Flowable::range(1, 1000)
            .observe_on(schedulers::single())
            .do_on_next(move |_| n.lock().unwrap().push(current_thread_name()))
            .test();
        ts.await_done(Duration::from_secs(5));
        ts.assert_value_count(1000).assert_complete();
        assert!(names.lock().unwrap().iter().all(|n| n.contains("single")));
    }

    #[test]
    fn test_observe_on_overflow_fails_with_missing_backpressure() {
        let scheduler = TestScheduler::new();
        let upstream = Arc::new(BooleanSubscription::new());
        let up = Arc::clone(&upstream);
        let ts = Flowable::from_subscribe_fn(move |s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::Plain(up.clone()));
            for i in 0..3 {
                s.on_next(i);
            }
        })
        .observe_on_with(Arc::new(scheduler.clone()), 2)
        .test();
        scheduler.trigger_actions();
        assert!(upstream.is_cancelled());
        ts.assert_error_matches(|e| {
            matches!(e, FlowError::MissingBackpressure { message } if message == "Queue is full?!")
        });
    }

    #[test]
    fn test_observe_on_backpressure() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 10)
            .map(|v| v)
            .observe_on_with(Arc::new(scheduler.clone()), 4)
            .test_with_request(0);
        scheduler.trigger_actions();
        ts.assert_empty();
        ts.request(3);
        scheduler.trigger_actions();
        ts.assert_values(&[1, 2, 3]).assert_not_complete();
        ts.request(UNBOUNDED);
        scheduler.trigger_actions();
        ts.assert_result(&(1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_observe_on_sync_fused_upstream() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 5)
            .observe_on(Arc::new(scheduler.clone()))
            .test();
        scheduler.trigger_actions();
        ts.assert_result(&[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_observe_on_offers_async_fusion() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 5)
            .observe_on(Arc::new(scheduler.clone()))
            .test_fused(FusionMode::ANY, UNBOUNDED);
        ts.assert_fusion_mode(FusionMode::ASYNC);
        scheduler.trigger_actions();
        ts.assert_result(&[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_observe_on_error_cuts_ahead() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::from_subscribe_fn(|s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::plain(BooleanSubscription::new()));
            s.on_next(1);
            s.on_next(2);
            s.on_error(FlowError::other("late"));
        })
        .observe_on(Arc::new(scheduler.clone()))
        .test_with_request(1);
        scheduler.trigger_actions();
        ts.assert_failure("late", &[]);
    }

    #[test]
    fn test_observe_on_replenishes_in_batches() {
        let requested = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requested);
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 20)
            .do_on_request(move |n| r.lock().unwrap().push(n))
            .observe_on_with(Arc::new(scheduler.clone()), 8)
            .test();
        scheduler.trigger_actions();
        ts.assert_value_count(20).assert_complete();
        assert_eq!(requested.lock().unwrap()[..3], [8, 6, 6]);
    }

    #[test]
    fn test_cancel_disposes_worker() {
        let scheduler = TestScheduler::new();
        let ts = Flowable::range(1, 5)
            .map(|v| v)
            .observe_on(Arc::new(scheduler.clone()))
            .test();
        ts.cancel();
        scheduler.trigger_actions();
        ts.assert_empty();
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        let scheduler: SchedulerRef = Arc::new(TestScheduler::new());
        check_double_on_subscribe(move |f: Flowable<i32>| f.observe_on(scheduler));
    }
}
