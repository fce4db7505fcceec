// SPDX-License-Identifier: MIT OR Apache-2.0

//! Map every item to an inner flow and merge the inner flows.
//!
//! At most `max_concurrency` inner flows are active; the upstream is asked
//! for one more item whenever an inner flow finishes. Each inner flow owns a
//! prefetch queue and a single drain loop, chosen by the work-in-progress
//! counter, moves values downstream within the outstanding demand. The first
//! error cancels everything and terminates the merged flow.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED};
use crate::core::subscription::{backpressure, validate, SubscriptionSlot};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

type FlatMapper<T, R> = Arc<dyn Fn(T) -> FlowResult<Flowable<R>> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// Merge the flows produced by `mapper`, running at most
    /// `max_concurrency` of them at once (`usize::MAX` for no limit)
    pub fn flat_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> Flowable<R> + Send + Sync + 'static,
        max_concurrency: usize,
    ) -> Flowable<R> {
        self.try_flat_map(move |v| Ok(mapper(v)), max_concurrency)
    }

    pub fn try_flat_map<R: Send + 'static>(
        &self,
        mapper: impl Fn(T) -> FlowResult<Flowable<R>> + Send + Sync + 'static,
        max_concurrency: usize,
    ) -> Flowable<R> {
        let source = self.clone();
        let mapper: FlatMapper<T, R> = Arc::new(mapper);
        let max_concurrency = max_concurrency.max(1);
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<R>| {
            let merge = Arc::new_cyclic(|this| MergeSubscriber {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                mapper: Arc::clone(&mapper),
                max_concurrency,
                prefetch: FlowConfig::buffer_size(),
                inners: Mutex::new(Vec::new()),
                requested: CachePadded::new(AtomicI64::new(0)),
                wip: CachePadded::new(AtomicUsize::new(0)),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
            });
            source.subscribe(SubscriberRef::Plain(merge));
        })
    }
}

struct MergeSubscriber<T, R> {
    this: Weak<MergeSubscriber<T, R>>,
    downstream: SubscriberRef<R>,
    upstream: SubscriptionSlot<T>,
    mapper: FlatMapper<T, R>,
    max_concurrency: usize,
    prefetch: usize,
    inners: Mutex<Vec<Arc<InnerSubscriber<T, R>>>>,
    requested: CachePadded<AtomicI64>,
    wip: CachePadded<AtomicUsize>,
    done: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

impl<T: Send + 'static, R: Send + 'static> MergeSubscriber<T, R> {
    fn snapshot(&self) -> Vec<Arc<InnerSubscriber<T, R>>> {
        self.inners.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn remove(&self, inner: &Arc<InnerSubscriber<T, R>>) {
        if let Ok(mut inners) = self.inners.lock() {
            inners.retain(|i| !Arc::ptr_eq(i, inner));
        }
    }

    fn cancel_inners(&self) {
        let inners = self
            .inners
            .lock()
            .map(|mut i| std::mem::take(&mut *i))
            .unwrap_or_default();
        for inner in inners {
            inner.upstream.cancel();
            while inner.queue.pop().is_some() {}
        }
    }

    fn add_error(&self, error: FlowError) {
        if self.cancelled.load(Ordering::Acquire) {
            error::on_error(error);
            return;
        }
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(match slot.take() {
                Some(previous) => FlowError::composite(previous, error),
                None => error,
            });
        }
        self.drain();
    }

    /// `true` when the drain loop must stop
    fn check_terminate(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            self.cancel_inners();
            return true;
        }
        let failure = self.error.lock().ok().and_then(|mut e| e.take());
        if let Some(e) = failure {
            self.cancelled.store(true, Ordering::Release);
            self.upstream.cancel();
            self.cancel_inners();
            self.downstream.on_error(e);
            return true;
        }
        false
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.check_terminate() {
                return;
            }
            let upstream_done = self.done.load(Ordering::Acquire);
            let inners = self.snapshot();
            if upstream_done && inners.is_empty() {
                self.cancelled.store(true, Ordering::Release);
                self.downstream.on_complete();
                return;
            }

            let requested = self.requested.load(Ordering::Acquire);
            let mut emitted = 0i64;
            let mut finished = 0i64;
            for inner in &inners {
                while emitted != requested {
                    if self.check_terminate() {
                        return;
                    }
                    let Some(v) = inner.queue.pop() else {
                        break;
                    };
                    self.downstream.on_next(v);
                    emitted += 1;
                    inner.consumed_one();
                }
                if inner.done.load(Ordering::Acquire) && inner.queue.is_empty() {
                    self.remove(inner);
                    finished += 1;
                }
            }
            if emitted != 0 && requested != UNBOUNDED {
                backpressure::produced(&self.requested, emitted);
            }
            if finished != 0 {
                if self.max_concurrency != usize::MAX && !self.cancelled.load(Ordering::Acquire) {
                    self.upstream.request(finished);
                }
                continue;
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for MergeSubscriber<T, R> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
        if self.max_concurrency == usize::MAX {
            subscription.request(UNBOUNDED);
        } else {
            subscription.request(self.max_concurrency.min(i64::MAX as usize) as i64);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let source = match (self.mapper)(item) {
            Ok(source) => source,
            Err(e) => {
                self.upstream.cancel();
                self.done.store(true, Ordering::Release);
                self.add_error(e);
                return;
            }
        };
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::new(InnerSubscriber::new(self.this.clone(), self.prefetch));
        if let Ok(mut inners) = self.inners.lock() {
            inners.push(Arc::clone(&inner));
        }
        source.subscribe(SubscriberRef::Plain(inner));
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        self.add_error(error);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscription for MergeSubscriber<T, R> {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
            self.drain();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.cancel_inners();
        }
    }
}

struct InnerSubscriber<T, R> {
    parent: Weak<MergeSubscriber<T, R>>,
    upstream: SubscriptionSlot<R>,
    queue: ArrayQueue<R>,
    limit: i64,
    prefetch: usize,
    consumed: AtomicI64,
    done: AtomicBool,
}

impl<T: Send + 'static, R: Send + 'static> InnerSubscriber<T, R> {
    fn new(parent: Weak<MergeSubscriber<T, R>>, prefetch: usize) -> Self {
        Self {
            parent,
            upstream: SubscriptionSlot::new(),
            queue: ArrayQueue::new(prefetch),
            limit: (prefetch - (prefetch >> 2)) as i64,
            prefetch,
            consumed: AtomicI64::new(0),
            done: AtomicBool::new(false),
        }
    }

    fn consumed_one(&self) {
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed == self.limit {
            self.consumed.store(0, Ordering::Release);
            self.upstream.request(consumed);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<R> for InnerSubscriber<T, R> {
    fn on_subscribe(&self, subscription: Upstream<R>) {
        if self.upstream.set_once(subscription.clone()) {
            subscription.request(self.prefetch as i64);
        }
    }

    fn on_next(&self, item: R) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if self.queue.push(item).is_err() {
            self.upstream.cancel();
            self.done.store(true, Ordering::Release);
            parent.add_error(FlowError::missing_backpressure(
                "Inner queue is full: the inner source ignored backpressure",
            ));
            return;
        }
        parent.drain();
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        match self.parent.upgrade() {
            Some(parent) => parent.add_error(error),
            None => error::on_error(error),
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::schedulers;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::{check_double_on_subscribe, ErrorCapture};
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_flat_map_synchronous_inners() {
        Flowable::range(1, 3)
            .flat_map(|v| Flowable::range(v * 10, 2), 2)
            .test()
            .assert_result(&[10, 11, 20, 21, 30, 31]);
    }

    #[test]
    fn test_max_concurrency_bounds_upstream_demand() {
        let requested = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requested);
        let ts = Flowable::range(1, 10)
            .do_on_request(move |n| r.lock().unwrap().push(n))
            .flat_map(|_| Flowable::<i32>::never(), 3)
            .test();
        ts.assert_empty();
        assert_eq!(*requested.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_finished_inner_requests_replacement() {
        let requested = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requested);
        Flowable::range(1, 3)
            .do_on_request(move |n| r.lock().unwrap().push(n))
            .flat_map(Flowable::just, 1)
            .test()
            .assert_result(&[1, 2, 3]);
        assert_eq!(*requested.lock().unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_unbounded_concurrency() {
        Flowable::range(1, 1000)
            .flat_map(Flowable::just, usize::MAX)
            .test()
            .assert_value_count(1000)
            .assert_complete();
    }

    #[test]
    fn test_backpressure() {
        let ts = Flowable::range(1, 2)
            .flat_map(|v| Flowable::range(v * 100, 5), 2)
            .test_with_request(0);
        ts.assert_empty();
        ts.request(3);
        ts.assert_values(&[100, 101, 102]).assert_not_complete();
        ts.request(UNBOUNDED);
        ts.assert_value_count(10).assert_complete();
    }

    #[test]
    fn test_inner_error_cancels_everything() {
        let outer = Arc::new(BooleanSubscription::new());
        let o = Arc::clone(&outer);
        let source = Flowable::from_subscribe_fn(move |s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::Plain(o.clone()));
            s.on_next(1);
            s.on_next(2);
        });
        let sibling = Arc::new(BooleanSubscription::new());
        let sib = Arc::clone(&sibling);
        source
            .flat_map(
                move |v| {
                    if v == 1 {
                        let sib = Arc::clone(&sib);
                        Flowable::from_subscribe_fn(move |s: SubscriberRef<i32>| {
                            s.on_subscribe(Upstream::Plain(sib.clone()));
                        })
                    } else {
                        Flowable::error(FlowError::other("inner"))
                    }
                },
                4,
            )
            .test()
            .assert_failure("inner", &[]);
        assert!(outer.is_cancelled());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_mapper_failure() {
        Flowable::range(1, 5)
            .try_flat_map(
                |v| {
                    if v == 3 {
                        Err(FlowError::callback("mapper"))
                    } else {
                        Ok(Flowable::just(v))
                    }
                },
                8,
            )
            .test()
            .assert_failure("mapper", &[1, 2]);
    }

    #[test]
    #[serial]
    fn test_second_error_is_undeliverable() {
        let capture = ErrorCapture::install();
        Flowable::from_subscribe_fn(|s: SubscriberRef<i32>| {
            s.on_subscribe(Upstream::plain(BooleanSubscription::new()));
            s.on_error(FlowError::other("outer"));
            s.on_error(FlowError::other("again"));
        })
        .flat_map(Flowable::just, 2)
        .test()
        .assert_failure("outer", &[]);
        capture.assert_undeliverable(0, "again");
    }

    #[test]
    fn test_asynchronous_inners() {
        let ts = Flowable::range(1, 200)
            .flat_map(|v| Flowable::just(v).subscribe_on(schedulers::computation()), 4)
            .test();
        ts.await_done(Duration::from_secs(5));
        ts.assert_value_count(200).assert_complete();
        let mut values = ts.values();
        values.sort_unstable();
        assert_eq!(values, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        check_double_on_subscribe(|f: Flowable<i32>| f.flat_map(Flowable::just, 2));
    }
}
