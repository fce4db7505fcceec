// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise combination of several sources.
//!
//! Each source feeds a lane with its own bounded prefetch queue. A row is
//! emitted once every lane holds a value; the flow completes as soon as a
//! lane is both finished and empty, cancelling the others.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED};
use crate::core::subscription::{backpressure, validate, EmptySubscription, SubscriptionSlot};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Zipper<T, R> = Arc<dyn Fn(Vec<T>) -> FlowResult<R> + Send + Sync>;

/// Lane value of a two-source zip
enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<T: Send + 'static> Flowable<T> {
    /// Combine the n-th items of `self` and `other`
    pub fn zip_with<U, R>(
        &self,
        other: &Flowable<U>,
        zipper: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flowable<R>
    where
        U: Send + 'static,
        R: Send + 'static,
    {
        let lanes = vec![
            self.map(Either::<T, U>::Left),
            other.map(Either::<T, U>::Right),
        ];
        Flowable::try_zip(lanes, move |row: Vec<Either<T, U>>| {
            let mut row = row.into_iter();
            match (row.next(), row.next()) {
                (Some(Either::Left(a)), Some(Either::Right(b))) => Ok(zipper(a, b)),
                _ => Err(FlowError::protocol("zip lanes out of order")),
            }
        })
    }

    /// Combine the n-th items of every source, in source order
    pub fn zip<R: Send + 'static>(
        sources: impl IntoIterator<Item = Flowable<T>>,
        zipper: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
    ) -> Flowable<R> {
        Flowable::try_zip(sources, move |row| Ok(zipper(row)))
    }

    pub fn try_zip<R: Send + 'static>(
        sources: impl IntoIterator<Item = Flowable<T>>,
        zipper: impl Fn(Vec<T>) -> FlowResult<R> + Send + Sync + 'static,
    ) -> Flowable<R> {
        let sources: Vec<Flowable<T>> = sources.into_iter().collect();
        let zipper: Zipper<T, R> = Arc::new(zipper);
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<R>| {
            if sources.is_empty() {
                EmptySubscription::complete(&subscriber);
                return;
            }
            let prefetch = FlowConfig::buffer_size();
            let zip = Arc::new_cyclic(|parent: &Weak<ZipCoordinator<T, R>>| ZipCoordinator {
                downstream: subscriber,
                lanes: (0..sources.len())
                    .map(|_| Arc::new(ZipLane::new(parent.clone(), prefetch)))
                    .collect(),
                current: Mutex::new((0..sources.len()).map(|_| None).collect()),
                zipper: Arc::clone(&zipper),
                requested: AtomicI64::new(0),
                wip: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
            });
            zip.downstream.on_subscribe(Upstream::Plain(zip.clone()));
            for (lane, source) in zip.lanes.iter().zip(sources.iter()) {
                if zip.cancelled.load(Ordering::Acquire) {
                    break;
                }
                source.subscribe(SubscriberRef::plain(Arc::clone(lane)));
            }
        })
    }
}

struct ZipCoordinator<T, R> {
    downstream: SubscriberRef<R>,
    lanes: Vec<Arc<ZipLane<T, R>>>,
    /// The row being assembled
    current: Mutex<Vec<Option<T>>>,
    zipper: Zipper<T, R>,
    requested: AtomicI64,
    wip: AtomicUsize,
    cancelled: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

enum Row<T> {
    Ready(Vec<T>),
    Pending,
    Finished,
}

impl<T: Send + 'static, R: Send + 'static> ZipCoordinator<T, R> {
    fn cancel_all(&self) {
        for lane in &self.lanes {
            lane.upstream.cancel();
        }
    }

    fn clear_all(&self) {
        for lane in &self.lanes {
            while lane.queue.pop().is_some() {}
        }
        if let Ok(mut current) = self.current.lock() {
            current.iter_mut().for_each(|slot| *slot = None);
        }
    }

    fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_all();
        self.clear_all();
    }

    fn fail(&self, error: FlowError) {
        if self.cancelled.load(Ordering::Acquire) {
            error::on_error(error);
            return;
        }
        if let Ok(mut slot) = self.error.lock() {
            match slot.take() {
                Some(previous) => *slot = Some(FlowError::composite(previous, error)),
                None => *slot = Some(error),
            }
        }
        self.drain();
    }

    fn take_error(&self) -> Option<FlowError> {
        self.error.lock().ok().and_then(|mut e| e.take())
    }

    /// Top up the current row from the lane queues
    fn fill(&self, take: bool) -> Row<T> {
        let Ok(mut current) = self.current.lock() else {
            return Row::Finished;
        };
        let mut missing = false;
        for (slot, lane) in current.iter_mut().zip(self.lanes.iter()) {
            if slot.is_some() {
                continue;
            }
            let done = lane.done.load(Ordering::Acquire);
            match lane.queue.pop() {
                Some(v) => *slot = Some(v),
                None if done => return Row::Finished,
                None => missing = true,
            }
        }
        if missing || !take {
            return Row::Pending;
        }
        Row::Ready(current.iter_mut().filter_map(Option::take).collect())
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            let requested = self.requested.load(Ordering::Acquire);
            let mut emitted = 0i64;
            while emitted != requested {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if let Some(e) = self.take_error() {
                    self.stop();
                    self.downstream.on_error(e);
                    return;
                }
                let row = match self.fill(true) {
                    Row::Ready(row) => row,
                    Row::Pending => break,
                    Row::Finished => {
                        self.stop();
                        self.downstream.on_complete();
                        return;
                    }
                };
                match (self.zipper)(row) {
                    Ok(v) => self.downstream.on_next(v),
                    Err(e) => {
                        self.stop();
                        self.downstream.on_error(e);
                        return;
                    }
                }
                emitted += 1;
                for lane in &self.lanes {
                    lane.consumed_one();
                }
            }
            if emitted == requested {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if let Some(e) = self.take_error() {
                    self.stop();
                    self.downstream.on_error(e);
                    return;
                }
                if let Row::Finished = self.fill(false) {
                    self.stop();
                    self.downstream.on_complete();
                    return;
                }
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
}

impl<T: Send + 'static, R: Send + 'static> Subscription for ZipCoordinator<T, R> {
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
        self.cancel_all();
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.clear_all();
        }
    }
}

struct ZipLane<T, R> {
    parent: Weak<ZipCoordinator<T, R>>,
    upstream: SubscriptionSlot<T>,
    queue: ArrayQueue<T>,
    prefetch: usize,
    limit: i64,
    consumed: AtomicI64,
    done: AtomicBool,
}

impl<T: Send + 'static, R: Send + 'static> ZipLane<T, R> {
    fn new(parent: Weak<ZipCoordinator<T, R>>, prefetch: usize) -> Self {
        Self {
            parent,
            upstream: SubscriptionSlot::new(),
            queue: ArrayQueue::new(prefetch),
            prefetch,
            limit: (prefetch - (prefetch >> 2)) as i64,
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

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for ZipLane<T, R> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set_once(subscription.clone()) {
            subscription.request(self.prefetch as i64);
        }
    }

    fn on_next(&self, item: T) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if self.queue.push(item).is_err() {
            self.upstream.cancel();
            parent.fail(FlowError::missing_backpressure("Zip lane queue is full"));
            return;
        }
        parent.drain();
    }

    fn on_error(&self, error: FlowError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.fail(error);
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}
