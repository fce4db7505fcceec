// SPDX-License-Identifier: MIT OR Apache-2.0

//! Truncation by count: `take` keeps the head, `take_last` the tail.

use super::Flowable;
use crate::core::error::{self, FlowError};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream, UNBOUNDED};
use crate::core::subscription::{backpressure, validate, EmptySubscription, SubscriptionSlot};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

impl<T: Send + 'static> Flowable<T> {
    /// Emit at most `count` items, then cancel upstream and complete
    ///
    /// Upstream demand never exceeds `count`.
    pub fn take(&self, count: u64) -> Flowable<T> {
        let source = self.clone();
        let limit = count.min(i64::MAX as u64) as i64;
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let take = Arc::new_cyclic(|this| TakeSubscriber {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                remaining: AtomicI64::new(limit),
                requestable: AtomicI64::new(limit),
            });
            source.subscribe(SubscriberRef::Plain(take));
        })
    }

    /// Emit only the last `count` items once the upstream completes
    ///
    /// `take_last(0)` ignores every item and only relays the terminal signal.
    pub fn take_last(&self, count: usize) -> Flowable<T> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let take = Arc::new_cyclic(|this| TakeLastSubscriber {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                queue: Mutex::new(VecDeque::new()),
                count,
                requested: AtomicI64::new(0),
                wip: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            });
            source.subscribe(SubscriberRef::Plain(take));
        })
    }
}

struct TakeSubscriber<T> {
    this: Weak<TakeSubscriber<T>>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionSlot<T>,
    remaining: AtomicI64,
    requestable: AtomicI64,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription) {
            return;
        }
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.upstream.cancel();
            self.remaining.store(-1, Ordering::Release);
            EmptySubscription::complete(&self.downstream);
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
    }

    fn on_next(&self, item: T) {
        let left = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if left <= 0 {
            self.remaining.store(-1, Ordering::Release);
            return;
        }
        if left == 1 {
            self.upstream.cancel();
            self.downstream.on_next(item);
            self.downstream.on_complete();
        } else {
            self.downstream.on_next(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.remaining.swap(-1, Ordering::AcqRel) > 0 {
            self.downstream.on_error(error);
        } else {
            error::on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.remaining.swap(-1, Ordering::AcqRel) > 0 {
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Subscription for TakeSubscriber<T> {
    fn request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        let mut current = self.requestable.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            let grant = current.min(n);
            match self.requestable.compare_exchange(
                current,
                current - grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(grant);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

struct TakeLastSubscriber<T> {
    this: Weak<TakeLastSubscriber<T>>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionSlot<T>,
    queue: Mutex<VecDeque<T>>,
    count: usize,
    requested: AtomicI64,
    wip: AtomicUsize,
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> TakeLastSubscriber<T> {
    fn pop(&self) -> Option<T> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    /// Emits the buffered tail within the outstanding demand
    ///
    /// Re-entrant requests from `on_next` only bump `wip`, so the loop
    /// below picks them up instead of recursing.
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if self.done.load(Ordering::Acquire) {
                let requested = self.requested.load(Ordering::Acquire);
                let mut emitted = 0i64;
                while emitted != requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    match self.pop() {
                        Some(v) => {
                            self.downstream.on_next(v);
                            emitted += 1;
                        }
                        None => {
                            self.downstream.on_complete();
                            return;
                        }
                    }
                }
                if self.is_empty() {
                    if !self.cancelled.load(Ordering::Acquire) {
                        self.downstream.on_complete();
                    }
                    return;
                }
                if emitted != 0 {
                    backpressure::produced(&self.requested, emitted);
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for TakeLastSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, item: T) {
        if self.count == 0 {
            return;
        }
        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() == self.count {
                queue.pop_front();
            }
            queue.push_back(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        // the tail is never drained after an error
        self.cancelled.store(true, Ordering::Release);
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

impl<T: Send + 'static> Subscription for TakeLastSubscriber<T> {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}
