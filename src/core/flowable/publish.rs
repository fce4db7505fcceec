// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multicast inside a selector.
//!
//! `publish(selector)` hands the selector a shared flow backed by one
//! upstream subscription. Every subscriber of the shared flow sees the same
//! items; the upstream is consumed at the pace of the slowest of them, with
//! `buffer_size` items prefetched. The upstream is cancelled once the flow
//! returned by the selector terminates or is cancelled.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{Publisher, Subscriber, SubscriberRef, Subscription, Upstream};
use crate::core::subscription::{backpressure, validate, EmptySubscription, SubscriptionSlot};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

impl<T: Clone + Send + Sync + 'static> Flowable<T> {
    /// Share one subscription to `self` among everything `selector` builds
    pub fn publish<R: Send + 'static>(
        &self,
        selector: impl Fn(Flowable<T>) -> FlowResult<Flowable<R>> + Send + Sync + 'static,
    ) -> Flowable<R> {
        let source = self.clone();
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<R>| {
            let processor = MulticastProcessor::new(FlowConfig::buffer_size());
            let shared = Flowable::from_publisher(processor.clone());
            let output = match selector(shared) {
                Ok(output) => output,
                Err(e) => {
                    EmptySubscription::error(&subscriber, e);
                    return;
                }
            };
            output.subscribe(SubscriberRef::Plain(Arc::new_cyclic(|this| {
                OutputCanceller {
                    this: this.clone(),
                    downstream: subscriber,
                    upstream: SubscriptionSlot::new(),
                    processor: Arc::clone(&processor),
                }
            })));
            source.subscribe(SubscriberRef::Plain(processor));
        })
    }
}

struct MulticastProcessor<T> {
    this: Weak<MulticastProcessor<T>>,
    upstream: SubscriptionSlot<T>,
    queue: ArrayQueue<T>,
    limit: i64,
    /// Items taken from the queue since the last replenishing request
    consumed: AtomicI64,
    subscribers: Mutex<Vec<Arc<MulticastSubscription<T>>>>,
    /// Set under the `subscribers` lock once everyone got a terminal signal
    terminated: AtomicBool,
    wip: AtomicUsize,
    done: AtomicBool,
    disposed: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

impl<T: Clone + Send + Sync + 'static> MulticastProcessor<T> {
    fn new(prefetch: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            upstream: SubscriptionSlot::new(),
            queue: ArrayQueue::new(prefetch),
            limit: (prefetch - (prefetch >> 2)) as i64,
            consumed: AtomicI64::new(0),
            subscribers: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            wip: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    fn prefetch(&self) -> i64 {
        self.queue.capacity() as i64
    }

    fn add(&self, inner: &Arc<MulticastSubscription<T>>) -> bool {
        match self.subscribers.lock() {
            Ok(mut subscribers) if !self.terminated.load(Ordering::Acquire) => {
                subscribers.push(Arc::clone(inner));
                true
            }
            _ => false,
        }
    }

    fn remove(&self, inner: &MulticastSubscription<T>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|s| !std::ptr::eq(s.as_ref(), inner));
        }
    }

    fn active(&self) -> Vec<Arc<MulticastSubscription<T>>> {
        self.subscribers
            .lock()
            .map(|s| {
                s.iter()
                    .filter(|s| !s.cancelled.load(Ordering::Acquire))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Take every subscriber and refuse new ones
    fn terminate(&self) -> Vec<Arc<MulticastSubscription<T>>> {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                self.terminated.store(true, Ordering::Release);
                std::mem::take(&mut *subscribers)
            }
            Err(_) => Vec::new(),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            while self.queue.pop().is_some() {}
        }
    }

    fn error_all(&self, error: FlowError) {
        for s in self.terminate() {
            if !s.cancelled.load(Ordering::Acquire) {
                s.downstream.on_error(error.clone());
            }
        }
    }

    fn complete_all(&self) {
        for s in self.terminate() {
            if !s.cancelled.load(Ordering::Acquire) {
                s.downstream.on_complete();
            }
        }
    }

    /// `true` once a terminal signal went out or the processor was disposed
    fn check_terminated(&self, done: bool, empty: bool) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            while self.queue.pop().is_some() {}
            return true;
        }
        if !done {
            return false;
        }
        let failure = self.error.lock().ok().and_then(|e| e.clone());
        if let Some(e) = failure {
            while self.queue.pop().is_some() {}
            self.error_all(e);
            return true;
        }
        if empty {
            self.complete_all();
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
            let subscribers = self.active();
            if !subscribers.is_empty() {
                let ready = subscribers
                    .iter()
                    .map(|s| s.requested.load(Ordering::Acquire) - s.emitted.load(Ordering::Acquire))
                    .min()
                    .unwrap_or(0);

                let mut emitted = 0i64;
                while emitted != ready {
                    let done = self.done.load(Ordering::Acquire);
                    let item = self.queue.pop();
                    if self.check_terminated(done, item.is_none()) {
                        return;
                    }
                    let Some(item) = item else {
                        break;
                    };
                    for s in &subscribers {
                        if !s.cancelled.load(Ordering::Acquire) {
                            s.emitted.fetch_add(1, Ordering::AcqRel);
                            s.downstream.on_next(item.clone());
                        }
                    }
                    emitted += 1;
                    let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
                    if consumed == self.limit {
                        self.consumed.store(0, Ordering::Release);
                        self.upstream.request(consumed);
                    }
                }

                if emitted == ready
                    && self.check_terminated(self.done.load(Ordering::Acquire), self.queue.is_empty())
                {
                    return;
                }
            } else if self.disposed.load(Ordering::Acquire) {
                while self.queue.pop().is_some() {}
                return;
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for MulticastProcessor<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let inner = Arc::new(MulticastSubscription {
            parent: self.this.clone(),
            downstream: subscriber,
            requested: AtomicI64::new(0),
            emitted: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
        });
        inner
            .downstream
            .on_subscribe(Upstream::Plain(inner.clone()));
        if self.add(&inner) {
            if inner.cancelled.load(Ordering::Acquire) {
                self.remove(&inner);
            }
            self.drain();
            return;
        }
        let failure = self.error.lock().ok().and_then(|e| e.clone());
        match failure {
            Some(e) => inner.downstream.on_error(e),
            None => inner.downstream.on_complete(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for MulticastProcessor<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set_once(subscription.clone()) {
            subscription.request(self.prefetch());
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.queue.push(item).is_err() {
            self.upstream.cancel();
            self.on_error(FlowError::missing_backpressure(
                "Queue is full: the source ignored backpressure",
            ));
            return;
        }
        self.drain();
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
        self.drain();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

struct MulticastSubscription<T> {
    parent: Weak<MulticastProcessor<T>>,
    downstream: SubscriberRef<T>,
    requested: AtomicI64,
    emitted: AtomicI64,
    cancelled: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Subscription for MulticastSubscription<T> {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
            if let Some(parent) = self.parent.upgrade() {
                parent.drain();
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove(self);
            parent.drain();
        }
    }
}

/// Downstream of the selector's flow; releases the shared upstream when it ends
struct OutputCanceller<T, R> {
    this: Weak<OutputCanceller<T, R>>,
    downstream: SubscriberRef<R>,
    upstream: SubscriptionSlot<R>,
    processor: Arc<MulticastProcessor<T>>,
}

impl<T, R> Subscriber<R> for OutputCanceller<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, subscription: Upstream<R>) {
        if !self.upstream.set_once(subscription) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
    }

    fn on_next(&self, item: R) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
        self.processor.dispose();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.processor.dispose();
    }
}

impl<T, R> Subscription for OutputCanceller<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn request(&self, n: i64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.processor.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::UNBOUNDED;
    use crate::core::testing::{check_double_on_subscribe, TestSubscriber};
    use serial_test::serial;

    #[test]
    fn test_publish_shares_one_subscription() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&subscriptions);
        let source = Flowable::defer(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(Flowable::range(1, 5))
        });
        source
            .publish(|f| Ok(f.zip_with(&f.map(|v| v * 10), |a, b| a + b)))
            .test()
            .assert_result(&[11, 22, 33, 44, 55]);
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_selector() {
        Flowable::range(1, 300)
            .publish(Ok)
            .test()
            .assert_value_count(300)
            .assert_complete();
    }

    #[test]
    fn test_selector_failure() {
        Flowable::range(1, 5)
            .publish(|_| Err::<Flowable<i32>, _>(FlowError::callback("selector")))
            .test()
            .assert_failure("selector", &[]);
    }

    #[test]
    fn test_slowest_subscriber_gates_consumption() {
        let slow = TestSubscriber::<i32>::with_request(2);
        let sl = slow.clone();
        let ts = Flowable::range(1, 10)
            .publish(move |f| {
                f.subscribe(sl.as_subscriber());
                Ok(f)
            })
            .test();
        ts.assert_values(&[1, 2]).assert_not_complete();
        slow.assert_values(&[1, 2]);

        slow.request(3);
        ts.assert_values(&[1, 2, 3, 4, 5]);

        slow.request(UNBOUNDED);
        ts.assert_result(&(1..=10).collect::<Vec<_>>());
        slow.assert_result(&(1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefetch_request() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requests);
        Flowable::range(1, 1000)
            .do_on_request(move |n| r.lock().unwrap().push(n))
            .publish(Ok)
            .test()
            .assert_value_count(1000);
        let requests = requests.lock().unwrap();
        let prefetch = FlowConfig::buffer_size() as i64;
        assert_eq!(requests[0], prefetch);
        assert!(requests[1..].iter().all(|n| *n == prefetch - prefetch / 4));
    }

    #[test]
    fn test_output_completion_cancels_upstream() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cancelled);
        Flowable::range(1, 100)
            .do_on_cancel(move || c.store(true, Ordering::SeqCst))
            .publish(|f| Ok(f.take(3)))
            .test()
            .assert_result(&[1, 2, 3]);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_cancels_upstream() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cancelled);
        let ts = Flowable::<i32>::never()
            .do_on_cancel(move || c.store(true, Ordering::SeqCst))
            .publish(Ok)
            .test();
        ts.cancel();
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_reaches_every_subscriber() {
        let side = TestSubscriber::<i32>::new();
        let sd = side.clone();
        Flowable::<i32>::error(FlowError::other("boom"))
            .publish(move |f| {
                f.subscribe(sd.as_subscriber());
                Ok(f.map(|v| v + 1))
            })
            .test()
            .assert_failure("boom", &[]);
        side.assert_failure("boom", &[]);
    }

    #[test]
    #[serial]
    fn test_double_on_subscribe() {
        check_double_on_subscribe(|f: Flowable<i32>| f.publish(Ok));
    }
}
