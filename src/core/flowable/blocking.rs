// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking bridges out of the reactive world.
//!
//! These park the calling thread until the source terminates; never call
//! them from a scheduler thread the source itself runs on.

use super::Flowable;
use crate::core::config::FlowConfig;
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{FlowError, FlowResult};
use crate::core::protocol::{
    CompletableObserver, MaybeObserver, Signal, SingleObserver, Subscriber, SubscriberRef,
    Upstream, UNBOUNDED,
};
use crate::core::subscription::SubscriptionSlot;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pick {
    First,
    Last,
}

/// One-shot rendezvous between a source and a waiting thread
pub(crate) struct Latch<T> {
    outcome: Mutex<Option<FlowResult<Option<T>>>>,
    last: Mutex<Option<T>>,
    signal: Condvar,
    disposable: DisposableSlot,
    subscription: SubscriptionSlot<T>,
    pick: Pick,
}

impl<T: Send + 'static> Latch<T> {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_pick(Pick::First)
    }

    fn with_pick(pick: Pick) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            last: Mutex::new(None),
            signal: Condvar::new(),
            disposable: DisposableSlot::new(),
            subscription: SubscriptionSlot::new(),
            pick,
        })
    }

    fn release(&self, outcome: FlowResult<Option<T>>) {
        if let Ok(mut slot) = self.outcome.lock() {
            if slot.is_none() {
                *slot = Some(outcome);
                self.signal.notify_all();
            }
        }
    }

    fn stop(&self) {
        self.disposable.dispose();
        self.subscription.cancel();
    }

    /// Wait for an optional value
    pub(crate) fn wait_optional(&self) -> FlowResult<Option<T>> {
        let guard = self
            .outcome
            .lock()
            .map_err(|_| FlowError::other("blocking latch poisoned"))?;
        let mut guard = self
            .signal
            .wait_while(guard, |o| o.is_none())
            .map_err(|_| FlowError::other("blocking latch poisoned"))?;
        guard.take().unwrap_or(Ok(None))
    }

    pub(crate) fn wait_optional_timeout(&self, timeout: Duration) -> FlowResult<Option<T>> {
        let guard = self
            .outcome
            .lock()
            .map_err(|_| FlowError::other("blocking latch poisoned"))?;
        let (mut guard, result) = self
            .signal
            .wait_timeout_while(guard, timeout, |o| o.is_none())
            .map_err(|_| FlowError::other("blocking latch poisoned"))?;
        if result.timed_out() && guard.is_none() {
            drop(guard);
            self.stop();
            return Err(FlowError::timeout(timeout));
        }
        guard.take().unwrap_or(Ok(None))
    }

    /// Wait for a value; an empty source is an error
    pub(crate) fn wait(&self) -> FlowResult<T> {
        self.wait_optional()?
            .ok_or_else(|| FlowError::no_such_element("The source is empty"))
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> FlowResult<T> {
        self.wait_optional_timeout(timeout)?
            .ok_or_else(|| FlowError::no_such_element("The source is empty"))
    }
}

impl<T: Send + 'static> SingleObserver<T> for Latch<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.disposable.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.release(Ok(Some(value)));
    }

    fn on_error(&self, error: FlowError) {
        self.release(Err(error));
    }
}

impl<T: Send + 'static> MaybeObserver<T> for Latch<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.disposable.set_once(disposable);
    }

    fn on_success(&self, value: T) {
        self.release(Ok(Some(value)));
    }

    fn on_error(&self, error: FlowError) {
        self.release(Err(error));
    }

    fn on_complete(&self) {
        self.release(Ok(None));
    }
}

impl<T: Send + 'static> CompletableObserver for Latch<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.disposable.set_once(disposable);
    }

    fn on_complete(&self) {
        self.release(Ok(None));
    }

    fn on_error(&self, error: FlowError) {
        self.release(Err(error));
    }
}

impl<T: Send + 'static> Subscriber<T> for Latch<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.subscription.set_once(subscription.clone()) {
            match self.pick {
                Pick::First => subscription.request(1),
                Pick::Last => subscription.request(UNBOUNDED),
            }
        }
    }

    fn on_next(&self, item: T) {
        match self.pick {
            Pick::First => {
                self.subscription.cancel();
                self.release(Ok(Some(item)));
            }
            Pick::Last => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(item);
                }
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.release(Err(error));
    }

    fn on_complete(&self) {
        let last = self.last.lock().ok().and_then(|mut l| l.take());
        self.release(Ok(last));
    }
}

impl<T: Send + 'static> Flowable<T> {
    /// The first item; `NoSuchElement` when the source is empty
    pub fn blocking_first(&self) -> FlowResult<T> {
        let latch = Latch::with_pick(Pick::First);
        self.subscribe(SubscriberRef::Plain(latch.clone()));
        latch.wait()
    }

    /// The last item; `NoSuchElement` when the source is empty
    pub fn blocking_last(&self) -> FlowResult<T> {
        let latch = Latch::with_pick(Pick::Last);
        self.subscribe(SubscriberRef::Plain(latch.clone()));
        latch.wait()
    }

    /// Iterate the items on the calling thread, prefetching `buffer_size`
    pub fn blocking_iter(&self) -> BlockingIter<T> {
        let prefetch = FlowConfig::buffer_size() as i64;
        let (sender, receiver) = unbounded();
        let subscriber = Arc::new(ChannelSubscriber {
            sender,
            upstream: SubscriptionSlot::new(),
            prefetch,
        });
        self.subscribe(SubscriberRef::Plain(subscriber.clone()));
        BlockingIter {
            receiver,
            subscriber,
            consumed: 0,
            limit: prefetch - (prefetch >> 2),
            done: false,
        }
    }

    /// Run `consumer` for every item on the calling thread
    ///
    /// A failing consumer cancels the source and its error is returned.
    pub fn blocking_for_each(&self, consumer: impl FnMut(T) -> FlowResult<()>) -> FlowResult<()> {
        let mut consumer = consumer;
        let mut iter = self.blocking_iter();
        while let Some(item) = iter.next() {
            if let Err(e) = item.and_then(&mut consumer) {
                iter.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait at most `timeout` for termination, collecting every item
    pub fn blocking_collect_timeout(&self, timeout: Duration) -> FlowResult<Vec<T>> {
        let deadline = Instant::now() + timeout;
        let mut iter = self.blocking_iter();
        let mut items = Vec::new();
        loop {
            match iter.next_before(deadline) {
                Some(Ok(v)) => items.push(v),
                Some(Err(e)) => return Err(e),
                None if iter.done => return Ok(items),
                None => {
                    iter.cancel();
                    return Err(FlowError::timeout(timeout));
                }
            }
        }
    }
}

struct ChannelSubscriber<T> {
    sender: Sender<Signal<T>>,
    upstream: SubscriptionSlot<T>,
    prefetch: i64,
}

impl<T: Send + 'static> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set_once(subscription.clone()) {
            subscription.request(self.prefetch);
        }
    }

    fn on_next(&self, item: T) {
        let _ = self.sender.send(Signal::Next(item));
    }

    fn on_error(&self, error: FlowError) {
        let _ = self.sender.send(Signal::Error(error));
    }

    fn on_complete(&self) {
        let _ = self.sender.send(Signal::Complete);
    }
}

/// Iterator over a [`Flowable`], blocking for each item
pub struct BlockingIter<T> {
    receiver: Receiver<Signal<T>>,
    subscriber: Arc<ChannelSubscriber<T>>,
    consumed: i64,
    limit: i64,
    done: bool,
}

impl<T: Send + 'static> BlockingIter<T> {
    pub fn cancel(&mut self) {
        self.done = true;
        self.subscriber.upstream.cancel();
    }

    fn handle(&mut self, signal: Signal<T>) -> Option<FlowResult<T>> {
        match signal {
            Signal::Next(v) => {
                self.consumed += 1;
                if self.consumed == self.limit {
                    self.consumed = 0;
                    self.subscriber.upstream.request(self.limit);
                }
                Some(Ok(v))
            }
            Signal::Error(e) => {
                self.done = true;
                Some(Err(e))
            }
            Signal::Complete => {
                self.done = true;
                None
            }
        }
    }

    fn next_before(&mut self, deadline: Instant) -> Option<FlowResult<T>> {
        if self.done {
            return None;
        }
        let signal = self.receiver.recv_deadline(deadline).ok()?;
        self.handle(signal)
    }
}

impl<T: Send + 'static> Iterator for BlockingIter<T> {
    type Item = FlowResult<T>;

    fn next(&mut self) -> Option<FlowResult<T>> {
        if self.done {
            return None;
        }
        match self.receiver.recv() {
            Ok(signal) => self.handle(signal),
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl<T> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        if !self.done {
            self.subscriber.upstream.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::schedulers;

    #[test]
    fn test_blocking_first_and_last() {
        assert_eq!(Flowable::range(3, 4).blocking_first().unwrap(), 3);
        assert_eq!(Flowable::range(3, 4).blocking_last().unwrap(), 6);
        let err = Flowable::<i32>::empty().blocking_first().unwrap_err();
        assert_eq!(err.message(), "The source is empty");
    }

    #[test]
    fn test_blocking_iter_refills_prefetch() {
        let items: Vec<i32> = Flowable::range(1, 1000)
            .blocking_iter()
            .collect::<FlowResult<_>>()
            .unwrap();
        assert_eq!(items.len(), 1000);
        assert_eq!(items[999], 1000);
    }

    #[test]
    fn test_blocking_for_each_stops_on_consumer_error() {
        let mut seen = Vec::new();
        let result = Flowable::range(1, 10).blocking_for_each(|v| {
            seen.push(v);
            if v == 3 {
                Err(FlowError::callback("stop"))
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap_err().message(), "stop");
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_blocking_across_threads() {
        let last = Flowable::range(1, 50)
            .subscribe_on(schedulers::computation())
            .blocking_last()
            .unwrap();
        assert_eq!(last, 50);
    }

    #[test]
    fn test_blocking_collect_timeout() {
        let err = Flowable::<i32>::never()
            .blocking_collect_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
    }
}
