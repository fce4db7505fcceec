// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Recorded;
use crate::core::error::FlowError;
use crate::core::protocol::{FusionMode, QueueSubscription, Subscriber, SubscriberRef, Upstream, UNBOUNDED};
use crate::core::subscription::SubscriptionSlot;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

type OnNextHook<T> = Arc<dyn Fn(&TestSubscriber<T>, &T) + Send + Sync>;

const NOT_NEGOTIATED: u8 = u8::MAX;

/// Recording subscriber for `Flowable` tests
///
/// ```ignore
/// Flowable::range(1, 5).filter(|v| v % 2 == 0).test().assert_result(&[2, 4]);
/// ```
pub struct TestSubscriber<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TestSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    this: Weak<Inner<T>>,
    record: Recorded<T>,
    upstream: SubscriptionSlot<T>,
    initial_request: i64,
    fusion_request: FusionMode,
    fusion_mode: AtomicU8,
    queue: Mutex<Option<Arc<dyn QueueSubscription<T>>>>,
    wip: AtomicUsize,
    on_next: Mutex<Option<OnNextHook<T>>>,
}

impl<T: Clone + Send + 'static> Default for TestSubscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    /// Requests everything on subscription
    pub fn new() -> Self {
        Self::build(UNBOUNDED, FusionMode::NONE)
    }

    /// Requests `initial` on subscription; `0` requests nothing
    pub fn with_request(initial: i64) -> Self {
        Self::build(initial, FusionMode::NONE)
    }

    /// Asks the upstream for `mode` fusion before requesting
    pub fn with_fusion(mode: FusionMode, initial: i64) -> Self {
        Self::build(initial, mode)
    }

    fn build(initial_request: i64, fusion_request: FusionMode) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            record: Recorded::default(),
            upstream: SubscriptionSlot::new(),
            initial_request,
            fusion_request,
            fusion_mode: AtomicU8::new(NOT_NEGOTIATED),
            queue: Mutex::new(None),
            wip: AtomicUsize::new(0),
            on_next: Mutex::new(None),
        });
        Self { inner }
    }

    /// Run `hook` after every recorded value, e.g. to request or cancel
    pub fn on_next_hook(self, hook: impl Fn(&TestSubscriber<T>, &T) + Send + Sync + 'static) -> Self {
        if let Ok(mut slot) = self.inner.on_next.lock() {
            *slot = Some(Arc::new(hook));
        }
        self
    }

    pub fn as_subscriber(&self) -> SubscriberRef<T> {
        SubscriberRef::Plain(self.inner.clone())
    }

    /// Feed an upstream directly, as a source would
    pub fn on_subscribe_for_test(&self, upstream: Upstream<T>) {
        self.inner.on_subscribe(upstream);
    }

    pub fn request(&self, n: i64) {
        self.inner.upstream.deferred_request(n);
    }

    pub fn cancel(&self) {
        self.inner.upstream.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.upstream.is_cancelled()
    }

    /// Mode granted by the upstream, `None` if no negotiation happened
    pub fn fusion_mode(&self) -> Option<FusionMode> {
        match self.inner.fusion_mode.load(Ordering::Acquire) {
            NOT_NEGOTIATED => None,
            bits => Some(FusionMode::from_bits(bits)),
        }
    }

    pub fn assert_fusion_mode(&self, expected: FusionMode) -> &Self {
        assert_eq!(self.fusion_mode(), Some(expected), "fusion mode");
        self
    }
}

impl<T> Deref for TestSubscriber<T> {
    type Target = Recorded<T>;

    fn deref(&self) -> &Recorded<T> {
        &self.inner.record
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn handle(&self) -> Option<TestSubscriber<T>> {
        self.this.upgrade().map(|inner| TestSubscriber { inner })
    }

    fn accept(&self, value: T) {
        self.record.record_value(value.clone());
        let hook = self.on_next.lock().ok().and_then(|h| h.clone());
        if let (Some(hook), Some(handle)) = (hook, self.handle()) {
            hook(&handle, &value);
        }
    }

    fn fused_queue(&self) -> Option<Arc<dyn QueueSubscription<T>>> {
        self.queue.lock().ok().and_then(|q| q.clone())
    }

    /// Poll until empty; returns `false` when polling failed
    fn drain_queue(&self) -> bool {
        let Some(queue) = self.fused_queue() else {
            return true;
        };
        loop {
            if self.upstream.is_cancelled() {
                queue.clear();
                return false;
            }
            match queue.poll() {
                Ok(Some(v)) => self.accept(v),
                Ok(None) => return true,
                Err(e) => {
                    self.upstream.cancel();
                    self.record.record_error(e);
                    return false;
                }
            }
        }
    }

    fn drain_async(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.drain_queue() {
                return;
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn mode(&self) -> FusionMode {
        match self.fusion_mode.load(Ordering::Acquire) {
            NOT_NEGOTIATED => FusionMode::NONE,
            bits => FusionMode::from_bits(bits),
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for Inner<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        self.record.record_subscription();
        if !self.upstream.set_once(subscription.clone()) {
            return;
        }

        if !self.fusion_request.is_none() {
            let granted = match subscription.queue() {
                Some(queue) => {
                    let granted = queue.request_fusion(self.fusion_request);
                    if !granted.is_none() {
                        if let Ok(mut q) = self.queue.lock() {
                            *q = Some(Arc::clone(queue));
                        }
                    }
                    granted
                }
                None => FusionMode::NONE,
            };
            self.fusion_mode.store(granted.bits(), Ordering::Release);

            if granted == FusionMode::SYNC {
                if self.drain_queue() && !self.upstream.is_cancelled() {
                    self.record.record_completion();
                }
                return;
            }
        }

        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, item: T) {
        self.accept(item);
    }

    fn on_error(&self, error: FlowError) {
        if self.mode() == FusionMode::ASYNC {
            self.drain_async();
        }
        self.record.record_error(error);
    }

    fn on_complete(&self) {
        if self.mode() == FusionMode::ASYNC {
            self.drain_async();
        }
        self.record.record_completion();
    }

    fn on_available(&self) {
        self.drain_async();
    }
}
