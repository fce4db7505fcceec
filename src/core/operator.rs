// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Operator Base
//!
//! Shared state of the synchronous pass-through operators (`map`, `filter`,
//! `do_on_next`, ...). Every such operator is a subscriber towards its
//! upstream and a (queue) subscription towards its downstream.
//!
//! ```text
//!  upstream ──on_next──▶ [ operator ] ──on_next / try_on_next──▶ downstream
//!           ◀─request───             ◀──request / cancel / poll──
//! ```
//!
//! ## Lifecycle
//!
//! `UNSUBSCRIBED → SUBSCRIBED → ACTIVE* → TERMINATED`. The terminal step is
//! taken once, by an upstream `on_error`/`on_complete`, by a failing user
//! callback ([`FuseableBase::fail`]) or by cancellation. Errors that arrive
//! afterwards go to the error hook.
//!
//! ## Fusion
//!
//! When the upstream offers a [`QueueSubscription`], the operator forwards
//! the downstream's fusion request upstream unless the `BOUNDARY` flag is
//! present: user callbacks must not move to the thread that polls.

use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{FusionMode, QueueSubscription, SubscriberRef, Upstream};
use crate::core::subscription::SubscriptionSlot;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

pub struct FuseableBase<T, R> {
    downstream: SubscriberRef<R>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
    source_mode: AtomicU8,
}

impl<T, R> FuseableBase<T, R> {
    pub fn new(downstream: SubscriberRef<R>) -> Self {
        Self {
            downstream,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
            source_mode: AtomicU8::new(FusionMode::NONE.bits()),
        }
    }

    #[inline]
    pub fn downstream(&self) -> &SubscriberRef<R> {
        &self.downstream
    }

    /// Store the upstream; returns `false` when it was rejected
    pub fn on_subscribe(&self, upstream: Upstream<T>) -> bool {
        self.upstream.set_once(upstream)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the operator terminated; `true` for the caller that did it
    #[inline]
    pub fn try_terminate(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub fn on_error(&self, error: FlowError) {
        if !self.try_terminate() {
            error::on_error(error);
            return;
        }
        self.downstream.on_error(error);
    }

    pub fn on_complete(&self) {
        if self.try_terminate() {
            self.downstream.on_complete();
        }
    }

    /// A user callback failed: cancel upstream and signal the error once
    pub fn fail(&self, error: FlowError) {
        self.upstream.cancel();
        self.on_error(error);
    }

    #[inline]
    pub fn request(&self, n: i64) {
        self.upstream.request(n);
    }

    #[inline]
    pub fn cancel(&self) {
        self.upstream.cancel();
    }

    pub fn upstream_queue(&self) -> Option<Arc<dyn QueueSubscription<T>>> {
        self.upstream.get().and_then(|u| u.queue().cloned())
    }

    /// Fusion mode granted by the upstream, `NONE` when not fused
    #[inline]
    pub fn source_mode(&self) -> FusionMode {
        FusionMode::from_bits(self.source_mode.load(Ordering::Acquire))
    }

    /// Forward a fusion request upstream unless it crosses a thread boundary
    pub fn transitive_boundary_fusion(&self, mode: FusionMode) -> FusionMode {
        if mode.is_boundary() {
            return FusionMode::NONE;
        }
        let Some(queue) = self.upstream_queue() else {
            return FusionMode::NONE;
        };
        let granted = queue.request_fusion(mode);
        if !granted.is_none() {
            log::debug!("Operator fused with upstream in {:?} mode", granted);
            self.source_mode.store(granted.bits(), Ordering::Release);
        }
        granted
    }

    /// Pull the next upstream item in fused mode
    pub fn poll_upstream(&self) -> FlowResult<Option<T>> {
        match self.upstream_queue() {
            Some(queue) => queue.poll(),
            None => Ok(None),
        }
    }

    pub fn upstream_is_empty(&self) -> bool {
        self.upstream_queue().map_or(true, |q| q.is_empty())
    }

    pub fn clear_upstream(&self) {
        if let Some(queue) = self.upstream_queue() {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::Upstream;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::{ErrorCapture, TestSubscriber};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_fail_cancels_and_routes_late_error() {
        let capture = ErrorCapture::install();
        let ts = TestSubscriber::<i32>::new();
        ts.on_subscribe_for_test(Upstream::plain(BooleanSubscription::new()));
        let base: FuseableBase<i32, i32> = FuseableBase::new(ts.as_subscriber());
        let upstream = Arc::new(BooleanSubscription::new());
        assert!(base.on_subscribe(Upstream::Plain(upstream.clone())));

        base.fail(FlowError::callback("boom"));
        base.on_error(FlowError::other("late"));
        base.on_complete();

        assert!(upstream.is_cancelled());
        ts.assert_error_message("boom");
        ts.assert_not_complete();
        capture.assert_error(0, "late");
    }

    #[test]
    fn test_plain_upstream_does_not_fuse() {
        let ts = TestSubscriber::<i32>::new();
        let base: FuseableBase<i32, i32> = FuseableBase::new(ts.as_subscriber());
        base.on_subscribe(Upstream::plain(BooleanSubscription::new()));
        assert_eq!(base.transitive_boundary_fusion(FusionMode::ANY), FusionMode::NONE);
        assert_eq!(base.source_mode(), FusionMode::NONE);
        assert!(base.upstream_is_empty());
    }
}
