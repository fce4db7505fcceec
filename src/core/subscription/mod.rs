// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Subscription Helpers
//!
//! Building blocks shared by every operator:
//!
//! - [`validate`]: rejects `request(n <= 0)` through the error hook
//! - [`SubscriptionSlot`]: set-once upstream holder with deferred requests
//! - [`EmptySubscription`], [`BooleanSubscription`], [`ScalarSubscription`]
//! - [`backpressure`]: saturating demand arithmetic
//! - [`arbiter`]: demand-preserving upstream switching
//! - [`deferred_scalar`]: single value delivered on request
//! - [`half_serializer`]: serialized signals from several producers

pub mod arbiter;
pub mod backpressure;
pub mod deferred_scalar;
pub mod half_serializer;

pub use arbiter::SubscriptionArbiter;
pub use deferred_scalar::DeferredScalarSubscription;
pub use half_serializer::HalfSerializer;

use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{FusionMode, QueueSubscription, SubscriberRef, Subscription, Upstream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Check a request amount, reporting non-positive values to the hook
#[inline]
pub fn validate(n: i64) -> bool {
    if n <= 0 {
        error::on_error(FlowError::bad_request(n));
        return false;
    }
    true
}

/// Report a second `on_subscribe` and cancel the late subscription
pub fn report_subscription_set<T>(late: &Upstream<T>) {
    late.cancel();
    log::warn!("Rejected a second upstream subscription");
    error::on_error(FlowError::subscription_already_set());
}

enum SlotState<T> {
    Empty,
    Set(Upstream<T>),
    Cancelled,
}

/// Holds the one upstream of an operator
///
/// Requests made before the upstream arrives are accumulated and replayed
/// once it is set ("deferred request"). Once cancelled, any late upstream is
/// cancelled on arrival.
pub struct SubscriptionSlot<T> {
    state: Mutex<SlotState<T>>,
    requested: AtomicI64,
}

impl<T> Default for SubscriptionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            requested: AtomicI64::new(0),
        }
    }

    /// Store the first upstream; a second one is cancelled and reported
    pub fn set_once(&self, subscription: Upstream<T>) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                subscription.cancel();
                return false;
            }
        };
        match &*state {
            SlotState::Empty => {
                *state = SlotState::Set(subscription);
                true
            }
            SlotState::Set(_) => {
                drop(state);
                report_subscription_set(&subscription);
                false
            }
            SlotState::Cancelled => {
                drop(state);
                subscription.cancel();
                false
            }
        }
    }

    /// [`set_once`](Self::set_once) then replay accumulated demand
    pub fn deferred_set_once(&self, subscription: Upstream<T>) -> bool {
        if !self.set_once(subscription.clone()) {
            return false;
        }
        let r = self.requested.swap(0, Ordering::AcqRel);
        if r != 0 {
            subscription.request(r);
        }
        true
    }

    /// Request from the upstream now, or once it arrives
    pub fn deferred_request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        if let Some(s) = self.get() {
            s.request(n);
            return;
        }
        backpressure::add(&self.requested, n);
        if let Some(s) = self.get() {
            let r = self.requested.swap(0, Ordering::AcqRel);
            if r != 0 {
                s.request(r);
            }
        }
    }

    /// The current upstream, if set and not cancelled
    pub fn get(&self) -> Option<Upstream<T>> {
        match self.state.lock().ok().as_deref() {
            Some(SlotState::Set(s)) => Some(s.clone()),
            _ => None,
        }
    }

    #[inline]
    pub fn request(&self, n: i64) {
        if let Some(s) = self.get() {
            s.request(n);
        }
    }

    /// Cancel the upstream; returns `true` for the call that did it
    pub fn cancel(&self) -> bool {
        let previous = match self.state.lock() {
            Ok(mut state) => {
                if matches!(*state, SlotState::Cancelled) {
                    return false;
                }
                std::mem::replace(&mut *state, SlotState::Cancelled)
            }
            Err(_) => return false,
        };
        if let SlotState::Set(s) = previous {
            s.cancel();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state.lock().ok().as_deref(),
            Some(SlotState::Cancelled) | None
        )
    }

    pub fn is_set(&self) -> bool {
        matches!(self.state.lock().ok().as_deref(), Some(SlotState::Set(_)))
    }
}

/// A subscription that does nothing, for sources that terminate immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySubscription;

impl EmptySubscription {
    /// Subscribe and complete right away
    pub fn complete<T: 'static>(subscriber: &SubscriberRef<T>) {
        subscriber.on_subscribe(Upstream::Queue(Arc::new(EmptySubscription)));
        subscriber.on_complete();
    }

    /// Subscribe and fail right away
    pub fn error<T: 'static>(subscriber: &SubscriberRef<T>, error: FlowError) {
        subscriber.on_subscribe(Upstream::Queue(Arc::new(EmptySubscription)));
        subscriber.on_error(error);
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, n: i64) {
        validate(n);
    }

    fn cancel(&self) {}
}

impl<T> QueueSubscription<T> for EmptySubscription {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        if mode.contains(FusionMode::ASYNC) {
            FusionMode::ASYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> FlowResult<Option<T>> {
        Ok(None)
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn clear(&self) {}
}

/// Tracks cancellation and accumulated demand without producing anything
#[derive(Debug, Default)]
pub struct BooleanSubscription {
    cancelled: AtomicBool,
    requested: AtomicI64,
}

impl BooleanSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn requested(&self) -> i64 {
        self.requested.load(Ordering::Acquire)
    }
}

impl Subscription for BooleanSubscription {
    fn request(&self, n: i64) {
        if validate(n) {
            backpressure::add(&self.requested, n);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

const SCALAR_NO_REQUEST: u8 = 0;
const SCALAR_REQUESTED: u8 = 1;
const SCALAR_CANCELLED: u8 = 2;

/// Emits one known value when the first request arrives
pub struct ScalarSubscription<T> {
    downstream: SubscriberRef<T>,
    value: Mutex<Option<T>>,
    state: AtomicU8,
}

impl<T: Send + 'static> ScalarSubscription<T> {
    pub fn new(downstream: SubscriberRef<T>, value: T) -> Self {
        Self {
            downstream,
            value: Mutex::new(Some(value)),
            state: AtomicU8::new(SCALAR_NO_REQUEST),
        }
    }

    fn take(&self) -> Option<T> {
        self.value.lock().ok().and_then(|mut v| v.take())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SCALAR_CANCELLED
    }
}

impl<T: Send + 'static> Subscription for ScalarSubscription<T> {
    fn request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        if self
            .state
            .compare_exchange(
                SCALAR_NO_REQUEST,
                SCALAR_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if let Some(v) = self.take() {
                self.downstream.on_next(v);
            }
            if self.state.load(Ordering::Acquire) != SCALAR_CANCELLED {
                self.downstream.on_complete();
            }
        }
    }

    fn cancel(&self) {
        self.state.store(SCALAR_CANCELLED, Ordering::Release);
    }
}

impl<T: Send + 'static> QueueSubscription<T> for ScalarSubscription<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        if mode.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> FlowResult<Option<T>> {
        if self
            .state
            .compare_exchange(
                SCALAR_NO_REQUEST,
                SCALAR_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Ok(self.take());
        }
        Ok(None)
    }

    fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) != SCALAR_NO_REQUEST
    }

    fn clear(&self) {
        self.state.store(SCALAR_REQUESTED, Ordering::Release);
        self.take();
    }
}
