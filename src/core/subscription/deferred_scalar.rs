// SPDX-License-Identifier: MIT OR Apache-2.0

//! A single value that becomes available after the subscription starts and
//! is emitted only once the downstream has requested it.
//!
//! Used by aggregating operators (`reduce`, `any`, `is_empty`, `to_list`)
//! and by `Single`/`Maybe` to `Flowable` conversion.

use super::validate;
use crate::core::protocol::SubscriberRef;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const HAS_REQUEST_HAS_VALUE: u8 = 3;
const CANCELLED: u8 = 4;

pub struct DeferredScalarSubscription<T> {
    downstream: SubscriberRef<T>,
    value: Mutex<Option<T>>,
    state: AtomicU8,
}

impl<T: Send + 'static> DeferredScalarSubscription<T> {
    pub fn new(downstream: SubscriberRef<T>) -> Self {
        Self {
            downstream,
            value: Mutex::new(None),
            state: AtomicU8::new(NO_REQUEST_NO_VALUE),
        }
    }

    pub fn downstream(&self) -> &SubscriberRef<T> {
        &self.downstream
    }

    /// Emit `value` followed by completion, now or on the first request
    pub fn complete(&self, value: T) {
        let mut value = Some(value);
        loop {
            match self.state.load(Ordering::Acquire) {
                HAS_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            HAS_REQUEST_NO_VALUE,
                            HAS_REQUEST_HAS_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if let Some(v) = value.take() {
                            self.emit(v);
                        }
                        return;
                    }
                }
                NO_REQUEST_NO_VALUE => {
                    if let Ok(mut slot) = self.value.lock() {
                        *slot = value.take();
                    }
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_NO_VALUE,
                            NO_REQUEST_HAS_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    // a request slipped in; take the value back and retry
                    value = self.value.lock().ok().and_then(|mut v| v.take());
                    if value.is_none() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Complete without a value
    pub fn complete_empty(&self) {
        if self.state.swap(HAS_REQUEST_HAS_VALUE, Ordering::AcqRel) != CANCELLED {
            self.downstream.on_complete();
        } else {
            self.state.store(CANCELLED, Ordering::Release);
        }
    }

    pub fn request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_HAS_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_HAS_VALUE,
                            HAS_REQUEST_HAS_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let value = self.value.lock().ok().and_then(|mut v| v.take());
                        if let Some(v) = value {
                            self.emit(v);
                        }
                    }
                    return;
                }
                NO_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_NO_VALUE,
                            HAS_REQUEST_NO_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    pub fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        if let Ok(mut v) = self.value.lock() {
            v.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the value was emitted or the flow ended
    pub fn is_done(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            HAS_REQUEST_HAS_VALUE | CANCELLED
        )
    }

    fn emit(&self, value: T) {
        self.downstream.on_next(value);
        if self.state.load(Ordering::Acquire) != CANCELLED {
            self.downstream.on_complete();
        }
    }
}
