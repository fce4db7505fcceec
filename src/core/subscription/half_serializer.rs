// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialized delivery when one thread emits items and any thread may end
//! the flow.
//!
//! The item producer enters with [`HalfSerializer::on_next`]; terminal
//! signals may come from other sources (e.g. `take_until`'s other publisher).
//! A terminal signal racing with an in-flight item is parked and emitted by
//! the item producer when it leaves. At most one terminal signal is ever
//! delivered; errors that lose the race go to the error hook.

use crate::core::error::{self, FlowError};
use crate::core::protocol::SubscriberRef;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

enum ErrorSlot {
    Empty,
    Failed(FlowError),
    Terminated,
}

pub struct HalfSerializer {
    wip: AtomicUsize,
    error: Mutex<ErrorSlot>,
}

impl Default for HalfSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl HalfSerializer {
    pub fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
            error: Mutex::new(ErrorSlot::Empty),
        }
    }

    /// Deliver an item unless a terminal signal is being delivered
    ///
    /// Returns `false` when the flow ended while (or before) delivering.
    pub fn on_next<T>(&self, downstream: &SubscriberRef<T>, item: T) -> bool {
        if self
            .wip
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        downstream.on_next(item);
        if self.wip.fetch_sub(1, Ordering::AcqRel) != 1 {
            self.emit_terminal(downstream);
            return false;
        }
        true
    }

    pub fn on_error<T>(&self, downstream: &SubscriberRef<T>, error: FlowError) {
        if !self.add_error(error.clone()) {
            error::on_error(error);
            return;
        }
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.emit_terminal(downstream);
        }
    }

    pub fn on_complete<T>(&self, downstream: &SubscriberRef<T>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.emit_terminal(downstream);
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self.error.lock().as_deref(),
            Ok(ErrorSlot::Terminated) | Err(_)
        )
    }

    fn add_error(&self, error: FlowError) -> bool {
        let Ok(mut slot) = self.error.lock() else {
            return false;
        };
        match std::mem::replace(&mut *slot, ErrorSlot::Empty) {
            ErrorSlot::Empty => {
                *slot = ErrorSlot::Failed(error);
                true
            }
            ErrorSlot::Failed(previous) => {
                *slot = ErrorSlot::Failed(FlowError::composite(previous, error));
                true
            }
            ErrorSlot::Terminated => {
                *slot = ErrorSlot::Terminated;
                false
            }
        }
    }

    fn emit_terminal<T>(&self, downstream: &SubscriberRef<T>) {
        let previous = match self.error.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, ErrorSlot::Terminated),
            Err(_) => return,
        };
        match previous {
            ErrorSlot::Failed(e) => downstream.on_error(e),
            ErrorSlot::Empty => downstream.on_complete(),
            ErrorSlot::Terminated => {}
        }
    }
}
