// SPDX-License-Identifier: MIT OR Apache-2.0

//! Disposable resources: cancellation handles for `Single`/`Maybe`
//! observers, scheduled tasks and scheduler workers.

use crate::core::error::{self, FlowError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A resource that can be released exactly once
pub trait Disposable: Send + Sync {
    /// Release the resource; idempotent
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Shared disposable handle
pub type DisposableRef = Arc<dyn Disposable>;

/// Flag-only disposable
#[derive(Debug, Default)]
pub struct BooleanDisposable {
    disposed: AtomicBool,
}

impl BooleanDisposable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that is already disposed
    pub fn disposed() -> DisposableRef {
        let d = Self::new();
        d.dispose();
        Arc::new(d)
    }
}

impl Disposable for BooleanDisposable {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Runs an action on first disposal
pub struct ActionDisposable {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    disposed: AtomicBool,
}

impl ActionDisposable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn arc(action: impl FnOnce() + Send + 'static) -> DisposableRef {
        Arc::new(Self::new(action))
    }
}

impl Disposable for ActionDisposable {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = self.action.lock().ok().and_then(|mut a| a.take());
        if let Some(action) = action {
            action();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

enum SlotState {
    Empty,
    Set(DisposableRef),
    Disposed,
}

/// A single-occupancy holder that disposes late arrivals once it is disposed
pub struct DisposableSlot {
    state: Mutex<SlotState>,
}

impl Default for DisposableSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposableSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// Attach the first disposable
    ///
    /// A second attachment is disposed and reported as
    /// "Disposable already set!". Returns whether `d` was stored.
    pub fn set_once(&self, d: DisposableRef) -> bool {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => {
                d.dispose();
                return false;
            }
        };
        match &*state {
            SlotState::Empty => {
                *state = SlotState::Set(d);
                true
            }
            SlotState::Set(_) => {
                drop(state);
                d.dispose();
                error::on_error(FlowError::disposable_already_set());
                false
            }
            SlotState::Disposed => {
                drop(state);
                d.dispose();
                false
            }
        }
    }

    /// Swap in a new disposable without disposing the previous one
    ///
    /// Returns `false` (and disposes `d`) when the slot is already disposed.
    pub fn replace(&self, d: DisposableRef) -> bool {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        if matches!(*state, SlotState::Disposed) {
            drop(state);
            d.dispose();
            return false;
        }
        *state = SlotState::Set(d);
        true
    }

    /// Swap in a new disposable and dispose the previous one
    pub fn set(&self, d: DisposableRef) -> bool {
        let previous = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return false,
            };
            if matches!(*state, SlotState::Disposed) {
                drop(state);
                d.dispose();
                return false;
            }
            std::mem::replace(&mut *state, SlotState::Set(d))
        };
        if let SlotState::Set(previous) = previous {
            previous.dispose();
        }
        true
    }

    /// The current occupant, if any
    pub fn get(&self) -> Option<DisposableRef> {
        match self.state.lock().ok().as_deref() {
            Some(SlotState::Set(d)) => Some(Arc::clone(d)),
            _ => None,
        }
    }
}

impl Disposable for DisposableSlot {
    fn dispose(&self) {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, SlotState::Disposed),
            Err(_) => return,
        };
        if let SlotState::Set(d) = previous {
            d.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        matches!(
            self.state.lock().ok().as_deref(),
            Some(SlotState::Disposed) | None
        )
    }
}

/// A group of disposables released together
pub struct CompositeDisposable {
    members: Mutex<Option<Vec<DisposableRef>>>,
}

impl Default for CompositeDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeDisposable {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Some(Vec::new())),
        }
    }

    /// Track `d`; disposes it immediately if the group is already disposed
    pub fn add(&self, d: DisposableRef) -> bool {
        if let Ok(mut members) = self.members.lock() {
            if let Some(list) = members.as_mut() {
                list.push(d);
                return true;
            }
        }
        d.dispose();
        false
    }

    /// Stop tracking `d` without disposing it
    pub fn delete(&self, d: &DisposableRef) -> bool {
        if let Ok(mut members) = self.members.lock() {
            if let Some(list) = members.as_mut() {
                if let Some(pos) = list.iter().position(|m| Arc::ptr_eq(m, d)) {
                    list.swap_remove(pos);
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.members
            .lock()
            .ok()
            .and_then(|m| m.as_ref().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Disposable for CompositeDisposable {
    fn dispose(&self) {
        let members = match self.members.lock() {
            Ok(mut m) => m.take(),
            Err(_) => None,
        };
        for d in members.into_iter().flatten() {
            d.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.members.lock().map(|m| m.is_none()).unwrap_or(true)
    }
}
