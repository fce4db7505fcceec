// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bridge from callback-style code into a [`Completable`].

use super::{Completable, CompletableObserverRef};
use crate::core::disposable::{ActionDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

impl Completable {
    /// Hand each subscriber an emitter to signal through
    ///
    /// The first terminal call wins; later errors go to the error hook. An
    /// `Err` returned by `on_subscribe` is signalled like `emitter.on_error`.
    pub fn create(
        on_subscribe: impl Fn(&CompletableEmitter) -> FlowResult<()> + Send + Sync + 'static,
    ) -> Completable {
        Completable::from_subscribe_fn(move |observer: CompletableObserverRef| {
            let state = Arc::new(EmitterState {
                downstream: observer,
                resource: DisposableSlot::new(),
                done: AtomicBool::new(false),
            });
            state.downstream.on_subscribe(state.clone());
            let emitter = CompletableEmitter { state };
            if let Err(e) = on_subscribe(&emitter) {
                emitter.on_error(e);
            }
        })
    }
}

/// Signalling handle given to [`Completable::create`] callbacks
///
/// Cheap to clone; every clone drives the same observer.
#[derive(Clone)]
pub struct CompletableEmitter {
    state: Arc<EmitterState>,
}

struct EmitterState {
    downstream: CompletableObserverRef,
    /// Released on termination or disposal
    resource: DisposableSlot,
    done: AtomicBool,
}

impl EmitterState {
    /// Claim the terminal signal; `false` once terminated or disposed
    fn terminate(&self) -> bool {
        !self.resource.is_disposed() && !self.done.swap(true, Ordering::AcqRel)
    }
}

impl Disposable for EmitterState {
    fn dispose(&self) {
        self.resource.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.resource.is_disposed()
    }
}

impl CompletableEmitter {
    pub fn on_complete(&self) {
        if self.state.terminate() {
            self.state.downstream.on_complete();
            self.state.resource.dispose();
        }
    }

    pub fn on_error(&self, error: FlowError) {
        if !self.try_on_error(error.clone()) {
            error::on_error(error);
        }
    }

    /// Like `on_error`, but reports whether the error was delivered instead
    /// of routing it to the hook
    pub fn try_on_error(&self, error: FlowError) -> bool {
        if !self.state.terminate() {
            return false;
        }
        self.state.downstream.on_error(error);
        self.state.resource.dispose();
        true
    }

    /// Attach a resource released on termination or disposal, releasing
    /// the previous one
    pub fn set_disposable(&self, d: DisposableRef) {
        self.state.resource.set(d);
    }

    /// Attach a release action, see [`CompletableEmitter::set_disposable`]
    pub fn set_cancellable(&self, action: impl FnOnce() + Send + 'static) {
        self.set_disposable(ActionDisposable::arc(action));
    }

    pub fn is_disposed(&self) -> bool {
        self.state.resource.is_disposed()
    }
}
