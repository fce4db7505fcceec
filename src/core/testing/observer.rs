// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Recorded;
use crate::core::disposable::{Disposable, DisposableRef, DisposableSlot};
use crate::core::error::FlowError;
use crate::core::protocol::{CompletableObserver, MaybeObserver, SingleObserver};
use std::ops::Deref;
use std::sync::Arc;

/// Recording observer for `Single`, `Maybe` and `Completable` tests
pub struct TestObserver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TestObserver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    record: Recorded<T>,
    upstream: DisposableSlot,
}

impl<T: Clone + Send + 'static> Default for TestObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TestObserver<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                record: Recorded::default(),
                upstream: DisposableSlot::new(),
            }),
        }
    }

    pub fn as_single_observer(&self) -> Arc<dyn SingleObserver<T>> {
        self.inner.clone()
    }

    pub fn as_maybe_observer(&self) -> Arc<dyn MaybeObserver<T>> {
        self.inner.clone()
    }

    pub fn as_completable_observer(&self) -> Arc<dyn CompletableObserver> {
        self.inner.clone()
    }

    pub fn dispose(&self) {
        self.inner.upstream.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.upstream.is_disposed()
    }
}

impl<T> Deref for TestObserver<T> {
    type Target = Recorded<T>;

    fn deref(&self) -> &Recorded<T> {
        &self.inner.record
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn subscribed(&self, disposable: DisposableRef) {
        self.record.record_subscription();
        self.upstream.set_once(disposable);
    }
}

impl<T: Clone + Send + 'static> SingleObserver<T> for Inner<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.subscribed(disposable);
    }

    fn on_success(&self, value: T) {
        self.record.record_value(value);
        self.record.record_completion();
    }

    fn on_error(&self, error: FlowError) {
        self.record.record_error(error);
    }
}

impl<T: Clone + Send + 'static> MaybeObserver<T> for Inner<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.subscribed(disposable);
    }

    fn on_success(&self, value: T) {
        self.record.record_value(value);
        self.record.record_completion();
    }

    fn on_error(&self, error: FlowError) {
        self.record.record_error(error);
    }

    fn on_complete(&self) {
        self.record.record_completion();
    }
}

impl<T: Clone + Send + 'static> CompletableObserver for Inner<T> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        self.subscribed(disposable);
    }

    fn on_complete(&self) {
        self.record.record_completion();
    }

    fn on_error(&self, error: FlowError) {
        self.record.record_error(error);
    }
}
