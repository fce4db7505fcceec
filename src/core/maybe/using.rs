// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource-scoped [`Maybe`]: acquire, derive a source, release.

use super::{Maybe, MaybeObserverRef};
use crate::core::disposable::{BooleanDisposable, Disposable, DisposableRef, DisposableSlot};
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::flowable::UsingMode;
use crate::core::protocol::MaybeObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Disposer<R> = Arc<dyn Fn(R) -> FlowResult<()> + Send + Sync>;

impl<T: Send + 'static> Maybe<T> {
    /// Create a resource per subscriber and release it when the flow ends
    ///
    /// With [`UsingMode::Eager`] the resource is released before the
    /// terminal signal and, on dispose, before the upstream is disposed.
    /// With [`UsingMode::NonEager`] the terminal signal goes first and, on
    /// dispose, the upstream is disposed first; a failing disposer is then
    /// reported to the error hook.
    pub fn using<R: Send + 'static>(
        resource: impl Fn() -> FlowResult<R> + Send + Sync + 'static,
        source: impl Fn(&R) -> FlowResult<Maybe<T>> + Send + Sync + 'static,
        disposer: impl Fn(R) -> FlowResult<()> + Send + Sync + 'static,
        mode: UsingMode,
    ) -> Maybe<T> {
        let disposer: Disposer<R> = Arc::new(disposer);
        Maybe::from_subscribe_fn(move |observer: MaybeObserverRef<T>| {
            let r = match resource() {
                Ok(r) => r,
                Err(e) => {
                    observer.on_subscribe(BooleanDisposable::disposed());
                    observer.on_error(e);
                    return;
                }
            };
            let inner = match source(&r) {
                Ok(inner) => inner,
                Err(e) => {
                    observer.on_subscribe(BooleanDisposable::disposed());
                    match mode {
                        UsingMode::Eager => match disposer(r) {
                            Ok(()) => observer.on_error(e),
                            Err(de) => observer.on_error(FlowError::composite(e, de)),
                        },
                        UsingMode::NonEager => {
                            observer.on_error(e);
                            if let Err(de) = disposer(r) {
                                error::on_error(de);
                            }
                        }
                    }
                    return;
                }
            };
            let using = Arc::new_cyclic(|this| UsingObserver {
                this: this.clone(),
                downstream: observer,
                resource: Mutex::new(Some(r)),
                disposer: Arc::clone(&disposer),
                upstream: DisposableSlot::new(),
                done: AtomicBool::new(false),
                mode,
            });
            inner.subscribe(using);
        })
    }
}

struct UsingObserver<T, R> {
    this: Weak<UsingObserver<T, R>>,
    downstream: MaybeObserverRef<T>,
    resource: Mutex<Option<R>>,
    disposer: Disposer<R>,
    upstream: DisposableSlot,
    done: AtomicBool,
    mode: UsingMode,
}

impl<T: Send + 'static, R: Send + 'static> UsingObserver<T, R> {
    /// Release the resource if nobody did yet
    fn release(&self) -> FlowResult<()> {
        let taken = self.resource.lock().ok().and_then(|mut r| r.take());
        match taken {
            Some(r) => (self.disposer)(r),
            None => Ok(()),
        }
    }

    fn release_to_hook(&self) {
        if let Err(e) = self.release() {
            error::on_error(e);
        }
    }

    fn finish(&self, signal: impl FnOnce(&MaybeObserverRef<T>), error: Option<FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Some(e) = error {
                error::on_error(e);
            }
            return;
        }
        match self.mode {
            UsingMode::Eager => match (self.release(), error) {
                (Ok(()), _) => signal(&self.downstream),
                (Err(de), Some(e)) => self.downstream.on_error(FlowError::composite(e, de)),
                (Err(de), None) => self.downstream.on_error(de),
            },
            UsingMode::NonEager => {
                signal(&self.downstream);
                self.release_to_hook();
            }
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> MaybeObserver<T> for UsingObserver<T, R> {
    fn on_subscribe(&self, disposable: DisposableRef) {
        if self.upstream.set_once(disposable) {
            if let Some(this) = self.this.upgrade() {
                self.downstream.on_subscribe(this);
            }
        }
    }

    fn on_success(&self, value: T) {
        self.finish(move |down| down.on_success(value), None);
    }

    fn on_error(&self, error: FlowError) {
        let forwarded = error.clone();
        self.finish(move |down| down.on_error(forwarded), Some(error));
    }

    fn on_complete(&self) {
        self.finish(|down| down.on_complete(), None);
    }
}

impl<T: Send + 'static, R: Send + 'static> Disposable for UsingObserver<T, R> {
    fn dispose(&self) {
        self.done.store(true, Ordering::Release);
        match self.mode {
            UsingMode::Eager => {
                self.release_to_hook();
                self.upstream.dispose();
            }
            UsingMode::NonEager => {
                self.upstream.dispose();
                self.release_to_hook();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.upstream.is_disposed()
    }
}
