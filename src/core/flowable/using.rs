// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource-scoped flows.
//!
//! A resource is created per subscriber, a source is derived from it and the
//! resource is released exactly once: when the flow terminates or when the
//! subscriber cancels, whichever happens first.

use super::Flowable;
use crate::core::error::{self, FlowError, FlowResult};
use crate::core::protocol::{Subscriber, SubscriberRef, Subscription, Upstream};
use crate::core::subscription::{EmptySubscription, SubscriptionSlot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// When the resource is released relative to the terminal signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsingMode {
    /// Release before the terminal signal; on cancel, release then cancel
    Eager,
    /// Release after the terminal signal; on cancel, cancel then release
    NonEager,
}

type Disposer<R> = Arc<dyn Fn(R) -> FlowResult<()> + Send + Sync>;

impl<T: Send + 'static> Flowable<T> {
    /// Build a flow over a per-subscriber resource
    ///
    /// Disposer failures in [`UsingMode::Eager`] are delivered downstream,
    /// combined with the upstream error if there is one. In
    /// [`UsingMode::NonEager`] they go to the error hook.
    pub fn using<R: Send + 'static>(
        resource: impl Fn() -> FlowResult<R> + Send + Sync + 'static,
        source: impl Fn(&R) -> FlowResult<Flowable<T>> + Send + Sync + 'static,
        disposer: impl Fn(R) -> FlowResult<()> + Send + Sync + 'static,
        mode: UsingMode,
    ) -> Flowable<T> {
        let disposer: Disposer<R> = Arc::new(disposer);
        Flowable::from_subscribe_fn(move |subscriber: SubscriberRef<T>| {
            let r = match resource() {
                Ok(r) => r,
                Err(e) => {
                    EmptySubscription::error(&subscriber, e);
                    return;
                }
            };
            let inner = match source(&r) {
                Ok(inner) => inner,
                Err(e) => {
                    match mode {
                        UsingMode::Eager => {
                            let e = match disposer(r) {
                                Ok(()) => e,
                                Err(de) => FlowError::composite(e, de),
                            };
                            EmptySubscription::error(&subscriber, e);
                        }
                        UsingMode::NonEager => {
                            EmptySubscription::error(&subscriber, e);
                            if let Err(de) = disposer(r) {
                                error::on_error(de);
                            }
                        }
                    }
                    return;
                }
            };
            let using = Arc::new_cyclic(|this| UsingSubscriber {
                this: this.clone(),
                downstream: subscriber,
                upstream: SubscriptionSlot::new(),
                resource: Mutex::new(Some(r)),
                disposer: Arc::clone(&disposer),
                done: AtomicBool::new(false),
                mode,
            });
            inner.subscribe(SubscriberRef::Plain(using));
        })
    }
}

struct UsingSubscriber<T, R> {
    this: Weak<UsingSubscriber<T, R>>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionSlot<T>,
    resource: Mutex<Option<R>>,
    disposer: Disposer<R>,
    done: AtomicBool,
    mode: UsingMode,
}

impl<T: Send + 'static, R: Send + 'static> UsingSubscriber<T, R> {
    fn release(&self) -> FlowResult<()> {
        let taken = self.resource.lock().ok().and_then(|mut r| r.take());
        match taken {
            Some(r) => {
                log::trace!("Releasing flow resource");
                (self.disposer)(r)
            }
            None => Ok(()),
        }
    }

    fn release_to_hook(&self) {
        if let Err(e) = self.release() {
            error::on_error(e);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for UsingSubscriber<T, R> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if !self.upstream.set_once(subscription) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.downstream.on_subscribe(Upstream::Plain(this));
        }
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            error::on_error(error);
            return;
        }
        match self.mode {
            UsingMode::Eager => match self.release() {
                Ok(()) => self.downstream.on_error(error),
                Err(de) => self.downstream.on_error(FlowError::composite(error, de)),
            },
            UsingMode::NonEager => {
                self.downstream.on_error(error);
                self.release_to_hook();
            }
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.mode {
            UsingMode::Eager => match self.release() {
                Ok(()) => self.downstream.on_complete(),
                Err(de) => self.downstream.on_error(de),
            },
            UsingMode::NonEager => {
                self.downstream.on_complete();
                self.release_to_hook();
            }
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscription for UsingSubscriber<T, R> {
    fn request(&self, n: i64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        match self.mode {
            UsingMode::Eager => {
                self.release_to_hook();
                self.upstream.cancel();
            }
            UsingMode::NonEager => {
                self.upstream.cancel();
                self.release_to_hook();
            }
        }
    }
}
