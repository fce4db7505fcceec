// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demand-preserving upstream switching.
//!
//! Operators that move from one upstream to the next (timeout fallback,
//! retry) keep the downstream's outstanding demand in a
//! [`SubscriptionArbiter`]: items produced by the old upstream are subtracted
//! with [`produced`](SubscriptionArbiter::produced) and the remainder is
//! requested from the replacement. Cancellation always wins over a racing
//! request or replacement.

use super::backpressure::add_cap;
use super::validate;
use crate::core::error::{self, FlowError};
use crate::core::protocol::{Subscription, Upstream, UNBOUNDED};
use std::sync::Mutex;

struct ArbiterState<T> {
    current: Option<Upstream<T>>,
    requested: i64,
    cancelled: bool,
}

pub struct SubscriptionArbiter<T> {
    state: Mutex<ArbiterState<T>>,
    cancel_on_replace: bool,
}

impl<T> SubscriptionArbiter<T> {
    /// `cancel_on_replace` cancels the previous upstream when a new one is set
    pub fn new(cancel_on_replace: bool) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                current: None,
                requested: 0,
                cancelled: false,
            }),
            cancel_on_replace,
        }
    }

    /// Switch to `next`, requesting whatever demand is still outstanding
    pub fn set_subscription(&self, next: Upstream<T>) {
        let (previous, outstanding) = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => {
                    next.cancel();
                    return;
                }
            };
            if state.cancelled {
                drop(state);
                next.cancel();
                return;
            }
            let previous = state.current.replace(next.clone());
            (previous, state.requested)
        };
        if self.cancel_on_replace {
            if let Some(previous) = previous {
                previous.cancel();
            }
        }
        if outstanding != 0 {
            next.request(outstanding);
        }
    }

    /// Account for `n` items delivered by the current upstream
    pub fn produced(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.requested == UNBOUNDED {
            return;
        }
        let remaining = state.requested - n;
        if remaining < 0 {
            drop(state);
            error::on_error(FlowError::protocol(format!(
                "More produced than requested: {}",
                remaining
            )));
            if let Ok(mut state) = self.state.lock() {
                state.requested = 0;
            }
            return;
        }
        state.requested = remaining;
    }

    pub fn requested(&self) -> i64 {
        self.state.lock().map(|s| s.requested).unwrap_or(0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().map(|s| s.cancelled).unwrap_or(true)
    }
}

impl<T> Subscription for SubscriptionArbiter<T> {
    fn request(&self, n: i64) {
        if !validate(n) {
            return;
        }
        let current = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.cancelled {
                return;
            }
            state.requested = add_cap(state.requested, n);
            state.current.clone()
        };
        if let Some(current) = current {
            current.request(n);
        }
    }

    fn cancel(&self) {
        let current = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.current.take()
        };
        if let Some(current) = current {
            current.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscription::BooleanSubscription;
    use crate::core::testing::race;
    use std::sync::Arc;

    #[test]
    fn test_outstanding_demand_moves_to_replacement() {
        let arbiter: SubscriptionArbiter<i32> = SubscriptionArbiter::new(true);
        let first = Arc::new(BooleanSubscription::new());
        arbiter.set_subscription(Upstream::Plain(first.clone()));
        arbiter.request(10);
        arbiter.produced(4);

        let second = Arc::new(BooleanSubscription::new());
        arbiter.set_subscription(Upstream::Plain(second.clone()));
        assert!(first.is_cancelled());
        assert_eq!(second.requested(), 6);
    }

    #[test]
    fn test_request_before_first_upstream() {
        let arbiter: SubscriptionArbiter<i32> = SubscriptionArbiter::new(false);
        arbiter.request(3);
        arbiter.request(i64::MAX);
        assert_eq!(arbiter.requested(), UNBOUNDED);
        let upstream = Arc::new(BooleanSubscription::new());
        arbiter.set_subscription(Upstream::Plain(upstream.clone()));
        assert_eq!(upstream.requested(), UNBOUNDED);
        arbiter.produced(100);
        assert_eq!(arbiter.requested(), UNBOUNDED);
    }

    #[test]
    fn test_cancel_wins_over_replacement() {
        for _ in 0..500 {
            let arbiter = Arc::new(SubscriptionArbiter::<i32>::new(true));
            let next = Arc::new(BooleanSubscription::new());
            let a = Arc::clone(&arbiter);
            let n = next.clone();
            race(
                move || a.set_subscription(Upstream::Plain(n)),
                || arbiter.cancel(),
            );
            assert!(arbiter.is_cancelled());
            assert!(next.is_cancelled());
        }
    }
}
