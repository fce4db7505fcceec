// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request accounting arithmetic.
//!
//! Demand is an `AtomicI64` that only grows through [`add`] (saturating at
//! [`UNBOUNDED`]) and only shrinks through [`produced`]. A counter at
//! `UNBOUNDED` is never decremented again. [`CANCELLED`] marks counters of
//! operators that fold the cancelled flag into the demand word.

use crate::core::protocol::UNBOUNDED;
use std::sync::atomic::{AtomicI64, Ordering};

/// Demand word value meaning "cancelled"
pub const CANCELLED: i64 = i64::MIN;

/// Saturating addition of two non-negative demands
#[inline]
pub fn add_cap(a: i64, b: i64) -> i64 {
    a.checked_add(b).unwrap_or(UNBOUNDED)
}

/// Saturating multiplication, used for prefetch * concurrency style limits
#[inline]
pub fn multiply_cap(a: i64, b: i64) -> i64 {
    a.checked_mul(b).unwrap_or(UNBOUNDED)
}

/// Atomically add `n`; returns the previous value
pub fn add(requested: &AtomicI64, n: i64) -> i64 {
    let mut current = requested.load(Ordering::Acquire);
    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = add_cap(current, n);
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return current,
            Err(actual) => current = actual,
        }
    }
}

/// Atomically add `n` unless the word holds [`CANCELLED`]; returns the previous value
pub fn add_cancel(requested: &AtomicI64, n: i64) -> i64 {
    let mut current = requested.load(Ordering::Acquire);
    loop {
        if current == CANCELLED || current == UNBOUNDED {
            return current;
        }
        let next = add_cap(current, n);
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return current,
            Err(actual) => current = actual,
        }
    }
}

/// Atomically subtract `n` emitted items; returns the remaining demand
///
/// An unbounded counter stays unbounded. Producing more than requested is
/// clamped at zero and logged because it indicates a misbehaving producer.
pub fn produced(requested: &AtomicI64, n: i64) -> i64 {
    let mut current = requested.load(Ordering::Acquire);
    loop {
        if current == UNBOUNDED || current == CANCELLED {
            return current;
        }
        let mut next = current - n;
        if next < 0 {
            log::warn!("More produced than requested: {}", next);
            next = 0;
        }
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_saturates() {
        let r = AtomicI64::new(UNBOUNDED - 1);
        assert_eq!(add(&r, 5), UNBOUNDED - 1);
        assert_eq!(r.load(Ordering::SeqCst), UNBOUNDED);
        assert_eq!(add(&r, 1), UNBOUNDED);
        assert_eq!(r.load(Ordering::SeqCst), UNBOUNDED);
    }

    #[test]
    fn test_produced_never_decrements_unbounded() {
        let r = AtomicI64::new(UNBOUNDED);
        assert_eq!(produced(&r, 10), UNBOUNDED);

        let r = AtomicI64::new(3);
        assert_eq!(produced(&r, 2), 1);
        assert_eq!(produced(&r, 5), 0);
    }

    #[test]
    fn test_add_cancel_respects_cancelled() {
        let r = AtomicI64::new(CANCELLED);
        assert_eq!(add_cancel(&r, 1), CANCELLED);
        assert_eq!(r.load(Ordering::SeqCst), CANCELLED);
    }

    #[test]
    fn test_caps() {
        assert_eq!(add_cap(UNBOUNDED, 1), UNBOUNDED);
        assert_eq!(multiply_cap(UNBOUNDED / 2, 3), UNBOUNDED);
        assert_eq!(multiply_cap(4, 32), 128);
    }
}
