// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queue fusion negotiation.
//!
//! Two adjacent operators may agree to skip `on_next` handoff and let the
//! downstream pull values straight out of the upstream with
//! [`QueueSubscription::poll`]. The downstream asks with
//! [`QueueSubscription::request_fusion`] during `on_subscribe`; the answer is
//! the granted mode or [`FusionMode::NONE`].
//!
//! - `SYNC`: every value is already available; `poll` returning `None`
//!   means completion and the downstream never calls `request`.
//! - `ASYNC`: values arrive over time; the upstream signals
//!   [`Subscriber::on_available`](super::Subscriber::on_available) instead of
//!   `on_next` and the downstream drains with `poll`.
//! - `BOUNDARY`: set by a requester that will `poll` from another thread.
//!   Operators running user callbacks refuse fusion across a boundary.

use super::Subscription;
use crate::core::error::{FlowError, FlowResult};
use std::fmt;
use std::ops::BitOr;

/// Fusion mode bit set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionMode(u8);

impl FusionMode {
    pub const NONE: FusionMode = FusionMode(0);
    pub const SYNC: FusionMode = FusionMode(1);
    pub const ASYNC: FusionMode = FusionMode(2);
    pub const ANY: FusionMode = FusionMode(3);
    pub const BOUNDARY: FusionMode = FusionMode(4);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> FusionMode {
        FusionMode(bits & 7)
    }

    /// Whether every bit of `other` is set
    #[inline]
    pub const fn contains(self, other: FusionMode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 & 3 == 0
    }

    #[inline]
    pub const fn is_boundary(self) -> bool {
        self.0 & 4 != 0
    }

    /// Drop the boundary modifier
    #[inline]
    pub const fn without_boundary(self) -> FusionMode {
        FusionMode(self.0 & 3)
    }
}

impl BitOr for FusionMode {
    type Output = FusionMode;

    fn bitor(self, rhs: FusionMode) -> FusionMode {
        FusionMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for FusionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.without_boundary().0 {
            0 => "NONE",
            1 => "SYNC",
            2 => "ASYNC",
            _ => "ANY",
        };
        if self.is_boundary() {
            write!(f, "{}|BOUNDARY", name)
        } else {
            f.write_str(name)
        }
    }
}

/// A subscription that can also be drained as a queue
pub trait QueueSubscription<T>: Subscription {
    /// Negotiate a fusion mode; returns the granted mode or `NONE`
    fn request_fusion(&self, mode: FusionMode) -> FusionMode;

    /// Pull the next available value
    fn poll(&self) -> FlowResult<Option<T>>;

    fn is_empty(&self) -> bool;

    /// Drop every queued value
    fn clear(&self);

    /// Fused queues are pull-only
    fn offer(&self, _item: T) -> FlowResult<()> {
        Err(FlowError::unsupported("Should not be called!"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        let requested = FusionMode::ANY | FusionMode::BOUNDARY;
        assert!(requested.contains(FusionMode::SYNC));
        assert!(requested.contains(FusionMode::ASYNC));
        assert!(requested.is_boundary());
        assert_eq!(requested.without_boundary(), FusionMode::ANY);
        assert!(!FusionMode::NONE.contains(FusionMode::NONE));
        assert!(FusionMode::BOUNDARY.is_none());
        assert_eq!(format!("{:?}", requested), "ANY|BOUNDARY");
    }
}
