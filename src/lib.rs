// SPDX-License-Identifier: MIT OR Apache-2.0

//! # backflow
//!
//! Backpressure-aware reactive streams for Rust.
//!
//! - [`Flowable`]: `0..N` items with `request(n)` flow control
//! - [`Single`]: exactly one item or an error
//! - [`Maybe`]: zero or one item, or an error
//! - [`Completable`]: no items, only completion or an error
//!
//! Operators follow the reactive-streams protocol, fuse synchronous stages
//! through queue subscriptions where possible, and move work between
//! threads through [`Scheduler`]s. Errors that cannot reach a consumer are
//! routed to a process-wide hook (see [`core::error::set_error_handler`]).

pub mod core;

pub use crate::core::completable::Completable;
pub use crate::core::config::FlowConfig;
pub use crate::core::error::{FlowError, FlowResult};
pub use crate::core::flowable::Flowable;
pub use crate::core::maybe::Maybe;
pub use crate::core::scheduler::{schedulers, Scheduler, SchedulerRef};
pub use crate::core::single::Single;
