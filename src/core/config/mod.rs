// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Runtime Configuration
//!
//! Two layers, lowest to highest level:
//!
//! - [`FlatConfig`]: string key/value pairs with source priority tracking
//! - [`FlowConfig`]: typed, validated settings consumed by operators and schedulers

pub mod flat_config;
pub mod flow_config;

pub use flat_config::{FlatConfig, PropertySource};
pub use flow_config::FlowConfig;
