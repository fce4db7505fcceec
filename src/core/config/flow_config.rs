// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed runtime settings.
//!
//! ```toml
//! buffer-size = 256
//! computation-threads = 4
//! thread-name-prefix = "backflow"
//! ```

use super::{FlatConfig, PropertySource};
use crate::core::error::{FlowError, FlowResult};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::sync::RwLock;

/// Smallest prefetch any operator will use
pub const MIN_BUFFER_SIZE: usize = 16;

/// Default prefetch of queue-based operators
pub const DEFAULT_BUFFER_SIZE: usize = 128;

static GLOBAL: Lazy<RwLock<FlowConfig>> = Lazy::new(|| RwLock::new(FlowConfig::from_env()));

/// Runtime settings consumed by operators and schedulers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FlowConfig {
    /// Default prefetch for `publish`, `flat_map`, `observe_on` and `zip`
    pub buffer_size: usize,

    /// Number of event loops backing the computation scheduler
    pub computation_threads: usize,

    /// Prefix for names of scheduler threads
    pub thread_name_prefix: String,

    /// Whether operators may negotiate queue fusion
    pub fuse_enabled: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            computation_threads: num_cpus::get().max(1),
            thread_name_prefix: "backflow".to_string(),
            fuse_enabled: true,
        }
    }
}

impl FlowConfig {
    /// Build from flat properties, falling back to defaults for absent keys
    pub fn from_flat_config(config: &FlatConfig) -> FlowResult<Self> {
        let defaults = Self::default();

        let buffer_size = parse_usize(config, "buffer-size")?.unwrap_or(defaults.buffer_size);
        let computation_threads =
            parse_usize(config, "computation-threads")?.unwrap_or(defaults.computation_threads);
        let thread_name_prefix = config
            .get("thread-name-prefix")
            .map(str::to_string)
            .unwrap_or(defaults.thread_name_prefix);
        let fuse_enabled = config
            .get("fuse-enabled")
            .map(|s| {
                s.parse::<bool>().map_err(|_| {
                    FlowError::invalid_parameter("fuse-enabled", "expected 'true' or 'false'")
                })
            })
            .transpose()?
            .unwrap_or(defaults.fuse_enabled);

        Self {
            buffer_size,
            computation_threads,
            thread_name_prefix,
            fuse_enabled,
        }
        .validated()
    }

    /// Parse a TOML document
    pub fn from_toml_str(document: &str) -> FlowResult<Self> {
        let config: FlowConfig = toml::from_str(document).map_err(|e| {
            FlowError::invalid_parameter("toml", format!("Invalid configuration: {}", e))
        })?;
        config.validated()
    }

    /// Defaults overridden by `BACKFLOW_*` environment variables
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut flat = FlatConfig::new();
        flat.set(
            "buffer-size",
            DEFAULT_BUFFER_SIZE.to_string(),
            PropertySource::RustDefault,
        );
        flat.merge(&FlatConfig::from_env_vars(std::env::vars()));
        match Self::from_flat_config(&flat) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring invalid BACKFLOW_* environment settings: {}", e);
                Self::default()
            }
        }
    }

    fn validated(mut self) -> FlowResult<Self> {
        if self.buffer_size == 0 {
            return Err(FlowError::invalid_parameter(
                "buffer-size",
                "buffer-size must be positive",
            ));
        }
        if self.computation_threads == 0 {
            return Err(FlowError::invalid_parameter(
                "computation-threads",
                "computation-threads must be positive",
            ));
        }
        self.buffer_size = self.buffer_size.max(MIN_BUFFER_SIZE);
        Ok(self)
    }

    /// Snapshot of the process-wide settings
    pub fn global() -> FlowConfig {
        GLOBAL
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| FlowConfig::default())
    }

    /// Replace the process-wide settings
    ///
    /// Already created schedulers keep their thread counts.
    pub fn set_global(config: FlowConfig) {
        if let Ok(mut slot) = GLOBAL.write() {
            *slot = config;
        }
    }

    /// Shortcut for the default prefetch
    pub fn buffer_size() -> usize {
        Self::global().buffer_size
    }
}

fn parse_usize(config: &FlatConfig, key: &str) -> FlowResult<Option<usize>> {
    config
        .get(key)
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| FlowError::invalid_parameter(key, "must be a positive integer"))
        })
        .transpose()
}
