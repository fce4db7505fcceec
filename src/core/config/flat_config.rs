// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Flat Property Configuration
//!
//! Priority-based property store. Settings can come from several places and
//! the one with the highest priority wins regardless of the order in which
//! they were applied.
//!
//! ## Property Sources (Priority: Low to High)
//!
//! 1. **RustDefault** - Built-in defaults
//! 2. **TomlFile** - A `backflow.toml` style document
//! 3. **Environment** - `BACKFLOW_*` environment variables
//! 4. **Programmatic** - Values set explicitly by the application

use std::collections::HashMap;

/// Property source identifier with priority ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySource {
    /// Rust code defaults (priority: 0)
    RustDefault,
    /// TOML document (priority: 1)
    TomlFile,
    /// Process environment (priority: 2)
    Environment,
    /// Explicit application override (priority: 3)
    Programmatic,
}

impl PropertySource {
    /// Get numeric priority for comparison (higher = more important)
    #[inline]
    pub const fn priority(&self) -> u8 {
        match self {
            PropertySource::RustDefault => 0,
            PropertySource::TomlFile => 1,
            PropertySource::Environment => 2,
            PropertySource::Programmatic => 3,
        }
    }

    #[inline]
    pub const fn description(&self) -> &'static str {
        match self {
            PropertySource::RustDefault => "Rust default",
            PropertySource::TomlFile => "TOML document",
            PropertySource::Environment => "environment variable",
            PropertySource::Programmatic => "programmatic override",
        }
    }
}

/// Flat key-value configuration with source tracking
#[derive(Debug, Clone, Default)]
pub struct FlatConfig {
    properties: HashMap<String, String>,
    sources: HashMap<String, PropertySource>,
}

impl FlatConfig {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property with source tracking and priority-based override
    ///
    /// Only sets the value if the new source has equal or higher priority
    /// than the existing source.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, source: PropertySource) {
        let key = key.into();

        if let Some(existing_source) = self.sources.get(&key) {
            if existing_source.priority() > source.priority() {
                return;
            }
        }

        self.properties.insert(key.clone(), value.into());
        self.sources.insert(key, source);
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Get a property value with its source
    pub fn get_with_source(&self, key: &str) -> Option<(&str, PropertySource)> {
        self.properties
            .get(key)
            .and_then(|value| self.sources.get(key).map(|source| (value.as_str(), *source)))
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Merge another configuration into this one (respects priorities)
    pub fn merge(&mut self, other: &FlatConfig) {
        for (key, value) in &other.properties {
            if let Some(source) = other.sources.get(key) {
                self.set(key.clone(), value.clone(), *source);
            }
        }
    }

    /// Get all properties with a specific prefix
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a String)> + 'a {
        self.properties
            .iter()
            .filter(move |(key, _)| key.starts_with(prefix))
    }

    /// Collect `BACKFLOW_*` variables as dotted lower-case keys
    ///
    /// `BACKFLOW_BUFFER_SIZE` becomes `buffer-size`,
    /// `BACKFLOW_RETRY__MAX_ATTEMPTS` becomes `retry.max-attempts`.
    pub fn from_env_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut config = Self::new();
        for (key, value) in vars {
            if let Some(rest) = key.strip_prefix("BACKFLOW_") {
                let normalized = rest.to_lowercase().replace("__", ".").replace('_', "-");
                config.set(normalized, value, PropertySource::Environment);
            }
        }
        config
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
