// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backflow Core Error Types
//!
//! Every failure that can travel through a reactive pipeline is a [`FlowError`].
//! Errors are cheap to clone because a multicasting operator has to hand the
//! same terminal error to each of its subscribers.
//!
//! ## Taxonomy
//!
//! | Category | Variants | Where it ends up |
//! |----------|----------|------------------|
//! | User callback | `Callback`, `Timeout`, `NoSuchElement`, `Cancelled` | downstream `on_error` |
//! | Protocol violation | `ProtocolViolation`, `UnsupportedOperation` | error hook |
//! | Undeliverable | `Undeliverable` | error hook |
//! | Composite | `Composite` | downstream `on_error` or error hook |

pub mod handler;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use handler::{
    has_error_handler, is_locked_down, lockdown, on_error, reset_error_handler,
    set_error_handler, ErrorHook,
};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Result type for backflow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Shared, type-erased error source
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Coarse classification used by the hook and the retry operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A user supplied function failed
    Callback,
    /// A participant broke the Reactive Streams rules
    Protocol,
    /// The error had no live consumer
    Undeliverable,
    /// Several independent failures combined
    Composite,
    /// A deadline elapsed
    Timeout,
    /// Anything else
    Other,
}

/// Comprehensive backflow error types
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("{message}")]
    Callback {
        message: String,
        source: Option<ErrorSource>,
    },

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("The exception could not be delivered to the consumer because it has already canceled/disposed the flow or the exception has nowhere to go to begin with: {cause}")]
    Undeliverable { cause: Box<FlowError> },

    #[error("{} exceptions occurred: {}", .causes.len(), CompositeDisplay(.causes))]
    Composite { causes: Vec<FlowError> },

    #[error("{message}")]
    Timeout { timeout: Duration, message: String },

    #[error("{message}")]
    NoSuchElement { message: String },

    #[error("{message}")]
    Cancelled { message: String },

    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[error("Invalid parameter '{parameter}': {message}")]
    InvalidParameter { message: String, parameter: String },

    #[error("Missing backpressure: {message}")]
    MissingBackpressure { message: String },

    #[error("{0}")]
    Other(String),
}

struct CompositeDisplay<'a>(&'a [FlowError]);

impl fmt::Display for CompositeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cause) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}] {}", i + 1, cause)?;
        }
        Ok(())
    }
}

// Custom error creation helpers
impl FlowError {
    /// Create a user callback failure
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
            source: None,
        }
    }

    /// Create a user callback failure wrapping an arbitrary error
    pub fn callback_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Callback {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// The report produced by `request(n)` with `n <= 0`
    pub fn bad_request(n: i64) -> Self {
        Self::protocol(format!("§3.9 violated: n > 0 required but it was {n}"))
    }

    /// The report produced when a second upstream tries to attach
    pub fn subscription_already_set() -> Self {
        Self::protocol("Subscription already set!")
    }

    /// The report produced when a second disposable tries to attach
    pub fn disposable_already_set() -> Self {
        Self::protocol("Disposable already set!")
    }

    /// Wrap an error that had no live consumer
    pub fn undeliverable(cause: FlowError) -> Self {
        Self::Undeliverable {
            cause: Box::new(cause),
        }
    }

    /// Combine two failures, flattening nested composites and preserving order
    pub fn composite(first: FlowError, second: FlowError) -> Self {
        Self::composite_of(vec![first, second])
    }

    /// Combine any number of failures into one
    pub fn composite_of(errors: impl IntoIterator<Item = FlowError>) -> Self {
        let mut causes = Vec::new();
        for e in errors {
            match e {
                FlowError::Composite { causes: inner } => causes.extend(inner),
                other => causes.push(other),
            }
        }
        if causes.len() == 1 {
            return causes.pop().unwrap_or_else(|| FlowError::other("empty composite"));
        }
        Self::Composite { causes }
    }

    /// Create the error emitted when a timeout elapses
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout,
            message: format!(
                "The source did not signal an event for {:?} and has been terminated.",
                timeout
            ),
        }
    }

    /// Create a no-such-element error
    pub fn no_such_element(message: impl Into<String>) -> Self {
        Self::NoSuchElement {
            message: message.into(),
        }
    }

    /// Create the error a `Single`/`Maybe` receives when another source ended it
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
            parameter: parameter.into(),
        }
    }

    /// Create a missing backpressure error
    pub fn missing_backpressure(message: impl Into<String>) -> Self {
        Self::MissingBackpressure {
            message: message.into(),
        }
    }

    /// Create a generic error from a string
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            FlowError::Callback { .. } | FlowError::NoSuchElement { .. } => ErrorCategory::Callback,
            FlowError::ProtocolViolation { .. }
            | FlowError::UnsupportedOperation { .. }
            | FlowError::InvalidParameter { .. }
            | FlowError::MissingBackpressure { .. } => ErrorCategory::Protocol,
            FlowError::Undeliverable { .. } => ErrorCategory::Undeliverable,
            FlowError::Composite { .. } => ErrorCategory::Composite,
            FlowError::Timeout { .. } => ErrorCategory::Timeout,
            FlowError::Cancelled { .. } | FlowError::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether the error is a known bug class that the hook receives unwrapped
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            FlowError::ProtocolViolation { .. }
                | FlowError::UnsupportedOperation { .. }
                | FlowError::InvalidParameter { .. }
                | FlowError::MissingBackpressure { .. }
                | FlowError::Undeliverable { .. }
                | FlowError::Composite { .. }
        )
    }

    /// Whether resubscribing can reasonably succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Callback | ErrorCategory::Timeout | ErrorCategory::Other
        )
    }

    /// Causes of a composite, or the error itself
    pub fn causes(&self) -> Vec<&FlowError> {
        match self {
            FlowError::Composite { causes } => causes.iter().collect(),
            other => vec![other],
        }
    }

    /// Unwrap `Undeliverable` layers
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::Undeliverable { cause } => cause.root(),
            other => other,
        }
    }

    /// Message of the innermost error without the variant prefix
    pub fn message(&self) -> String {
        match self.root() {
            FlowError::Callback { message, .. }
            | FlowError::ProtocolViolation { message }
            | FlowError::Timeout { message, .. }
            | FlowError::NoSuchElement { message }
            | FlowError::Cancelled { message }
            | FlowError::UnsupportedOperation { message }
            | FlowError::InvalidParameter { message, .. }
            | FlowError::MissingBackpressure { message } => message.clone(),
            FlowError::Other(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for FlowError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlowError::Composite { causes: a }, FlowError::Composite { causes: b }) => a == b,
            (FlowError::Undeliverable { cause: a }, FlowError::Undeliverable { cause: b }) => {
                a == b
            }
            _ => {
                std::mem::discriminant(self) == std::mem::discriminant(other)
                    && self.to_string() == other.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_message() {
        let error = FlowError::bad_request(-1);
        assert!(error.to_string().contains("n > 0 required but it was -1"));
        assert_eq!(error.category(), ErrorCategory::Protocol);
        assert!(error.is_bug());
    }

    #[test]
    fn test_composite_flattens_in_order() {
        let inner = FlowError::composite(FlowError::callback("a"), FlowError::callback("b"));
        let outer = FlowError::composite(inner, FlowError::callback("c"));
        let messages: Vec<String> = outer.causes().iter().map(|e| e.message()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert!(outer.to_string().starts_with("3 exceptions occurred"));
    }

    #[test]
    fn test_composite_of_single_is_identity() {
        let e = FlowError::composite_of(vec![FlowError::callback("only")]);
        assert_eq!(e, FlowError::callback("only"));
    }

    #[test]
    fn test_undeliverable_root() {
        let e = FlowError::undeliverable(FlowError::callback("late"));
        assert_eq!(e.root(), &FlowError::callback("late"));
        assert_eq!(e.message(), "late");
        assert_eq!(e.category(), ErrorCategory::Undeliverable);
    }

    #[test]
    fn test_timeout_message() {
        let e = FlowError::timeout(Duration::from_millis(10));
        assert!(e.to_string().contains("did not signal an event for 10ms"));
        assert!(e.is_retriable());
    }

    #[test]
    fn test_callback_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let e = FlowError::callback_with_source("read failed", io);
        match &e {
            FlowError::Callback { source, .. } => assert!(source.is_some()),
            _ => panic!("Expected Callback"),
        }
        assert!(!e.is_bug());
    }
}
