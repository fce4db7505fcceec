// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Error Hook - Process-wide Routing of Undeliverable Errors
//!
//! Operators call [`on_error`] whenever a failure cannot be handed to a live
//! downstream: the consumer already cancelled, a terminal signal was already
//! delivered, or a participant broke the protocol (double `on_subscribe`,
//! `request(0)`, signal after terminal).
//!
//! ## Lifecycle
//!
//! The hook starts empty. Tests (or an application at startup) install a
//! handler with [`set_error_handler`] and remove it again with
//! [`reset_error_handler`]. After [`lockdown`] the hook can no longer be
//! changed.
//!
//! ```rust,ignore
//! backflow::core::error::set_error_handler(Arc::new(|e| eprintln!("dropped: {e}")))?;
//! // ...
//! backflow::core::error::reset_error_handler()?;
//! ```
//!
//! Errors that are not already classified as bugs (see
//! [`FlowError::is_bug`]) are wrapped into [`FlowError::Undeliverable`]
//! before the handler sees them. With no handler installed the error is
//! logged at `error` level.

use super::{FlowError, FlowResult};
use once_cell::sync::Lazy;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Handler signature for routed errors
pub type ErrorHook = Arc<dyn Fn(FlowError) + Send + Sync>;

static ERROR_HOOK: Lazy<RwLock<Option<ErrorHook>>> = Lazy::new(|| RwLock::new(None));
static LOCKDOWN: AtomicBool = AtomicBool::new(false);

/// Install the process-wide error handler
pub fn set_error_handler(hook: ErrorHook) -> FlowResult<()> {
    ensure_unlocked()?;
    let mut slot = ERROR_HOOK
        .write()
        .map_err(|_| FlowError::other("error hook lock poisoned"))?;
    *slot = Some(hook);
    log::debug!("Error hook installed");
    Ok(())
}

/// Restore the default (logging) behaviour
pub fn reset_error_handler() -> FlowResult<()> {
    ensure_unlocked()?;
    let mut slot = ERROR_HOOK
        .write()
        .map_err(|_| FlowError::other("error hook lock poisoned"))?;
    *slot = None;
    Ok(())
}

/// Whether a custom handler is currently installed
pub fn has_error_handler() -> bool {
    ERROR_HOOK.read().map(|slot| slot.is_some()).unwrap_or(false)
}

/// Prevent any further change to the hook
pub fn lockdown() {
    LOCKDOWN.store(true, Ordering::Release);
}

/// Whether [`lockdown`] has been called
pub fn is_locked_down() -> bool {
    LOCKDOWN.load(Ordering::Acquire)
}

fn ensure_unlocked() -> FlowResult<()> {
    if is_locked_down() {
        return Err(FlowError::unsupported("Plugins can't be changed anymore"));
    }
    Ok(())
}

/// Route an error that has no live consumer
pub fn on_error(error: FlowError) {
    let error = if error.is_bug() {
        error
    } else {
        FlowError::undeliverable(error)
    };

    let hook = ERROR_HOOK.read().ok().and_then(|slot| slot.clone());
    match hook {
        Some(hook) => {
            let routed = error.clone();
            // A failing handler must not take the emitting thread down with it
            if catch_unwind(AssertUnwindSafe(|| hook(routed))).is_err() {
                log::error!("Error hook panicked while handling: {}", error);
            }
        }
        None => log::error!("{}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;

    #[test]
    #[serial]
    fn test_wraps_plain_errors_as_undeliverable() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_error_handler(Arc::new(move |e| sink.lock().unwrap().push(e))).unwrap();

        on_error(FlowError::callback("late"));
        on_error(FlowError::bad_request(0));

        reset_error_handler().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], FlowError::undeliverable(FlowError::callback("late")));
        assert_eq!(seen[1], FlowError::bad_request(0));
    }

    #[test]
    #[serial]
    fn test_reset_restores_default() {
        set_error_handler(Arc::new(|_| {})).unwrap();
        assert!(has_error_handler());
        reset_error_handler().unwrap();
        assert!(!has_error_handler());
        // Falls back to logging
        on_error(FlowError::other("nobody listens"));
    }

    #[test]
    #[serial]
    fn test_panicking_handler_is_contained() {
        set_error_handler(Arc::new(|_| panic!("handler bug"))).unwrap();
        on_error(FlowError::other("boom"));
        reset_error_handler().unwrap();
    }
}
