//! MI access context tracking
//!
//! The transport is shared between ordinary test-code commands and an
//! active intercept breakpoint's handler. This guard is the only mechanism
//! keeping the two from interleaving: exactly one holder, transitions to a
//! non-normal context only from `Normal`, release only by the holder.

use crate::error::{Result, RigError};
use std::sync::Mutex;

/// Who may currently issue commands on the shared transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiContext {
    /// Ordinary test-code traffic
    Normal,
    /// An intercept breakpoint handler owns the transport
    BpIntercept,
}

#[derive(Debug)]
struct ContextState {
    context: MiContext,
    holder: Option<String>,
}

/// Single-holder mutual-exclusion gate over the MI context
#[derive(Debug)]
pub struct ContextGuard {
    state: Mutex<ContextState>,
}

impl Default for ContextGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState {
                context: MiContext::Normal,
                holder: None,
            }),
        }
    }

    /// Switch to `context` on behalf of `holder`.
    ///
    /// Fails without side effects unless the current context is `Normal`.
    pub fn acquire(&self, holder: &str, context: MiContext) -> Result<()> {
        let mut state = self.state.lock().expect("context lock poisoned");
        if state.context != MiContext::Normal {
            return Err(RigError::ContextViolation(
                "Unable to switch context while not in normal context. \
                 The current context holder has to release first."
                    .to_string(),
            ));
        }
        state.context = context;
        state.holder = Some(holder.to_string());
        Ok(())
    }

    /// Return to `Normal`. Only the current holder may release.
    pub fn release(&self, holder: &str) -> Result<()> {
        let mut state = self.state.lock().expect("context lock poisoned");
        if state.holder.as_deref() != Some(holder) {
            return Err(RigError::ContextViolation(
                "Context can only be released by the entity that acquired it.".to_string(),
            ));
        }
        state.context = MiContext::Normal;
        state.holder = None;
        Ok(())
    }

    pub fn current(&self) -> MiContext {
        self.state.lock().expect("context lock poisoned").context
    }
}
