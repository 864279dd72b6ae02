//! Breakpoint abstraction
//!
//! Four variants share one capability contract: halting breakpoints
//! ([`HaltPoint`]), the single-waiter [`BarrierPoint`], fire-and-forget
//! command intercepts ([`InterceptPointCmds`]) and full-duplex intercepts
//! ([`InterceptPoint`]). Not every capability is meaningful on every
//! variant; unsupported ones warn and do nothing.

pub mod dispatch;
pub mod halt;
pub mod intercept;

pub use dispatch::BreakpointDispatch;
pub use halt::{BarrierPoint, HaltPoint};
pub use intercept::{InterceptHook, InterceptPoint, InterceptPointCmds, InterceptRegistry};

use crate::error::{Result, RigError};
use crate::target::Target;
use crate::utils::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked when a halting breakpoint is reached.
///
/// Runs in the dispatch task with the target halted; it may issue ordinary
/// target commands (the barrier's auto-continue is one such hook).
pub type ReachedHook = Arc<dyn Fn(Arc<Target>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Capability set common to all breakpoint variants
#[async_trait]
pub trait Breakpoint: Send + Sync {
    /// The location this breakpoint was created for
    fn location(&self) -> &str;

    /// Number of times the location was reached
    fn hits(&self) -> u64;

    /// Hook invoked when the breakpoint is hit
    async fn reached(&self) -> Result<()>;

    /// Block until the breakpoint's hit handling completed
    async fn wait_complete(&self, timeout: Option<Duration>) -> Result<()>;

    /// Execute a debugger command in this breakpoint's context
    async fn exec(&self, cmd: &str) -> Result<()>;

    /// Evaluate an expression in this breakpoint's context
    async fn eval(&self, expr: &str) -> Result<Value>;

    /// Return from the current function, optionally forcing a return value
    async fn ret(&self, ret_val: Option<&str>) -> Result<()>;

    /// Remove the breakpoint from the debugger
    async fn delete(&self) -> Result<()>;
}

/// Check a location against the target's symbol index.
///
/// Raw addresses (`*0x...`) and line offsets (`+n`/`-n`) bypass the check;
/// everything else must name a known symbol when an index is available.
pub(crate) fn validate_location(target: &Target, location: &str) -> Result<()> {
    if location.starts_with(['+', '-', '*']) {
        return Ok(());
    }
    if let Some(symbols) = target.symbols() {
        if !symbols.exists(location) {
            return Err(RigError::Registration(format!(
                "No symbol \"{}\" found in target binary symbols",
                location
            )));
        }
    }
    Ok(())
}
