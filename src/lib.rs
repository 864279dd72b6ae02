//! Debugger-driven on-target test rig
//!
//! Remote-controls a debugger attached to a physical microcontroller to
//! drive automated tests against firmware. Test code talks to a [`Target`]
//! over the debugger's machine interface; breakpoint variants let it stop
//! the target, wait for locations to be passed, or run host logic inside a
//! paused execution context over a private channel without fully stopping
//! the target.
//!
//! Process supervision (launching the debugger and debug server), ELF
//! loading and test-runner wiring live outside this crate; the transport
//! is injected as an [`mi::MiLink`] reader/writer pair.

pub mod breakpoint;
pub mod config;
pub mod error;
pub mod mi;
pub mod symbols;
pub mod target;
pub mod utils;
pub mod wire;

pub use breakpoint::{
    BarrierPoint, Breakpoint, BreakpointDispatch, HaltPoint, InterceptPoint, InterceptPointCmds,
};
pub use config::Config;
pub use error::{Result, RigError};
pub use target::Target;
pub use utils::Value;
