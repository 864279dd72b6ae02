//! Machine-interface transport: record parsing, routing, context tracking

pub mod context;
pub mod record;
pub mod router;

pub use context::{ContextGuard, MiContext};
pub use record::{MiRecord, MiValue, ResultClass};
pub use router::{MiLink, Notification, Router};
