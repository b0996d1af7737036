//! Hand-written query functions, one module per table family.

pub mod dispatch_logs;
pub mod dispatches;
pub mod idempotency;
pub mod workspaces;
