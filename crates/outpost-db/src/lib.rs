//! PostgreSQL persistence for the Outpost control plane.
//!
//! Row models, connection pooling, migrations, and hand-written query
//! functions. Higher-level semantics (lifecycle validation, error
//! taxonomy) live in `outpost-core`; this crate exposes the raw
//! conditional-write primitives they are built on.

pub mod bootstrap;
pub mod cursor;
pub mod models;
pub mod queries;
