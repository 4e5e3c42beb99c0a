//! Persistence layer: libSQL-backed storage for policies, snapshots, and the action log.

pub mod libsql_backend;
pub mod migrations;
pub mod retention;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use retention::spawn_retention_task;
pub use traits::{PolicyStore, normalize_address};
