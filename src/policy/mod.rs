//! Policy domain types.

pub mod model;

pub use model::{ActionKind, ActionLogEntry, EmailSnapshot, NewAction, PolicyKind, SenderPolicy, Stats};
