//! Policy enforcement pipeline.
//!
//! Every poll cycle flows through:
//! 1. Intake: messages in `USPIS/Block` and `USPIS/Transactional Only`
//!    become sender policies and are deleted.
//! 2. Enforcement: the rest of the mailbox is scanned for senders under
//!    policy; blocked mail is deleted outright, transactional-only mail is
//!    deleted when `classifier::classify()` marks it as marketing.
//!
//! `scheduler::spawn_poller()` runs cycles on a timer, one at a time.

pub mod classifier;
pub mod poller;
pub mod scheduler;
pub mod types;

pub use classifier::{Classification, classify};
pub use poller::Poller;
pub use scheduler::{PollerHandle, PollerState, spawn_poller};
pub use types::{CycleReport, StepName, StepOutcome};
