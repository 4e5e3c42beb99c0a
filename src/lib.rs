//! Postal Inspector: enforces block and transactional-only sender policies on an IMAP mailbox.

pub mod config;
pub mod error;
pub mod mail;
pub mod pipeline;
pub mod policy;
pub mod store;
pub mod web;
