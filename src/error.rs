//! Error types for the postal inspector.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail store errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed for {username}")]
    Auth { username: String },

    #[error("Failed to select folder {folder}: {reason}")]
    FolderSelect { folder: String, reason: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mail operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Mail task failed: {0}")]
    TaskFailed(String),
}

impl MailError {
    /// True when the folder could not be selected (absent or not yet created).
    ///
    /// Intake steps treat this as an empty folder rather than a failure.
    pub fn is_folder_missing(&self) -> bool {
        matches!(self, MailError::FolderSelect { .. })
    }

    /// True for failures after which the connection can no longer be
    /// trusted. Anything else is local to the folder or command at hand.
    pub fn breaks_session(&self) -> bool {
        matches!(
            self,
            MailError::Io(_) | MailError::Protocol(_) | MailError::Timeout { .. } | MailError::Tls(_)
        )
    }
}

/// A failure that aborts a single poll-cycle step.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("{step}: {source}")]
    Mail {
        step: &'static str,
        #[source]
        source: MailError,
    },

    #[error("{step}: {source}")]
    Database {
        step: &'static str,
        #[source]
        source: DatabaseError,
    },
}
