//! Sender policies, email snapshots, and the action log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two policy kinds a sender can be placed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// All mail from the sender is deleted.
    Block,
    /// Only mail the classifier considers transactional is kept.
    TransactionalOnly,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Block => "block",
            PolicyKind::TransactionalOnly => "transactional_only",
        }
    }

    /// Log entry written when a sender is placed under this policy.
    pub fn added_action(&self) -> ActionKind {
        match self {
            PolicyKind::Block => ActionKind::SenderBlocked,
            PolicyKind::TransactionalOnly => ActionKind::SenderMarkedTransactionalOnly,
        }
    }

    /// Log entry written when a sender is removed from this policy.
    pub fn removed_action(&self) -> ActionKind {
        match self {
            PolicyKind::Block => ActionKind::SenderUnblocked,
            PolicyKind::TransactionalOnly => ActionKind::SenderUnmarkedTransactionalOnly,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    /// Accepts the storage form as well as the dashboard's URL form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" | "blocked" => Ok(PolicyKind::Block),
            "transactional_only" | "transactional-only" | "transactional" => {
                Ok(PolicyKind::TransactionalOnly)
            }
            other => Err(format!("unknown policy kind: {other}")),
        }
    }
}

/// A durable sender policy. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderPolicy {
    pub id: String,
    /// Lower-cased sender address, unique per kind.
    pub address: String,
    pub kind: PolicyKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Kinds of entries in the append-only action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "blocked_sender")]
    SenderBlocked,
    #[serde(rename = "deleted_email")]
    EmailDeleted,
    #[serde(rename = "unblocked_sender")]
    SenderUnblocked,
    #[serde(rename = "transactional_only_sender")]
    SenderMarkedTransactionalOnly,
    #[serde(rename = "removed_transactional_only")]
    SenderUnmarkedTransactionalOnly,
    #[serde(rename = "deleted_marketing")]
    MarketingEmailDeleted,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SenderBlocked => "blocked_sender",
            ActionKind::EmailDeleted => "deleted_email",
            ActionKind::SenderUnblocked => "unblocked_sender",
            ActionKind::SenderMarkedTransactionalOnly => "transactional_only_sender",
            ActionKind::SenderUnmarkedTransactionalOnly => "removed_transactional_only",
            ActionKind::MarketingEmailDeleted => "deleted_marketing",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked_sender" => Ok(ActionKind::SenderBlocked),
            "deleted_email" => Ok(ActionKind::EmailDeleted),
            "unblocked_sender" => Ok(ActionKind::SenderUnblocked),
            "transactional_only_sender" => Ok(ActionKind::SenderMarkedTransactionalOnly),
            "removed_transactional_only" => Ok(ActionKind::SenderUnmarkedTransactionalOnly),
            "deleted_marketing" => Ok(ActionKind::MarketingEmailDeleted),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// An action to append to the log. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub sender: String,
    pub subject: String,
    pub message_id: String,
    pub details: String,
    pub snapshot_ref: Option<String>,
}

impl NewAction {
    pub fn new(
        kind: ActionKind,
        sender: impl Into<String>,
        subject: impl Into<String>,
        message_id: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            subject: subject.into(),
            message_id: message_id.into(),
            details: details.into(),
            snapshot_ref: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_ref: Option<String>) -> Self {
        self.snapshot_ref = snapshot_ref;
        self
    }
}

/// A persisted action log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: String,
    pub kind: ActionKind,
    pub sender: String,
    pub subject: String,
    pub message_id: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Full copy of a processed intake message, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSnapshot {
    pub id: String,
    pub message_id: String,
    pub sender: String,
    pub recipients: String,
    pub subject: String,
    pub date: String,
    pub headers: String,
    pub body_text: String,
    pub body_html: String,
    pub has_attachments: bool,
    pub created_at: DateTime<Utc>,
}

/// Dashboard summary counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub blocked_senders: usize,
    pub transactional_only_senders: usize,
    pub total_actions: usize,
    pub recent_actions: Vec<ActionLogEntry>,
}
