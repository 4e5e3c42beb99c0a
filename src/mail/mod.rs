//! Mail store: the remote mailbox the poller reads from and deletes in.
//!
//! `MailStore` is the seam between the poll engine and the protocol:
//! `ImapMailStore` talks IMAP over TLS, `MemoryMailStore` keeps folders in
//! process for tests.

pub mod imap;
pub mod memory;
pub mod parse;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::MailError;
use crate::policy::EmailSnapshot;

pub use imap::{ImapConfig, ImapMailStore};
pub use memory::MemoryMailStore;

/// Top-level container for the intake folders.
pub const FOLDER_CONTAINER: &str = "USPIS";
/// Messages moved here block their sender.
pub const FOLDER_BLOCK: &str = "USPIS/Block";
/// Messages moved here put their sender under the transactional-only policy.
pub const FOLDER_TRANSACTIONAL_ONLY: &str = "USPIS/Transactional Only";

/// Folders never touched by the enforcement scans.
pub const EXCLUDED_FOLDERS: &[&str] = &[
    "Orders",
    FOLDER_CONTAINER,
    FOLDER_BLOCK,
    FOLDER_TRANSACTIONAL_ONLY,
    "Sent Messages",
    "Drafts",
    "Deleted Messages",
];

/// Whether the enforcement scans must skip this folder.
///
/// Compared ignoring ASCII case so a server that reports `drafts` or
/// `uspis/block` still has them skipped.
pub fn is_excluded_folder(name: &str) -> bool {
    EXCLUDED_FOLDERS
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name))
}

/// Keep only the folders the enforcement scans may touch, in input order.
pub fn scannable_folders(all: &[String]) -> Vec<String> {
    all.iter()
        .filter(|f| !is_excluded_folder(f))
        .cloned()
        .collect()
}

/// IMAP UID of a message within its folder.
pub type Uid = u32;

/// Per-folder batches of UIDs to delete.
pub type DeleteBatches = BTreeMap<String, Vec<Uid>>;

/// Lightweight message metadata, no body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub uid: Uid,
    pub message_id: String,
    /// Lower-cased sender address.
    pub from: String,
    pub subject: String,
    pub flags: Vec<String>,
}

/// A fully fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullMessage {
    pub uid: Uid,
    pub message_id: String,
    /// Sender address as it appears in the message.
    pub from: String,
    /// Comma-separated recipient addresses.
    pub to: String,
    pub subject: String,
    pub date: String,
    pub headers: String,
    pub body_text: String,
    pub body_html: String,
    pub has_attachments: bool,
}

impl FullMessage {
    /// Audit copy of this message under the given (normalized) sender.
    pub fn to_snapshot(&self, sender: &str) -> EmailSnapshot {
        EmailSnapshot {
            id: Uuid::new_v4().to_string(),
            message_id: self.message_id.clone(),
            sender: sender.to_string(),
            recipients: self.to.clone(),
            subject: self.subject.clone(),
            date: self.date.clone(),
            headers: self.headers.clone(),
            body_text: self.body_text.clone(),
            body_html: self.body_html.clone(),
            has_attachments: self.has_attachments,
            created_at: Utc::now(),
        }
    }
}

/// Envelopes in one folder whose sender matched a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderScanResult {
    pub folder: String,
    pub envelopes: Vec<Envelope>,
}

/// Remote mailbox operations consumed by the poller.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// All folder names in the mailbox.
    async fn list_folders(&self) -> Result<Vec<String>, MailError>;

    /// Create the folder if it does not exist.
    async fn ensure_folder(&self, name: &str) -> Result<(), MailError>;

    /// Envelopes of every message in a folder.
    async fn fetch_envelopes(&self, folder: &str) -> Result<Vec<Envelope>, MailError>;

    /// Full content of the given messages.
    async fn fetch_full(&self, folder: &str, uids: &[Uid]) -> Result<Vec<FullMessage>, MailError>;

    /// Full content of every message in a folder.
    ///
    /// Fails with `MailError::FolderSelect` when the folder cannot be selected.
    async fn fetch_folder(&self, folder: &str) -> Result<Vec<FullMessage>, MailError> {
        let uids: Vec<Uid> = self
            .fetch_envelopes(folder)
            .await?
            .into_iter()
            .map(|e| e.uid)
            .collect();
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_full(folder, &uids).await
    }

    /// Scan folders for envelopes whose lower-cased sender is in `senders`.
    ///
    /// A folder that fails without breaking the session (cannot be
    /// selected, a rejected FETCH) is logged and skipped. Only folders with
    /// at least one match appear in the result.
    async fn scan_for_senders(
        &self,
        folders: &[String],
        senders: &HashSet<String>,
    ) -> Result<Vec<FolderScanResult>, MailError>;

    /// Mark messages deleted and expunge. Unknown UIDs are ignored.
    async fn delete_by_uids(&self, folder: &str, uids: &[Uid]) -> Result<(), MailError>;

    /// Delete batches across several folders in one session.
    async fn delete_across_folders(&self, batches: &DeleteBatches) -> Result<(), MailError>;

    /// Release any session held between calls. Called once per poll cycle.
    async fn close_session(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_and_system_folders_are_excluded() {
        for name in [
            "USPIS",
            "USPIS/Block",
            "USPIS/Transactional Only",
            "Orders",
            "Sent Messages",
            "Drafts",
            "Deleted Messages",
        ] {
            assert!(is_excluded_folder(name), "{name} should be excluded");
        }
    }

    #[test]
    fn exclusion_ignores_case() {
        assert!(is_excluded_folder("uspis/block"));
        assert!(is_excluded_folder("DRAFTS"));
        assert!(is_excluded_folder("sent messages"));
    }

    #[test]
    fn regular_folders_are_scanned() {
        for name in ["INBOX", "Archive", "Junk", "Receipts", "USPIS/Other", "Orders/2024"] {
            assert!(!is_excluded_folder(name), "{name} should be scanned");
        }
    }

    #[test]
    fn scannable_preserves_order() {
        let all: Vec<String> = ["Drafts", "INBOX", "USPIS/Block", "Archive", "orders"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(scannable_folders(&all), vec!["INBOX", "Archive"]);
    }

    #[test]
    fn snapshot_copies_message_fields() {
        let msg = FullMessage {
            uid: 7,
            message_id: "<abc@shop.com>".into(),
            from: "Deals@Shop.com".into(),
            to: "me@icloud.com".into(),
            subject: "50% off".into(),
            date: "2026-01-02 03:04:05".into(),
            headers: "From: Deals@Shop.com".into(),
            body_text: "Buy".into(),
            body_html: "<p>Buy</p>".into(),
            has_attachments: true,
        };
        let snap = msg.to_snapshot("deals@shop.com");
        assert_eq!(snap.sender, "deals@shop.com");
        assert_eq!(snap.recipients, "me@icloud.com");
        assert_eq!(snap.message_id, "<abc@shop.com>");
        assert!(snap.has_attachments);
        assert!(!snap.id.is_empty());
    }
}
