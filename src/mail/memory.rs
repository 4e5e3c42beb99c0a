//! In-process `MailStore` for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::MailError;
use crate::mail::{DeleteBatches, Envelope, FolderScanResult, FullMessage, MailStore, Uid};

#[derive(Debug, Default)]
struct Inner {
    folders: BTreeMap<String, Vec<FullMessage>>,
    next_uid: Uid,
    failing: HashSet<String>,
    offline: bool,
    scanned: Vec<String>,
    sessions_closed: usize,
}

impl Inner {
    fn check_online(&self) -> Result<(), MailError> {
        if self.offline {
            return Err(refused());
        }
        Ok(())
    }

    fn select(&self, folder: &str) -> Result<&Vec<FullMessage>, MailError> {
        self.check_online()?;
        if self.failing.contains(folder) {
            return Err(MailError::Command {
                command: "UID FETCH".into(),
                reason: format!("NO [UNAVAILABLE] {folder} is temporarily unavailable"),
            });
        }
        self.folders.get(folder).ok_or_else(|| MailError::FolderSelect {
            folder: folder.to_string(),
            reason: "NO [NONEXISTENT] Mailbox doesn't exist".into(),
        })
    }

    fn delete(&mut self, folder: &str, uids: &[Uid]) -> Result<(), MailError> {
        self.select(folder)?;
        if let Some(messages) = self.folders.get_mut(folder) {
            messages.retain(|m| !uids.contains(&m.uid));
        }
        Ok(())
    }
}

fn refused() -> MailError {
    MailError::Connect {
        host: "memory".into(),
        reason: "connection refused".into(),
    }
}

fn envelope(msg: &FullMessage) -> Envelope {
    Envelope {
        uid: msg.uid,
        message_id: msg.message_id.clone(),
        from: msg.from.to_lowercase(),
        subject: msg.subject.clone(),
        flags: Vec::new(),
    }
}

/// Folders and messages held in memory, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryMailStore {
    inner: Mutex<Inner>,
}

impl MemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the given (empty) folders.
    pub fn with_folders(names: &[&str]) -> Self {
        let store = Self::new();
        for name in names {
            store.create_folder(name);
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, MailError> {
        self.inner
            .lock()
            .map_err(|_| MailError::TaskFailed("memory store lock poisoned".into()))
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn create_folder(&self, name: &str) {
        self.with_inner(|inner| {
            inner.folders.entry(name.to_string()).or_default();
        });
    }

    /// Append a plain-text message, creating the folder if needed.
    pub fn add_message(&self, folder: &str, from: &str, subject: &str) -> Uid {
        self.with_inner(|inner| {
            inner.next_uid += 1;
            let uid = inner.next_uid;
            let msg = FullMessage {
                uid,
                message_id: format!("<{uid}@memory.test>"),
                from: from.to_string(),
                to: "me@example.com".into(),
                subject: subject.to_string(),
                date: "2026-01-01 00:00:00".into(),
                headers: format!("From: {from}\r\nSubject: {subject}"),
                body_text: subject.to_string(),
                body_html: String::new(),
                has_attachments: false,
            };
            inner.folders.entry(folder.to_string()).or_default().push(msg);
            uid
        })
    }

    /// Current messages in a folder; empty if the folder does not exist.
    pub fn messages(&self, folder: &str) -> Vec<FullMessage> {
        self.with_inner(|inner| inner.folders.get(folder).cloned().unwrap_or_default())
    }

    pub fn subjects(&self, folder: &str) -> Vec<String> {
        self.messages(folder).into_iter().map(|m| m.subject).collect()
    }

    pub fn has_folder(&self, folder: &str) -> bool {
        self.with_inner(|inner| inner.folders.contains_key(folder))
    }

    /// Every access to `folder` is rejected by the server; the session
    /// itself stays usable.
    pub fn fail_folder(&self, folder: &str) {
        self.with_inner(|inner| {
            inner.failing.insert(folder.to_string());
        });
    }

    /// While offline, every call fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.with_inner(|inner| inner.offline = offline);
    }

    /// Folders visited by `scan_for_senders`, in order, across all calls.
    pub fn scanned_folders(&self) -> Vec<String> {
        self.with_inner(|inner| inner.scanned.clone())
    }

    pub fn sessions_closed(&self) -> usize {
        self.with_inner(|inner| inner.sessions_closed)
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn list_folders(&self) -> Result<Vec<String>, MailError> {
        let inner = self.lock()?;
        inner.check_online()?;
        Ok(inner.folders.keys().cloned().collect())
    }

    async fn ensure_folder(&self, name: &str) -> Result<(), MailError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        inner.folders.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn fetch_envelopes(&self, folder: &str) -> Result<Vec<Envelope>, MailError> {
        let inner = self.lock()?;
        Ok(inner.select(folder)?.iter().map(envelope).collect())
    }

    async fn fetch_full(&self, folder: &str, uids: &[Uid]) -> Result<Vec<FullMessage>, MailError> {
        let inner = self.lock()?;
        Ok(inner
            .select(folder)?
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn scan_for_senders(
        &self,
        folders: &[String],
        senders: &HashSet<String>,
    ) -> Result<Vec<FolderScanResult>, MailError> {
        let mut inner = self.lock()?;
        inner.check_online()?;

        let mut results = Vec::new();
        for folder in folders {
            inner.scanned.push(folder.clone());
            let envelopes: Vec<Envelope> = match inner.select(folder) {
                Ok(messages) => messages
                    .iter()
                    .map(envelope)
                    .filter(|env| senders.contains(&env.from))
                    .collect(),
                Err(e) if !e.breaks_session() => {
                    tracing::warn!(folder = %folder, error = %e, "Skipping folder");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !envelopes.is_empty() {
                results.push(FolderScanResult {
                    folder: folder.clone(),
                    envelopes,
                });
            }
        }
        Ok(results)
    }

    async fn delete_by_uids(&self, folder: &str, uids: &[Uid]) -> Result<(), MailError> {
        self.lock()?.delete(folder, uids)
    }

    async fn delete_across_folders(&self, batches: &DeleteBatches) -> Result<(), MailError> {
        let mut inner = self.lock()?;
        let mut first_err = None;
        for (folder, uids) in batches {
            if let Err(e) = inner.delete(folder, uids) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn close_session(&self) {
        self.with_inner(|inner| inner.sessions_closed += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_folder_is_select_error() {
        let store = MemoryMailStore::new();
        let err = store.fetch_envelopes("USPIS/Block").await.unwrap_err();
        assert!(err.is_folder_missing());
    }

    #[tokio::test]
    async fn envelopes_lower_case_sender() {
        let store = MemoryMailStore::new();
        store.add_message("INBOX", "News@Shop.COM", "Hello");
        let envs = store.fetch_envelopes("INBOX").await.unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].from, "news@shop.com");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryMailStore::new();
        let keep = store.add_message("INBOX", "a@x.com", "keep");
        let gone = store.add_message("INBOX", "b@x.com", "gone");

        store.delete_by_uids("INBOX", &[gone]).await.unwrap();
        store.delete_by_uids("INBOX", &[gone]).await.unwrap();
        store.delete_by_uids("INBOX", &[999]).await.unwrap();

        let left = store.messages("INBOX");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uid, keep);
    }

    #[tokio::test]
    async fn scan_skips_missing_folders_and_filters_senders() {
        let store = MemoryMailStore::new();
        store.add_message("INBOX", "spam@x.com", "buy");
        store.add_message("INBOX", "friend@x.com", "hi");
        store.add_message("Archive", "friend@x.com", "old");

        let senders: HashSet<String> = ["spam@x.com".to_string()].into();
        let folders = vec!["INBOX".to_string(), "Gone".to_string(), "Archive".to_string()];
        let results = store.scan_for_senders(&folders, &senders).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].folder, "INBOX");
        assert_eq!(results[0].envelopes[0].subject, "buy");
        assert_eq!(store.scanned_folders(), folders);
    }

    #[tokio::test]
    async fn failing_folder_is_rejected_command() {
        let store = MemoryMailStore::new();
        store.add_message("USPIS/Block", "a@x.com", "x");
        store.fail_folder("USPIS/Block");
        let err = store.fetch_folder("USPIS/Block").await.unwrap_err();
        assert!(matches!(err, MailError::Command { .. }));
        assert!(!err.is_folder_missing());
    }

    #[tokio::test]
    async fn scan_skips_rejected_folder() {
        let store = MemoryMailStore::new();
        store.add_message("Archive", "spam@x.com", "old");
        store.add_message("INBOX", "spam@x.com", "new");
        store.fail_folder("Archive");

        let senders: HashSet<String> = ["spam@x.com".to_string()].into();
        let folders = vec!["Archive".to_string(), "INBOX".to_string()];
        let results = store.scan_for_senders(&folders, &senders).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].folder, "INBOX");
    }

    #[tokio::test]
    async fn scan_aborts_when_offline() {
        let store = MemoryMailStore::new();
        store.add_message("INBOX", "spam@x.com", "new");
        store.set_offline(true);

        let senders: HashSet<String> = ["spam@x.com".to_string()].into();
        assert!(
            store
                .scan_for_senders(&["INBOX".to_string()], &senders)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn offline_fails_everything() {
        let store = MemoryMailStore::with_folders(&["INBOX"]);
        store.set_offline(true);
        assert!(store.list_folders().await.is_err());
        assert!(store.ensure_folder("USPIS").await.is_err());
        store.set_offline(false);
        assert_eq!(store.list_folders().await.unwrap(), vec!["INBOX"]);
    }

    #[tokio::test]
    async fn delete_across_continues_past_missing_folder() {
        let store = MemoryMailStore::new();
        let uid = store.add_message("INBOX", "a@x.com", "x");
        let mut batches = DeleteBatches::new();
        batches.insert("Archive".into(), vec![1]);
        batches.insert("INBOX".into(), vec![uid]);

        assert!(store.delete_across_folders(&batches).await.is_err());
        assert!(store.messages("INBOX").is_empty());
    }
}
