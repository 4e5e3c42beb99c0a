//! `PolicyStore` trait: single async interface for sender policies,
//! email snapshots, and the action log.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::policy::{ActionLogEntry, EmailSnapshot, NewAction, PolicyKind, SenderPolicy, Stats};

/// Number of entries returned in `Stats::recent_actions`.
pub const RECENT_ACTIONS: usize = 10;

/// Backend-agnostic persistence for the poller and the dashboard.
///
/// Addresses are normalized (trimmed, lower-cased) by implementations.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    // ── Policies ────────────────────────────────────────────────────

    /// Whether `address` is under the given policy.
    async fn is_under_policy(&self, address: &str, kind: PolicyKind) -> Result<bool, DatabaseError>;

    /// Insert-if-absent. Returns `true` when a new policy was created.
    async fn add_policy(
        &self,
        address: &str,
        kind: PolicyKind,
        reason: &str,
    ) -> Result<bool, DatabaseError>;

    /// All addresses under the given policy.
    async fn get_policy_addresses(&self, kind: PolicyKind) -> Result<Vec<String>, DatabaseError>;

    /// Full policy rows, newest first.
    async fn list_policies(&self, kind: PolicyKind) -> Result<Vec<SenderPolicy>, DatabaseError>;

    /// Remove a policy. Returns `false` if it did not exist.
    async fn remove_policy(&self, kind: PolicyKind, address: &str) -> Result<bool, DatabaseError>;

    // ── Snapshots ───────────────────────────────────────────────────

    /// Persist a snapshot and return its id.
    async fn save_snapshot(&self, snapshot: &EmailSnapshot) -> Result<String, DatabaseError>;

    async fn get_snapshot(&self, id: &str) -> Result<Option<EmailSnapshot>, DatabaseError>;

    /// Delete snapshots older than `days`, clearing log references first.
    /// Returns the number of snapshots removed.
    async fn purge_snapshots_older_than(&self, days: u32) -> Result<u64, DatabaseError>;

    // ── Action log ──────────────────────────────────────────────────

    /// Append to the action log.
    async fn log_action(&self, action: NewAction) -> Result<ActionLogEntry, DatabaseError>;

    /// Log entries, newest first.
    async fn list_actions(&self, limit: usize, offset: usize)
    -> Result<Vec<ActionLogEntry>, DatabaseError>;

    async fn get_action(&self, id: &str) -> Result<Option<ActionLogEntry>, DatabaseError>;

    async fn action_count(&self) -> Result<usize, DatabaseError>;

    /// Dashboard summary counts.
    async fn stats(&self) -> Result<Stats, DatabaseError> {
        Ok(Stats {
            blocked_senders: self.get_policy_addresses(PolicyKind::Block).await?.len(),
            transactional_only_senders: self
                .get_policy_addresses(PolicyKind::TransactionalOnly)
                .await?
                .len(),
            total_actions: self.action_count().await?,
            recent_actions: self.list_actions(RECENT_ACTIONS, 0).await?,
        })
    }
}

/// Canonical form of a sender address.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
