//! The poll engine.
//!
//! One cycle runs four steps in order, each fault-isolated:
//! 1. Block-folder intake
//! 2. Transactional-only-folder intake
//! 3. Block enforcement across the mailbox
//! 4. Transactional-only enforcement across the mailbox
//!
//! A failing step is recorded in the `CycleReport` and the cycle moves on.
//! Re-running a cycle after partial failure is safe: policy writes are
//! insert-if-absent and deletes of missing messages are no-ops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, MailError, PollError};
use crate::mail::{
    DeleteBatches, FOLDER_BLOCK, FOLDER_CONTAINER, FOLDER_TRANSACTIONAL_ONLY, FolderScanResult,
    FullMessage, MailStore, scannable_folders,
};
use crate::pipeline::classifier::classify;
use crate::pipeline::types::{CycleReport, StepName, StepOutcome};
use crate::policy::{ActionKind, NewAction, PolicyKind};
use crate::store::PolicyStore;

/// Intake folder for a policy kind.
pub fn intake_folder(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::Block => FOLDER_BLOCK,
        PolicyKind::TransactionalOnly => FOLDER_TRANSACTIONAL_ONLY,
    }
}

fn intake_reason(kind: PolicyKind, subject: &str) -> String {
    match kind {
        PolicyKind::Block => format!("Moved to Block folder: {subject}"),
        PolicyKind::TransactionalOnly => format!("Moved to Transactional Only folder: {subject}"),
    }
}

fn policy_added_detail(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::Block => "Blocked via USPIS/Block folder",
        PolicyKind::TransactionalOnly => {
            "Added via USPIS/Transactional Only folder - marketing emails will be deleted"
        }
    }
}

fn intake_deleted_detail(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::Block => "Deleted from Block folder",
        PolicyKind::TransactionalOnly => "Deleted from Transactional Only folder",
    }
}

fn mail_err(step: StepName) -> impl FnOnce(MailError) -> PollError {
    move |source| PollError::Mail {
        step: step.as_str(),
        source,
    }
}

fn db_err(step: StepName) -> impl FnOnce(DatabaseError) -> PollError {
    move |source| PollError::Database {
        step: step.as_str(),
        source,
    }
}

/// Drives poll cycles against a mail store and a policy store.
pub struct Poller {
    mail: Arc<dyn MailStore>,
    store: Arc<dyn PolicyStore>,
}

impl Poller {
    pub fn new(mail: Arc<dyn MailStore>, store: Arc<dyn PolicyStore>) -> Self {
        Self { mail, store }
    }

    /// Create the container and intake folders. Failures are logged only.
    pub async fn bootstrap_folders(&self) {
        for folder in [FOLDER_CONTAINER, FOLDER_BLOCK, FOLDER_TRANSACTIONAL_ONLY] {
            match self.mail.ensure_folder(folder).await {
                Ok(()) => debug!(folder, "Folder ready"),
                Err(e) => warn!(folder, error = %e, "Failed to ensure folder"),
            }
        }
    }

    /// Run one full cycle. Never fails as a whole.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(Utc::now());

        for step in StepName::ALL {
            let result = match step {
                StepName::BlockIntake => self.process_intake(PolicyKind::Block).await,
                StepName::TransactionalOnlyIntake => {
                    self.process_intake(PolicyKind::TransactionalOnly).await
                }
                StepName::BlockEnforcement => self.enforce_block().await,
                StepName::TransactionalOnlyEnforcement => self.enforce_transactional_only().await,
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(step = %step, error = %e, "Poll step failed");
                    StepOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.push(step, outcome);
        }

        self.mail.close_session().await;

        report.duration = started.elapsed();
        info!(
            deleted = report.total_deleted(),
            failures = report.failures(),
            elapsed_ms = report.duration.as_millis() as u64,
            "Poll cycle complete"
        );
        report
    }

    /// Append to the action log; failures are logged and swallowed.
    async fn log(&self, action: NewAction) {
        if let Err(e) = self.store.log_action(action).await {
            warn!(error = %e, "Failed to write action log entry");
        }
    }

    // ── Steps 1 and 2: intake ───────────────────────────────────────

    /// Turn every message in the intake folder into a policy, then delete them.
    pub async fn process_intake(&self, kind: PolicyKind) -> Result<StepOutcome, PollError> {
        let step = StepName::intake(kind);
        let folder = intake_folder(kind);

        let messages = match self.mail.fetch_folder(folder).await {
            Ok(messages) => messages,
            Err(e) if e.is_folder_missing() => {
                info!(folder, "Intake folder not available, nothing to do");
                return Ok(StepOutcome::skipped(format!("{folder} not available")));
            }
            Err(e) => return Err(mail_err(step)(e)),
        };

        if messages.is_empty() {
            return Ok(StepOutcome::Completed {
                processed: 0,
                deleted: 0,
            });
        }
        info!(folder, count = messages.len(), "Processing intake folder");

        let mut to_delete = Vec::new();
        for msg in &messages {
            if self.process_intake_message(kind, msg).await {
                to_delete.push(msg.uid);
            }
        }

        if !to_delete.is_empty() {
            self.mail
                .delete_by_uids(folder, &to_delete)
                .await
                .map_err(mail_err(step))?;
            info!(folder, count = to_delete.len(), "Deleted intake messages");
        }

        Ok(StepOutcome::Completed {
            processed: messages.len(),
            deleted: to_delete.len(),
        })
    }

    /// Handle one intake message. Returns whether it should be deleted.
    async fn process_intake_message(&self, kind: PolicyKind, msg: &FullMessage) -> bool {
        let sender = msg.from.trim().to_lowercase();
        if sender.is_empty() {
            debug!(uid = msg.uid, "Skipping intake message without sender");
            return false;
        }

        let snapshot_id = match self.store.save_snapshot(&msg.to_snapshot(&sender)).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(sender = %sender, error = %e, "Failed to save email snapshot");
                None
            }
        };

        let already = match self.store.is_under_policy(&sender, kind).await {
            Ok(already) => already,
            Err(e) => {
                // Leave the message in place so the next cycle retries it.
                error!(sender = %sender, kind = %kind, error = %e, "Policy lookup failed");
                return false;
            }
        };

        let mut deleted_detail = intake_deleted_detail(kind).to_string();
        if already {
            debug!(sender = %sender, kind = %kind, "Sender already under policy");
        } else {
            match self
                .store
                .add_policy(&sender, kind, &intake_reason(kind, &msg.subject))
                .await
            {
                Ok(_) => {
                    info!(sender = %sender, kind = %kind, "Sender placed under policy");
                    self.log(
                        NewAction::new(
                            kind.added_action(),
                            &sender,
                            &msg.subject,
                            &msg.message_id,
                            policy_added_detail(kind),
                        )
                        .with_snapshot(snapshot_id.clone()),
                    )
                    .await;
                }
                Err(e) => {
                    error!(sender = %sender, kind = %kind, error = %e, "Policy write failed; message deleted anyway");
                    deleted_detail.push_str(&format!(" (policy write failed: {e})"));
                }
            }
        }

        self.log(
            NewAction::new(
                ActionKind::EmailDeleted,
                &sender,
                &msg.subject,
                &msg.message_id,
                deleted_detail,
            )
            .with_snapshot(snapshot_id),
        )
        .await;
        true
    }

    // ── Steps 3 and 4: enforcement ──────────────────────────────────

    /// Mailbox folders the enforcement scans may touch.
    pub async fn enforcement_folders(&self) -> Result<Vec<String>, MailError> {
        Ok(scannable_folders(&self.mail.list_folders().await?))
    }

    /// Load the sender set for `kind` and scan the mailbox for it.
    /// `None` when no sender is under the policy.
    async fn scan_policy(
        &self,
        step: StepName,
        kind: PolicyKind,
    ) -> Result<Option<Vec<FolderScanResult>>, PollError> {
        let addresses = self
            .store
            .get_policy_addresses(kind)
            .await
            .map_err(db_err(step))?;
        if addresses.is_empty() {
            return Ok(None);
        }
        let senders: HashSet<String> = addresses.into_iter().collect();

        let folders = self.enforcement_folders().await.map_err(mail_err(step))?;
        debug!(step = %step, folders = folders.len(), senders = senders.len(), "Scanning mailbox");

        let results = self
            .mail
            .scan_for_senders(&folders, &senders)
            .await
            .map_err(mail_err(step))?;
        Ok(Some(results))
    }

    /// Delete all mail from blocked senders outside the excluded folders.
    pub async fn enforce_block(&self) -> Result<StepOutcome, PollError> {
        let step = StepName::BlockEnforcement;
        let Some(results) = self.scan_policy(step, PolicyKind::Block).await? else {
            return Ok(StepOutcome::skipped("no blocked senders"));
        };

        let mut batches = DeleteBatches::new();
        let mut processed = 0;
        for result in &results {
            for env in &result.envelopes {
                processed += 1;
                self.log(NewAction::new(
                    ActionKind::EmailDeleted,
                    &env.from,
                    &env.subject,
                    &env.message_id,
                    format!("Auto-deleted email from blocked sender (folder: {})", result.folder),
                ))
                .await;
                batches.entry(result.folder.clone()).or_default().push(env.uid);
            }
        }

        let deleted = self.delete_batches(step, &batches).await?;
        Ok(StepOutcome::Completed { processed, deleted })
    }

    /// Delete marketing mail from transactional-only senders, keep the rest.
    pub async fn enforce_transactional_only(&self) -> Result<StepOutcome, PollError> {
        let step = StepName::TransactionalOnlyEnforcement;
        let Some(results) = self.scan_policy(step, PolicyKind::TransactionalOnly).await? else {
            return Ok(StepOutcome::skipped("no transactional-only senders"));
        };

        let mut batches = DeleteBatches::new();
        let mut processed = 0;
        for result in &results {
            for env in &result.envelopes {
                processed += 1;
                let verdict = classify(&env.subject);
                if verdict.is_transactional {
                    debug!(sender = %env.from, reason = %verdict.reason, "Keeping transactional email");
                    continue;
                }

                self.log(NewAction::new(
                    ActionKind::MarketingEmailDeleted,
                    &env.from,
                    &env.subject,
                    &env.message_id,
                    format!(
                        "Deleted marketing email from folder {} (reason: {})",
                        result.folder, verdict.reason
                    ),
                ))
                .await;
                batches.entry(result.folder.clone()).or_default().push(env.uid);
            }
        }

        let deleted = self.delete_batches(step, &batches).await?;
        Ok(StepOutcome::Completed { processed, deleted })
    }

    async fn delete_batches(&self, step: StepName, batches: &DeleteBatches) -> Result<usize, PollError> {
        let count = batches.values().map(Vec::len).sum();
        if count == 0 {
            return Ok(0);
        }
        self.mail
            .delete_across_folders(batches)
            .await
            .map_err(mail_err(step))?;
        info!(step = %step, folders = batches.len(), count, "Deleted matched messages");
        Ok(count)
    }
}
