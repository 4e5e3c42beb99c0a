//! End-to-end poll cycles against an in-memory mailbox and an in-memory
//! policy store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use postal_inspector::mail::{FOLDER_BLOCK, FOLDER_TRANSACTIONAL_ONLY, MemoryMailStore};
use postal_inspector::pipeline::{CycleReport, Poller, StepName, StepOutcome};
use postal_inspector::policy::{ActionKind, PolicyKind};
use postal_inspector::store::{LibSqlBackend, PolicyStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    mail: Arc<MemoryMailStore>,
    store: Arc<LibSqlBackend>,
    poller: Poller,
}

impl Harness {
    async fn new(mail: MemoryMailStore) -> Self {
        let mail = Arc::new(mail);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let poller = Poller::new(mail.clone(), store.clone());
        poller.bootstrap_folders().await;
        Self {
            mail,
            store,
            poller,
        }
    }

    async fn cycle(&self) -> CycleReport {
        timeout(TEST_TIMEOUT, self.poller.run_cycle())
            .await
            .expect("test timed out")
    }

    async fn log_kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<ActionKind> = self
            .store
            .list_actions(100, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[tokio::test]
async fn block_intake_creates_policy_and_deletes_message() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX"])).await;
    h.mail.add_message(FOLDER_BLOCK, "spam@example.com", "50% off everything");

    let report = h.cycle().await;
    assert_eq!(report.failures(), 0);

    assert!(
        h.store
            .is_under_policy("spam@example.com", PolicyKind::Block)
            .await
            .unwrap()
    );
    assert!(h.mail.messages(FOLDER_BLOCK).is_empty());
    assert_eq!(
        h.log_kinds().await,
        vec![ActionKind::SenderBlocked, ActionKind::EmailDeleted]
    );

    let policy = &h.store.list_policies(PolicyKind::Block).await.unwrap()[0];
    assert_eq!(policy.reason, "Moved to Block folder: 50% off everything");

    // Both entries point at the saved snapshot.
    let entries = h.store.list_actions(10, 0).await.unwrap();
    let snapshot_id = entries[0].snapshot_ref.clone().expect("snapshot ref");
    assert!(entries.iter().all(|e| e.snapshot_ref.as_deref() == Some(&snapshot_id)));
    let snapshot = h.store.get_snapshot(&snapshot_id).await.unwrap().unwrap();
    assert_eq!(snapshot.subject, "50% off everything");
}

#[tokio::test]
async fn transactional_only_keeps_receipts_and_deletes_marketing() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX"])).await;
    h.store
        .add_policy("newsletter@shop.com", PolicyKind::TransactionalOnly, "test")
        .await
        .unwrap();
    h.mail.add_message("INBOX", "newsletter@shop.com", "Your Order #1234 has shipped");
    h.mail.add_message("INBOX", "newsletter@shop.com", "Flash Sale - 30% off");

    let report = h.cycle().await;
    assert_eq!(report.failures(), 0);
    assert_eq!(
        report
            .outcome(StepName::TransactionalOnlyEnforcement)
            .map(StepOutcome::deleted),
        Some(1)
    );

    assert_eq!(h.mail.subjects("INBOX"), vec!["Your Order #1234 has shipped"]);

    let entries = h.store.list_actions(10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, ActionKind::MarketingEmailDeleted);
    assert_eq!(entries[0].subject, "Flash Sale - 30% off");
    assert!(entries[0].details.contains("reason: Flash sale promotion"));
}

#[tokio::test]
async fn excluded_folders_are_never_touched() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX", "Orders", "Drafts"])).await;
    h.store
        .add_policy("spam@example.com", PolicyKind::Block, "test")
        .await
        .unwrap();
    h.mail.add_message("Orders", "spam@example.com", "Receipt");
    h.mail.add_message("Drafts", "spam@example.com", "Re: stop");

    for _ in 0..3 {
        assert_eq!(h.cycle().await.failures(), 0);
    }

    assert_eq!(h.mail.subjects("Orders"), vec!["Receipt"]);
    assert_eq!(h.mail.subjects("Drafts"), vec!["Re: stop"]);
    assert_eq!(h.store.action_count().await.unwrap(), 0);
    assert!(
        h.mail
            .scanned_folders()
            .iter()
            .all(|f| f != "Orders" && f != "Drafts")
    );
}

#[tokio::test]
async fn failing_step_does_not_stop_the_cycle() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX"])).await;
    h.store
        .add_policy("spam@example.com", PolicyKind::Block, "test")
        .await
        .unwrap();
    h.mail.add_message(FOLDER_BLOCK, "someone@example.com", "Hi");
    h.mail
        .add_message(FOLDER_TRANSACTIONAL_ONLY, "deals@store.com", "Weekly deals");
    h.mail.add_message("INBOX", "spam@example.com", "Buy now");
    h.mail.fail_folder(FOLDER_BLOCK);

    let report = h.cycle().await;

    assert!(report.outcome(StepName::BlockIntake).unwrap().is_failed());
    assert_eq!(report.failures(), 1);
    assert!(
        h.store
            .is_under_policy("deals@store.com", PolicyKind::TransactionalOnly)
            .await
            .unwrap()
    );
    assert!(h.mail.subjects("INBOX").is_empty());
    assert_eq!(h.mail.sessions_closed(), 1);
}

#[tokio::test]
async fn rerunning_a_cycle_is_idempotent() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX"])).await;
    h.mail.add_message(FOLDER_BLOCK, "spam@example.com", "Deal");
    h.mail.add_message("INBOX", "friend@example.com", "Lunch?");

    h.cycle().await;
    let after_first = h.store.action_count().await.unwrap();

    let report = h.cycle().await;
    assert_eq!(report.failures(), 0);
    assert_eq!(report.total_deleted(), 0);
    assert_eq!(h.store.action_count().await.unwrap(), after_first);
    assert_eq!(h.store.list_policies(PolicyKind::Block).await.unwrap().len(), 1);
    assert_eq!(h.mail.subjects("INBOX"), vec!["Lunch?"]);
}

#[tokio::test]
async fn blocked_sender_mail_arriving_later_is_deleted() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX", "Archive"])).await;
    h.mail.add_message(FOLDER_BLOCK, "spam@example.com", "First");
    h.cycle().await;

    h.mail.add_message("INBOX", "Spam@Example.com", "Second");
    h.mail.add_message("Archive", "spam@example.com", "Third");
    let report = h.cycle().await;

    assert_eq!(
        report
            .outcome(StepName::BlockEnforcement)
            .map(StepOutcome::deleted),
        Some(2)
    );
    assert!(h.mail.messages("INBOX").is_empty());
    assert!(h.mail.messages("Archive").is_empty());

    let auto = h
        .store
        .list_actions(10, 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.details.starts_with("Auto-deleted"))
        .count();
    assert_eq!(auto, 2);
}

#[tokio::test]
async fn block_wins_for_sender_under_both_policies() {
    let h = Harness::new(MemoryMailStore::with_folders(&["INBOX"])).await;
    for kind in [PolicyKind::Block, PolicyKind::TransactionalOnly] {
        h.store.add_policy("shop@example.com", kind, "test").await.unwrap();
    }
    h.mail
        .add_message("INBOX", "shop@example.com", "Your receipt for order 42");

    let report = h.cycle().await;

    assert_eq!(
        report
            .outcome(StepName::BlockEnforcement)
            .map(StepOutcome::deleted),
        Some(1)
    );
    assert_eq!(
        report
            .outcome(StepName::TransactionalOnlyEnforcement)
            .map(StepOutcome::deleted),
        Some(0)
    );
    assert!(h.mail.messages("INBOX").is_empty());
    assert_eq!(h.log_kinds().await, vec![ActionKind::EmailDeleted]);
}
