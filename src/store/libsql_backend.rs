//! libSQL backend: async `PolicyStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::policy::{ActionLogEntry, EmailSnapshot, NewAction, PolicyKind, SenderPolicy};
use crate::store::migrations;
use crate::store::traits::{PolicyStore, normalize_address};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn insert_action(&self, action: &NewAction) -> Result<ActionLogEntry, DatabaseError> {
        let entry = ActionLogEntry {
            id: Uuid::new_v4().to_string(),
            kind: action.kind,
            sender: action.sender.clone(),
            subject: action.subject.clone(),
            message_id: action.message_id.clone(),
            details: action.details.clone(),
            snapshot_ref: action.snapshot_ref.clone(),
            created_at: Utc::now(),
        };

        self.conn()
            .execute(
                "INSERT INTO action_log \
                 (id, kind, sender, subject, message_id, details, snapshot_ref, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.clone(),
                    entry.kind.as_str(),
                    entry.sender.clone(),
                    entry.subject.clone(),
                    entry.message_id.clone(),
                    entry.details.clone(),
                    opt_text(entry.snapshot_ref.as_deref()),
                    timestamp(&entry.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_action: {e}")))?;

        Ok(entry)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width so string order is time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(ctx: &'static str) -> impl Fn(libsql::Error) -> DatabaseError + Copy {
    move |e| DatabaseError::Query(format!("{ctx} row parse: {e}"))
}

const POLICY_COLUMNS: &str = "id, address, kind, reason, created_at";

fn row_to_policy(row: &libsql::Row) -> Result<SenderPolicy, DatabaseError> {
    let err = row_err("policy");
    let kind: String = row.get(2).map_err(err)?;
    Ok(SenderPolicy {
        id: row.get(0).map_err(err)?,
        address: row.get(1).map_err(err)?,
        kind: kind.parse().map_err(DatabaseError::Query)?,
        reason: row.get(3).map_err(err)?,
        created_at: parse_datetime(&row.get::<String>(4).map_err(err)?),
    })
}

const SNAPSHOT_COLUMNS: &str = "id, message_id, sender, recipients, subject, date, headers, \
                                body_text, body_html, has_attachments, created_at";

fn row_to_snapshot(row: &libsql::Row) -> Result<EmailSnapshot, DatabaseError> {
    let err = row_err("snapshot");
    Ok(EmailSnapshot {
        id: row.get(0).map_err(err)?,
        message_id: row.get(1).map_err(err)?,
        sender: row.get(2).map_err(err)?,
        recipients: row.get(3).map_err(err)?,
        subject: row.get(4).map_err(err)?,
        date: row.get(5).map_err(err)?,
        headers: row.get(6).map_err(err)?,
        body_text: row.get(7).map_err(err)?,
        body_html: row.get(8).map_err(err)?,
        has_attachments: row.get::<i64>(9).map_err(err)? != 0,
        created_at: parse_datetime(&row.get::<String>(10).map_err(err)?),
    })
}

const ACTION_COLUMNS: &str = "id, kind, sender, subject, message_id, details, snapshot_ref, created_at";

fn row_to_action(row: &libsql::Row) -> Result<ActionLogEntry, DatabaseError> {
    let err = row_err("action");
    let kind: String = row.get(1).map_err(err)?;
    Ok(ActionLogEntry {
        id: row.get(0).map_err(err)?,
        kind: kind.parse().map_err(DatabaseError::Query)?,
        sender: row.get(2).map_err(err)?,
        subject: row.get(3).map_err(err)?,
        message_id: row.get(4).map_err(err)?,
        details: row.get(5).map_err(err)?,
        snapshot_ref: row.get::<String>(6).ok(),
        created_at: parse_datetime(&row.get::<String>(7).map_err(err)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl PolicyStore for LibSqlBackend {
    async fn is_under_policy(&self, address: &str, kind: PolicyKind) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM sender_policies WHERE address = ?1 AND kind = ?2 LIMIT 1",
                params![normalize_address(address), kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_under_policy: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_under_policy: {e}"))),
        }
    }

    async fn add_policy(
        &self,
        address: &str,
        kind: PolicyKind,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let address = normalize_address(address);
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO sender_policies (id, address, kind, reason, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    address.clone(),
                    kind.as_str(),
                    reason,
                    timestamp(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_policy: {e}")))?;

        if inserted > 0 {
            debug!(sender = %address, kind = %kind, "Policy added");
        }
        Ok(inserted > 0)
    }

    async fn get_policy_addresses(&self, kind: PolicyKind) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address FROM sender_policies WHERE kind = ?1 ORDER BY address",
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy_addresses: {e}")))?;

        let mut addresses = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy_addresses: {e}")))?
        {
            addresses.push(row.get::<String>(0).map_err(row_err("policy address"))?);
        }
        Ok(addresses)
    }

    async fn list_policies(&self, kind: PolicyKind) -> Result<Vec<SenderPolicy>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM sender_policies WHERE kind = ?1 \
                     ORDER BY created_at DESC, rowid DESC"
                ),
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_policies: {e}")))?;

        let mut policies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_policies: {e}")))?
        {
            policies.push(row_to_policy(&row)?);
        }
        Ok(policies)
    }

    async fn remove_policy(&self, kind: PolicyKind, address: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM sender_policies WHERE address = ?1 AND kind = ?2",
                params![normalize_address(address), kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_policy: {e}")))?;
        Ok(removed > 0)
    }

    async fn save_snapshot(&self, snapshot: &EmailSnapshot) -> Result<String, DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO email_snapshots ({SNAPSHOT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    snapshot.id.clone(),
                    snapshot.message_id.clone(),
                    snapshot.sender.clone(),
                    snapshot.recipients.clone(),
                    snapshot.subject.clone(),
                    snapshot.date.clone(),
                    snapshot.headers.clone(),
                    snapshot.body_text.clone(),
                    snapshot.body_html.clone(),
                    i64::from(snapshot.has_attachments),
                    timestamp(&snapshot.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_snapshot: {e}")))?;

        debug!(snapshot_id = %snapshot.id, sender = %snapshot.sender, "Snapshot saved");
        Ok(snapshot.id.clone())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<EmailSnapshot>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM email_snapshots WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_snapshot: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_snapshot(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_snapshot: {e}"))),
        }
    }

    async fn purge_snapshots_older_than(&self, days: u32) -> Result<u64, DatabaseError> {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(days, "Retention cutoff predates the calendar; nothing to purge");
            return Ok(0);
        };
        let cutoff = timestamp(&cutoff);
        let conn = self.conn();

        conn.execute(
            "UPDATE action_log SET snapshot_ref = NULL WHERE snapshot_ref IN \
             (SELECT id FROM email_snapshots WHERE created_at < ?1)",
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("purge_snapshots clear refs: {e}")))?;

        let removed = conn
            .execute(
                "DELETE FROM email_snapshots WHERE created_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_snapshots: {e}")))?;

        if removed > 0 {
            info!(removed, days, "Purged old email snapshots");
        }
        Ok(removed)
    }

    async fn log_action(&self, action: NewAction) -> Result<ActionLogEntry, DatabaseError> {
        match self.insert_action(&action).await {
            Ok(entry) => Ok(entry),
            Err(e) if action.snapshot_ref.is_some() => {
                warn!(error = %e, kind = %action.kind, "Retrying action log without snapshot reference");
                self.insert_action(&action.with_snapshot(None)).await
            }
            Err(e) => Err(e),
        }
    }

    async fn list_actions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ActionLogEntry>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM action_log \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
                ),
                params![limit, offset],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_actions: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_actions: {e}")))?
        {
            entries.push(row_to_action(&row)?);
        }
        Ok(entries)
    }

    async fn get_action(&self, id: &str) -> Result<Option<ActionLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACTION_COLUMNS} FROM action_log WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_action: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_action(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_action: {e}"))),
        }
    }

    async fn action_count(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM action_log", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("action_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(row_err("action count"))?;
                Ok(usize::try_from(count).unwrap_or_default())
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("action_count: {e}"))),
        }
    }
}
