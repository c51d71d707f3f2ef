use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use super::{CommitResult, PhaseCommit, apply_commit, apply_lifecycle};
use crate::errors::StoreError;
use crate::flow::{ChildFlow, FlowFilter, LifecycleStatus, MasterFlow, PhaseState};
use crate::registry::flow_type::is_identifier;

/// Async-safe handle to the flow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&FlowDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FlowDb {
    conn: Connection,
    /// Flow type name -> child table name.
    child_tables: BTreeMap<String, String>,
}

const MASTER_COLUMNS: &str = "flow_id, flow_type, lifecycle_status, configuration, \
     execution_metadata, client_account_id, engagement_id, user_id, created_at, updated_at";

const CHILD_COLUMNS: &str = "id, flow_id, flow_type, client_account_id, engagement_id, \
     current_phase, phase_state, deleted, created_at, updated_at";

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations
    /// for the master table plus one child table per flow type.
    pub fn new(path: &Path, child_tables: BTreeMap<String, String>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let db = Self { conn, child_tables };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory(child_tables: BTreeMap<String, String>) -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn, child_tables };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS master_flows (
                    flow_id TEXT PRIMARY KEY,
                    flow_type TEXT NOT NULL,
                    lifecycle_status TEXT NOT NULL DEFAULT 'initialized',
                    configuration TEXT NOT NULL DEFAULT '{}',
                    execution_metadata TEXT NOT NULL DEFAULT '{}',
                    client_account_id TEXT NOT NULL,
                    engagement_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_master_flows_tenant
                    ON master_flows(client_account_id, engagement_id);
                CREATE INDEX IF NOT EXISTS idx_master_flows_status
                    ON master_flows(lifecycle_status);

                CREATE TABLE IF NOT EXISTS phase_locks (
                    flow_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    holder_id TEXT NOT NULL,
                    lease_token TEXT NOT NULL DEFAULT '',
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (flow_id, phase)
                );",
            )
            .context("Failed to create core tables")?;

        // Additive migration for databases created before leases carried a
        // token. Only "duplicate column" errors are ignored.
        match self.conn.execute(
            "ALTER TABLE phase_locks ADD COLUMN lease_token TEXT NOT NULL DEFAULT ''",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow!("Failed to add lease_token column: {}", e)),
        }

        for table in self.child_tables.values() {
            if !is_identifier(table) {
                return Err(anyhow!("Invalid child table name '{}'", table));
            }
            self.conn
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        flow_id TEXT NOT NULL UNIQUE
                            REFERENCES master_flows(flow_id) ON DELETE CASCADE,
                        flow_type TEXT NOT NULL,
                        client_account_id TEXT NOT NULL,
                        engagement_id TEXT NOT NULL,
                        current_phase TEXT NOT NULL,
                        phase_state TEXT NOT NULL,
                        deleted INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_{table}_phase ON {table}(current_phase);
                    CREATE INDEX IF NOT EXISTS idx_{table}_tenant
                        ON {table}(client_account_id, engagement_id);"
                ))
                .with_context(|| format!("Failed to create child table {}", table))?;
        }
        Ok(())
    }

    fn child_table(&self, flow_type: &str) -> Result<&str, StoreError> {
        self.child_tables
            .get(flow_type)
            .map(String::as_str)
            .ok_or_else(|| StoreError::UnknownChildTable(flow_type.to_string()))
    }

    // ── Flows ──────────────────────────────────────────────────────────

    pub fn insert_flow(&self, master: &MasterFlow, child: &ChildFlow) -> Result<ChildFlow, StoreError> {
        let table = self.child_table(&master.flow_type)?;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM master_flows WHERE flow_id = ?1",
                params![master.flow_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to check for existing flow")?;
        if exists {
            return Err(StoreError::DuplicateFlow(master.flow_id));
        }

        tx.execute(
            &format!("INSERT INTO master_flows ({MASTER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                master.flow_id.to_string(),
                master.flow_type,
                master.lifecycle_status.as_str(),
                serde_json::to_string(&master.configuration).context("Failed to encode configuration")?,
                serde_json::to_string(&master.execution_metadata).context("Failed to encode execution metadata")?,
                master.client_account_id,
                master.engagement_id,
                master.user_id,
                timestamp(master.created_at),
                timestamp(master.updated_at),
            ],
        )
        .context("Failed to insert master flow")?;

        let tenant = child.tenant();
        tx.execute(
            &format!(
                "INSERT INTO {table} (flow_id, flow_type, client_account_id, engagement_id, \
                 current_phase, phase_state, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)"
            ),
            params![
                child.flow_id().to_string(),
                child.flow_type(),
                tenant.client_account_id,
                tenant.engagement_id,
                child.current_phase(),
                serde_json::to_string(child.phase_state()).context("Failed to encode phase state")?,
                timestamp(child.created_at()),
                timestamp(child.updated_at()),
            ],
        )
        .context("Failed to insert child flow")?;
        let id = tx.last_insert_rowid();

        tx.commit().context("Failed to commit flow creation")?;

        let mut child = child.clone();
        child.set_id(id);
        Ok(child)
    }

    pub fn get_master(&self, flow_id: Uuid) -> Result<Option<MasterFlow>, StoreError> {
        query_master(&self.conn, flow_id)
    }

    pub fn get_child(&self, flow_id: Uuid) -> Result<Option<ChildFlow>, StoreError> {
        let Some(flow_type) = query_flow_type(&self.conn, flow_id)? else {
            return Ok(None);
        };
        let table = self.child_table(&flow_type)?;
        query_child(&self.conn, table, flow_id)
    }

    /// Apply a phase commit: both phase fields, artifacts, the run record and
    /// the lifecycle are written in one transaction.
    pub fn commit_phase(&self, commit: PhaseCommit) -> Result<CommitResult, StoreError> {
        let flow_id = commit.flow_id;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let mut master =
            query_master(&tx, flow_id)?.ok_or(StoreError::FlowNotFound(flow_id))?;
        let table = self.child_table(&master.flow_type)?;
        let mut child =
            query_child(&tx, table, flow_id)?.ok_or(StoreError::FlowNotFound(flow_id))?;

        let superseded = apply_commit(&mut master, &mut child, commit);

        tx.execute(
            "UPDATE master_flows
             SET lifecycle_status = ?1, execution_metadata = ?2, updated_at = ?3
             WHERE flow_id = ?4",
            params![
                master.lifecycle_status.as_str(),
                serde_json::to_string(&master.execution_metadata)
                    .context("Failed to encode execution metadata")?,
                timestamp(master.updated_at),
                flow_id.to_string(),
            ],
        )
        .context("Failed to update master flow")?;

        tx.execute(
            &format!(
                "UPDATE {table} SET current_phase = ?1, phase_state = ?2, updated_at = ?3 WHERE id = ?4"
            ),
            params![
                child.current_phase(),
                serde_json::to_string(child.phase_state()).context("Failed to encode phase state")?,
                timestamp(child.updated_at()),
                child.id(),
            ],
        )
        .context("Failed to update child flow")?;

        tx.commit().context("Failed to commit phase")?;
        Ok(CommitResult {
            master,
            child,
            superseded,
        })
    }

    pub fn update_lifecycle(
        &self,
        flow_id: Uuid,
        next: LifecycleStatus,
    ) -> Result<MasterFlow, StoreError> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let mut master =
            query_master(&tx, flow_id)?.ok_or(StoreError::FlowNotFound(flow_id))?;
        apply_lifecycle(&mut master, next)?;

        tx.execute(
            "UPDATE master_flows SET lifecycle_status = ?1, updated_at = ?2 WHERE flow_id = ?3",
            params![
                master.lifecycle_status.as_str(),
                timestamp(master.updated_at),
                flow_id.to_string(),
            ],
        )
        .context("Failed to update lifecycle status")?;

        tx.commit().context("Failed to commit lifecycle update")?;
        Ok(master)
    }

    pub fn list_masters(&self, filter: &FlowFilter) -> Result<Vec<MasterFlow>, StoreError> {
        let mut sql = format!("SELECT {MASTER_COLUMNS} FROM master_flows WHERE deleted = 0");
        let mut values: Vec<String> = Vec::new();
        let conditions = [
            ("client_account_id", filter.client_account_id.clone()),
            ("engagement_id", filter.engagement_id.clone()),
            ("flow_type", filter.flow_type.clone()),
            (
                "lifecycle_status",
                filter.lifecycle_status.map(|s| s.as_str().to_string()),
            ),
        ];
        for (column, value) in conditions {
            if let Some(value) = value {
                values.push(value);
                sql.push_str(&format!(" AND {} = ?{}", column, values.len()));
            }
        }
        sql.push_str(" ORDER BY created_at ASC, flow_id ASC");

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare flow listing")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), MasterRow::from_row)
            .context("Failed to list master flows")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read master flow row")?;
        rows.into_iter().map(MasterRow::into_master).collect()
    }

    /// Flag the master and child records deleted.
    pub fn soft_delete(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let now = timestamp(Utc::now());
        let count = tx
            .execute(
                "UPDATE master_flows SET deleted = 1, updated_at = ?1 WHERE flow_id = ?2 AND deleted = 0",
                params![now, flow_id.to_string()],
            )
            .context("Failed to soft-delete master flow")?;
        if count == 0 {
            return Ok(false);
        }
        if let Some(flow_type) = query_flow_type(&tx, flow_id)? {
            let table = self.child_table(&flow_type)?;
            tx.execute(
                &format!("UPDATE {table} SET deleted = 1, updated_at = ?1 WHERE flow_id = ?2"),
                params![now, flow_id.to_string()],
            )
            .context("Failed to soft-delete child flow")?;
        }

        tx.commit().context("Failed to commit soft delete")?;
        Ok(true)
    }

    /// Hard-delete a flow; the child row goes with it via `ON DELETE CASCADE`.
    pub fn purge(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        let count = self
            .conn
            .execute(
                "DELETE FROM master_flows WHERE flow_id = ?1",
                params![flow_id.to_string()],
            )
            .context("Failed to purge flow")?;
        Ok(count > 0)
    }

    // ── Phase leases ───────────────────────────────────────────────────

    /// Insert a lease, or take over an expired one. Returns whether the lease
    /// is now held under `token`.
    pub fn try_acquire_lease(
        &self,
        flow_id: Uuid,
        phase: &str,
        holder_id: &str,
        token: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, StoreError> {
        let count = self
            .conn
            .execute(
                "INSERT INTO phase_locks (flow_id, phase, holder_id, lease_token, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(flow_id, phase) DO UPDATE
                    SET holder_id = excluded.holder_id,
                        lease_token = excluded.lease_token,
                        expires_at = excluded.expires_at
                    WHERE phase_locks.expires_at <= ?6",
                params![flow_id.to_string(), phase, holder_id, token, now_ms + ttl_ms, now_ms],
            )
            .context("Failed to acquire phase lease")?;
        Ok(count == 1)
    }

    /// Extend the lease held under `token`. Returns false if another
    /// acquisition took the key or the lease was purged.
    pub fn renew_lease(
        &self,
        flow_id: Uuid,
        phase: &str,
        token: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, StoreError> {
        let count = self
            .conn
            .execute(
                "UPDATE phase_locks SET expires_at = ?1
                 WHERE flow_id = ?2 AND phase = ?3 AND lease_token = ?4",
                params![now_ms + ttl_ms, flow_id.to_string(), phase, token],
            )
            .context("Failed to renew phase lease")?;
        Ok(count == 1)
    }

    /// Drop the lease held under `token`. Leases taken over by another
    /// acquisition after expiry are left alone.
    pub fn release_lease(&self, flow_id: Uuid, phase: &str, token: &str) -> Result<bool, StoreError> {
        let count = self
            .conn
            .execute(
                "DELETE FROM phase_locks WHERE flow_id = ?1 AND phase = ?2 AND lease_token = ?3",
                params![flow_id.to_string(), phase, token],
            )
            .context("Failed to release phase lease")?;
        Ok(count == 1)
    }

    pub fn purge_expired_leases(&self, now_ms: i64) -> Result<usize, StoreError> {
        let count = self
            .conn
            .execute(
                "DELETE FROM phase_locks WHERE expires_at <= ?1",
                params![now_ms],
            )
            .context("Failed to purge expired phase leases")?;
        Ok(count)
    }

    pub fn lease_holder(&self, flow_id: Uuid, phase: &str) -> Result<Option<String>, StoreError> {
        let holder = self
            .conn
            .query_row(
                "SELECT holder_id FROM phase_locks WHERE flow_id = ?1 AND phase = ?2",
                params![flow_id.to_string(), phase],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read phase lease")?;
        Ok(holder)
    }
}

// ── Row helpers ─────────────────────────────────────────────────────────

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_uuid(value: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid flow id '{}'", value))
}

fn query_flow_type(conn: &Connection, flow_id: Uuid) -> Result<Option<String>, StoreError> {
    let flow_type = conn
        .query_row(
            "SELECT flow_type FROM master_flows WHERE flow_id = ?1",
            params![flow_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up flow type")?;
    Ok(flow_type)
}

fn query_master(conn: &Connection, flow_id: Uuid) -> Result<Option<MasterFlow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {MASTER_COLUMNS} FROM master_flows WHERE flow_id = ?1 AND deleted = 0"),
            params![flow_id.to_string()],
            MasterRow::from_row,
        )
        .optional()
        .context("Failed to load master flow")?;
    row.map(MasterRow::into_master).transpose()
}

fn query_child(conn: &Connection, table: &str, flow_id: Uuid) -> Result<Option<ChildFlow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {CHILD_COLUMNS} FROM {table} WHERE flow_id = ?1 AND deleted = 0"),
            params![flow_id.to_string()],
            ChildRow::from_row,
        )
        .optional()
        .context("Failed to load child flow")?;
    row.map(ChildRow::into_child).transpose()
}

struct MasterRow {
    flow_id: String,
    flow_type: String,
    lifecycle_status: String,
    configuration: String,
    execution_metadata: String,
    client_account_id: String,
    engagement_id: String,
    user_id: String,
    created_at: String,
    updated_at: String,
}

impl MasterRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            flow_id: row.get(0)?,
            flow_type: row.get(1)?,
            lifecycle_status: row.get(2)?,
            configuration: row.get(3)?,
            execution_metadata: row.get(4)?,
            client_account_id: row.get(5)?,
            engagement_id: row.get(6)?,
            user_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_master(self) -> Result<MasterFlow, StoreError> {
        let lifecycle_status: LifecycleStatus = self
            .lifecycle_status
            .parse()
            .map_err(|e: String| anyhow!(e))
            .context("Invalid lifecycle status")?;
        Ok(MasterFlow {
            flow_id: parse_uuid(&self.flow_id)?,
            flow_type: self.flow_type,
            lifecycle_status,
            configuration: serde_json::from_str(&self.configuration)
                .context("Invalid configuration document")?,
            execution_metadata: serde_json::from_str(&self.execution_metadata)
                .context("Invalid execution metadata document")?,
            client_account_id: self.client_account_id,
            engagement_id: self.engagement_id,
            user_id: self.user_id,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct ChildRow {
    id: i64,
    flow_id: String,
    flow_type: String,
    client_account_id: String,
    engagement_id: String,
    current_phase: String,
    phase_state: String,
    deleted: bool,
    created_at: String,
    updated_at: String,
}

impl ChildRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            flow_type: row.get(2)?,
            client_account_id: row.get(3)?,
            engagement_id: row.get(4)?,
            current_phase: row.get(5)?,
            phase_state: row.get(6)?,
            deleted: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_child(self) -> Result<ChildFlow, StoreError> {
        let phase_state: PhaseState =
            serde_json::from_str(&self.phase_state).context("Invalid phase state document")?;
        ChildFlow::from_parts(
            self.id,
            parse_uuid(&self.flow_id)?,
            self.flow_type,
            self.client_account_id,
            self.engagement_id,
            self.current_phase,
            phase_state,
            self.deleted,
            parse_timestamp(&self.created_at)?,
            parse_timestamp(&self.updated_at)?,
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
