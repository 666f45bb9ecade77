use std::path::Path;

use idr_core::{
    ConsolidatedView, ContactRecord, ReconcileError, Reconciliation, RecordId, RecordStore,
    Signature, now_unix_millis, reconcile,
};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::json;

use crate::error::{Result, StoreError};
use crate::records::SqliteRecords;
use crate::schema;

pub struct Store {
    conn: Connection,
    clock: Option<i64>,
}

/// Row counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub primaries: u64,
    pub secondaries: u64,
    pub deleted: u64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn, clock: None })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn, clock: None })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Pin the timestamp stamped on writes. `None` restores the system clock.
    pub fn set_clock(&mut self, millis: Option<i64>) {
        self.clock = millis;
    }

    fn now(&self) -> i64 {
        self.clock.unwrap_or_else(now_unix_millis)
    }

    // --- Reconciliation ---

    /// Reconcile `signature` as one atomic unit.
    ///
    /// The write lock is taken before the first read (`BEGIN IMMEDIATE`), so
    /// reconciliations from other connections wait on `busy_timeout` instead of
    /// reading a state that is about to change. Any error rolls everything back.
    pub fn reconcile(
        &mut self,
        signature: &Signature,
    ) -> std::result::Result<Reconciliation, ReconcileError<StoreError>> {
        let signature = signature.validate()?;
        let now = self.now();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ReconcileError::Store(e.into()))?;
        let outcome = {
            let mut records = SqliteRecords::new(&tx, now);
            reconcile(&mut records, &signature)?
        };
        tx.commit().map_err(|e| ReconcileError::Store(e.into()))?;

        let view = &outcome.view;
        if outcome.is_read_only() {
            tracing::debug!("reconciled to primary {} with no writes", view.primary_contact_id);
        } else {
            tracing::info!(
                "primary {}: {} writes (created={:?} promoted={:?} demoted={:?} relinked={:?})",
                view.primary_contact_id,
                outcome.write_count(),
                outcome.created,
                outcome.promoted,
                outcome.demoted,
                outcome.relinked,
            );
        }
        Ok(outcome)
    }

    // --- Reads ---

    /// Consolidated view of the cluster containing `id`, if it is live.
    ///
    /// A secondary whose primary was soft-deleted has no view until the next
    /// reconciliation touching it promotes a new root, so it reads as `None`.
    pub fn view_for(&self, id: RecordId) -> Result<Option<ConsolidatedView>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut records = SqliteRecords::new(&tx, self.now());
        let Some(record) = records.find_by_id(id)? else {
            return Ok(None);
        };
        let root = record.root_id();
        if root != record.id {
            let live_root = records.find_by_id(root)?.filter(|r| r.is_primary());
            if live_root.is_none() {
                tracing::warn!("contact {id} links to {root}, which is not a live primary");
                return Ok(None);
            }
        }
        let cluster = records.find_cluster(root)?;
        let view = ConsolidatedView::assemble(root, &cluster)?;
        tx.commit()?;
        Ok(Some(view))
    }

    /// Every record, soft-deleted ones included, in id order.
    pub fn records(&self) -> Result<Vec<ContactRecord>> {
        SqliteRecords::new(&self.conn, self.now()).all()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(deleted_at IS NULL AND link_precedence = 'primary'), 0),
                    COALESCE(SUM(deleted_at IS NULL AND link_precedence = 'secondary'), 0),
                    COALESCE(SUM(deleted_at IS NOT NULL), 0)
             FROM contacts",
            [],
            |row| {
                Ok(StoreStats {
                    total: row.get(0)?,
                    primaries: row.get(1)?,
                    secondaries: row.get(2)?,
                    deleted: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// All records as pretty JSON, wrapped with the export time.
    pub fn export_json(&self) -> Result<String> {
        let records = self.records()?;
        let version = schema::get_schema_version(&self.conn)?
            .ok_or_else(|| StoreError::InvalidData("schema_version missing".into()))?;
        let doc = json!({
            "exportedAt": idr_core::unix_millis_to_iso8601(now_unix_millis()),
            "schemaVersion": version,
            "contacts": records,
        });
        serde_json::to_string_pretty(&doc)
            .map_err(|e| StoreError::InvalidData(format!("failed to serialize contacts: {e}")))
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint_truncate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}
