//! `RecordStore` over a SQLite connection. Callers own the transaction.

use idr_core::{ContactRecord, NewContact, Precedence, RecordId, RecordStore};
use rusqlite::{Connection, params};

use crate::error::{Result, StoreError};

const COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at";

type RawRow = (
    i64,
    Option<String>,
    Option<String>,
    String,
    Option<i64>,
    i64,
    i64,
    Option<i64>,
);

/// Record access bound to one connection (normally an open transaction) and
/// a single write timestamp.
pub struct SqliteRecords<'c> {
    conn: &'c Connection,
    now: i64,
}

impl<'c> SqliteRecords<'c> {
    pub fn new(conn: &'c Connection, now: i64) -> Self {
        Self { conn, now }
    }

    fn query(&self, filter: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<ContactRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM contacts WHERE {filter}");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows: Vec<RawRow> = stmt
            .query_map([param], read_raw)?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(to_record).collect()
    }

    /// Every row, soft-deleted ones included, in id order.
    pub fn all(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM contacts ORDER BY id"))?;
        let rows: Vec<RawRow> = stmt
            .query_map([], read_raw)?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(to_record).collect()
    }
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn to_record(raw: RawRow) -> Result<ContactRecord> {
    let (id, email, phone_number, precedence, linked_id, created_at, updated_at, deleted_at) = raw;
    let precedence = Precedence::parse(&precedence).ok_or_else(|| {
        StoreError::InvalidData(format!("contact {id}: unknown precedence '{precedence}'"))
    })?;
    Ok(ContactRecord {
        id,
        email,
        phone_number,
        precedence,
        linked_id,
        created_at,
        updated_at,
        deleted_at,
    })
}

impl RecordStore for SqliteRecords<'_> {
    type Error = StoreError;

    fn find_by_email(&mut self, email: &str) -> Result<Vec<ContactRecord>> {
        self.query(
            "email = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
            &email,
        )
    }

    fn find_by_phone(&mut self, phone_number: &str) -> Result<Vec<ContactRecord>> {
        self.query(
            "phone_number = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
            &phone_number,
        )
    }

    fn find_by_id(&mut self, id: RecordId) -> Result<Option<ContactRecord>> {
        Ok(self
            .query("id = ?1 AND deleted_at IS NULL", &id)?
            .into_iter()
            .next())
    }

    fn find_cluster(&mut self, primary_id: RecordId) -> Result<Vec<ContactRecord>> {
        self.query(
            "(id = ?1 OR linked_id = ?1) AND deleted_at IS NULL
             ORDER BY CASE link_precedence WHEN 'primary' THEN 0 ELSE 1 END, created_at, id",
            &primary_id,
        )
    }

    fn insert(&mut self, new: NewContact) -> Result<ContactRecord> {
        self.conn.execute(
            "INSERT INTO contacts
                 (email, phone_number, link_precedence, linked_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                new.email,
                new.phone_number,
                new.precedence.as_str(),
                new.linked_id,
                self.now,
            ],
        )?;
        Ok(ContactRecord {
            id: self.conn.last_insert_rowid(),
            email: new.email,
            phone_number: new.phone_number,
            precedence: new.precedence,
            linked_id: new.linked_id,
            created_at: self.now,
            updated_at: self.now,
            deleted_at: None,
        })
    }

    fn save(&mut self, record: &ContactRecord) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE contacts SET link_precedence = ?1, linked_id = ?2, updated_at = ?3
             WHERE id = ?4 AND deleted_at IS NULL",
            params![
                record.precedence.as_str(),
                record.linked_id,
                record.updated_at,
                record.id,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::InvalidData(format!(
                "contact not found: {}",
                record.id
            )));
        }
        Ok(())
    }

    fn now(&mut self) -> i64 {
        self.now
    }
}
