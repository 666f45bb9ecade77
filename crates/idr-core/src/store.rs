//! The record store contract consumed by the reconciliation engine, plus an
//! in-process implementation.

use std::convert::Infallible;

use crate::record::{ContactRecord, NewContact, RecordId};
use crate::time::now_unix_millis;

/// Keyed access to contact records. Every read excludes soft-deleted rows.
///
/// Implementations are expected to run one reconciliation against a single
/// transactional view of the data; the engine never commits or rolls back.
pub trait RecordStore {
    type Error;

    fn find_by_email(&mut self, email: &str) -> Result<Vec<ContactRecord>, Self::Error>;

    fn find_by_phone(&mut self, phone_number: &str) -> Result<Vec<ContactRecord>, Self::Error>;

    fn find_by_id(&mut self, id: RecordId) -> Result<Option<ContactRecord>, Self::Error>;

    /// `primary_id` and every record linked to it, primary first, then by
    /// `(created_at, id)`.
    fn find_cluster(&mut self, primary_id: RecordId) -> Result<Vec<ContactRecord>, Self::Error>;

    fn insert(&mut self, new: NewContact) -> Result<ContactRecord, Self::Error>;

    /// Persist `precedence`, `linked_id` and `updated_at` of an existing record.
    fn save(&mut self, record: &ContactRecord) -> Result<(), Self::Error>;

    /// Timestamp to stamp on writes made during this reconciliation.
    fn now(&mut self) -> i64;
}

/// Vec-backed store. Ids are assigned sequentially from 1.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<ContactRecord>,
    clock: Option<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the clock at `millis`; writes are stamped with it until changed.
    pub fn with_clock(millis: i64) -> Self {
        Self {
            records: Vec::new(),
            clock: Some(millis),
        }
    }

    pub fn set_clock(&mut self, millis: i64) {
        self.clock = Some(millis);
    }

    /// All records including soft-deleted ones, in id order.
    pub fn records(&self) -> &[ContactRecord] {
        &self.records
    }

    pub fn get(&self, id: RecordId) -> Option<&ContactRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Mark a record deleted. Returns false if it does not exist.
    pub fn soft_delete(&mut self, id: RecordId) -> bool {
        let now = self.now();
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(r) => {
                r.deleted_at = Some(now);
                true
            }
            None => false,
        }
    }

    fn live(&self) -> impl Iterator<Item = &ContactRecord> {
        self.records.iter().filter(|r| !r.is_deleted())
    }
}

impl RecordStore for MemoryStore {
    type Error = Infallible;

    fn find_by_email(&mut self, email: &str) -> Result<Vec<ContactRecord>, Infallible> {
        Ok(self
            .live()
            .filter(|r| r.email.as_deref() == Some(email))
            .cloned()
            .collect())
    }

    fn find_by_phone(&mut self, phone_number: &str) -> Result<Vec<ContactRecord>, Infallible> {
        Ok(self
            .live()
            .filter(|r| r.phone_number.as_deref() == Some(phone_number))
            .cloned()
            .collect())
    }

    fn find_by_id(&mut self, id: RecordId) -> Result<Option<ContactRecord>, Infallible> {
        Ok(self.live().find(|r| r.id == id).cloned())
    }

    fn find_cluster(&mut self, primary_id: RecordId) -> Result<Vec<ContactRecord>, Infallible> {
        let mut cluster: Vec<ContactRecord> = self
            .live()
            .filter(|r| r.id == primary_id || r.linked_id == Some(primary_id))
            .cloned()
            .collect();
        cluster.sort_by_key(|r| (!r.is_primary(), r.seniority_key()));
        Ok(cluster)
    }

    fn insert(&mut self, new: NewContact) -> Result<ContactRecord, Infallible> {
        let now = self.now();
        let id = self.records.last().map_or(1, |r| r.id + 1);
        let record = ContactRecord {
            id,
            email: new.email,
            phone_number: new.phone_number,
            precedence: new.precedence,
            linked_id: new.linked_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    fn save(&mut self, record: &ContactRecord) -> Result<(), Infallible> {
        if let Some(existing) = self.records.iter_mut().find(|r| r.id == record.id) {
            existing.precedence = record.precedence;
            existing.linked_id = record.linked_id;
            existing.updated_at = record.updated_at;
        }
        Ok(())
    }

    fn now(&mut self) -> i64 {
        self.clock.unwrap_or_else(now_unix_millis)
    }
}
