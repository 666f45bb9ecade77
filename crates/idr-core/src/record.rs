use std::fmt;

use serde::{Deserialize, Serialize};

/// Store-assigned record identifier. Monotonic in insertion order.
pub type RecordId = i64;

/// Whether a record is the root of its cluster or hangs off one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precedence {
    Primary,
    Secondary,
}

impl Precedence {
    pub fn as_str(self) -> &'static str {
        match self {
            Precedence::Primary => "primary",
            Precedence::Secondary => "secondary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Precedence::Primary),
            "secondary" => Some(Precedence::Secondary),
            _ => None,
        }
    }
}

impl fmt::Display for Precedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed contact signature, as persisted.
///
/// A secondary always carries `linked_id` pointing at its cluster's primary;
/// a primary never does. Timestamps are Unix milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: RecordId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    #[serde(rename = "linkPrecedence")]
    pub precedence: Precedence,
    pub linked_id: Option<RecordId>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl ContactRecord {
    pub fn is_primary(&self) -> bool {
        self.precedence == Precedence::Primary
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Ordering key for "oldest wins". Ties on `created_at` fall back to `id`.
    pub fn seniority_key(&self) -> (i64, RecordId) {
        (self.created_at, self.id)
    }

    /// The id of the primary this record belongs to, as recorded on the row.
    pub fn root_id(&self) -> RecordId {
        match (self.precedence, self.linked_id) {
            (Precedence::Secondary, Some(linked)) => linked,
            _ => self.id,
        }
    }

    /// Turn this record into the root of its cluster.
    pub fn promote(&mut self, now: i64) {
        self.precedence = Precedence::Primary;
        self.linked_id = None;
        self.updated_at = now;
    }

    /// Hang this record off `primary_id`.
    pub fn link_to(&mut self, primary_id: RecordId, now: i64) {
        self.precedence = Precedence::Secondary;
        self.linked_id = Some(primary_id);
        self.updated_at = now;
    }
}

/// Insert shape: the store assigns `id` and timestamps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub precedence: Precedence,
    pub linked_id: Option<RecordId>,
}

impl NewContact {
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            precedence: Precedence::Primary,
            linked_id: None,
        }
    }

    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: RecordId,
    ) -> Self {
        Self {
            email,
            phone_number,
            precedence: Precedence::Secondary,
            linked_id: Some(primary_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RecordId, created_at: i64, precedence: Precedence) -> ContactRecord {
        ContactRecord {
            id,
            email: None,
            phone_number: None,
            precedence,
            linked_id: None,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    #[test]
    fn test_precedence_string_form() {
        for p in [Precedence::Primary, Precedence::Secondary] {
            assert_eq!(Precedence::parse(p.as_str()), Some(p));
        }
        assert_eq!(Precedence::parse("PRIMARY"), None);
    }

    #[test]
    fn test_seniority_breaks_ties_by_id() {
        let a = record(7, 100, Precedence::Primary);
        let b = record(3, 100, Precedence::Primary);
        let c = record(1, 200, Precedence::Primary);
        let oldest = [&a, &b, &c]
            .into_iter()
            .min_by_key(|r| r.seniority_key())
            .unwrap();
        assert_eq!(oldest.id, 3);
    }

    #[test]
    fn test_root_id() {
        let mut r = record(5, 0, Precedence::Primary);
        assert_eq!(r.root_id(), 5);
        r.link_to(2, 10);
        assert_eq!(r.root_id(), 2);
        assert_eq!(r.updated_at, 10);
        r.promote(20);
        assert_eq!(r.root_id(), 5);
        assert!(r.linked_id.is_none());
    }

    #[test]
    fn test_serializes_camel_case() {
        let r = record(1, 0, Precedence::Secondary);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["linkPrecedence"], "secondary");
        assert!(json.get("phoneNumber").is_some());
        assert!(json.get("deletedAt").is_some());
    }
}
