use serde::{Deserialize, Serialize};

use crate::error::InvariantViolation;
use crate::record::{ContactRecord, RecordId};

/// Everything known about one person, rooted at their primary record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedView {
    pub primary_contact_id: RecordId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<RecordId>,
}

impl ConsolidatedView {
    /// Build the view from a cluster fetched for `primary_id`.
    ///
    /// The cluster must be a depth-1 tree: exactly one primary, whose id is
    /// `primary_id`, and every other record a secondary linked directly to it.
    /// Emails and phone numbers are deduplicated with the primary's value first,
    /// then in ascending id order of the records contributing them.
    pub fn assemble(
        primary_id: RecordId,
        records: &[ContactRecord],
    ) -> Result<Self, InvariantViolation> {
        if records.is_empty() {
            return Err(InvariantViolation::EmptyCluster { primary_id });
        }

        let primaries: Vec<RecordId> = records
            .iter()
            .filter(|r| r.is_primary())
            .map(|r| r.id)
            .collect();
        let primary = match primaries.as_slice() {
            [id] if *id == primary_id => records
                .iter()
                .find(|r| r.id == primary_id)
                .ok_or(InvariantViolation::NotPrimary { id: primary_id })?,
            [] | [_] => return Err(InvariantViolation::NotPrimary { id: primary_id }),
            _ => return Err(InvariantViolation::MultiplePrimaries { ids: primaries }),
        };

        let mut secondaries: Vec<&ContactRecord> =
            records.iter().filter(|r| !r.is_primary()).collect();
        secondaries.sort_by_key(|r| r.id);
        if let Some(bad) = secondaries.iter().find(|r| r.linked_id != Some(primary_id)) {
            return Err(InvariantViolation::DanglingLink {
                id: bad.id,
                linked_id: bad.linked_id,
                expected: primary_id,
            });
        }

        let ordered: Vec<&ContactRecord> = std::iter::once(primary)
            .chain(secondaries.iter().copied())
            .collect();

        Ok(Self {
            primary_contact_id: primary_id,
            emails: collect_unique(ordered.iter().map(|r| r.email.as_deref())),
            phone_numbers: collect_unique(ordered.iter().map(|r| r.phone_number.as_deref())),
            secondary_contact_ids: secondaries.iter().map(|r| r.id).collect(),
        })
    }
}

fn collect_unique<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values.flatten() {
        let v = v.trim();
        if !v.is_empty() && !out.iter().any(|seen| seen == v) {
            out.push(v.to_string());
        }
    }
    out
}
