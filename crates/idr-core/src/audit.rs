//! Whole-store invariant audit.
//!
//! Recomputes clusters from scratch as the transitive closure of shared email,
//! shared phone number and live `linked_id` edges, then checks every cluster
//! has exactly one primary and every secondary points straight at a live one.
//!
//! Link edges are needed because a bridging merge records no row holding both
//! values: the demoted primary's link is the only trace of the bridge.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::record::{ContactRecord, RecordId};

/// Disjoint-set forest over record ids, with path halving and union by size.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: HashMap<RecordId, RecordId>,
    size: HashMap<RecordId, usize>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: RecordId) {
        self.parent.entry(id).or_insert(id);
        self.size.entry(id).or_insert(1);
    }

    pub fn find(&mut self, id: RecordId) -> RecordId {
        self.insert(id);
        let mut x = id;
        loop {
            let p = self.parent[&x];
            if p == x {
                return x;
            }
            let gp = self.parent[&p];
            self.parent.insert(x, gp);
            x = gp;
        }
    }

    pub fn union(&mut self, a: RecordId, b: RecordId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[&ra] >= self.size[&rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent.insert(small, big);
        let merged = self.size[&big] + self.size[&small];
        self.size.insert(big, merged);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// A connected cluster with no primary record.
    NoPrimary { members: Vec<RecordId> },
    /// A connected cluster with more than one primary record.
    SplitCluster { primaries: Vec<RecordId> },
    /// A secondary whose `linked_id` is missing, deleted or not a primary.
    BrokenLink { id: RecordId, linked_id: Option<RecordId> },
    /// A primary that still carries a `linked_id`.
    LinkedPrimary { id: RecordId, linked_id: RecordId },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::NoPrimary { members } => write!(f, "cluster {members:?} has no primary"),
            Finding::SplitCluster { primaries } => {
                write!(f, "cluster has {} primaries: {primaries:?}", primaries.len())
            }
            Finding::BrokenLink { id, linked_id } => {
                write!(f, "secondary {id} links to non-primary {linked_id:?}")
            }
            Finding::LinkedPrimary { id, linked_id } => {
                write!(f, "primary {id} carries linked_id {linked_id}")
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub records: usize,
    pub clusters: usize,
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Audit a full record set. Soft-deleted records are ignored.
pub fn audit(records: &[ContactRecord]) -> AuditReport {
    let live: BTreeMap<RecordId, &ContactRecord> = records
        .iter()
        .filter(|r| !r.is_deleted())
        .map(|r| (r.id, r))
        .collect();

    let mut uf = UnionFind::new();
    let mut by_email: HashMap<&str, RecordId> = HashMap::new();
    let mut by_phone: HashMap<&str, RecordId> = HashMap::new();
    for r in live.values() {
        uf.insert(r.id);
        if let Some(email) = r.email.as_deref().filter(|e| !e.is_empty()) {
            let first = *by_email.entry(email).or_insert(r.id);
            uf.union(first, r.id);
        }
        if let Some(phone) = r.phone_number.as_deref().filter(|p| !p.is_empty()) {
            let first = *by_phone.entry(phone).or_insert(r.id);
            uf.union(first, r.id);
        }
        if let Some(linked_id) = r.linked_id
            && live.contains_key(&linked_id)
        {
            uf.union(linked_id, r.id);
        }
    }

    let mut clusters: BTreeMap<RecordId, Vec<RecordId>> = BTreeMap::new();
    for &id in live.keys() {
        clusters.entry(uf.find(id)).or_default().push(id);
    }

    let mut findings = Vec::new();
    for members in clusters.values() {
        let primaries: Vec<RecordId> = members
            .iter()
            .copied()
            .filter(|id| live[id].is_primary())
            .collect();
        match primaries.len() {
            0 => findings.push(Finding::NoPrimary {
                members: members.clone(),
            }),
            1 => {}
            _ => findings.push(Finding::SplitCluster { primaries }),
        }
    }

    for r in live.values() {
        if r.is_primary() {
            if let Some(linked_id) = r.linked_id {
                findings.push(Finding::LinkedPrimary { id: r.id, linked_id });
            }
            continue;
        }
        let target_is_primary = r
            .linked_id
            .and_then(|l| live.get(&l))
            .is_some_and(|target| target.is_primary());
        if !target_is_primary {
            findings.push(Finding::BrokenLink {
                id: r.id,
                linked_id: r.linked_id,
            });
        }
    }

    AuditReport {
        records: live.len(),
        clusters: clusters.len(),
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use crate::record::NewContact;
    use crate::signature::Signature;
    use crate::store::{MemoryStore, RecordStore};

    #[test]
    fn test_union_find_groups() {
        let mut uf = UnionFind::new();
        uf.union(1, 2);
        uf.union(3, 4);
        uf.union(2, 4);
        uf.insert(5);
        assert_eq!(uf.find(1), uf.find(3));
        assert_ne!(uf.find(1), uf.find(5));
    }

    #[test]
    fn test_reconciled_store_is_clean() {
        let mut store = MemoryStore::with_clock(0);
        for (email, phone) in [
            (Some("a@x.com"), Some("111")),
            (Some("b@x.com"), Some("222")),
            (Some("b@x.com"), Some("111")),
            (Some("c@x.com"), None),
            (None, Some("222")),
        ] {
            reconcile(&mut store, &Signature::new(email, phone)).unwrap();
        }
        let report = audit(store.records());
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.clusters, 2);
        assert_eq!(report.records, store.records().len());
    }

    #[test]
    fn test_bridge_without_shared_values_is_one_cluster() {
        let mut store = MemoryStore::with_clock(0);
        reconcile(&mut store, &Signature::new(Some("a@x.com"), None)).unwrap();
        reconcile(&mut store, &Signature::new(None, Some("555"))).unwrap();
        // No record holds both values after this; only the link joins them.
        reconcile(&mut store, &Signature::new(Some("a@x.com"), Some("555"))).unwrap();
        assert_eq!(store.records().len(), 2);

        let report = audit(store.records());
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.clusters, 1);
    }

    #[test]
    fn test_detects_split_cluster() {
        let mut store = MemoryStore::with_clock(0);
        reconcile(&mut store, &Signature::new(Some("a@x.com"), None)).unwrap();
        reconcile(&mut store, &Signature::new(None, Some("555"))).unwrap();
        // Record sharing both values but written without reconciliation.
        store
            .insert(NewContact::secondary(Some("a@x.com".into()), Some("555".into()), 1))
            .unwrap();

        let report = audit(store.records());
        assert_eq!(
            report.findings,
            vec![Finding::SplitCluster { primaries: vec![1, 2] }]
        );
    }

    #[test]
    fn test_detects_broken_link_after_primary_deleted() {
        let mut store = MemoryStore::with_clock(0);
        reconcile(&mut store, &Signature::new(Some("a@x.com"), Some("111"))).unwrap();
        reconcile(&mut store, &Signature::new(Some("b@x.com"), Some("111"))).unwrap();
        store.soft_delete(1);

        let report = audit(store.records());
        assert!(report.findings.contains(&Finding::BrokenLink {
            id: 2,
            linked_id: Some(1)
        }));
        assert!(report.findings.contains(&Finding::NoPrimary { members: vec![2] }));
    }
}
