//! Identity reconciliation: match a signature against existing records,
//! link or merge clusters, and report the consolidated view.
//!
//! Clusters are depth-1 trees. Every write made here keeps them that way:
//! demoting a primary relinks its secondaries to the surviving root in the
//! same call, so `find_cluster(root)` always returns the whole cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{InvariantViolation, ReconcileError};
use crate::record::{ContactRecord, NewContact, RecordId};
use crate::signature::Signature;
use crate::store::RecordStore;
use crate::view::ConsolidatedView;

/// Outcome of one reconciliation: the view plus every write that was issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    pub view: ConsolidatedView,
    /// Record inserted for this signature, if any.
    pub created: Option<RecordId>,
    /// Orphaned secondary promoted to primary because no live root existed.
    pub promoted: Option<RecordId>,
    /// Primaries demoted to secondaries by a merge.
    pub demoted: Vec<RecordId>,
    /// Secondaries re-pointed at the surviving primary.
    pub relinked: Vec<RecordId>,
}

impl Reconciliation {
    pub fn is_read_only(&self) -> bool {
        self.created.is_none()
            && self.promoted.is_none()
            && self.demoted.is_empty()
            && self.relinked.is_empty()
    }

    pub fn write_count(&self) -> usize {
        usize::from(self.created.is_some())
            + usize::from(self.promoted.is_some())
            + self.demoted.len()
            + self.relinked.len()
    }
}

type Result<T, E> = std::result::Result<T, ReconcileError<E>>;

/// Reconcile `signature` against `store`.
///
/// The signature is normalized and validated first; an unusable signature is
/// rejected without touching the store. All reads and writes go through
/// `store`, which must provide a single transactional view for the call.
pub fn reconcile<S: RecordStore>(
    store: &mut S,
    signature: &Signature,
) -> Result<Reconciliation, S::Error> {
    let sig = signature.validate()?;
    let candidates = fetch_candidates(store, &sig)?;

    if candidates.is_empty() {
        let record = store
            .insert(NewContact::primary(sig.email, sig.phone_number))
            .map_err(ReconcileError::Store)?;
        let view = ConsolidatedView::assemble(record.id, std::slice::from_ref(&record))?;
        return Ok(Reconciliation {
            view,
            created: Some(record.id),
            promoted: None,
            demoted: Vec::new(),
            relinked: Vec::new(),
        });
    }

    let new_info = has_new_information(&sig, &candidates);
    let mut outcome = resolve_primary(store, candidates)?;

    if new_info {
        let record = store
            .insert(NewContact::secondary(
                sig.email,
                sig.phone_number,
                outcome.primary.id,
            ))
            .map_err(ReconcileError::Store)?;
        outcome.created = Some(record.id);
    }

    let cluster = store
        .find_cluster(outcome.primary.id)
        .map_err(ReconcileError::Store)?;
    let view = ConsolidatedView::assemble(outcome.primary.id, &cluster)?;

    Ok(Reconciliation {
        view,
        created: outcome.created,
        promoted: outcome.promoted,
        demoted: outcome.demoted,
        relinked: outcome.relinked.into_iter().collect(),
    })
}

/// Live records sharing the signature's email or phone, keyed by id.
fn fetch_candidates<S: RecordStore>(
    store: &mut S,
    sig: &Signature,
) -> Result<BTreeMap<RecordId, ContactRecord>, S::Error> {
    let mut candidates = BTreeMap::new();
    if let Some(email) = &sig.email {
        for r in store.find_by_email(email).map_err(ReconcileError::Store)? {
            candidates.insert(r.id, r);
        }
    }
    if let Some(phone) = &sig.phone_number {
        for r in store.find_by_phone(phone).map_err(ReconcileError::Store)? {
            candidates.insert(r.id, r);
        }
    }
    Ok(candidates)
}

/// True when the signature carries an email or phone none of the candidates have.
pub fn has_new_information(
    sig: &Signature,
    candidates: &BTreeMap<RecordId, ContactRecord>,
) -> bool {
    let new_email = sig.email.as_deref().is_some_and(|email| {
        !candidates
            .values()
            .any(|c| c.email.as_deref() == Some(email))
    });
    let new_phone = sig.phone_number.as_deref().is_some_and(|phone| {
        !candidates
            .values()
            .any(|c| c.phone_number.as_deref() == Some(phone))
    });
    new_email || new_phone
}

struct Resolution {
    primary: ContactRecord,
    created: Option<RecordId>,
    promoted: Option<RecordId>,
    demoted: Vec<RecordId>,
    relinked: BTreeSet<RecordId>,
}

/// Find the single primary the candidates belong to, merging and repairing
/// clusters as needed.
fn resolve_primary<S: RecordStore>(
    store: &mut S,
    candidates: BTreeMap<RecordId, ContactRecord>,
) -> Result<Resolution, S::Error> {
    let mut roots: BTreeMap<RecordId, ContactRecord> = BTreeMap::new();
    let mut orphans: Vec<ContactRecord> = Vec::new();
    let mut dead_roots: BTreeSet<RecordId> = BTreeSet::new();
    let mut lookups: HashMap<RecordId, Option<ContactRecord>> = HashMap::new();

    for candidate in candidates.into_values() {
        if candidate.is_primary() {
            roots.insert(candidate.id, candidate);
            continue;
        }
        let root = match candidate.linked_id {
            Some(linked) => {
                if !lookups.contains_key(&linked) {
                    let found = store.find_by_id(linked).map_err(ReconcileError::Store)?;
                    lookups.insert(linked, found);
                }
                lookups.get(&linked).cloned().flatten()
            }
            None => None,
        };
        match root {
            Some(root) if root.is_primary() => {
                roots.insert(root.id, root);
            }
            _ => {
                if let Some(linked) = candidate.linked_id {
                    dead_roots.insert(linked);
                }
                orphans.push(candidate);
            }
        }
    }

    let now = store.now();
    let mut promoted = None;

    if roots.is_empty() {
        let oldest = orphans
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.seniority_key())
            .map(|(i, _)| i)
            .ok_or(InvariantViolation::NoCandidateToPromote)?;
        let mut record = orphans.swap_remove(oldest);
        record.promote(now);
        store.save(&record).map_err(ReconcileError::Store)?;
        promoted = Some(record.id);
        roots.insert(record.id, record);
    }

    let survivor = roots
        .values()
        .min_by_key(|r| r.seniority_key())
        .cloned()
        .ok_or(InvariantViolation::NoCandidateToPromote)?;

    let mut demoted = Vec::new();
    let mut relinked = BTreeSet::new();

    for mut root in roots.into_values().filter(|r| r.id != survivor.id) {
        root.link_to(survivor.id, now);
        store.save(&root).map_err(ReconcileError::Store)?;
        demoted.push(root.id);
        relink_children(store, root.id, survivor.id, now, &mut relinked)?;
    }

    for mut orphan in orphans {
        if orphan.id == survivor.id || orphan.linked_id == Some(survivor.id) {
            continue;
        }
        orphan.link_to(survivor.id, now);
        store.save(&orphan).map_err(ReconcileError::Store)?;
        relinked.insert(orphan.id);
    }

    for dead in dead_roots {
        relink_children(store, dead, survivor.id, now, &mut relinked)?;
    }

    Ok(Resolution {
        primary: survivor,
        created: None,
        promoted,
        demoted,
        relinked,
    })
}

/// Point every live record linked to `from` at `to`.
fn relink_children<S: RecordStore>(
    store: &mut S,
    from: RecordId,
    to: RecordId,
    now: i64,
    relinked: &mut BTreeSet<RecordId>,
) -> Result<(), S::Error> {
    let children = store.find_cluster(from).map_err(ReconcileError::Store)?;
    for mut child in children {
        if child.id == from || child.id == to || child.linked_id != Some(from) {
            continue;
        }
        child.link_to(to, now);
        store.save(&child).map_err(ReconcileError::Store)?;
        relinked.insert(child.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::record::Precedence;
    use crate::store::MemoryStore;

    fn sig(email: Option<&str>, phone: Option<&str>) -> Signature {
        Signature::new(email, phone)
    }

    fn run(store: &mut MemoryStore, email: Option<&str>, phone: Option<&str>) -> Reconciliation {
        reconcile(store, &sig(email, phone)).unwrap()
    }

    fn primaries(store: &MemoryStore) -> Vec<RecordId> {
        store
            .records()
            .iter()
            .filter(|r| !r.is_deleted() && r.is_primary())
            .map(|r| r.id)
            .collect()
    }

    #[test]
    fn test_empty_store_creates_primary() {
        let mut store = MemoryStore::with_clock(100);
        let out = run(&mut store, Some("a@x.com"), Some("555"));

        assert_eq!(out.created, Some(1));
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.view.emails, vec!["a@x.com"]);
        assert_eq!(out.view.phone_numbers, vec!["555"]);
        assert!(out.view.secondary_contact_ids.is_empty());
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records()[0].precedence, Precedence::Primary);
    }

    #[test]
    fn test_exact_resubmission_writes_nothing() {
        let mut store = MemoryStore::with_clock(100);
        let first = run(&mut store, Some("a@x.com"), Some("555"));
        let before = store.records().to_vec();

        let second = run(&mut store, Some("a@x.com"), Some("555"));
        assert!(second.is_read_only());
        assert_eq!(second.view, first.view);
        assert_eq!(store.records(), before.as_slice());
    }

    #[test]
    fn test_subset_signature_writes_nothing() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("555"));
        let out = run(&mut store, None, Some("555"));
        assert!(out.is_read_only());
        assert_eq!(out.view.emails, vec!["a@x.com"]);
    }

    #[test]
    fn test_new_phone_creates_linked_secondary() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), None);
        store.set_clock(200);
        let out = run(&mut store, Some("a@x.com"), Some("555"));

        assert_eq!(out.created, Some(2));
        let secondary = store.get(2).unwrap();
        assert_eq!(secondary.precedence, Precedence::Secondary);
        assert_eq!(secondary.linked_id, Some(1));
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.view.phone_numbers, vec!["555"]);
        assert_eq!(out.view.secondary_contact_ids, vec![2]);
    }

    #[test]
    fn test_bridging_merge_demotes_newer_primary_without_new_record() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), None);
        store.set_clock(200);
        run(&mut store, None, Some("555"));

        store.set_clock(300);
        let out = run(&mut store, Some("a@x.com"), Some("555"));

        assert_eq!(out.created, None, "no field beyond A and B is new");
        assert_eq!(out.demoted, vec![2]);
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.view.secondary_contact_ids, vec![2]);
        assert_eq!(out.view.emails, vec!["a@x.com"]);
        assert_eq!(out.view.phone_numbers, vec!["555"]);
        let b = store.get(2).unwrap();
        assert_eq!(b.precedence, Precedence::Secondary);
        assert_eq!(b.linked_id, Some(1));
        assert_eq!(b.updated_at, 300);
        assert_eq!(primaries(&store), vec![1]);
    }

    #[test]
    fn test_bridging_merge_with_new_field_creates_secondary() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111"));
        store.set_clock(200);
        run(&mut store, Some("b@x.com"), Some("222"));

        store.set_clock(300);
        let out = run(&mut store, Some("b@x.com"), Some("111"));
        assert_eq!(out.created, None);
        assert_eq!(out.demoted, vec![2]);

        let out = run(&mut store, Some("c@x.com"), Some("222"));
        assert_eq!(out.created, Some(3));
        assert_eq!(store.get(3).unwrap().linked_id, Some(1));
        assert_eq!(out.view.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(out.view.phone_numbers, vec!["111", "222"]);
        assert_eq!(out.view.secondary_contact_ids, vec![2, 3]);
    }

    #[test]
    fn test_merge_flattens_demoted_primarys_secondaries() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111")); // 1
        store.set_clock(200);
        run(&mut store, Some("b@x.com"), Some("222")); // 2
        store.set_clock(300);
        run(&mut store, Some("c@x.com"), Some("222")); // 3 -> 2

        store.set_clock(400);
        let out = run(&mut store, Some("a@x.com"), Some("222"));

        assert_eq!(out.demoted, vec![2]);
        assert_eq!(out.relinked, vec![3]);
        assert_eq!(out.write_count(), 2);
        assert_eq!(store.get(3).unwrap().linked_id, Some(1));
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.view.secondary_contact_ids, vec![2, 3]);
        assert_eq!(out.view.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_candidate_secondary_resolves_to_its_primary() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111")); // 1
        run(&mut store, Some("b@x.com"), Some("111")); // 2 -> 1

        // Matches only the secondary; the primary shares neither field.
        let out = run(&mut store, Some("b@x.com"), Some("999"));
        assert_eq!(out.created, Some(3));
        assert_eq!(out.promoted, None);
        assert_eq!(store.get(3).unwrap().linked_id, Some(1));
        assert_eq!(primaries(&store), vec![1]);
        assert_eq!(out.view.phone_numbers, vec!["111", "999"]);
    }

    #[test]
    fn test_tie_on_created_at_breaks_by_smaller_id() {
        let mut store = MemoryStore::with_clock(500);
        run(&mut store, Some("a@x.com"), None); // 1
        run(&mut store, None, Some("555")); // 2, same timestamp

        let out = run(&mut store, Some("a@x.com"), Some("555"));
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.demoted, vec![2]);
    }

    #[test]
    fn test_older_primary_survives_even_with_larger_id() {
        let mut store = MemoryStore::with_clock(900);
        run(&mut store, Some("a@x.com"), None); // 1 at 900
        store.set_clock(100);
        run(&mut store, None, Some("555")); // 2 at 100

        let out = run(&mut store, Some("a@x.com"), Some("555"));
        assert_eq!(out.view.primary_contact_id, 2);
        assert_eq!(out.demoted, vec![1]);
        assert_eq!(out.view.emails, vec!["a@x.com"]);
        assert_eq!(out.view.phone_numbers, vec!["555"]);
    }

    #[test]
    fn test_three_way_merge_leaves_one_primary() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111")); // 1
        store.set_clock(200);
        run(&mut store, Some("b@x.com"), Some("222")); // 2
        store.set_clock(300);
        run(&mut store, Some("c@x.com"), Some("333")); // 3

        store.set_clock(400);
        run(&mut store, Some("b@x.com"), Some("333"));
        let out = run(&mut store, Some("a@x.com"), Some("333"));

        assert_eq!(primaries(&store), vec![1]);
        assert_eq!(out.view.primary_contact_id, 1);
        assert_eq!(out.view.secondary_contact_ids, vec![2, 3]);
        for id in [2, 3] {
            assert_eq!(store.get(id).unwrap().linked_id, Some(1));
        }
    }

    #[test]
    fn test_deleted_primary_promotes_oldest_orphan() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111")); // 1
        store.set_clock(200);
        run(&mut store, Some("b@x.com"), Some("111")); // 2 -> 1
        store.set_clock(300);
        run(&mut store, Some("c@x.com"), Some("111")); // 3 -> 1
        store.soft_delete(1);

        store.set_clock(400);
        let out = run(&mut store, Some("b@x.com"), None);

        assert_eq!(out.promoted, Some(2));
        assert_eq!(out.relinked, vec![3]);
        assert_eq!(out.created, None);
        let promoted = store.get(2).unwrap();
        assert!(promoted.is_primary());
        assert_eq!(promoted.linked_id, None);
        assert_eq!(out.view.primary_contact_id, 2);
        assert_eq!(out.view.secondary_contact_ids, vec![3]);
        assert_eq!(out.view.emails, vec!["b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_orphan_joins_live_primary_when_one_matches() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), Some("111")); // 1
        run(&mut store, Some("b@x.com"), Some("111")); // 2 -> 1
        store.set_clock(200);
        run(&mut store, Some("z@x.com"), Some("999")); // 3
        store.soft_delete(1);

        let out = run(&mut store, Some("b@x.com"), Some("999"));
        assert_eq!(out.promoted, None);
        assert_eq!(out.relinked, vec![2]);
        assert_eq!(out.view.primary_contact_id, 3);
        assert_eq!(out.view.secondary_contact_ids, vec![2]);
    }

    #[test]
    fn test_deleted_records_are_not_candidates() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), None);
        store.soft_delete(1);

        let out = run(&mut store, Some("a@x.com"), None);
        assert_eq!(out.created, Some(2));
        assert_eq!(out.view.primary_contact_id, 2);
        assert!(store.get(2).unwrap().is_primary());
    }

    #[test]
    fn test_rejects_unusable_signature_without_writes() {
        let mut store = MemoryStore::with_clock(100);
        let err = reconcile(&mut store, &sig(Some("  "), None)).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Rejected(ValidationError::NoContactMethod)
        ));
        let err = reconcile(&mut store, &sig(Some("not-an-email"), None)).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Rejected(ValidationError::MalformedEmail)
        ));
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_signature_is_trimmed_before_matching() {
        let mut store = MemoryStore::with_clock(100);
        run(&mut store, Some("a@x.com"), None);
        let out = run(&mut store, Some("  a@x.com  "), None);
        assert!(out.is_read_only());
    }

    #[test]
    fn test_has_new_information_only_checks_supplied_fields() {
        let mut store = MemoryStore::with_clock(0);
        run(&mut store, Some("a@x.com"), Some("111"));
        let candidates: BTreeMap<_, _> = store
            .records()
            .iter()
            .map(|r| (r.id, r.clone()))
            .collect();

        assert!(!has_new_information(&sig(Some("a@x.com"), None), &candidates));
        assert!(!has_new_information(&sig(None, Some("111")), &candidates));
        assert!(has_new_information(&sig(Some("a@x.com"), Some("222")), &candidates));
        assert!(has_new_information(&sig(Some("b@x.com"), Some("111")), &candidates));
    }
}
