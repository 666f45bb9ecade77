//! Contact identity reconciliation engine.
//!
//! Each interaction supplies a partial contact signature (email and/or phone
//! number). The engine decides whether it belongs to a known person, a new
//! person, or bridges two known persons that must be merged, and produces a
//! consolidated view rooted at that person's primary record.
//!
//! Zero I/O. Persistence is reached only through the [`RecordStore`] trait.

pub mod audit;
pub mod error;
pub mod reconcile;
pub mod record;
pub mod signature;
pub mod store;
pub mod time;
pub mod view;

pub use audit::{AuditReport, Finding, UnionFind, audit};
pub use error::{InvariantViolation, ReconcileError, ValidationError};
pub use reconcile::{Reconciliation, reconcile};
pub use record::{ContactRecord, NewContact, Precedence, RecordId};
pub use signature::{Signature, is_valid_email};
pub use store::{MemoryStore, RecordStore};
pub use time::{now_unix_millis, unix_millis_to_iso8601};
pub use view::ConsolidatedView;
