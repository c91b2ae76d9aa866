//! Integrity-checked storage for processed chunks.
//!
//! Every record is written three times: the primary copy that reads are served from, a backup
//! snapshot and a redundant replica. [`IntegrityStore::detect`] scans primaries for checksum,
//! vector and metadata damage; [`IntegrityStore::recover`] repairs what the chosen
//! [`RecoveryStrategy`] can and quarantines the rest.

mod detect;
mod error;
mod record;
mod store;

pub use detect::{CorruptionKind, DetectionReport, Finding, ScanScope};
pub use error::IntegrityError;
pub use record::{checksum, StoredRecord};
pub use store::{
    CorruptionEvent, IntegrityConfig, IntegrityStore, RecordCopy, RecoveryReport,
    RecoveryStrategy,
};
