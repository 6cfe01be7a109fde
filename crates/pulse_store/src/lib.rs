//! Pulse Store - durable differential telemetry storage.
//!
//! Records per-day usage metrics tagged by the device/software environment
//! they occurred under, and compiles the accumulated data into a compact,
//! differential JSON report for periodic upload. Upload transport,
//! scheduling and the IPC request router live outside this crate; it only
//! exposes the storage operations they call.
//!
//! Concurrency contract: submit all mutating operations through one
//! sequential writer per [`PulseStore`] instance. Read-only queries may run
//! beside the writer and tolerate slightly stale caches. The only race the
//! engine recovers internally is a uniqueness-constraint failure on
//! environment/add-on insert from a second store instance, resolved by
//! re-query.

pub mod catalog;
pub mod diff;
pub mod document;
pub mod environment;
pub mod error;
pub mod events;
pub mod ids;
pub mod registry;
pub mod storage;
pub mod time;
pub mod values;

pub use catalog::MeasurementListing;
pub use document::{generate, DocumentRequest, DOCUMENT_VERSION};
pub use environment::{Environment, ProfileInfoProvider};
pub use error::{Result, StoreError};
pub use events::{EventRow, NamedEventRow};
pub use ids::{EnvId, FieldId, MeasurementId};
pub use storage::PulseStore;
pub use values::{AccumKind, FieldSpec, FieldValue, ValueType};
