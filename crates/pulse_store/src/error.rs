//! Error taxonomy for the storage engine.
//!
//! The split matters to callers: schema-integrity failures are programming
//! errors and surface loudly, while dedup races and malformed persisted JSON
//! are recovered internally and never reach this enum.

use crate::ids::FieldId;

/// Errors surfaced by the storage engine and document generator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure (disk error, corrupt database, ...).
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A uniqueness or foreign-key violation on an event write. Indicates
    /// the referenced field or environment does not exist.
    #[error("schema integrity violation: {0}")]
    SchemaIntegrity(String),

    /// Lookup of a field that was never declared in the catalog.
    #[error("unknown field '{field}' in measurement '{measurement}' v{version}")]
    UnknownField {
        measurement: String,
        version: u32,
        field: String,
    },

    /// Lookup of a field id with no catalog entry.
    #[error("unknown field id {0}")]
    UnknownFieldId(FieldId),

    /// A value whose type does not match the field's declared value type.
    #[error("field '{field}' declares value type {declared}, got {got}")]
    TypeMismatch {
        field: String,
        declared: &'static str,
        got: &'static str,
    },

    /// An operation used against a field with a different accumulation kind.
    #[error("field '{field}' has accumulation kind {kind}, operation requires {required}")]
    KindMismatch {
        field: String,
        kind: &'static str,
        required: &'static str,
    },

    /// An event attributed to an environment id that was never registered.
    #[error("event attributed to unregistered environment")]
    UnregisteredEnvironment,

    /// An environment snapshot missing a mandatory scalar; its content hash
    /// cannot be computed.
    #[error("environment snapshot incomplete: missing {missing}")]
    IncompleteEnvironment { missing: &'static str },

    /// Document generation could not proceed at all.
    #[error("no document: {0}")]
    NoDocument(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// True when a rusqlite error is a uniqueness/foreign-key constraint failure.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Promote a constraint violation to a schema-integrity error; pass anything
/// else through as a plain storage failure.
pub(crate) fn integrity(err: rusqlite::Error) -> StoreError {
    if is_constraint_violation(&err) {
        StoreError::SchemaIntegrity(err.to_string())
    } else {
        StoreError::Storage(err)
    }
}
