//! Store lifecycle: connection, schema bootstrap, caches, transactions.
//!
//! One `PulseStore` owns one SQLite connection plus the in-memory caches.
//! All mutating operations are expected to be submitted through a single
//! sequential writer per store instance; the only cross-writer race the
//! engine tolerates is a uniqueness-constraint failure on environment or
//! add-on insert, recovered by re-query (two independent store instances can
//! still race at the storage layer itself). Read paths may run beside the
//! writer and tolerate slightly stale caches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::ids::{EnvId, FieldId};
use crate::values::FieldInfo;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS addons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS environments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL UNIQUE,
    version INTEGER NOT NULL,
    profile_creation_days INTEGER NOT NULL,
    cpu_count INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    architecture TEXT NOT NULL,
    sys_name TEXT NOT NULL,
    sys_version TEXT NOT NULL,
    vendor TEXT NOT NULL,
    app_name TEXT NOT NULL,
    app_version TEXT NOT NULL,
    app_build_id TEXT NOT NULL,
    platform_version TEXT NOT NULL,
    platform_build_id TEXT NOT NULL,
    os TEXT NOT NULL,
    update_channel TEXT NOT NULL,
    blocklist_enabled INTEGER NOT NULL,
    telemetry_enabled INTEGER NOT NULL,
    app_locale TEXT,
    os_locale TEXT,
    accept_lang_user_set INTEGER,
    distribution TEXT,
    extension_count INTEGER NOT NULL,
    plugin_count INTEGER NOT NULL,
    theme_count INTEGER NOT NULL,
    addons_id INTEGER NOT NULL REFERENCES addons(id)
);

CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS fields (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_id INTEGER NOT NULL REFERENCES measurements(id),
    name TEXT NOT NULL,
    value_type TEXT NOT NULL,
    accum_kind TEXT NOT NULL,
    UNIQUE (measurement_id, name)
);

CREATE TABLE IF NOT EXISTS events_integer (
    day INTEGER NOT NULL,
    env_id INTEGER NOT NULL REFERENCES environments(id),
    field_id INTEGER NOT NULL REFERENCES fields(id),
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events_textual (
    day INTEGER NOT NULL,
    env_id INTEGER NOT NULL REFERENCES environments(id),
    field_id INTEGER NOT NULL REFERENCES fields(id),
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_integer_key
    ON events_integer (day, env_id, field_id);
CREATE INDEX IF NOT EXISTS idx_events_textual_key
    ON events_textual (day, env_id, field_id);

CREATE VIEW IF NOT EXISTS events AS
    SELECT day, env_id, field_id, value, 'integer' AS value_kind
        FROM events_integer
    UNION ALL
    SELECT day, env_id, field_id, value, 'textual' AS value_kind
        FROM events_textual;

CREATE VIEW IF NOT EXISTS named_fields AS
    SELECT f.id AS field_id,
           f.name AS field_name,
           f.value_type AS value_type,
           f.accum_kind AS accum_kind,
           m.id AS measurement_id,
           m.name AS measurement_name,
           m.version AS measurement_version
    FROM fields f
    JOIN measurements m ON m.id = f.measurement_id;

CREATE VIEW IF NOT EXISTS named_events AS
    SELECT e.day AS day,
           env.hash AS env_hash,
           nf.measurement_name AS measurement_name,
           nf.measurement_version AS measurement_version,
           nf.field_name AS field_name,
           e.value AS value
    FROM events e
    JOIN named_fields nf ON nf.field_id = e.field_id
    JOIN environments env ON env.id = e.env_id;

CREATE VIEW IF NOT EXISTS current_measurements AS
    SELECT name, MAX(version) AS version
    FROM measurements
    GROUP BY name;
"#;

/// Cached field metadata, bulk-loaded from the catalog on first miss.
#[derive(Debug, Default)]
pub(crate) struct FieldCache {
    pub(crate) by_key: HashMap<(String, u32, String), FieldId>,
    pub(crate) by_id: HashMap<FieldId, FieldInfo>,
}

/// The storage engine: environment registry, measurement/field catalog and
/// event store over one SQLite database.
pub struct PulseStore {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    /// hash -> id, populated on register and on lookup.
    pub(crate) env_cache: Mutex<HashMap<String, EnvId>>,
    /// Field metadata cache. Dedicated lock: read far more often than
    /// written, and must not contend with the writer queue.
    pub(crate) field_cache: RwLock<Option<FieldCache>>,
}

impl PulseStore {
    /// Open or create a store at the given path.
    ///
    /// Fatal on any storage failure; the engine offers no degraded mode.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, Some(path.as_ref().to_path_buf()))
    }

    /// In-memory store, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path, "pulse store opened");
        Ok(Self {
            conn,
            path,
            env_cache: Mutex::new(HashMap::new()),
            field_cache: RwLock::new(None),
        })
    }

    /// Run several store operations inside one transaction.
    ///
    /// Required around multi-step writes such as concurrent counter
    /// increments; the check-then-act in `increment_counter` is not atomic
    /// by itself.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// On-disk size of the database file, for storage-cap enforcement.
    /// Zero for in-memory stores.
    pub fn storage_size_bytes(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub(crate) fn clear_env_cache(&self) {
        if let Ok(mut cache) = self.env_cache.lock() {
            cache.clear();
        }
    }

    pub(crate) fn invalidate_field_cache(&self) {
        if let Ok(mut cache) = self.field_cache.write() {
            *cache = None;
        }
    }

    // -- wipe operations (adapter surface) ---------------------------------

    /// Delete all persisted data and reset the caches.
    pub fn delete_everything(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM events_integer;
             DELETE FROM events_textual;
             DELETE FROM fields;
             DELETE FROM measurements;
             DELETE FROM environments;
             DELETE FROM addons;",
        )?;
        self.clear_env_cache();
        self.invalidate_field_cache();
        Ok(())
    }

    /// Delete every measurement and its fields, cascading their events.
    pub fn delete_measurements(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM events_integer;
             DELETE FROM events_textual;
             DELETE FROM fields;
             DELETE FROM measurements;",
        )?;
        self.invalidate_field_cache();
        Ok(())
    }

    /// Delete every environment, cascading their events and orphaned add-on
    /// sets. Measurement/field definitions survive.
    pub fn delete_environments(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM events_integer;
             DELETE FROM events_textual;
             DELETE FROM environments;
             DELETE FROM addons;",
        )?;
        self.clear_env_cache();
        Ok(())
    }
}
