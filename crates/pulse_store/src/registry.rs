//! Environment registry: deduplicated, hash-keyed snapshot persistence.
//!
//! Registration is insert-or-lookup keyed by the content hash. Two writers
//! (separate store instances, separate processes) can race to insert the
//! same new hash; the loser hits the UNIQUE constraint, re-queries, and
//! returns the winner's id. Add-on inventories are deduplicated the same
//! way in their own table, since many environments share one add-on set.

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::environment::Environment;
use crate::error::{is_constraint_violation, Result, StoreError};
use crate::ids::EnvId;
use crate::storage::PulseStore;

impl PulseStore {
    /// Register a snapshot, returning the id of the row holding its content.
    ///
    /// Idempotent: identical content always maps to the same id, and the
    /// environments table gains at most one row per distinct hash.
    pub fn register_environment(&self, env: &Environment) -> Result<EnvId> {
        let hash = env.content_hash()?;

        if let Ok(cache) = self.env_cache.lock() {
            if let Some(id) = cache.get(&hash) {
                return Ok(*id);
            }
        }
        if let Some(id) = self.environment_id_by_hash(&hash)? {
            self.cache_env(&hash, id);
            return Ok(id);
        }

        match self.insert_environment(&hash, env) {
            Ok(id) => {
                self.cache_env(&hash, id);
                Ok(id)
            }
            Err(err) if is_constraint_violation(&err) => {
                // Lost an insert race; the winner's row is durable now.
                match self.environment_id_by_hash(&hash)? {
                    Some(id) => {
                        debug!(%hash, %id, "environment insert race recovered");
                        self.cache_env(&hash, id);
                        Ok(id)
                    }
                    None => Err(StoreError::Storage(err)),
                }
            }
            Err(err) => Err(StoreError::Storage(err)),
        }
    }

    /// Every registered environment, with its id and stored hash. Full
    /// materialization; used once per report.
    pub fn all_environments(&self) -> Result<Vec<(EnvId, String, Environment)>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.hash, e.version, e.profile_creation_days,
                    e.cpu_count, e.memory_mb, e.architecture, e.sys_name, e.sys_version,
                    e.vendor, e.app_name, e.app_version, e.app_build_id,
                    e.platform_version, e.platform_build_id, e.os, e.update_channel,
                    e.blocklist_enabled, e.telemetry_enabled,
                    e.app_locale, e.os_locale, e.accept_lang_user_set, e.distribution,
                    e.extension_count, e.plugin_count, e.theme_count,
                    a.body
             FROM environments e
             JOIN addons a ON a.id = e.addons_id
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let env = Environment {
                version: row.get::<_, i64>(2)? as u32,
                profile_creation_days: row.get(3)?,
                cpu_count: row.get(4)?,
                memory_mb: row.get(5)?,
                architecture: row.get(6)?,
                sys_name: row.get(7)?,
                sys_version: row.get(8)?,
                vendor: row.get(9)?,
                app_name: row.get(10)?,
                app_version: row.get(11)?,
                app_build_id: row.get(12)?,
                platform_version: row.get(13)?,
                platform_build_id: row.get(14)?,
                os: row.get(15)?,
                update_channel: row.get(16)?,
                blocklist_enabled: row.get(17)?,
                telemetry_enabled: row.get(18)?,
                app_locale: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
                os_locale: row.get::<_, Option<String>>(20)?.unwrap_or_default(),
                accept_lang_user_set: row.get::<_, Option<bool>>(21)?.unwrap_or(false),
                distribution: row.get::<_, Option<String>>(22)?.unwrap_or_default(),
                extension_count: row.get(23)?,
                plugin_count: row.get(24)?,
                theme_count: row.get(25)?,
                addons_json: row.get(26)?,
            };
            Ok((EnvId(row.get(0)?), row.get::<_, String>(1)?, env))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reverse lookup of a registered environment's hash.
    pub fn environment_hash(&self, id: EnvId) -> Result<Option<String>> {
        let hash = self
            .conn
            .query_row(
                "SELECT hash FROM environments WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub(crate) fn environment_id_by_hash(&self, hash: &str) -> Result<Option<EnvId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM environments WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(EnvId))
    }

    fn cache_env(&self, hash: &str, id: EnvId) {
        if let Ok(mut cache) = self.env_cache.lock() {
            cache.insert(hash.to_string(), id);
        }
    }

    /// Insert the add-on body (deduplicated) and the environment row in one
    /// atomic unit, so a crash cannot leave an environment without its
    /// add-on reference.
    fn insert_environment(&self, hash: &str, env: &Environment) -> rusqlite::Result<EnvId> {
        let tx = self.conn.unchecked_transaction()?;
        let addons_id = self.resolve_addons_id(&env.addons_json)?;
        tx.execute(
            "INSERT INTO environments (
                hash, version, profile_creation_days,
                cpu_count, memory_mb, architecture, sys_name, sys_version,
                vendor, app_name, app_version, app_build_id,
                platform_version, platform_build_id, os, update_channel,
                blocklist_enabled, telemetry_enabled,
                app_locale, os_locale, accept_lang_user_set, distribution,
                extension_count, plugin_count, theme_count, addons_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                hash,
                env.version,
                env.profile_creation_days,
                env.cpu_count,
                env.memory_mb,
                env.architecture,
                env.sys_name,
                env.sys_version,
                env.vendor,
                env.app_name,
                env.app_version,
                env.app_build_id,
                env.platform_version,
                env.platform_build_id,
                env.os,
                env.update_channel,
                env.blocklist_enabled,
                env.telemetry_enabled,
                if env.version >= 2 { Some(&env.app_locale) } else { None },
                if env.version >= 2 { Some(&env.os_locale) } else { None },
                if env.version >= 2 { Some(env.accept_lang_user_set) } else { None },
                if env.version >= 2 { Some(&env.distribution) } else { None },
                env.extension_count,
                env.plugin_count,
                env.theme_count,
                addons_id,
            ],
        )?;
        let id = EnvId(tx.last_insert_rowid());
        tx.commit()?;
        Ok(id)
    }

    /// Look up an add-on body with identical serialized content, or insert a
    /// new row. The UNIQUE constraint covers the same cross-process race as
    /// environment insert, recovered the same way.
    fn resolve_addons_id(&self, body: &str) -> rusqlite::Result<i64> {
        let existing = self
            .conn
            .query_row(
                "SELECT id FROM addons WHERE body = ?1",
                params![body],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        match self
            .conn
            .execute("INSERT INTO addons (body) VALUES (?1)", params![body])
        {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(err) if is_constraint_violation(&err) => self.conn.query_row(
                "SELECT id FROM addons WHERE body = ?1",
                params![body],
                |row| row.get(0),
            ),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: i64) -> Environment {
        Environment {
            app_name: "pulse".to_string(),
            app_version: "1.0".to_string(),
            cpu_count: cpu,
            memory_mb: 2048,
            ..Environment::default()
        }
    }

    fn table_count(store: &PulseStore, table: &str) -> i64 {
        store
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn registering_same_content_twice_is_idempotent() {
        let store = PulseStore::open_in_memory().unwrap();
        let a = store.register_environment(&snapshot(4)).unwrap();
        let b = store.register_environment(&snapshot(4)).unwrap();
        assert_eq!(a, b);
        assert_eq!(table_count(&store, "environments"), 1);
    }

    #[test]
    fn distinct_content_gets_distinct_ids() {
        let store = PulseStore::open_in_memory().unwrap();
        let a = store.register_environment(&snapshot(4)).unwrap();
        let b = store.register_environment(&snapshot(8)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table_count(&store, "environments"), 2);
    }

    #[test]
    fn identical_addon_sets_are_shared() {
        let store = PulseStore::open_in_memory().unwrap();
        let mut a = snapshot(4);
        let mut b = snapshot(8);
        a.addons_json = r#"{"ext@example.org": {"version": "1"}}"#.to_string();
        b.addons_json = r#"{"ext@example.org": {"version": "1"}}"#.to_string();
        store.register_environment(&a).unwrap();
        store.register_environment(&b).unwrap();
        assert_eq!(table_count(&store, "environments"), 2);
        assert_eq!(table_count(&store, "addons"), 1);
    }

    #[test]
    fn lookup_survives_cold_cache() {
        let store = PulseStore::open_in_memory().unwrap();
        let id = store.register_environment(&snapshot(4)).unwrap();
        store.clear_env_cache();
        let again = store.register_environment(&snapshot(4)).unwrap();
        assert_eq!(id, again);
        assert_eq!(table_count(&store, "environments"), 1);
    }

    #[test]
    fn hash_reverse_lookup() {
        let store = PulseStore::open_in_memory().unwrap();
        let env = snapshot(4);
        let id = store.register_environment(&env).unwrap();
        assert_eq!(
            store.environment_hash(id).unwrap(),
            Some(env.content_hash().unwrap())
        );
        assert_eq!(store.environment_hash(EnvId(999)).unwrap(), None);
    }

    #[test]
    fn all_environments_round_trips_snapshots() {
        let store = PulseStore::open_in_memory().unwrap();
        let mut env = snapshot(4);
        env.app_locale = "en-US".to_string();
        env.addons_json = r#"{"a@x": {"version": "1"}}"#.to_string();
        let id = store.register_environment(&env).unwrap();

        let all = store.all_environments().unwrap();
        assert_eq!(all.len(), 1);
        let (got_id, got_hash, got_env) = &all[0];
        assert_eq!(*got_id, id);
        assert_eq!(*got_hash, env.content_hash().unwrap());
        assert_eq!(*got_env, env);
    }

    #[test]
    fn v1_snapshot_round_trips_without_v2_columns() {
        let store = PulseStore::open_in_memory().unwrap();
        let mut env = snapshot(4);
        env.version = 1;
        store.register_environment(&env).unwrap();
        let all = store.all_environments().unwrap();
        assert_eq!(all[0].2.version, 1);
        assert_eq!(all[0].2.app_locale, "");
    }
}
