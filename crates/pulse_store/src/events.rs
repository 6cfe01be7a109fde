//! Event store: per-day accumulation rows and ordered window reads.
//!
//! One row per (day, environment, field) fact. Integer and textual values
//! live in physically separate tables, logically unioned for reads. Write
//! semantics are selected by the field's declared accumulation kind and
//! type-checked centrally; a foreign-key violation means the referenced
//! field or environment does not exist and is surfaced as a hard error.

use rusqlite::params;
use tracing::debug;

use crate::error::{integrity, Result, StoreError};
use crate::ids::{EnvId, FieldId};
use crate::storage::PulseStore;
use crate::time::day_of_millis;
use crate::values::{AccumKind, FieldInfo, FieldValue, ValueType};

/// One event row from the ordered union of both value tables. Textual rows
/// carry their storage form; JSON-typed fields are parsed downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub day: i64,
    pub env: EnvId,
    pub field: FieldId,
    pub value: FieldValue,
}

/// One row from the `named_events` view, for human-readable listings.
#[derive(Debug, Clone)]
pub struct NamedEventRow {
    pub day: i64,
    pub env_hash: String,
    pub measurement: String,
    pub measurement_version: u32,
    pub field: String,
    pub value: String,
}

impl PulseStore {
    /// Record a "last observed value wins" fact: update the existing row for
    /// (day, env, field) or insert one.
    pub fn record_last(
        &self,
        env: EnvId,
        day: i64,
        field: &FieldInfo,
        value: &FieldValue,
    ) -> Result<()> {
        check_env(env)?;
        field.check_kind(&[AccumKind::Last], "last")?;
        field.check_value(value)?;

        match value {
            FieldValue::Int(n) => {
                let updated = self
                    .conn
                    .execute(
                        "UPDATE events_integer SET value = ?4
                         WHERE day = ?1 AND env_id = ?2 AND field_id = ?3",
                        params![day, env.0, field.id.0, n],
                    )
                    .map_err(integrity)?;
                if updated == 0 {
                    self.conn
                        .execute(
                            "INSERT INTO events_integer (day, env_id, field_id, value)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![day, env.0, field.id.0, n],
                        )
                        .map_err(integrity)?;
                }
            }
            FieldValue::Text(_) | FieldValue::Json(_) => {
                let text = value.to_storage_text().unwrap_or_default();
                let updated = self
                    .conn
                    .execute(
                        "UPDATE events_textual SET value = ?4
                         WHERE day = ?1 AND env_id = ?2 AND field_id = ?3",
                        params![day, env.0, field.id.0, text],
                    )
                    .map_err(integrity)?;
                if updated == 0 {
                    self.conn
                        .execute(
                            "INSERT INTO events_textual (day, env_id, field_id, value)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![day, env.0, field.id.0, text],
                        )
                        .map_err(integrity)?;
                }
            }
        }
        Ok(())
    }

    /// Record a discrete occurrence: always a new row, never merged. Valid
    /// for append and counted fields.
    pub fn record_discrete(
        &self,
        env: EnvId,
        day: i64,
        field: &FieldInfo,
        value: &FieldValue,
    ) -> Result<()> {
        check_env(env)?;
        field.check_kind(
            &[AccumKind::DiscreteAppend, AccumKind::DiscreteCounted],
            "discrete",
        )?;
        field.check_value(value)?;

        match value {
            FieldValue::Int(n) => {
                self.conn
                    .execute(
                        "INSERT INTO events_integer (day, env_id, field_id, value)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![day, env.0, field.id.0, n],
                    )
                    .map_err(integrity)?;
            }
            FieldValue::Text(_) | FieldValue::Json(_) => {
                let text = value.to_storage_text().unwrap_or_default();
                self.conn
                    .execute(
                        "INSERT INTO events_textual (day, env_id, field_id, value)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![day, env.0, field.id.0, text],
                    )
                    .map_err(integrity)?;
            }
        }
        Ok(())
    }

    /// Add `by` to the day's counter, inserting the row on first increment.
    ///
    /// The read-modify-write here is not atomic by itself: concurrent
    /// increments must be wrapped in a caller-provided transaction
    /// ([`PulseStore::in_transaction`]).
    pub fn increment_counter(
        &self,
        env: EnvId,
        day: i64,
        field: &FieldInfo,
        by: i64,
    ) -> Result<()> {
        check_env(env)?;
        field.check_kind(&[AccumKind::Counter], "counter")?;
        if field.value_type != ValueType::Int {
            return Err(StoreError::TypeMismatch {
                field: field.name.clone(),
                declared: field.value_type.code(),
                got: ValueType::Int.code(),
            });
        }

        let updated = self
            .conn
            .execute(
                "UPDATE events_integer SET value = value + ?4
                 WHERE day = ?1 AND env_id = ?2 AND field_id = ?3",
                params![day, env.0, field.id.0, by],
            )
            .map_err(integrity)?;
        if updated == 0 {
            self.conn
                .execute(
                    "INSERT INTO events_integer (day, env_id, field_id, value)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![day, env.0, field.id.0, by],
                )
                .map_err(integrity)?;
        }
        Ok(())
    }

    /// All events at or after the day containing `since_millis`, strictly
    /// ordered by (day, env, field) ascending.
    ///
    /// The ordering is load-bearing: the document generator's walking
    /// partition assumes it and would silently mis-group data otherwise.
    pub fn events_since(&self, since_millis: i64) -> Result<Vec<EventRow>> {
        let day = day_of_millis(since_millis);
        let mut stmt = self.conn.prepare(
            "SELECT day, env_id, field_id, value, value_kind FROM events
             WHERE day >= ?1
             ORDER BY day ASC, env_id ASC, field_id ASC",
        )?;
        let rows = stmt.query_map(params![day], |row| {
            let kind: String = row.get(4)?;
            let value = if kind == "integer" {
                FieldValue::Int(row.get(3)?)
            } else {
                FieldValue::Text(row.get(3)?)
            };
            Ok(EventRow {
                day: row.get(0)?,
                env: EnvId(row.get(1)?),
                field: FieldId(row.get(2)?),
                value,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Cheap existence probe over the same window as [`events_since`].
    pub fn has_event_since(&self, since_millis: i64) -> Result<bool> {
        let day = day_of_millis(since_millis);
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM events WHERE day >= ?1)",
            params![day],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// Events joined to measurement/field/environment names, for listings.
    pub fn named_events_since(&self, since_millis: i64) -> Result<Vec<NamedEventRow>> {
        let day = day_of_millis(since_millis);
        let mut stmt = self.conn.prepare(
            "SELECT day, env_hash, measurement_name, measurement_version, field_name, value
             FROM named_events
             WHERE day >= ?1
             ORDER BY day ASC, env_hash ASC, field_name ASC",
        )?;
        let rows = stmt.query_map(params![day], |row| {
            Ok(NamedEventRow {
                day: row.get(0)?,
                env_hash: row.get(1)?,
                measurement: row.get(2)?,
                measurement_version: row.get::<_, i64>(3)? as u32,
                field: row.get(4)?,
                value: row.get::<_, rusqlite::types::Value>(5).map(stringify)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- pruning -----------------------------------------------------------

    /// Delete everything older than `before_millis`: the day's events, then
    /// environments left without events (except `current`), then orphaned
    /// add-on sets. Cascades together so no event ever references a pruned
    /// environment.
    pub fn prune_before(&self, before_millis: i64, current: EnvId) -> Result<()> {
        let day = day_of_millis(before_millis);
        self.in_transaction(|store| {
            store
                .conn
                .execute("DELETE FROM events_integer WHERE day < ?1", params![day])?;
            store
                .conn
                .execute("DELETE FROM events_textual WHERE day < ?1", params![day])?;
            let envs = store.conn.execute(
                "DELETE FROM environments
                 WHERE id != ?1
                   AND id NOT IN (SELECT env_id FROM events_integer)
                   AND id NOT IN (SELECT env_id FROM events_textual)",
                params![current.0],
            )?;
            store.conn.execute(
                "DELETE FROM addons
                 WHERE id NOT IN (SELECT addons_id FROM environments)",
                [],
            )?;
            debug!(day, pruned_environments = envs, "pruned events before day");
            Ok(())
        })?;
        self.clear_env_cache();
        Ok(())
    }

    /// Delete the `count` oldest events across both value tables. Bounded
    /// pruning for storage-cap enforcement.
    pub fn delete_oldest_events(&self, count: usize) -> Result<usize> {
        self.in_transaction(|store| {
            let mut stmt = store.conn.prepare(
                "SELECT rowid, day, value_kind FROM (
                     SELECT rowid, day, 'integer' AS value_kind FROM events_integer
                     UNION ALL
                     SELECT rowid, day, 'textual' AS value_kind FROM events_textual
                 )
                 ORDER BY day ASC
                 LIMIT ?1",
            )?;
            let victims = stmt
                .query_map(params![count as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut deleted = 0;
            for (rowid, kind) in victims {
                let table = if kind == "integer" {
                    "events_integer"
                } else {
                    "events_textual"
                };
                deleted += store.conn.execute(
                    &format!("DELETE FROM {table} WHERE rowid = ?1"),
                    params![rowid],
                )?;
            }
            Ok(deleted)
        })
    }

    /// Delete the `count` oldest environments (never `keep`), cascading
    /// their events and any orphaned add-on sets.
    pub fn delete_oldest_environments(&self, count: usize, keep: EnvId) -> Result<usize> {
        let deleted = self.in_transaction(|store| {
            let victims = {
                let mut stmt = store.conn.prepare(
                    "SELECT id FROM environments WHERE id != ?1 ORDER BY id ASC LIMIT ?2",
                )?;
                let ids = stmt
                    .query_map(params![keep.0, count as i64], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            for id in &victims {
                store
                    .conn
                    .execute("DELETE FROM events_integer WHERE env_id = ?1", params![id])?;
                store
                    .conn
                    .execute("DELETE FROM events_textual WHERE env_id = ?1", params![id])?;
                store
                    .conn
                    .execute("DELETE FROM environments WHERE id = ?1", params![id])?;
            }
            store.conn.execute(
                "DELETE FROM addons
                 WHERE id NOT IN (SELECT addons_id FROM environments)",
                [],
            )?;
            Ok(victims.len())
        })?;
        self.clear_env_cache();
        Ok(deleted)
    }
}

fn check_env(env: EnvId) -> Result<()> {
    if env.0 > 0 {
        Ok(())
    } else {
        Err(StoreError::UnregisteredEnvironment)
    }
}

fn stringify(value: rusqlite::types::Value) -> String {
    match value {
        rusqlite::types::Value::Integer(n) => n.to_string(),
        rusqlite::types::Value::Real(f) => f.to_string(),
        rusqlite::types::Value::Text(s) => s,
        rusqlite::types::Value::Blob(_) | rusqlite::types::Value::Null => String::new(),
    }
}
