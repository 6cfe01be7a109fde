//! Measurement/field catalog.
//!
//! A measurement is a named, versioned group of fields. Once a
//! (name, version) pair is initialized its field set is permanent; schema
//! changes bump the version. Exactly one version per name is current: the
//! highest, since versions only move forward.
//!
//! Field metadata is cached in bulk behind a dedicated lock. The cache is
//! invalidated after initialization and rebuilt lazily on the next lookup;
//! concurrent readers may briefly see the stale snapshot, which the engine
//! tolerates.

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::{integrity, Result, StoreError};
use crate::ids::{FieldId, MeasurementId};
use crate::storage::{FieldCache, PulseStore};
use crate::values::{AccumKind, FieldInfo, FieldSpec, ValueType};

/// One measurement with its declared fields, for catalog listings.
#[derive(Debug, Clone)]
pub struct MeasurementListing {
    pub id: MeasurementId,
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

impl PulseStore {
    /// Currently-active version of a measurement, or 0 if never registered.
    pub fn current_measurement_version(&self, name: &str) -> Result<u32> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM current_measurements WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0) as u32)
    }

    /// Initialize a measurement version with its field set.
    ///
    /// Idempotent: a no-op when this version is already current. Otherwise
    /// the measurement row and every field row are inserted in one atomic
    /// unit, and the field cache is invalidated for lazy rebuild.
    pub fn ensure_measurement(&self, name: &str, version: u32, fields: &[FieldSpec]) -> Result<()> {
        if self.current_measurement_version(name)? == version {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO measurements (name, version) VALUES (?1, ?2)",
            params![name, version],
        )
        .map_err(integrity)?;
        let measurement_id = tx.last_insert_rowid();
        for field in fields {
            tx.execute(
                "INSERT INTO fields (measurement_id, name, value_type, accum_kind)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    measurement_id,
                    field.name,
                    field.value_type.code(),
                    field.kind.code()
                ],
            )
            .map_err(integrity)?;
        }
        tx.commit()?;

        // A lookup cached before this call may now be stale.
        self.invalidate_field_cache();
        debug!(name, version, fields = fields.len(), "measurement initialized");
        Ok(())
    }

    /// Field metadata by (measurement name, measurement version, field name).
    ///
    /// A miss after a warm cache scan means the field was never declared:
    /// that is a programming error upstream and fails loudly.
    pub fn field_for(&self, measurement: &str, version: u32, field: &str) -> Result<FieldInfo> {
        self.ensure_field_cache()?;
        let cache = self
            .field_cache
            .read()
            .map_err(|_| StoreError::SchemaIntegrity("field cache poisoned".to_string()))?;
        let key = (measurement.to_string(), version, field.to_string());
        cache
            .as_ref()
            .and_then(|c| c.by_key.get(&key))
            .and_then(|id| cache.as_ref().and_then(|c| c.by_id.get(id)))
            .cloned()
            .ok_or_else(|| StoreError::UnknownField {
                measurement: measurement.to_string(),
                version,
                field: field.to_string(),
            })
    }

    /// Field metadata by id; used when resolving events back to names.
    pub fn field_by_id(&self, id: FieldId) -> Result<FieldInfo> {
        self.ensure_field_cache()?;
        let cache = self
            .field_cache
            .read()
            .map_err(|_| StoreError::SchemaIntegrity("field cache poisoned".to_string()))?;
        cache
            .as_ref()
            .and_then(|c| c.by_id.get(&id))
            .cloned()
            .ok_or(StoreError::UnknownFieldId(id))
    }

    /// Snapshot of the whole field catalog, keyed by field id.
    pub fn all_fields(&self) -> Result<std::collections::HashMap<FieldId, FieldInfo>> {
        self.ensure_field_cache()?;
        let cache = self
            .field_cache
            .read()
            .map_err(|_| StoreError::SchemaIntegrity("field cache poisoned".to_string()))?;
        Ok(cache.as_ref().map(|c| c.by_id.clone()).unwrap_or_default())
    }

    /// Every measurement version with its field declarations.
    pub fn measurement_listings(&self) -> Result<Vec<MeasurementListing>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, version FROM measurements ORDER BY name, version",
        )?;
        let measurements = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(measurements.len());
        let mut field_stmt = self.conn.prepare(
            "SELECT name, value_type, accum_kind FROM fields
             WHERE measurement_id = ?1 ORDER BY id",
        )?;
        for (id, name, version) in measurements {
            let fields = field_stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut specs = Vec::with_capacity(fields.len());
            for (fname, vt, kind) in fields {
                specs.push(FieldSpec {
                    name: fname.clone(),
                    value_type: decode_value_type(&vt, &fname)?,
                    kind: decode_accum_kind(&kind, &fname)?,
                });
            }
            out.push(MeasurementListing {
                id: MeasurementId(id),
                name,
                version: version as u32,
                fields: specs,
            });
        }
        Ok(out)
    }

    /// Populate the field cache by scanning the full catalog once. Cheap
    /// relative to per-field queries; repeated lookups are then O(1).
    fn ensure_field_cache(&self) -> Result<()> {
        {
            let cache = self
                .field_cache
                .read()
                .map_err(|_| StoreError::SchemaIntegrity("field cache poisoned".to_string()))?;
            if cache.is_some() {
                return Ok(());
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT field_id, field_name, value_type, accum_kind,
                    measurement_id, measurement_name, measurement_version
             FROM named_fields",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut fresh = FieldCache::default();
        for (fid, fname, vt, kind, mid, mname, mversion) in rows {
            let info = FieldInfo {
                id: FieldId(fid),
                measurement_id: MeasurementId(mid),
                measurement_name: mname.clone(),
                measurement_version: mversion as u32,
                name: fname.clone(),
                value_type: decode_value_type(&vt, &fname)?,
                kind: decode_accum_kind(&kind, &fname)?,
            };
            fresh
                .by_key
                .insert((mname, mversion as u32, fname), info.id);
            fresh.by_id.insert(info.id, info);
        }
        debug!(fields = fresh.by_id.len(), "field cache rebuilt");

        let mut cache = self
            .field_cache
            .write()
            .map_err(|_| StoreError::SchemaIntegrity("field cache poisoned".to_string()))?;
        // Another thread may have rebuilt it meanwhile; last write wins,
        // both snapshots are equally fresh.
        *cache = Some(fresh);
        Ok(())
    }
}

fn decode_value_type(code: &str, field: &str) -> Result<ValueType> {
    ValueType::from_code(code).ok_or_else(|| {
        StoreError::SchemaIntegrity(format!("field '{field}' has unknown value type '{code}'"))
    })
}

fn decode_accum_kind(code: &str, field: &str) -> Result<AccumKind> {
    AccumKind::from_code(code).ok_or_else(|| {
        StoreError::SchemaIntegrity(format!(
            "field '{field}' has unknown accumulation kind '{code}'"
        ))
    })
}
