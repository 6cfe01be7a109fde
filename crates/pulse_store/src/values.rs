//! Field metadata and the tagged value union.
//!
//! A field combines a value type (what shape a recorded value has) with an
//! accumulation kind (how repeated values for one day merge). The two are a
//! plain struct of closed enums; call sites match exhaustively instead of
//! testing flag bits.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::ids::{FieldId, MeasurementId};

/// Shape of a recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Text,
    Json,
}

impl ValueType {
    /// Stable code persisted in the `fields` table.
    pub fn code(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Text => "text",
            ValueType::Json => "json",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "int" => Some(ValueType::Int),
            "text" => Some(ValueType::Text),
            "json" => Some(ValueType::Json),
            _ => None,
        }
    }
}

/// How repeated values for one (day, environment, field) merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumKind {
    /// Last observed value wins; at most one row per day.
    Last,
    /// Every occurrence is kept as its own row, in write order.
    DiscreteAppend,
    /// Every occurrence is kept; the document tallies values into named
    /// buckets instead of emitting them verbatim.
    DiscreteCounted,
    /// Integer accumulator; at most one row per day, incremented in place.
    Counter,
}

impl AccumKind {
    /// Stable code persisted in the `fields` table.
    pub fn code(self) -> &'static str {
        match self {
            AccumKind::Last => "last",
            AccumKind::DiscreteAppend => "discrete",
            AccumKind::DiscreteCounted => "counted",
            AccumKind::Counter => "counter",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "last" => Some(AccumKind::Last),
            "discrete" => Some(AccumKind::DiscreteAppend),
            "counted" => Some(AccumKind::DiscreteCounted),
            "counter" => Some(AccumKind::Counter),
            _ => None,
        }
    }
}

/// One recorded value, passed uniformly into the event-write operations.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValue::Int(_) => ValueType::Int,
            FieldValue::Text(_) => ValueType::Text,
            FieldValue::Json(_) => ValueType::Json,
        }
    }

    /// Textual storage form for the `events_textual` table.
    pub(crate) fn to_storage_text(&self) -> Option<String> {
        match self {
            FieldValue::Int(_) => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// Declaration of one field within a measurement version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub value_type: ValueType,
    pub kind: AccumKind,
}

impl FieldSpec {
    pub fn new(name: &str, value_type: ValueType, kind: AccumKind) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            kind,
        }
    }
}

/// Fully resolved field metadata, as cached by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub id: FieldId,
    pub measurement_id: MeasurementId,
    pub measurement_name: String,
    pub measurement_version: u32,
    pub name: String,
    pub value_type: ValueType,
    pub kind: AccumKind,
}

impl FieldInfo {
    /// Central type check applied once per write, not per call site.
    pub(crate) fn check_value(&self, value: &FieldValue) -> Result<()> {
        let got = value.value_type();
        if got == self.value_type {
            Ok(())
        } else {
            Err(StoreError::TypeMismatch {
                field: self.name.clone(),
                declared: self.value_type.code(),
                got: got.code(),
            })
        }
    }

    /// Reject an operation that does not match the declared accumulation kind.
    pub(crate) fn check_kind(&self, allowed: &[AccumKind], required: &'static str) -> Result<()> {
        if allowed.contains(&self.kind) {
            Ok(())
        } else {
            Err(StoreError::KindMismatch {
                field: self.name.clone(),
                kind: self.kind.code(),
                required,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{FieldId, MeasurementId};

    fn info(value_type: ValueType, kind: AccumKind) -> FieldInfo {
        FieldInfo {
            id: FieldId(1),
            measurement_id: MeasurementId(1),
            measurement_name: "m".to_string(),
            measurement_version: 1,
            name: "f".to_string(),
            value_type,
            kind,
        }
    }

    #[test]
    fn codes_round_trip() {
        for vt in [ValueType::Int, ValueType::Text, ValueType::Json] {
            assert_eq!(ValueType::from_code(vt.code()), Some(vt));
        }
        for k in [
            AccumKind::Last,
            AccumKind::DiscreteAppend,
            AccumKind::DiscreteCounted,
            AccumKind::Counter,
        ] {
            assert_eq!(AccumKind::from_code(k.code()), Some(k));
        }
        assert_eq!(ValueType::from_code("bogus"), None);
        assert_eq!(AccumKind::from_code("bogus"), None);
    }

    #[test]
    fn type_check_rejects_mismatch() {
        let f = info(ValueType::Int, AccumKind::Last);
        assert!(f.check_value(&FieldValue::Int(3)).is_ok());
        let err = f
            .check_value(&FieldValue::Text("nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn kind_check_rejects_wrong_operation() {
        let f = info(ValueType::Int, AccumKind::Counter);
        assert!(f.check_kind(&[AccumKind::Counter], "counter").is_ok());
        let err = f.check_kind(&[AccumKind::Last], "last").unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
    }

    #[test]
    fn json_storage_text_is_compact() {
        let v = FieldValue::Json(serde_json::json!({"a": 1}));
        assert_eq!(v.to_storage_text().unwrap(), r#"{"a":1}"#);
        assert_eq!(FieldValue::Int(5).to_storage_text(), None);
    }
}
