//! Records read from the staging collection and the primary scan.

use super::bulk::BulkAction;
use super::meta::ID_FIELD;
use crate::errors::SessionError;
use serde_json::{Map, Value};

const TYPE_FIELD: &str = "Type";
const RID_FIELD: &str = "_rid";
const SOURCE_FIELD: &str = "_source";

/// Change kind recorded in a staging row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingOp {
    Insert,
    Delete,
    Update,
}

impl StagingOp {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Insert),
            2 => Some(Self::Delete),
            3 => Some(Self::Update),
            _ => None,
        }
    }
}

/// One change captured in the staging collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRecord {
    /// Monotonic position in the staging collection.
    pub logical_id: i64,
    pub op: StagingOp,
    /// `_id` of the primary document the change applies to.
    pub record_id: String,
    pub source: Value,
}

impl StagingRecord {
    pub fn parse(doc: &Value) -> Result<Self, SessionError> {
        let logical_id = doc
            .get(ID_FIELD)
            .and_then(Value::as_i64)
            .ok_or_else(|| SessionError::Structural(format!("staging record has no numeric {}", ID_FIELD)))?;

        let code = doc.get(TYPE_FIELD).and_then(Value::as_i64).unwrap_or(0);
        let op = StagingOp::from_code(code).ok_or_else(|| {
            SessionError::Structural(format!("staging record {} has invalid type {}", logical_id, code))
        })?;

        let record_id = match doc.get(RID_FIELD).and_then(Value::as_str) {
            Some(rid) if !rid.is_empty() => rid.to_string(),
            _ => {
                return Err(SessionError::Structural(format!(
                    "staging record {} has no {}",
                    logical_id, RID_FIELD
                )))
            }
        };

        let source = match doc.get(SOURCE_FIELD) {
            None => Value::Object(Map::new()),
            Some(source @ Value::Object(_)) => source.clone(),
            Some(_) => {
                return Err(SessionError::Structural(format!(
                    "staging record {} has a non-object {}",
                    logical_id, SOURCE_FIELD
                )))
            }
        };

        Ok(Self {
            logical_id,
            op,
            record_id,
            source,
        })
    }

    pub fn to_action(&self) -> BulkAction {
        match self.op {
            StagingOp::Insert => BulkAction::Index {
                id: self.record_id.clone(),
                source: self.source.clone(),
            },
            StagingOp::Update => BulkAction::Update {
                id: self.record_id.clone(),
                source: self.source.clone(),
            },
            StagingOp::Delete => BulkAction::Delete {
                id: self.record_id.clone(),
            },
        }
    }
}

/// Builds the index action for a row of the primary scan.
///
/// The search document id is the primary `_id` rendered as a string; object
/// ids use their hex form.
pub fn primary_action(doc: &Value) -> Result<BulkAction, SessionError> {
    let Value::Object(fields) = doc else {
        return Err(SessionError::Structural("primary row is not an object".to_string()));
    };
    let id = match fields.get(ID_FIELD) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::Object(oid)) => match oid.get("$oid").and_then(Value::as_str) {
            Some(hex) => hex.to_string(),
            None => return Err(SessionError::Structural("unsupported _id object".to_string())),
        },
        _ => return Err(SessionError::Structural(format!("primary row has no {}", ID_FIELD))),
    };

    let mut source = fields.clone();
    source.remove(ID_FIELD);
    Ok(BulkAction::Index {
        id,
        source: Value::Object(source),
    })
}
