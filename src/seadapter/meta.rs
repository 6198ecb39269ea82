use crate::errors::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const ID_FIELD: &str = "_id";

/// Describes one text index and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Full name of the primary collection.
    pub collection: String,
    /// Name of the text index on the primary collection.
    pub index_name: String,
    /// Capped collection receiving the change records.
    pub staging_collection: String,
    pub search_index: String,
    pub search_type: String,
    /// Fields covered by the text index.
    pub fields: Vec<String>,
}

impl IndexMeta {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.fields.is_empty() {
            return Err(SessionError::Structural(format!(
                "text index {} has no fields",
                self.index_name
            )));
        }
        if self.fields.iter().any(|field| field == ID_FIELD) {
            return Err(SessionError::Structural(format!(
                "text index {} must not include {}",
                self.index_name, ID_FIELD
            )));
        }
        Ok(())
    }

    /// Matches rows carrying at least one indexed field.
    pub fn primary_condition(&self) -> Value {
        let clauses: Vec<Value> = self
            .fields
            .iter()
            .map(|field| {
                let mut clause = Map::new();
                clause.insert(field.clone(), json!({ "$exists": 1 }));
                Value::Object(clause)
            })
            .collect();
        json!({ "$or": clauses })
    }

    /// Projects `_id` plus the indexed fields.
    pub fn primary_selector(&self) -> Value {
        let mut selector = Map::new();
        selector.insert(ID_FIELD.to_string(), json!({ "$include": 1 }));
        for field in &self.fields {
            selector.insert(field.clone(), json!({ "$include": 1 }));
        }
        Value::Object(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(fields: &[&str]) -> IndexMeta {
        IndexMeta {
            collection: "cs.cl".to_string(),
            index_name: "text_idx".to_string(),
            staging_collection: "cs_capped.cl".to_string(),
            search_index: "cs_cl_text_idx".to_string(),
            search_type: "doc".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_query_shape_covers_every_field() {
        let meta = meta(&["title", "body"]);

        assert_eq!(
            meta.primary_condition(),
            json!({"$or": [{"title": {"$exists": 1}}, {"body": {"$exists": 1}}]})
        );
        assert_eq!(
            meta.primary_selector(),
            json!({"_id": {"$include": 1}, "title": {"$include": 1}, "body": {"$include": 1}})
        );
    }

    #[test]
    fn test_empty_or_id_index_is_invalid() {
        assert!(meta(&[]).validate().is_err());
        assert!(meta(&["title", "_id"]).validate().is_err());
        assert!(meta(&["title"]).validate().is_ok());
    }
}
