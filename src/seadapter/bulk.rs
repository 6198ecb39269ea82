//! Search-engine bulk requests.
//!
//! Actions are keyed by the original document id, so replaying a batch that
//! was already applied leaves the index unchanged.

use super::clients::SearchEngine;
use crate::errors::{SessionError, WireError};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Create or replace the whole document.
    Index { id: String, source: Value },
    /// Merge into the document, creating it if missing.
    Update { id: String, source: Value },
    Delete { id: String },
}

impl BulkAction {
    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Update { id, .. } | Self::Delete { id } => id,
        }
    }

    /// Renders the action as bulk body lines, each ending in a newline.
    pub fn render(&self, index: &str, doc_type: &str) -> Result<String, WireError> {
        let target = json!({ "_index": index, "_type": doc_type, "_id": self.id() });
        let mut out = String::new();
        match self {
            Self::Index { source, .. } => {
                push_line(&mut out, &json!({ "index": target }))?;
                push_line(&mut out, source)?;
            }
            Self::Update { source, .. } => {
                push_line(&mut out, &json!({ "update": target }))?;
                push_line(&mut out, &json!({ "doc": source, "doc_as_upsert": true }))?;
            }
            Self::Delete { .. } => {
                push_line(&mut out, &json!({ "delete": target }))?;
            }
        }
        Ok(out)
    }
}

fn push_line(out: &mut String, value: &Value) -> Result<(), WireError> {
    out.push_str(&serde_json::to_string(value)?);
    out.push('\n');
    Ok(())
}

/// Size-bounded bulk body that flushes itself when the next action would not fit.
pub struct BulkBuffer {
    index: String,
    doc_type: String,
    capacity: usize,
    body: String,
    pending: usize,
}

impl BulkBuffer {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>, capacity: usize) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            capacity,
            body: String::new(),
            pending: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.pending = 0;
    }

    /// Appends an action, sending the buffered body first if the action
    /// would push it past capacity. An action larger than the capacity is
    /// sent on its own.
    pub fn push(&mut self, action: &BulkAction, engine: &mut dyn SearchEngine) -> Result<(), SessionError> {
        let lines = action.render(&self.index, &self.doc_type)?;
        if !self.body.is_empty() && self.body.len() + lines.len() > self.capacity {
            self.flush(engine)?;
        }
        self.body.push_str(&lines);
        self.pending += 1;
        Ok(())
    }

    /// Sends whatever is buffered.
    pub fn finish(&mut self, engine: &mut dyn SearchEngine) -> Result<(), SessionError> {
        if self.body.is_empty() {
            return Ok(());
        }
        self.flush(engine)
    }

    fn flush(&mut self, engine: &mut dyn SearchEngine) -> Result<(), SessionError> {
        tracing::debug!(index = %self.index, actions = self.pending, bytes = self.body.len(), "Sending bulk request");
        engine
            .bulk(&self.index, &self.doc_type, &self.body)
            .map_err(SessionError::Search)?;
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemorySearchEngine;

    #[test]
    fn test_update_renders_as_upsert() {
        let action = BulkAction::Update {
            id: "a".to_string(),
            source: json!({"title": "x"}),
        };
        let rendered = action.render("idx", "doc").expect("render");
        let lines: Vec<Value> = rendered
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();

        assert_eq!(lines[0], json!({"update": {"_index": "idx", "_type": "doc", "_id": "a"}}));
        assert_eq!(lines[1], json!({"doc": {"title": "x"}, "doc_as_upsert": true}));
    }

    #[test]
    fn test_delete_has_no_source_line() {
        let action = BulkAction::Delete { id: "a".to_string() };
        let rendered = action.render("idx", "doc").expect("render");
        assert_eq!(rendered.lines().count(), 1);
    }

    #[test]
    fn test_buffer_flushes_before_overflowing() {
        let engine_state = MemorySearchEngine::shared();
        let mut engine = engine_state.client();
        let action = BulkAction::Index {
            id: "doc-1".to_string(),
            source: json!({"title": "hello"}),
        };
        let one = action.render("idx", "doc").expect("render").len();
        let mut buffer = BulkBuffer::new("idx", "doc", one * 2);

        for i in 0..5 {
            let action = BulkAction::Index {
                id: format!("doc-{}", i),
                source: json!({"title": "hello"}),
            };
            buffer.push(&action, &mut engine).expect("push");
        }
        assert_eq!(engine_state.bulk_calls(), 2);
        assert_eq!(buffer.pending(), 1);

        buffer.finish(&mut engine).expect("finish");
        assert_eq!(engine_state.bulk_calls(), 3);
        assert!(buffer.is_empty());
        assert_eq!(engine_state.document_count("idx"), 5);
    }

    #[test]
    fn test_oversized_action_is_sent_alone() {
        let engine_state = MemorySearchEngine::shared();
        let mut engine = engine_state.client();
        let mut buffer = BulkBuffer::new("idx", "doc", 8);

        let action = BulkAction::Index {
            id: "big".to_string(),
            source: json!({"title": "much longer than eight bytes"}),
        };
        buffer.push(&action, &mut engine).expect("push");
        assert_eq!(engine_state.bulk_calls(), 0);
        buffer.finish(&mut engine).expect("finish");
        assert_eq!(engine_state.bulk_calls(), 1);
    }
}
