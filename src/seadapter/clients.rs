//! Collaborators the index session talks to.
//!
//! Data-node traffic is fire-and-forget: replies come back through the
//! dispatcher tagged with the session's tag. Catalog and search-engine calls
//! are synchronous and bounded by their own deadlines.

use crate::errors::CollaboratorError;
use crate::session::SessionTag;
use crate::wire::DataNodeRequest;
use serde_json::Value;
use std::time::Duration;

/// Sends requests to the data node holding the primary collection.
pub trait DataNodeClient: Send + Sync {
    fn send(&self, tag: SessionTag, request_id: u64, request: &DataNodeRequest) -> Result<(), CollaboratorError>;
}

/// Catalog metadata lookups.
pub trait CatalogClient: Send + Sync {
    /// Fetches the collection's current metadata version.
    fn refresh_version(&self, collection: &str, timeout: Duration) -> Result<i32, CollaboratorError>;
}

/// A connection to the search engine.
pub trait SearchEngine: Send {
    fn is_active(&self) -> bool;

    fn activate(&mut self) -> Result<(), CollaboratorError>;

    fn index_exists(&mut self, index: &str) -> Result<bool, CollaboratorError>;

    fn drop_index(&mut self, index: &str) -> Result<(), CollaboratorError>;

    /// `Ok(None)` when the document (or its index) does not exist.
    fn get_document(&mut self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>, CollaboratorError>;

    fn index_document(&mut self, index: &str, doc_type: &str, id: &str, body: &Value) -> Result<(), CollaboratorError>;

    /// Runs a newline-delimited bulk request.
    fn bulk(&mut self, index: &str, doc_type: &str, body: &str) -> Result<(), CollaboratorError>;
}

/// Pool of search engine connections.
pub trait SearchEngineProvider: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn SearchEngine>, CollaboratorError>;

    fn release(&self, client: Box<dyn SearchEngine>);
}
