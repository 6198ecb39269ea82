//! Search adapter: replays a collection into a search engine index.

mod bulk;
mod clients;
mod factory;
mod index_session;
mod meta;
mod staging;

pub use bulk::{BulkAction, BulkBuffer};
pub use clients::{CatalogClient, DataNodeClient, SearchEngine, SearchEngineProvider};
pub use factory::{start_index_session, IndexSessionFactory};
pub use index_session::{IndexPhase, IndexSession, IndexSyncDeps, CHECKPOINT_DOC_ID};
pub use meta::IndexMeta;
pub use staging::{primary_action, StagingOp, StagingRecord};

#[cfg(test)]
#[path = "tests/index_session_tests.rs"]
mod index_session_tests;
