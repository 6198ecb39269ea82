use super::index_session::{IndexSession, IndexSyncDeps};
use super::meta::IndexMeta;
use crate::config::IndexSyncConfig;
use crate::errors::RegistryError;
use crate::registry::{SessionFactory, SessionHint, SessionInit, SessionRef, SessionRegistry};
use crate::session::{MessageMap, Session, SessionType};
use std::sync::Arc;

/// Builds [`IndexSession`]s from an [`IndexMeta`] carried in the session hint.
pub struct IndexSessionFactory {
    settings: IndexSyncConfig,
    deps: IndexSyncDeps,
    handlers: Arc<MessageMap<IndexSession>>,
}

impl IndexSessionFactory {
    pub fn new(settings: IndexSyncConfig, deps: IndexSyncDeps) -> Self {
        Self {
            settings,
            deps,
            handlers: Arc::new(IndexSession::handlers()),
        }
    }
}

impl SessionFactory for IndexSessionFactory {
    fn create(&self, init: SessionInit<'_>) -> Result<Box<dyn Session>, RegistryError> {
        let params = init
            .params
            .ok_or_else(|| RegistryError::Create("index session needs index metadata".to_string()))?;
        let meta: IndexMeta = serde_json::from_value(params.clone())
            .map_err(|err| RegistryError::Create(format!("invalid index metadata: {}", err)))?;

        Ok(Box::new(IndexSession::new(
            init.key,
            meta,
            self.settings.clone(),
            self.deps.clone(),
            Arc::clone(&self.handlers),
        )))
    }
}

/// Starts the background sync session for one text index.
pub async fn start_index_session(registry: &SessionRegistry, meta: &IndexMeta) -> Result<SessionRef, RegistryError> {
    let params = serde_json::to_value(meta).map_err(|err| RegistryError::Create(err.to_string()))?;
    let session = registry
        .start_active(&SessionHint::new(SessionType::SearchIndex, params))
        .await?;
    tracing::info!(
        session = %session.key(),
        collection = %meta.collection,
        index = %meta.search_index,
        "Index sync session started"
    );
    Ok(session)
}
