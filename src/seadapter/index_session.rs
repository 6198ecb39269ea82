//! Background session keeping one search index in sync with its collection.
//!
//! The session first agrees with the search engine on where to resume
//! (`Consult`), optionally rescans the whole primary collection, then tails the
//! staging collection forever. Every step is a fire-and-forget request to the
//! data node; the reply comes back through the dispatcher and lands in one of
//! the handlers registered in [`IndexSession::handlers`]. Timer ticks restart
//! scans that are idle.

use super::bulk::{BulkAction, BulkBuffer};
use super::clients::{CatalogClient, DataNodeClient, SearchEngine, SearchEngineProvider};
use super::meta::{IndexMeta, ID_FIELD};
use super::staging::{primary_action, StagingRecord};
use crate::config::IndexSyncConfig;
use crate::errors::{CollaboratorError, SessionError};
use crate::failure::{FailureKind, RecoveryAction};
use crate::session::{ExecContext, MessageMap, NetHandle, Session, SessionKey, SessionType};
use crate::structured_logger::SessionJournal;
use crate::timer::TimerId;
use crate::wire::{
    DataNodeRequest, Envelope, OpCode, OpReply, ReplyClass, FLG_QUERY_WITH_RETURNDATA, NO_CONTEXT,
};
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Reserved id of the checkpoint marker document in the search index.
pub const CHECKPOINT_DOC_ID: &str = "SDB_SEADPT_COMMIT_ID";

const CHECKPOINT_FIELD: &str = "_lid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Begin,
    Consult,
    QueryLastCheckpoint,
    CompareCheckpoint,
    QueryPrimaryTable,
    QueryStagingTable,
    PopStaging,
}

impl Display for IndexPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Begin => "begin",
            Self::Consult => "consult",
            Self::QueryLastCheckpoint => "query_last_checkpoint",
            Self::CompareCheckpoint => "compare_checkpoint",
            Self::QueryPrimaryTable => "query_primary_table",
            Self::QueryStagingTable => "query_staging_table",
            Self::PopStaging => "pop_staging",
        };
        write!(f, "{}", name)
    }
}

/// Collaborators shared by every index session of a node.
#[derive(Clone)]
pub struct IndexSyncDeps {
    pub data_node: Arc<dyn DataNodeClient>,
    pub catalog: Arc<dyn CatalogClient>,
    pub provider: Arc<dyn SearchEngineProvider>,
    pub journal: Option<Arc<SessionJournal>>,
}

pub struct IndexSession {
    key: SessionKey,
    name: String,
    exec: Arc<ExecContext>,
    meta: IndexMeta,
    settings: IndexSyncConfig,
    deps: IndexSyncDeps,
    handlers: Arc<MessageMap<IndexSession>>,
    search: Option<Box<dyn SearchEngine>>,
    bulk: BulkBuffer,
    condition: Value,
    selector: Value,
    phase: IndexPhase,
    source_version: i32,
    /// Resume point agreed during `Consult`, written as the checkpoint when
    /// the primary scan ends.
    expected_lid: i64,
    /// Staging records up to here may be popped.
    last_pop_lid: i64,
    query_context_id: i64,
    query_busy: bool,
    quit: bool,
    next_request_id: u64,
}

fn no_search_client() -> SessionError {
    SessionError::Search(CollaboratorError::Unavailable("no search engine client".to_string()))
}

impl IndexSession {
    pub fn new(
        key: SessionKey,
        meta: IndexMeta,
        settings: IndexSyncConfig,
        deps: IndexSyncDeps,
        handlers: Arc<MessageMap<IndexSession>>,
    ) -> Self {
        let bulk = BulkBuffer::new(
            meta.search_index.clone(),
            meta.search_type.clone(),
            settings.bulk_buffer_bytes,
        );
        Self {
            key,
            name: format!("search-index:{}/{}", meta.collection, meta.index_name),
            exec: Arc::new(ExecContext::new()),
            meta,
            settings,
            deps,
            handlers,
            search: None,
            bulk,
            condition: Value::Null,
            selector: Value::Null,
            phase: IndexPhase::Consult,
            source_version: -1,
            expected_lid: -1,
            last_pop_lid: -1,
            query_context_id: NO_CONTEXT,
            query_busy: false,
            quit: false,
            next_request_id: 1,
        }
    }

    /// Reply handlers, built once per node.
    pub fn handlers() -> MessageMap<IndexSession> {
        MessageMap::new()
            .on(OpCode::QueryResponse, Self::handle_query_reply)
            .on(OpCode::GetMoreResponse, Self::handle_getmore_reply)
            .on(OpCode::KillContextResponse, Self::handle_kill_context_reply)
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn phase(&self) -> IndexPhase {
        self.phase
    }

    pub fn expected_lid(&self) -> i64 {
        self.expected_lid
    }

    pub fn last_pop_lid(&self) -> i64 {
        self.last_pop_lid
    }

    pub fn source_version(&self) -> i32 {
        self.source_version
    }

    pub fn is_query_busy(&self) -> bool {
        self.query_busy
    }

    pub fn is_quit(&self) -> bool {
        self.quit
    }

    fn switch(&mut self, to: IndexPhase) {
        if self.phase == to {
            return;
        }
        tracing::debug!(session = %self.key, from = %self.phase, to = %to, "Index session phase change");
        if let Some(journal) = &self.deps.journal {
            journal.log_phase_transition(self.key, &self.phase.to_string(), &to.to_string());
        }
        self.phase = to;
    }

    fn send(&mut self, request: &DataNodeRequest, request_id: Option<u64>) -> Result<(), SessionError> {
        let request_id = match request_id {
            Some(id) => id,
            None => {
                let id = self.next_request_id;
                self.next_request_id += 1;
                id
            }
        };
        self.deps.data_node.send(self.key.tag(), request_id, request)?;
        Ok(())
    }

    fn send_getmore(&mut self, context_id: i64, request_id: Option<u64>) -> Result<(), SessionError> {
        let request = DataNodeRequest::GetMore {
            context_id,
            num_to_return: self.settings.getmore_batch,
        };
        self.send(&request, request_id)
    }

    /// Asks for the newest staging record id only.
    fn query_newest_staging_id(&mut self) -> Result<(), SessionError> {
        let request = DataNodeRequest::Query {
            collection: self.meta.staging_collection.clone(),
            condition: None,
            selector: Some(json!({ ID_FIELD: "" })),
            order_by: Some(json!({ ID_FIELD: -1 })),
            skip: 0,
            limit: 1,
            flags: FLG_QUERY_WITH_RETURNDATA,
            version: -1,
        };
        self.send(&request, None)
    }

    fn query_primary(&mut self) -> Result<(), SessionError> {
        let request = DataNodeRequest::Query {
            collection: self.meta.collection.clone(),
            condition: Some(self.condition.clone()),
            selector: Some(self.selector.clone()),
            order_by: None,
            skip: 0,
            limit: -1,
            flags: 0,
            version: self.source_version,
        };
        self.send(&request, None)
    }

    fn query_staging(&mut self) -> Result<(), SessionError> {
        let condition = (self.last_pop_lid >= 0).then(|| json!({ ID_FIELD: { "$gt": self.last_pop_lid } }));
        let request = DataNodeRequest::Query {
            collection: self.meta.staging_collection.clone(),
            condition,
            selector: None,
            order_by: Some(json!({ ID_FIELD: 1 })),
            skip: 0,
            limit: -1,
            flags: 0,
            version: -1,
        };
        self.send(&request, None)
    }

    fn pop_staging(&mut self, logical_id: i64) -> Result<(), SessionError> {
        let request = DataNodeRequest::Pop {
            collection: self.meta.staging_collection.clone(),
            logical_id,
            direction: 1,
        };
        self.send(&request, None)
    }

    fn refresh_version(&mut self) -> Result<(), SessionError> {
        let version = self
            .deps
            .catalog
            .refresh_version(&self.meta.collection, self.settings.catalog_timeout())?;
        if version != self.source_version {
            tracing::debug!(
                session = %self.key,
                collection = %self.meta.collection,
                from = self.source_version,
                to = version,
                "Collection version refreshed"
            );
        }
        self.source_version = version;
        Ok(())
    }

    fn ensure_search(&mut self) -> Result<(), SessionError> {
        match self.search.as_mut() {
            Some(client) if client.is_active() => Ok(()),
            Some(client) => client.activate().map_err(SessionError::Search),
            None => {
                let client = self.deps.provider.acquire().map_err(SessionError::Search)?;
                self.search = Some(client);
                Ok(())
            }
        }
    }

    /// Sends `actions` as bulk requests bounded by the buffer capacity.
    fn apply_actions(&mut self, actions: &[BulkAction]) -> Result<(), SessionError> {
        self.ensure_search()?;
        let engine = self.search.as_deref_mut().ok_or_else(no_search_client)?;
        self.bulk.clear();
        for action in actions {
            self.bulk.push(action, engine)?;
        }
        self.bulk.finish(engine)
    }

    fn mark_progress(&mut self, logical_id: i64) -> Result<(), SessionError> {
        self.ensure_search()?;
        let Self { search, meta, .. } = &mut *self;
        let engine = search.as_deref_mut().ok_or_else(no_search_client)?;
        engine
            .index_document(
                &meta.search_index,
                &meta.search_type,
                CHECKPOINT_DOC_ID,
                &json!({ CHECKPOINT_FIELD: logical_id }),
            )
            .map_err(SessionError::Search)?;
        tracing::debug!(session = %self.key, logical_id, "Checkpoint written");
        Ok(())
    }

    fn drop_search_index(&mut self) -> Result<(), SessionError> {
        self.ensure_search()?;
        let Self { search, meta, .. } = &mut *self;
        let engine = search.as_deref_mut().ok_or_else(no_search_client)?;
        if engine.index_exists(&meta.search_index).map_err(SessionError::Search)? {
            engine.drop_index(&meta.search_index).map_err(SessionError::Search)?;
            tracing::info!(session = %self.key, index = %self.meta.search_index, "Search index dropped");
        }
        Ok(())
    }

    fn drop_search_index_logged(&mut self) {
        if let Err(err) = self.drop_search_index() {
            tracing::warn!(session = %self.key, index = %self.meta.search_index, "Failed to drop search index: {}", err);
        }
    }

    /// Decides where to resume from the index state and the checkpoint marker.
    fn consult(&mut self) -> Result<(), SessionError> {
        self.ensure_search()?;
        let marker = {
            let Self { search, meta, .. } = &mut *self;
            let engine = search.as_deref_mut().ok_or_else(no_search_client)?;
            if engine.index_exists(&meta.search_index).map_err(SessionError::Search)? {
                let marker = engine
                    .get_document(&meta.search_index, &meta.search_type, CHECKPOINT_DOC_ID)
                    .map_err(SessionError::Search)?;
                if marker.is_none() {
                    // Interrupted in the middle of a primary scan.
                    engine.drop_index(&meta.search_index).map_err(SessionError::Search)?;
                }
                marker
            } else {
                None
            }
        };

        match marker {
            None => {
                tracing::info!(session = %self.key, index = %self.meta.search_index, "No usable index, starting full sync");
                self.query_newest_staging_id()?;
                self.switch(IndexPhase::QueryLastCheckpoint);
            }
            Some(marker) => {
                let expected = marker.get(CHECKPOINT_FIELD).and_then(Value::as_i64).ok_or_else(|| {
                    SessionError::Structural(format!("checkpoint marker has no numeric {}", CHECKPOINT_FIELD))
                })?;
                tracing::info!(session = %self.key, expected, "Resuming from checkpoint");
                self.expected_lid = expected;
                self.query_newest_staging_id()?;
                self.switch(IndexPhase::CompareCheckpoint);
            }
        }
        self.query_busy = true;
        Ok(())
    }

    fn tick(&mut self) -> Result<(), SessionError> {
        match self.phase {
            IndexPhase::Begin => {
                self.refresh_version()?;
                self.query_busy = false;
                self.switch(IndexPhase::QueryPrimaryTable);
            }
            IndexPhase::Consult => self.consult()?,
            IndexPhase::QueryPrimaryTable if !self.query_busy => {
                self.refresh_version()?;
                self.query_primary()?;
                self.query_busy = true;
            }
            IndexPhase::QueryStagingTable if !self.query_busy => {
                self.query_staging()?;
                self.query_busy = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_query_reply(&mut self, _handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError> {
        let reply = OpReply::decode(envelope)?;
        match reply.flags.class() {
            ReplyClass::Ok => {}
            ReplyClass::EndOfCursor => return self.on_query_end_of_cursor(),
            ReplyClass::NotExist => {
                self.on_source_dropped();
                return Ok(());
            }
            ReplyClass::NotPrimary => {
                self.terminate(false, "not primary");
                return Ok(());
            }
            ReplyClass::Failed(status) => return Err(SessionError::Status(status)),
        }

        match self.phase {
            IndexPhase::QueryLastCheckpoint => self.apply_last_checkpoint(reply.docs.first()),
            IndexPhase::CompareCheckpoint => self.compare_checkpoint(reply.docs.first()),
            IndexPhase::PopStaging => {
                // Keep pulling from the scan that was running before the pop.
                self.switch(IndexPhase::QueryStagingTable);
                self.send_getmore(self.query_context_id, Some(envelope.header.request_id))
            }
            IndexPhase::QueryPrimaryTable | IndexPhase::QueryStagingTable => {
                self.query_context_id = reply.context_id;
                self.send_getmore(reply.context_id, Some(envelope.header.request_id))
            }
            phase => Err(SessionError::UnexpectedReply {
                op_code: envelope.header.op_code,
                phase: phase.to_string(),
            }),
        }
    }

    fn on_query_end_of_cursor(&mut self) -> Result<(), SessionError> {
        match self.phase {
            IndexPhase::QueryLastCheckpoint => self.apply_last_checkpoint(None)?,
            IndexPhase::CompareCheckpoint => self.compare_checkpoint(None)?,
            IndexPhase::QueryPrimaryTable => self.finish_primary_scan()?,
            IndexPhase::QueryStagingTable => self.query_busy = false,
            IndexPhase::PopStaging => {
                self.query_busy = false;
                self.switch(IndexPhase::QueryStagingTable);
            }
            IndexPhase::Begin | IndexPhase::Consult => {}
        }

        if self.query_context_id != NO_CONTEXT {
            let request = DataNodeRequest::KillContexts {
                context_ids: vec![self.query_context_id],
            };
            if let Err(err) = self.send(&request, None) {
                tracing::warn!(session = %self.key, context_id = self.query_context_id, "Failed to kill context: {}", err);
            }
            self.query_context_id = NO_CONTEXT;
        }
        Ok(())
    }

    fn apply_last_checkpoint(&mut self, newest: Option<&Value>) -> Result<(), SessionError> {
        match newest {
            None => {
                self.last_pop_lid = -1;
                self.expected_lid = 0;
            }
            Some(doc) => {
                let lid = logical_id_of(doc)?;
                self.last_pop_lid = lid;
                self.expected_lid = lid;
            }
        }
        tracing::debug!(session = %self.key, expected = self.expected_lid, "Resume point taken from staging");
        self.query_busy = false;
        self.switch(IndexPhase::QueryPrimaryTable);
        Ok(())
    }

    fn compare_checkpoint(&mut self, newest: Option<&Value>) -> Result<(), SessionError> {
        let newest = newest.map(logical_id_of).transpose()?;
        let consistent = match newest {
            None => self.expected_lid == 0,
            Some(lid) => self.expected_lid <= lid,
        };
        if !consistent {
            tracing::warn!(
                session = %self.key,
                expected = self.expected_lid,
                newest = ?newest,
                "Checkpoint is ahead of the staging collection, starting over"
            );
            self.start_over();
            return Ok(());
        }

        self.last_pop_lid = match newest {
            Some(_) => self.expected_lid,
            None => -1,
        };
        self.query_busy = false;
        self.switch(IndexPhase::QueryStagingTable);
        Ok(())
    }

    fn finish_primary_scan(&mut self) -> Result<(), SessionError> {
        self.mark_progress(self.expected_lid)?;
        tracing::info!(session = %self.key, collection = %self.meta.collection, "Primary scan complete");
        self.query_busy = false;
        self.switch(IndexPhase::QueryStagingTable);
        Ok(())
    }

    fn handle_getmore_reply(&mut self, _handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError> {
        let reply = OpReply::decode(envelope)?;
        match reply.flags.class() {
            ReplyClass::Ok => {}
            ReplyClass::EndOfCursor => {
                return match self.phase {
                    IndexPhase::QueryPrimaryTable => self.finish_primary_scan(),
                    _ => {
                        self.query_busy = false;
                        Ok(())
                    }
                };
            }
            ReplyClass::NotExist => {
                self.on_source_dropped();
                return Ok(());
            }
            ReplyClass::NotPrimary => {
                self.terminate(false, "not primary");
                return Ok(());
            }
            ReplyClass::Failed(status) => return Err(SessionError::Status(status)),
        }

        let context_id = if reply.context_id != NO_CONTEXT {
            reply.context_id
        } else {
            self.query_context_id
        };
        match self.phase {
            IndexPhase::QueryPrimaryTable => {
                let actions = reply
                    .docs
                    .iter()
                    .map(primary_action)
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply_actions(&actions)?;
                self.send_getmore(context_id, Some(envelope.header.request_id))
            }
            IndexPhase::QueryStagingTable => {
                self.process_staging_batch(&reply.docs, context_id, envelope.header.request_id)
            }
            phase => Err(SessionError::UnexpectedReply {
                op_code: envelope.header.op_code,
                phase: phase.to_string(),
            }),
        }
    }

    /// Applies a staging batch, records progress, then pops what the previous
    /// batch left behind.
    fn process_staging_batch(&mut self, docs: &[Value], context_id: i64, request_id: u64) -> Result<(), SessionError> {
        let records = docs
            .iter()
            .map(StagingRecord::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let actions: Vec<BulkAction> = records.iter().map(StagingRecord::to_action).collect();
        self.apply_actions(&actions)?;

        let next_pop = records.last().map(|record| record.logical_id);
        if let Some(lid) = next_pop {
            self.mark_progress(lid)?;
        }

        if self.last_pop_lid >= 0 {
            self.pop_staging(self.last_pop_lid)?;
            self.switch(IndexPhase::PopStaging);
        } else {
            self.send_getmore(context_id, Some(request_id))?;
        }

        if let Some(lid) = next_pop {
            tracing::debug!(session = %self.key, from = self.last_pop_lid, to = lid, "Pop position advanced");
            self.last_pop_lid = lid;
        }
        Ok(())
    }

    fn handle_kill_context_reply(&mut self, _handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError> {
        let reply = OpReply::decode(envelope)?;
        if !reply.flags.is_ok() {
            tracing::warn!(session = %self.key, status = %reply.flags, "Kill context failed");
        }
        Ok(())
    }

    /// Drops the index and renegotiates the resume point from scratch.
    fn start_over(&mut self) {
        self.drop_search_index_logged();
        self.expected_lid = -1;
        self.last_pop_lid = -1;
        self.query_context_id = NO_CONTEXT;
        self.query_busy = false;
        self.bulk.clear();
        self.switch(IndexPhase::Consult);
    }

    fn on_source_dropped(&mut self) {
        self.terminate(true, "source collection dropped");
    }

    fn terminate(&mut self, drop_index: bool, reason: &str) {
        self.quit = true;
        self.query_busy = false;
        if drop_index {
            self.drop_search_index_logged();
        }
        tracing::info!(session = %self.key, index = %self.meta.search_index, reason, "Index sync stopped");
    }

    fn recovery_for(&self, kind: FailureKind) -> RecoveryAction {
        match kind {
            FailureKind::ResourceGone => RecoveryAction::Terminate { drop_index: true },
            FailureKind::NotPrimary => RecoveryAction::Terminate { drop_index: false },
            _ if self.phase == IndexPhase::Consult => RecoveryAction::RestartFromBegin,
            FailureKind::Structural | FailureKind::ProtocolFatal => RecoveryAction::StartOver,
            FailureKind::Transient => match self.phase {
                IndexPhase::QueryStagingTable | IndexPhase::PopStaging => RecoveryAction::RetryNextTick,
                IndexPhase::QueryLastCheckpoint | IndexPhase::CompareCheckpoint => RecoveryAction::StartOver,
                IndexPhase::Begin | IndexPhase::Consult | IndexPhase::QueryPrimaryTable => {
                    RecoveryAction::RestartFromBegin
                }
            },
        }
    }

    fn recover(&mut self, err: &SessionError) {
        let kind = FailureKind::from_session(err);
        let action = self.recovery_for(kind);
        tracing::warn!(
            session = %self.key,
            phase = %self.phase,
            kind = kind.display_name(),
            ?action,
            "Index sync step failed: {}",
            err
        );
        match action {
            RecoveryAction::RetryNextTick => {
                self.query_busy = false;
                if self.phase == IndexPhase::PopStaging {
                    self.switch(IndexPhase::QueryStagingTable);
                }
            }
            RecoveryAction::RestartFromBegin => {
                self.query_busy = false;
                self.switch(IndexPhase::Begin);
            }
            RecoveryAction::StartOver => self.start_over(),
            RecoveryAction::Terminate { drop_index } => self.terminate(drop_index, kind.display_name()),
        }
    }

    /// Honors a pending interrupt. Returns `true` when the session stopped.
    fn check_interrupt(&mut self) -> bool {
        if !self.exec.is_interrupted() {
            return false;
        }
        self.terminate(true, "interrupted");
        true
    }
}

fn logical_id_of(doc: &Value) -> Result<i64, SessionError> {
    doc.get(ID_FIELD)
        .and_then(Value::as_i64)
        .ok_or_else(|| SessionError::Structural(format!("staging record has no numeric {}", ID_FIELD)))
}

impl Session for IndexSession {
    fn key(&self) -> SessionKey {
        self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn session_type(&self) -> SessionType {
        SessionType::SearchIndex
    }

    fn exec(&self) -> &Arc<ExecContext> {
        &self.exec
    }

    fn on_message(&mut self, handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError> {
        if self.quit || self.check_interrupt() {
            return Ok(());
        }

        let handlers = Arc::clone(&self.handlers);
        match handlers.dispatch(self, handle, envelope) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SessionError::UnexpectedReply {
                op_code: envelope.header.op_code,
                phase: self.phase.to_string(),
            }),
            Err(err) => {
                self.recover(&err);
                Err(err)
            }
        }
    }

    fn on_timer(&mut self, _timer_id: TimerId, _interval_ms: u32) {
        if self.quit || self.check_interrupt() {
            return;
        }
        if let Err(err) = self.tick() {
            self.recover(&err);
        }
    }

    fn timeout(&self, _interval_ms: u32) -> bool {
        self.quit
    }

    fn timer_interval(&self) -> Option<Duration> {
        Some(self.settings.tick_interval())
    }

    fn on_attach(&mut self) {
        if let Err(err) = self.meta.validate() {
            tracing::error!(session = %self.key, "Cannot start index session: {}", err);
            self.quit = true;
            return;
        }
        self.condition = self.meta.primary_condition();
        self.selector = self.meta.primary_selector();
        tracing::info!(
            session = %self.key,
            collection = %self.meta.collection,
            index = %self.meta.search_index,
            "Index session attached"
        );
    }

    fn on_detach(&mut self) {
        if let Some(client) = self.search.take() {
            self.deps.provider.release(client);
        }
        tracing::debug!(session = %self.key, "Index session detached");
    }
}
