//! In-memory collaborators shared by the unit tests.

use crate::errors::{CollaboratorError, RegistryError, SessionError};
use crate::hooks::{RouteAgent, SessionManagerHooks};
use crate::registry::{SessionFactory, SessionInit, SessionRef};
use crate::seadapter::{CatalogClient, DataNodeClient, SearchEngine, SearchEngineProvider};
use crate::session::{ExecContext, NetHandle, Session, SessionKey, SessionTag, SessionType};
use crate::timer::TimerId;
use crate::wire::{DataNodeRequest, Envelope, MsgHeader, OpCode};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Attach,
    Receive(OpCode),
    Message(OpCode),
    Timer(TimerId),
    Detach,
}

pub type EventLog = Arc<Mutex<Vec<(SessionKey, SessionEvent)>>>;

pub struct TestSession {
    key: SessionKey,
    exec: Arc<ExecContext>,
    events: EventLog,
    interval: Option<Duration>,
    stop: Arc<AtomicBool>,
}

impl TestSession {
    fn record(&self, event: SessionEvent) {
        self.events.lock().expect("event log").push((self.key, event));
    }
}

impl Session for TestSession {
    fn key(&self) -> SessionKey {
        self.key
    }

    fn name(&self) -> &str {
        "test-session"
    }

    fn session_type(&self) -> SessionType {
        SessionType::Client
    }

    fn exec(&self) -> &Arc<ExecContext> {
        &self.exec
    }

    fn on_receive(&mut self, _handle: NetHandle, header: &MsgHeader) {
        self.record(SessionEvent::Receive(header.op_code));
    }

    fn on_message(&mut self, _handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError> {
        self.record(SessionEvent::Message(envelope.header.op_code));
        Ok(())
    }

    fn on_timer(&mut self, timer_id: TimerId, _interval_ms: u32) {
        self.record(SessionEvent::Timer(timer_id));
    }

    fn timeout(&self, _interval_ms: u32) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn timer_interval(&self) -> Option<Duration> {
        self.interval
    }

    fn on_attach(&mut self) {
        self.record(SessionEvent::Attach);
    }

    fn on_detach(&mut self) {
        self.record(SessionEvent::Detach);
    }
}

/// Builds [`TestSession`]s that all write to one event log.
#[derive(Clone, Default)]
pub struct TestSessionFactory {
    pub events: EventLog,
    pub interval: Option<Duration>,
    /// Makes every session report itself done.
    pub stop: Arc<AtomicBool>,
    pub created: Arc<AtomicUsize>,
}

impl TestSessionFactory {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn session(&self, key: SessionKey) -> TestSession {
        TestSession {
            key,
            exec: Arc::new(ExecContext::new()),
            events: Arc::clone(&self.events),
            interval: self.interval,
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn events(&self) -> Vec<(SessionKey, SessionEvent)> {
        self.events.lock().expect("event log").clone()
    }

    pub fn events_for(&self, key: SessionKey) -> Vec<SessionEvent> {
        self.events()
            .into_iter()
            .filter(|(owner, _)| *owner == key)
            .map(|(_, event)| event)
            .collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SessionFactory for TestSessionFactory {
    fn create(&self, init: SessionInit<'_>) -> Result<Box<dyn Session>, RegistryError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.session(init.key)))
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub none_session_disconnects: Mutex<Vec<(SessionKey, NetHandle)>>,
    pub disconnects: Mutex<Vec<SessionKey>>,
    pub released: Mutex<Vec<(SessionKey, bool)>>,
}

impl RecordingHooks {
    pub fn released(&self) -> Vec<(SessionKey, bool)> {
        self.released.lock().expect("released").clone()
    }
}

impl SessionManagerHooks for RecordingHooks {
    fn on_none_session_disconnect(&self, key: SessionKey, handle: NetHandle) {
        self.none_session_disconnects
            .lock()
            .expect("disconnects")
            .push((key, handle));
    }

    fn on_session_disconnect(&self, session: &SessionRef) {
        self.disconnects.lock().expect("disconnects").push(session.key());
    }

    fn on_session_released(&self, key: SessionKey, notify: bool) {
        self.released.lock().expect("released").push((key, notify));
    }
}

#[derive(Default)]
pub struct RecordingRoute {
    pub sent: Mutex<Vec<(NetHandle, Vec<u8>)>>,
}

impl RecordingRoute {
    pub fn sent(&self) -> Vec<(NetHandle, Vec<u8>)> {
        self.sent.lock().expect("sent").clone()
    }
}

impl RouteAgent for RecordingRoute {
    fn sync_send_raw(&self, handle: NetHandle, data: &[u8]) -> Result<(), CollaboratorError> {
        self.sent.lock().expect("sent").push((handle, data.to_vec()));
        Ok(())
    }
}

/// Records every request instead of sending it.
#[derive(Default)]
pub struct FakeDataNode {
    requests: Mutex<Vec<(SessionTag, u64, DataNodeRequest)>>,
}

impl FakeDataNode {
    pub fn requests(&self) -> Vec<(SessionTag, u64, DataNodeRequest)> {
        self.requests.lock().expect("requests").clone()
    }

    /// Returns and clears everything sent so far.
    pub fn take(&self) -> Vec<DataNodeRequest> {
        std::mem::take(&mut *self.requests.lock().expect("requests"))
            .into_iter()
            .map(|(_, _, request)| request)
            .collect()
    }

    pub fn last(&self) -> Option<DataNodeRequest> {
        self.requests
            .lock()
            .expect("requests")
            .last()
            .map(|(_, _, request)| request.clone())
    }
}

impl DataNodeClient for FakeDataNode {
    fn send(&self, tag: SessionTag, request_id: u64, request: &DataNodeRequest) -> Result<(), CollaboratorError> {
        self.requests
            .lock()
            .expect("requests")
            .push((tag, request_id, request.clone()));
        Ok(())
    }
}

pub struct FakeCatalog {
    result: Mutex<Result<i32, CollaboratorError>>,
}

impl FakeCatalog {
    pub fn with_version(version: i32) -> Self {
        Self {
            result: Mutex::new(Ok(version)),
        }
    }

    pub fn fail_with(&self, err: CollaboratorError) {
        *self.result.lock().expect("catalog") = Err(err);
    }
}

impl CatalogClient for FakeCatalog {
    fn refresh_version(&self, _collection: &str, _timeout: Duration) -> Result<i32, CollaboratorError> {
        self.result.lock().expect("catalog").clone()
    }
}

#[derive(Default)]
struct SearchState {
    indices: HashMap<String, HashMap<String, Value>>,
    bulk_calls: usize,
    dropped: usize,
}

/// Search engine keeping documents in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySearchEngine {
    state: Arc<Mutex<SearchState>>,
}

impl MemorySearchEngine {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemorySearchClient {
        MemorySearchClient {
            state: Arc::clone(&self.state),
            active: true,
        }
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().expect("search").bulk_calls
    }

    pub fn dropped(&self) -> usize {
        self.state.lock().expect("search").dropped
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.state.lock().expect("search").indices.contains_key(index)
    }

    pub fn documents(&self, index: &str) -> HashMap<String, Value> {
        self.state
            .lock()
            .expect("search")
            .indices
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.documents(index).get(id).cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.documents(index).len()
    }

    pub fn put_document(&self, index: &str, id: &str, body: Value) {
        self.state
            .lock()
            .expect("search")
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), body);
    }
}

pub struct MemorySearchClient {
    state: Arc<Mutex<SearchState>>,
    active: bool,
}

fn target(action: &Value) -> Result<(String, String), CollaboratorError> {
    let index = action.get("_index").and_then(Value::as_str);
    let id = action.get("_id").and_then(Value::as_str);
    match (index, id) {
        (Some(index), Some(id)) => Ok((index.to_string(), id.to_string())),
        _ => Err(CollaboratorError::Failed {
            code: -6,
            message: format!("bad bulk target {}", action),
        }),
    }
}

fn parse_line(line: Option<&str>) -> Result<Value, CollaboratorError> {
    let line = line.ok_or_else(|| CollaboratorError::Failed {
        code: -6,
        message: "bulk body ends early".to_string(),
    })?;
    serde_json::from_str(line).map_err(|err| CollaboratorError::Failed {
        code: -6,
        message: err.to_string(),
    })
}

impl SearchEngine for MemorySearchClient {
    fn is_active(&self) -> bool {
        self.active
    }

    fn activate(&mut self) -> Result<(), CollaboratorError> {
        self.active = true;
        Ok(())
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, CollaboratorError> {
        Ok(self.state.lock().expect("search").indices.contains_key(index))
    }

    fn drop_index(&mut self, index: &str) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().expect("search");
        if state.indices.remove(index).is_some() {
            state.dropped += 1;
        }
        Ok(())
    }

    fn get_document(&mut self, index: &str, _doc_type: &str, id: &str) -> Result<Option<Value>, CollaboratorError> {
        let state = self.state.lock().expect("search");
        Ok(state.indices.get(index).and_then(|docs| docs.get(id)).cloned())
    }

    fn index_document(&mut self, index: &str, _doc_type: &str, id: &str, body: &Value) -> Result<(), CollaboratorError> {
        self.state
            .lock()
            .expect("search")
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        Ok(())
    }

    fn bulk(&mut self, _index: &str, _doc_type: &str, body: &str) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().expect("search");
        state.bulk_calls += 1;
        let mut lines = body.lines();
        while let Some(line) = lines.next() {
            let action = parse_line(Some(line))?;
            if let Some(target_doc) = action.get("index") {
                let (index, id) = target(target_doc)?;
                let source = parse_line(lines.next())?;
                state.indices.entry(index).or_default().insert(id, source);
            } else if let Some(target_doc) = action.get("update") {
                let (index, id) = target(target_doc)?;
                let update = parse_line(lines.next())?;
                let docs = state.indices.entry(index).or_default();
                let doc = docs.entry(id).or_insert_with(|| Value::Object(Map::new()));
                if let (Value::Object(doc), Some(Value::Object(patch))) = (doc, update.get("doc")) {
                    for (field, value) in patch {
                        doc.insert(field.clone(), value.clone());
                    }
                }
            } else if let Some(target_doc) = action.get("delete") {
                let (index, id) = target(target_doc)?;
                if let Some(docs) = state.indices.get_mut(&index) {
                    docs.remove(&id);
                }
            }
        }
        Ok(())
    }
}

/// Hands out clients of one [`MemorySearchEngine`].
#[derive(Default)]
pub struct FakeProvider {
    pub engine: MemorySearchEngine,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl SearchEngineProvider for FakeProvider {
    fn acquire(&self) -> Result<Box<dyn SearchEngine>, CollaboratorError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.engine.client()))
    }

    fn release(&self, _client: Box<dyn SearchEngine>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
