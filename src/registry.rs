//! Session registry.
//!
//! Maps session keys to live session actors and owns every session's timer
//! registration. Insert, remove and timer lookup all happen under one lock, so
//! a released key is never handed out again and a released session never sees
//! a late timer tick.

use crate::config::RegistryConfig;
use crate::errors::RegistryError;
use crate::hooks::SessionManagerHooks;
use crate::session::{
    ExecContext, NetHandle, Session, SessionActor, SessionActorArgs, SessionKey, SessionMsg,
    SessionPolicy, SessionRetirer, SessionTag, SessionType,
};
use crate::structured_logger::SessionJournal;
use crate::timer::{TimerId, TimerService};
use crate::wire::{Envelope, MsgHeader, OpCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorRef};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Everything a factory gets to build a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionInit<'a> {
    pub key: SessionKey,
    pub session_type: SessionType,
    pub policy: SessionPolicy,
    pub handle: NetHandle,
    pub op_code: OpCode,
    /// Parameters from the creator's hint, if any.
    pub params: Option<&'a Value>,
}

/// Builds sessions of one type.
pub trait SessionFactory: Send + Sync {
    fn create(&self, init: SessionInit<'_>) -> Result<Box<dyn Session>, RegistryError>;
}

/// Creation request for sessions that inbound traffic cannot describe.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHint {
    pub session_type: SessionType,
    pub params: Value,
}

impl SessionHint {
    pub fn new(session_type: SessionType, params: Value) -> Self {
        Self {
            session_type,
            params,
        }
    }
}

/// Handle to a live session, valid while a dispatch is in progress.
///
/// Holding one does not keep the session registered; sends to a released
/// session fail with [`RegistryError::SessionGone`].
#[derive(Clone)]
pub struct SessionRef {
    key: SessionKey,
    session_type: SessionType,
    policy: SessionPolicy,
    name: Arc<str>,
    exec: Arc<ExecContext>,
    actor: ActorRef<SessionMsg>,
}

impl SessionRef {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marks the session's execution context interrupted.
    pub fn interrupt(&self) {
        self.exec.interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.exec.is_interrupted()
    }

    fn send(&self, message: SessionMsg) -> Result<(), RegistryError> {
        self.actor
            .send_message(message)
            .map_err(|_| RegistryError::SessionGone(self.key))
    }
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRef")
            .field("key", &self.key)
            .field("session_type", &self.session_type)
            .field("name", &self.name)
            .finish()
    }
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub name: String,
    pub session_type: SessionType,
    pub policy: SessionPolicy,
    pub owner: NetHandle,
    pub timer: Option<TimerId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub interrupted: bool,
}

struct SessionEntry {
    session: SessionRef,
    owner: NetHandle,
    timer: Option<TimerId>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.session.key,
            name: self.session.name.to_string(),
            session_type: self.session.session_type,
            policy: self.session.policy,
            owner: self.owner,
            timer: self.timer,
            created_at: self.created_at,
            last_activity: self.last_activity,
            interrupted: self.session.is_interrupted(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionKey, SessionEntry>,
    timers: HashMap<TimerId, SessionKey>,
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    factories: RwLock<HashMap<SessionType, Arc<dyn SessionFactory>>>,
    hooks: Arc<dyn SessionManagerHooks>,
    timers: Arc<TimerService>,
    journal: Option<Arc<SessionJournal>>,
    next_active_tag: AtomicU32,
    detach_timeout: Duration,
}

impl RegistryShared {
    /// Removes the entry and its timer registration in one step.
    async fn remove_entry(&self, key: SessionKey) -> Option<SessionEntry> {
        let mut state = self.state.lock().await;
        let entry = state.sessions.remove(&key)?;
        if let Some(timer_id) = entry.timer {
            state.timers.remove(&timer_id);
            self.timers.cancel(timer_id);
        }
        Some(entry)
    }

    fn finish_release(&self, key: SessionKey, notify: bool, reason: &str) {
        self.hooks.on_session_released(key, notify);
        if let Some(journal) = &self.journal {
            journal.log_session_released(key, reason);
        }
        tracing::debug!(session = %key, reason, notify, "Session released");
    }
}

#[async_trait]
impl SessionRetirer for RegistryShared {
    async fn retire(&self, key: SessionKey) -> bool {
        if self.remove_entry(key).await.is_none() {
            return false;
        }
        self.finish_release(key, true, "timeout");
        true
    }
}

/// Concurrent key to session map. Cloning shares the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    pub fn new(
        config: &RegistryConfig,
        hooks: Arc<dyn SessionManagerHooks>,
        timers: Arc<TimerService>,
        journal: Option<Arc<SessionJournal>>,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                state: Mutex::new(RegistryState::default()),
                factories: RwLock::new(HashMap::new()),
                hooks,
                timers,
                journal,
                next_active_tag: AtomicU32::new(1),
                detach_timeout: Duration::from_millis(config.detach_timeout_ms),
            }),
        }
    }

    /// Registers the factory for a session type, replacing any earlier one.
    pub fn register_factory(&self, session_type: SessionType, factory: Arc<dyn SessionFactory>) {
        self.shared
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_type, factory);
    }

    fn factory(&self, session_type: SessionType) -> Option<Arc<dyn SessionFactory>> {
        self.shared
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_type)
            .cloned()
    }

    /// Returns the live session for `key`, creating it when allowed.
    ///
    /// The factory is chosen from the hint's session type, or from the hooks'
    /// passive session type for the opcode when there is no hint.
    pub async fn get_or_create(
        &self,
        key: SessionKey,
        policy: SessionPolicy,
        handle: NetHandle,
        allow_create: bool,
        op_code: OpCode,
        hint: Option<&SessionHint>,
    ) -> Result<SessionRef, RegistryError> {
        let mut state = self.shared.state.lock().await;
        if let Some(entry) = state.sessions.get(&key) {
            return Ok(entry.session.clone());
        }
        if !allow_create {
            return Err(RegistryError::NotFound(key));
        }

        let session_type = match hint {
            Some(hint) => Some(hint.session_type),
            None => self.shared.hooks.passive_session_type(op_code),
        }
        .ok_or(RegistryError::NoFactory {
            session_type: None,
            op_code,
        })?;
        let factory = self.factory(session_type).ok_or(RegistryError::NoFactory {
            session_type: Some(session_type),
            op_code,
        })?;

        let session = factory.create(SessionInit {
            key,
            session_type,
            policy,
            handle,
            op_code,
            params: hint.map(|hint| &hint.params),
        })?;
        self.insert_locked(&mut state, session, policy, handle).await
    }

    /// Spawns a node-owned session under a freshly allocated active key.
    pub async fn start_active(&self, hint: &SessionHint) -> Result<SessionRef, RegistryError> {
        let key = self.next_active_key().await;
        self.get_or_create(
            key,
            SessionPolicy::Active,
            NetHandle::INTERNAL,
            true,
            OpCode::Other(0),
            Some(hint),
        )
        .await
    }

    async fn next_active_key(&self) -> SessionKey {
        let state = self.shared.state.lock().await;
        loop {
            let seq = self.shared.next_active_tag.fetch_add(1, Ordering::Relaxed) & !SessionTag::ACTIVE_BIT;
            if seq == 0 {
                continue;
            }
            let key = SessionKey::active(SessionTag(seq | SessionTag::ACTIVE_BIT));
            if !state.sessions.contains_key(&key) {
                return key;
            }
        }
    }

    /// Registers an already constructed session.
    pub async fn register(
        &self,
        session: Box<dyn Session>,
        policy: SessionPolicy,
        handle: NetHandle,
    ) -> Result<SessionRef, RegistryError> {
        let mut state = self.shared.state.lock().await;
        let key = session.key();
        if state.sessions.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        self.insert_locked(&mut state, session, policy, handle).await
    }

    async fn insert_locked(
        &self,
        state: &mut RegistryState,
        session: Box<dyn Session>,
        policy: SessionPolicy,
        handle: NetHandle,
    ) -> Result<SessionRef, RegistryError> {
        let key = session.key();
        if state.sessions.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }

        let session_type = session.session_type();
        let name: Arc<str> = Arc::from(session.name());
        let exec = Arc::clone(session.exec());
        let interval = session.timer_interval();
        let retirer: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let retirer: Weak<dyn SessionRetirer> = retirer;

        let (actor, _join) =
            SessionActor::spawn(None, SessionActor, SessionActorArgs { session, retirer })
                .await
                .map_err(|err| RegistryError::Spawn(err.to_string()))?;

        let session_ref = SessionRef {
            key,
            session_type,
            policy,
            name,
            exec,
            actor,
        };
        let timer = interval.map(|interval| {
            let timer_id = self.shared.timers.schedule(interval, key);
            state.timers.insert(timer_id, key);
            timer_id
        });

        let now = Utc::now();
        state.sessions.insert(
            key,
            SessionEntry {
                session: session_ref.clone(),
                owner: handle,
                timer,
                created_at: now,
                last_activity: now,
            },
        );

        if let Some(journal) = &self.shared.journal {
            journal.log_session_created(key, session_type, policy, handle);
        }
        tracing::debug!(
            session = %key,
            name = session_ref.name(),
            session_type = %session_type,
            owner = %handle,
            "Session created"
        );
        Ok(session_ref)
    }

    /// Records activity and runs the session's `on_receive` hook.
    pub async fn notify_received(
        &self,
        session: &SessionRef,
        handle: NetHandle,
        header: &MsgHeader,
    ) -> Result<(), RegistryError> {
        {
            let mut state = self.shared.state.lock().await;
            if let Some(entry) = state.sessions.get_mut(&session.key) {
                entry.last_activity = Utc::now();
            }
        }
        session.send(SessionMsg::Received {
            handle,
            header: *header,
        })
    }

    /// Queues an owned frame for the session's message handlers.
    pub fn push_message(
        &self,
        session: &SessionRef,
        handle: NetHandle,
        envelope: Envelope,
    ) -> Result<(), RegistryError> {
        session.send(SessionMsg::Deliver { handle, envelope })
    }

    /// Removes the session and waits for its `on_detach` to run.
    pub async fn release(&self, key: SessionKey, notify: bool) -> Result<(), RegistryError> {
        let entry = self
            .shared
            .remove_entry(key)
            .await
            .ok_or(RegistryError::NotFound(key))?;

        let (tx, rx) = oneshot::channel();
        if entry.session.send(SessionMsg::Detach(tx)).is_ok() {
            match tokio::time::timeout(self.shared.detach_timeout, rx).await {
                Ok(_) => {}
                Err(_) => tracing::warn!(session = %key, "Session did not detach in time"),
            }
        } else {
            tracing::debug!(session = %key, "Session actor already stopped");
        }

        self.shared.finish_release(key, notify, "released");
        Ok(())
    }

    /// Hands a timer tick to the owning session.
    ///
    /// Fails with [`RegistryError::UnknownTimer`] when the owner has been
    /// released; the caller reports that as an orphaned tick.
    pub async fn on_timeout(&self, timer_id: TimerId, interval_ms: u32) -> Result<(), RegistryError> {
        let state = self.shared.state.lock().await;
        let key = *state
            .timers
            .get(&timer_id)
            .ok_or(RegistryError::UnknownTimer(timer_id))?;
        let entry = state
            .sessions
            .get(&key)
            .ok_or(RegistryError::UnknownTimer(timer_id))?;
        entry.session.send(SessionMsg::Timer {
            timer_id,
            interval_ms,
        })
    }

    /// Releases every passive session owned by a closed connection.
    pub async fn handle_close(&self, handle: NetHandle) -> usize {
        let keys: Vec<SessionKey> = {
            let state = self.shared.state.lock().await;
            state
                .sessions
                .values()
                .filter(|entry| entry.owner == handle && entry.session.policy == SessionPolicy::Passive)
                .map(|entry| entry.session.key)
                .collect()
        };
        self.release_all(keys, true).await
    }

    /// Releases every session.
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<SessionKey> = {
            let state = self.shared.state.lock().await;
            state.sessions.keys().copied().collect()
        };
        let released = self.release_all(keys, false).await;
        self.shared.timers.cancel_all();
        released
    }

    async fn release_all(&self, keys: Vec<SessionKey>, notify: bool) -> usize {
        let mut released = 0;
        for key in keys {
            match self.release(key, notify).await {
                Ok(()) => released += 1,
                // Retired concurrently.
                Err(RegistryError::NotFound(_)) => {}
                Err(err) => tracing::warn!(session = %key, "Failed to release session: {}", err),
            }
        }
        released
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let state = self.shared.state.lock().await;
        let mut infos: Vec<SessionInfo> = state.sessions.values().map(SessionEntry::info).collect();
        infos.sort_by_key(|info| info.key);
        infos
    }

    pub async fn contains(&self, key: SessionKey) -> bool {
        self.shared.state.lock().await.sessions.contains_key(&key)
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Waits until the session has handled everything queued before this call.
    pub async fn flush(&self, key: SessionKey) -> Result<(), RegistryError> {
        let session = {
            let state = self.shared.state.lock().await;
            state
                .sessions
                .get(&key)
                .map(|entry| entry.session.clone())
                .ok_or(RegistryError::NotFound(key))?
        };
        let (tx, rx) = oneshot::channel();
        session.send(SessionMsg::Flush(tx))?;
        rx.await.map_err(|_| RegistryError::SessionGone(key))
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod registry_tests;
