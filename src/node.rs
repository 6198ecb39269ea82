//! Composition root for one node's dispatch core.
//!
//! Owns the timer service, registry, dispatcher and journal for the lifetime
//! of the node, and runs the pump that turns timer ticks into session
//! callbacks.

use crate::config::NodeConfig;
use crate::dispatcher::MessageDispatcher;
use crate::errors::RegistryError;
use crate::hooks::{RouteAgent, SessionManagerHooks};
use crate::queue::{EventQueue, OutboundEvent};
use crate::registry::{SessionFactory, SessionRegistry};
use crate::session::SessionType;
use crate::structured_logger::SessionJournal;
use crate::timer::{TimerFired, TimerService};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Node {
    config: NodeConfig,
    registry: SessionRegistry,
    dispatcher: Arc<MessageDispatcher>,
    journal: Option<Arc<SessionJournal>>,
    pump: JoinHandle<()>,
}

impl Node {
    /// Builds every component and starts the timeout pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: NodeConfig,
        hooks: Arc<dyn SessionManagerHooks>,
        route: Arc<dyn RouteAgent>,
        main_queue: Arc<dyn EventQueue>,
    ) -> Result<Self> {
        let journal = match &config.journal.dir {
            Some(dir) => Some(Arc::new(
                SessionJournal::open(dir)
                    .with_context(|| format!("failed to open session journal in {}", dir.display()))?,
            )),
            None => None,
        };

        let (timers, fired) = TimerService::new();
        let registry = SessionRegistry::new(
            &config.registry,
            Arc::clone(&hooks),
            Arc::new(timers),
            journal.clone(),
        );
        let dispatcher = Arc::new(MessageDispatcher::new(
            &config.dispatcher,
            registry.clone(),
            hooks,
            route,
            Arc::clone(&main_queue),
            journal.clone(),
        ));
        let pump = tokio::spawn(run_timeout_pump(
            fired,
            registry.clone(),
            main_queue,
            journal.clone(),
        ));

        tracing::info!(
            journal = ?journal.as_ref().map(|journal| journal.log_path().to_path_buf()),
            "Node dispatch core started"
        );
        Ok(Self {
            config,
            registry,
            dispatcher,
            journal,
            pump,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn register_factory(&self, session_type: SessionType, factory: Arc<dyn SessionFactory>) {
        self.registry.register_factory(session_type, factory);
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn journal(&self) -> Option<&Arc<SessionJournal>> {
        self.journal.as_ref()
    }

    /// Releases every session and stops the pump.
    pub async fn stop(self) -> usize {
        let released = self.registry.shutdown().await;
        self.pump.abort();
        tracing::info!(released, "Node dispatch core stopped");
        released
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Hands each timer tick to the registry. Ticks whose session is gone are
/// reported to the main queue.
async fn run_timeout_pump(
    mut fired: mpsc::UnboundedReceiver<TimerFired>,
    registry: SessionRegistry,
    main_queue: Arc<dyn EventQueue>,
    journal: Option<Arc<SessionJournal>>,
) {
    while let Some(tick) = fired.recv().await {
        match registry.on_timeout(tick.timer_id, tick.interval_ms).await {
            Ok(()) => {}
            Err(RegistryError::UnknownTimer(timer_id)) => {
                if let Some(journal) = &journal {
                    journal.log_timer_orphaned(timer_id, tick.interval_ms);
                }
                let event = OutboundEvent::Timeout {
                    timer_id,
                    interval_ms: tick.interval_ms,
                    occurred_at: Utc::now(),
                };
                if let Err(err) = main_queue.post_event(event) {
                    tracing::warn!(timer_id = %timer_id, "Failed to report orphaned timer: {}", err);
                }
            }
            Err(err) => {
                tracing::debug!(timer_id = %tick.timer_id, owner = %tick.owner, "Timer tick dropped: {}", err);
            }
        }
    }
    tracing::debug!("Timeout pump stopped");
}
