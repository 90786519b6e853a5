// src/process/manager.rs — Service object that owns every live session

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::checkpoints::CheckpointLedger;
use super::events::EventSink;
use super::handle::ProcessHandle;
use super::instance::{InstanceEvent, InstanceState, InstanceStateMachine, StateChange};
use super::registry::ProcessRegistry;
use super::spawner::{pending_key, ForkOrigin, SpawnRequest, Spawner};
use crate::infra::config::Config;
use crate::infra::errors::DeckError;
use crate::memory::StoreHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Resume this session. `None` starts a new one.
    pub session_id: Option<String>,
    pub folder_path: String,
    pub message: String,
}

/// The registry key the process started under and its handle. For a new
/// session the key is a placeholder until the agent reports its id.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub key: String,
    pub handle: ProcessHandle,
}

pub struct ProcessManager {
    config: Config,
    registry: Arc<ProcessRegistry>,
    checkpoints: Arc<CheckpointLedger>,
    states: Arc<InstanceStateMachine>,
    store: StoreHandle,
    sink: Arc<dyn EventSink>,
    spawner: Spawner,
}

impl ProcessManager {
    pub fn new(config: Config, store: StoreHandle, sink: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(ProcessRegistry::new());
        let checkpoints = Arc::new(CheckpointLedger::new(config.limits.checkpoint_capacity));
        let states = Arc::new(InstanceStateMachine::new());
        let spawner = Spawner::new(
            &config,
            registry.clone(),
            checkpoints.clone(),
            states.clone(),
            sink.clone(),
        )
        .with_store(store.clone());

        Self {
            config,
            registry,
            checkpoints,
            states,
            store,
            sink,
            spawner,
        }
    }

    /// Replace the spawner, e.g. to point agent config somewhere else.
    pub fn with_spawner(mut self, build: impl FnOnce(Spawner) -> Spawner) -> Self {
        let spawner = Spawner::new(
            &self.config,
            self.registry.clone(),
            self.checkpoints.clone(),
            self.states.clone(),
            self.sink.clone(),
        )
        .with_store(self.store.clone());
        self.spawner = build(spawner);
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Start an agent run for one user message.
    pub async fn send_message(&self, req: SendRequest) -> Result<SendOutcome, DeckError> {
        if let Some(id) = &req.session_id {
            if self.registry.contains(id) {
                return Err(DeckError::Busy {
                    session_id: id.clone(),
                });
            }
        }

        let mut spawn = SpawnRequest::new(req.folder_path.clone(), req.message.clone());
        if let Some(id) = &req.session_id {
            spawn = spawn.resume(id.clone());
            self.prepare_resume(id, &mut spawn).await?;
        }

        let key = req.session_id.clone().unwrap_or_else(pending_key);
        self.states.transition(&key, InstanceEvent::SendMessage);

        match self.spawner.spawn_keyed(&key, spawn) {
            Ok(handle) => {
                if let Some(id) = &req.session_id {
                    self.commit_resume(id).await;
                }
                Ok(SendOutcome { key, handle })
            }
            Err(e @ DeckError::Busy { .. }) => Err(e),
            Err(e) => {
                self.states.transition(&key, InstanceEvent::ProcessError);
                if req.session_id.is_none() {
                    self.states.remove_session(&key);
                }
                Err(e)
            }
        }
    }

    /// Apply stored lineage to a resumed session: a pending rewind, or a
    /// fork that has never run, continues from the parent's transcript.
    /// Reads only; `commit_resume` consumes the rewind once a process runs.
    async fn prepare_resume(&self, id: &str, spawn: &mut SpawnRequest) -> Result<(), DeckError> {
        let session = self
            .store
            .get_session(id.to_string())
            .await
            .map_err(into_deck_error)?;
        let Some(session) = session else {
            debug!("Session {} not in storage, resuming as-is", id);
            self.store
                .ensure_session(id.to_string(), spawn.folder_path.clone())
                .await
                .map_err(into_deck_error)?;
            return Ok(());
        };
        spawn.folder_path = session.folder_path.clone();

        let rewind = self
            .store
            .get_rewind_context(id.to_string())
            .await
            .map_err(into_deck_error)?;

        match (rewind, &session.forked_from_session_id) {
            (Some(ctx), Some(parent)) => {
                debug!(
                    "Session {} replays {} up to {}",
                    id, parent, ctx.checkpoint_uuid
                );
                if spawn.message.trim().is_empty() {
                    spawn.message = ctx.new_message;
                }
                spawn.fork = Some(ForkOrigin {
                    parent_id: parent.clone(),
                    resume_at: Some(ctx.checkpoint_uuid),
                });
            }
            (None, Some(parent)) if session.last_accessed_at.is_none() => {
                spawn.fork = Some(ForkOrigin {
                    parent_id: parent.clone(),
                    resume_at: None,
                });
            }
            (Some(_), None) => warn!("Rewind context on root session {} ignored", id),
            _ => {}
        }
        Ok(())
    }

    /// The agent is running for `id`: drop its rewind context and mark it
    /// accessed. The process is already live, so failures are only logged.
    async fn commit_resume(&self, id: &str) {
        if let Err(e) = self.store.take_rewind_context(id.to_string()).await {
            warn!("Failed to clear rewind context for {}: {}", id, e);
        }
        if let Err(e) = self.store.touch_session(id.to_string()).await {
            warn!("Failed to touch session {}: {}", id, e);
        }
    }

    /// Stop a response early. Returns true once the process is gone; an
    /// unknown id counts as stopped.
    pub async fn abort(&self, session_id: &str) -> bool {
        self.stop_session(session_id, self.config.timeouts.abort())
            .await
    }

    pub async fn terminate(&self, session_id: &str) -> bool {
        self.stop_session(session_id, self.config.timeouts.terminate())
            .await
    }

    /// Stop every live process in parallel. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let keys = self.registry.keys();
        if keys.is_empty() {
            return 0;
        }
        info!("Shutting down {} agent process(es)", keys.len());
        let grace = self.config.timeouts.shutdown();
        let results = join_all(keys.iter().map(|k| self.stop_session(k, grace))).await;
        results.into_iter().filter(|stopped| *stopped).count()
    }

    async fn stop_session(&self, session_id: &str, grace: Duration) -> bool {
        let Some(handle) = self.registry.get(session_id) else {
            return true;
        };
        handle.mark_stopped_by_user();
        let exited = handle.stop(grace).await;
        if exited {
            self.registry.remove_handle(&handle);
        } else {
            // Left registered; the exit watcher removes it once the exit is seen.
            warn!(
                "Agent process {:?} for {} did not confirm exit",
                handle.pid(),
                session_id
            );
        }
        exited
    }

    pub fn acknowledge_error(&self, session_id: &str) -> InstanceState {
        self.states
            .transition(session_id, InstanceEvent::AcknowledgeError)
    }

    pub fn instance_state(&self, session_id: &str) -> InstanceState {
        self.states.get_state(session_id)
    }

    pub fn checkpoints(&self, session_id: &str) -> Vec<String> {
        self.checkpoints.list(session_id)
    }

    /// Keys of every running process.
    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.keys()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.registry.contains(session_id)
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.states.subscribe()
    }
}

/// Recover the typed error a store call raised, if it raised one.
fn into_deck_error(err: anyhow::Error) -> DeckError {
    let err = match err.downcast::<DeckError>() {
        Ok(e) => return e,
        Err(other) => other,
    };
    let err = match err.downcast::<rusqlite::Error>() {
        Ok(e) => return DeckError::Database(e),
        Err(other) => other,
    };
    match err.downcast::<std::io::Error>() {
        Ok(e) => DeckError::Io(e),
        Err(other) => DeckError::Other(other),
    }
}
