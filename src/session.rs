//! Session lifecycle
//!
//! Creates, restores and closes conversation sessions, and drives each
//! session's queue through the process runner into the message buffer.
//! Evictions signalled by the resource manager are finished here.

use crate::buffer::MessageBufferStore;
use crate::device::DeviceRegistry;
use crate::error::{ProcessError, SessionError, SessionRestoreError};
use crate::notify::TurnNotifier;
use crate::queue::{MessageQueue, Priority, QueueOptions, QueueOutcome, QueuedMessage};
use crate::resources::{ResourceEvent, ResourceManager};
use crate::runner::{ProcessRunner, TurnRequest, TurnResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    #[default]
    Active,
    Restoring,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// The CLI's own conversation handle, known after the first turn
    #[serde(default)]
    pub claude_session_id: Option<String>,
    #[serde(default)]
    pub status: SessionState,
}

/// Last known state of a project's conversation, used by restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub claude_session_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Who is asking for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionContext {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { result: TurnResult },
    Failed { error: ProcessError, retryable: bool },
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Explicit,
    Evicted,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session: Session,
    },
    SessionRestored {
        session: Session,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
    TurnStarted {
        session_id: String,
        request_id: String,
        device_id: String,
    },
    TurnCompleted {
        session_id: String,
        request_id: String,
        device_id: String,
        outcome: TurnOutcome,
    },
}

struct InflightTurn {
    message_id: String,
    handle: AbortHandle,
}

struct Reaper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    sessions: DashMap<String, Session>,
    /// project_path -> last known metadata
    metadata: DashMap<String, SessionMetadata>,
    inflight: DashMap<String, InflightTurn>,
    devices: Arc<DeviceRegistry>,
    queue: Arc<MessageQueue>,
    buffers: Arc<MessageBufferStore>,
    resources: Arc<ResourceManager>,
    runner: Arc<ProcessRunner>,
    notifier: Arc<dyn TurnNotifier>,
    events: broadcast::Sender<SessionEvent>,
    reaper: Mutex<Option<Reaper>>,
}

impl SessionManager {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        queue: Arc<MessageQueue>,
        buffers: Arc<MessageBufferStore>,
        resources: Arc<ResourceManager>,
        runner: Arc<ProcessRunner>,
        notifier: Arc<dyn TurnNotifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            metadata: DashMap::new(),
            inflight: DashMap::new(),
            devices,
            queue,
            buffers,
            resources,
            runner,
            notifier,
            events,
            reaper: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    fn is_open(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.status != SessionState::Closed)
            .unwrap_or(false)
    }

    /// Register a session as active, evicting an idle one first if the
    /// concurrency ceiling is reached
    fn admit(&self, mut session: Session, ctx: &ConnectionContext) -> Session {
        for evicted in self.resources.make_room(Utc::now()) {
            self.teardown(&evicted, CloseReason::Evicted);
        }

        session.status = SessionState::Active;
        session.last_activity = Utc::now();
        self.resources.sessions().insert(&session.session_id);
        self.buffers.get_or_create_buffer(&session.session_id);
        self.sessions
            .insert(session.session_id.clone(), session.clone());

        if !ctx.device_id.is_empty() {
            self.devices
                .subscribe_session(&ctx.device_id, &session.session_id);
            self.devices.update_last_seen(&ctx.device_id);
        }
        session
    }

    /// Start a fresh conversation. The CLI assigns its own handle on the
    /// first turn.
    pub fn create_session(&self, project_path: &str, ctx: &ConnectionContext) -> Session {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: ctx.user_id.clone(),
            project_path: project_path.to_string(),
            created_at: now,
            last_activity: now,
            claude_session_id: None,
            status: SessionState::Requested,
        };
        let session = self.admit(session, ctx);
        tracing::info!(
            "Session {} created for {} ({})",
            session.session_id,
            project_path,
            ctx.user_id
        );
        self.emit(SessionEvent::SessionCreated {
            session: session.clone(),
        });
        session
    }

    /// Resume the last recorded conversation for a project
    pub fn restore_session(
        &self,
        project_path: &str,
        ctx: &ConnectionContext,
    ) -> Result<Session, SessionRestoreError> {
        let meta = self
            .metadata
            .get(project_path)
            .map(|m| m.clone())
            .ok_or_else(|| SessionRestoreError::NoExistingSession {
                project_path: project_path.to_string(),
            })?;

        let Some(claude_session_id) = meta.claude_session_id.filter(|id| !id.trim().is_empty())
        else {
            tracing::warn!(
                "Session metadata for {} has no CLI session handle",
                project_path
            );
            return Err(SessionRestoreError::InvalidSessionMetadata {
                project_path: project_path.to_string(),
            });
        };

        if self.is_open(&meta.session_id) {
            if !ctx.device_id.is_empty() {
                self.devices.subscribe_session(&ctx.device_id, &meta.session_id);
            }
            self.resources.sessions().touch(&meta.session_id);
            if let Some(session) = self.get_session(&meta.session_id) {
                return Ok(session);
            }
        }

        let now = Utc::now();
        let session = Session {
            session_id: meta.session_id.clone(),
            user_id: meta.user_id.clone(),
            project_path: project_path.to_string(),
            created_at: now,
            last_activity: now,
            claude_session_id: Some(claude_session_id),
            status: SessionState::Restoring,
        };
        let session = self.admit(session, ctx);
        tracing::info!(
            "Session {} restored for {}",
            session.session_id,
            project_path
        );
        self.emit(SessionEvent::SessionRestored {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Adopt a session the caller already holds, or fall back to restore
    pub fn handle_session_after_connection(
        &self,
        project_path: &str,
        passed: Option<Session>,
        ctx: &ConnectionContext,
    ) -> Result<Session, SessionError> {
        let Some(passed) = passed else {
            return Ok(self.restore_session(project_path, ctx)?);
        };

        if self.is_open(&passed.session_id) {
            if !ctx.device_id.is_empty() {
                self.devices
                    .subscribe_session(&ctx.device_id, &passed.session_id);
            }
            self.resources.sessions().touch(&passed.session_id);
            return self
                .get_session(&passed.session_id)
                .ok_or(SessionError::NotFound(passed.session_id));
        }

        let session = self.admit(passed, ctx);
        tracing::info!("Adopted session {} from device {}", session.session_id, ctx.device_id);
        self.emit(SessionEvent::SessionRestored {
            session: session.clone(),
        });
        Ok(session)
    }

    pub fn record_session_metadata(&self, project_path: &str, metadata: SessionMetadata) {
        self.metadata.insert(project_path.to_string(), metadata);
    }

    pub fn session_metadata(&self, project_path: &str) -> Option<SessionMetadata> {
        self.metadata.get(project_path).map(|m| m.clone())
    }

    pub fn close_session(&self, session_id: &str) -> bool {
        self.teardown(session_id, CloseReason::Explicit)
    }

    /// Idempotent; only the first caller for a session does the work
    fn teardown(&self, session_id: &str, reason: CloseReason) -> bool {
        let first = match self.sessions.get_mut(session_id) {
            Some(mut session) if session.status != SessionState::Closed => {
                session.status = SessionState::Closed;
                true
            }
            _ => false,
        };
        if !first {
            return false;
        }

        if let Some((_, turn)) = self.inflight.remove(session_id) {
            turn.handle.abort();
            tracing::info!(
                "Cancelled in-flight turn {} for session {}",
                turn.message_id,
                session_id
            );
        }
        self.queue.remove_queue(session_id);
        self.devices.clear_session(session_id);
        self.buffers.remove_buffer(session_id);
        self.resources.sessions().remove(session_id);
        self.sessions.remove(session_id);

        tracing::info!("Session {} closed ({:?})", session_id, reason);
        self.emit(SessionEvent::SessionClosed {
            session_id: session_id.to_string(),
            reason,
        });
        true
    }

    /// Accept a turn from a device. The first device to submit becomes
    /// primary; other devices are refused until primary moves to them.
    pub fn submit_message(
        self: &Arc<Self>,
        session_id: &str,
        device_id: &str,
        content: &str,
        priority: Priority,
    ) -> Result<QueueOutcome, SessionError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status == SessionState::Closed {
            return Err(SessionError::Closed(session_id.to_string()));
        }

        self.devices.update_last_seen(device_id);
        match self.devices.get_primary_device(session_id) {
            Some(primary) if primary != device_id => {
                return Err(SessionError::NotPrimary {
                    device_id: device_id.to_string(),
                    primary_device_id: primary,
                });
            }
            Some(_) => {}
            None => {
                let election = self
                    .devices
                    .elect_primary(&session.user_id, session_id, device_id);
                if !election.success {
                    return Err(SessionError::NotPrimary {
                        device_id: device_id.to_string(),
                        primary_device_id: election.primary_device_id.unwrap_or_default(),
                    });
                }
            }
        }

        let outcome = self.queue.queue_message(
            session_id,
            content,
            priority,
            QueueOptions {
                device_id: device_id.to_string(),
                project_path: session.project_path.clone(),
            },
        );
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
        self.resources.sessions().touch(session_id);

        if outcome.is_queued() {
            self.pump(session_id);
        }
        Ok(outcome)
    }

    /// Start the next queued turn unless one is already running
    pub fn pump(self: &Arc<Self>, session_id: &str) {
        // The entry guard is held until the handle is stored, so a turn that
        // finishes immediately cannot race its own registration
        let Entry::Vacant(slot) = self.inflight.entry(session_id.to_string()) else {
            return;
        };
        let Some(message) = self.queue.begin_next(session_id) else {
            return;
        };
        let message_id = message.message_id.clone();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.execute_turn(message).await });
        slot.insert(InflightTurn {
            message_id,
            handle: handle.abort_handle(),
        });
    }

    async fn execute_turn(self: Arc<Self>, message: QueuedMessage) {
        let session_id = message.session_id.clone();
        let request_id = message.message_id.clone();

        let Some(session) = self.get_session(&session_id) else {
            self.finish_turn(&session_id, &request_id);
            return;
        };

        self.resources.sessions().set_interactive(&session_id, true);
        self.buffers.store_message(
            &session_id,
            "user",
            &message.payload,
            json!({ "deviceId": message.device_id, "requestId": request_id }),
        );
        self.emit(SessionEvent::TurnStarted {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            device_id: message.device_id.clone(),
        });

        let request = TurnRequest {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            prompt: message.payload.clone(),
            project_path: session.project_path.clone(),
            claude_session_id: session.claude_session_id.clone(),
        };
        let result = self.runner.run_turn(&request).await;

        if !self.is_open(&session_id) {
            return;
        }

        let outcome = match result {
            Ok(result) => {
                self.store_response(&session, &result);
                TurnOutcome::Completed { result }
            }
            Err(error) => {
                tracing::warn!(
                    "Turn {} for session {} failed: {}",
                    request_id,
                    session_id,
                    error
                );
                TurnOutcome::Failed {
                    retryable: error.kind.is_retryable(),
                    error,
                }
            }
        };

        self.resources.sessions().set_interactive(&session_id, false);
        self.resources.sessions().touch(&session_id);
        self.finish_turn(&session_id, &request_id);

        self.notifier
            .notify(&message.device_id, &session_id, &request_id, &outcome);
        self.emit(SessionEvent::TurnCompleted {
            session_id: session_id.clone(),
            request_id,
            device_id: message.device_id,
            outcome,
        });

        self.pump(&session_id);
    }

    fn finish_turn(&self, session_id: &str, request_id: &str) {
        self.queue.complete(session_id, request_id);
        self.inflight
            .remove_if(session_id, |_, turn| turn.message_id == request_id);
    }

    fn store_response(&self, session: &Session, result: &TurnResult) {
        let mut metadata = match serde_json::to_value(&result.metadata) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(request_id) = &result.request_id {
            metadata.insert("requestId".to_string(), Value::String(request_id.clone()));
        }
        self.buffers.store_message(
            &session.session_id,
            "assistant",
            &result.response,
            Value::Object(metadata),
        );

        let claude_session_id = result
            .claude_session_id
            .clone()
            .or_else(|| session.claude_session_id.clone());
        if let Some(mut live) = self.sessions.get_mut(&session.session_id) {
            live.claude_session_id = claude_session_id.clone();
            live.last_activity = Utc::now();
        }
        if claude_session_id.is_some() {
            self.record_session_metadata(
                &session.project_path,
                SessionMetadata {
                    session_id: session.session_id.clone(),
                    user_id: session.user_id.clone(),
                    claude_session_id,
                    updated_at: Utc::now(),
                },
            );
        }
    }

    /// Finish teardown for sessions the resource manager evicts
    pub fn start_reaper(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut resource_events = self.resources.subscribe();
        let manager = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = resource_events.recv() => match event {
                        Ok(ResourceEvent::SessionEvicted { session_id, .. }) => {
                            let Some(manager) = manager.upgrade() else { break };
                            manager.teardown(&session_id, CloseReason::Evicted);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Eviction reaper lagged by {} event(s)", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Eviction reaper stopped");
        });

        if let Ok(mut slot) = self.reaper.lock() {
            *slot = Some(Reaper {
                shutdown: shutdown_tx,
                handle,
            });
        }
    }

    /// Stop the reaper and close every open session
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().ok().and_then(|mut r| r.take());
        if let Some(reaper) = reaper {
            let _ = reaper.shutdown.send(true);
            let _ = reaper.handle.await;
        }

        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.teardown(&id, CloseReason::Shutdown);
        }
    }
}
