//! Service wiring
//!
//! Builds every service once from a [`Config`], routes protocol requests to
//! them and owns the shutdown sequence.

use crate::buffer::MessageBufferStore;
use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::error::SessionError;
use crate::notify::{LogNotifier, TurnNotifier};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::queue::MessageQueue;
use crate::resources::{ActiveSessions, ResourceManager, SysinfoProbe, SystemProbe};
use crate::runner::{calculate_timeout_for_command, ProcessRunner};
use crate::session::{ConnectionContext, SessionManager};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Hub {
    config: Config,
    pub devices: Arc<DeviceRegistry>,
    pub queue: Arc<MessageQueue>,
    pub buffers: Arc<MessageBufferStore>,
    pub resources: Arc<ResourceManager>,
    pub sessions: Arc<SessionManager>,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        let runner = ProcessRunner::from_config(&config);
        Self::with_parts(config, runner, Box::new(SysinfoProbe::new()), Arc::new(LogNotifier))
    }

    pub fn with_parts(
        config: Config,
        runner: ProcessRunner,
        probe: Box<dyn SystemProbe>,
        notifier: Arc<dyn TurnNotifier>,
    ) -> Self {
        let devices = Arc::new(DeviceRegistry::new(config.liveness_timeout()));
        let queue = Arc::new(MessageQueue::new(config.dedup_window()));
        let active = Arc::new(ActiveSessions::new());
        let buffers = Arc::new(MessageBufferStore::new(active.clone()));
        let resources = Arc::new(ResourceManager::new(
            &config,
            active,
            buffers.clone(),
            probe,
        ));
        let sessions = Arc::new(SessionManager::new(
            devices.clone(),
            queue.clone(),
            buffers.clone(),
            resources.clone(),
            Arc::new(runner),
            notifier,
        ));
        Self {
            config,
            devices,
            queue,
            buffers,
            resources,
            sessions,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the background tasks: liveness sweep, resource audit, eviction reaper
    pub fn start(&self) {
        self.devices
            .start_liveness_sweep(self.config.heartbeat_sweep_interval());
        self.resources
            .start_audit(self.config.resource_audit_interval());
        self.sessions.start_reaper();
        tracing::info!(
            "Hub started (max {} sessions, liveness {}s)",
            self.config.max_concurrent_sessions,
            self.config.liveness_timeout_secs
        );
    }

    /// Forward every service event into `tx` until the receiver goes away
    pub fn forward_events(&self, tx: mpsc::UnboundedSender<ServerMessage>) {
        let mut device_events = self.devices.subscribe();
        let mut queue_events = self.queue.subscribe();
        let mut session_events = self.sessions.subscribe();
        let mut resource_events = self.resources.subscribe();

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    Ok(event) = device_events.recv() => ServerMessage::DeviceEvent { event },
                    Ok(event) = queue_events.recv() => ServerMessage::QueueEvent { event },
                    Ok(event) = session_events.recv() => ServerMessage::from_session_event(event),
                    Ok(event) = resource_events.recv() => ServerMessage::ResourceEvent { event },
                    else => break,
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
            tracing::debug!("Event forwarding stopped");
        });
    }

    /// Requests that create per-session state only apply to known sessions,
    /// since teardown is what clears that state
    fn require_session(&self, session_id: &str) -> Result<(), ServerMessage> {
        match self.sessions.get_session(session_id) {
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound(session_id.to_string()).into()),
        }
    }

    pub fn handle(&self, msg: ClientMessage) -> ServerMessage {
        match msg {
            ClientMessage::RegisterDevice {
                user_id,
                device_id,
                metadata,
            } => {
                let result = self.devices.register_device(&user_id, &device_id, metadata);
                ServerMessage::Registered {
                    success: result.success,
                    device: result.device,
                }
            }
            ClientMessage::Heartbeat { device_id } => {
                let known = self.devices.get_device(&device_id).is_some();
                self.devices.update_last_seen(&device_id);
                ServerMessage::ack("heartbeat", known)
            }
            ClientMessage::UnregisterDevice { device_id } => {
                ServerMessage::ack("unregister_device", self.devices.unregister_device(&device_id))
            }
            ClientMessage::GetActiveDevices { user_id } => ServerMessage::ActiveDevices {
                devices: self.devices.get_active_devices(&user_id),
                user_id,
            },
            ClientMessage::GetDeviceStats => ServerMessage::DeviceStats {
                stats: self.devices.get_stats(),
            },
            ClientMessage::ElectPrimary {
                user_id,
                session_id,
                device_id,
            } => match self.require_session(&session_id) {
                Err(e) => e,
                Ok(()) => ServerMessage::Election {
                    result: self.devices.elect_primary(&user_id, &session_id, &device_id),
                    session_id,
                },
            },
            ClientMessage::TransferPrimary {
                session_id,
                from_device_id,
                to_device_id,
            } => ServerMessage::Transfer {
                result: self
                    .devices
                    .transfer_primary(&session_id, &from_device_id, &to_device_id),
                session_id,
            },
            ClientMessage::ReleasePrimary {
                session_id,
                device_id,
            } => ServerMessage::ack(
                "release_primary",
                self.devices.release_primary(&session_id, &device_id),
            ),
            ClientMessage::GetPrimaryDevice { session_id } => ServerMessage::PrimaryDevice {
                device_id: self.devices.get_primary_device(&session_id),
                session_id,
            },
            ClientMessage::SubscribeSession {
                device_id,
                session_id,
            } => {
                self.devices.subscribe_session(&device_id, &session_id);
                ServerMessage::ack("subscribe_session", true)
            }
            ClientMessage::UnsubscribeSession {
                device_id,
                session_id,
            } => {
                self.devices.unsubscribe_session(&device_id, &session_id);
                ServerMessage::ack("unsubscribe_session", true)
            }
            ClientMessage::CreateSession {
                project_path,
                user_id,
                device_id,
            } => {
                let ctx = ConnectionContext { user_id, device_id };
                ServerMessage::Session {
                    session: self.sessions.create_session(&project_path, &ctx),
                }
            }
            ClientMessage::ResumeSession {
                project_path,
                user_id,
                device_id,
                session,
            } => {
                let ctx = ConnectionContext { user_id, device_id };
                match self
                    .sessions
                    .handle_session_after_connection(&project_path, session, &ctx)
                {
                    Ok(session) => ServerMessage::Session { session },
                    Err(e) => e.into(),
                }
            }
            ClientMessage::CloseSession { session_id } => {
                ServerMessage::ack("close_session", self.sessions.close_session(&session_id))
            }
            ClientMessage::ListSessions => ServerMessage::Sessions {
                sessions: self.sessions.list_sessions(),
            },
            ClientMessage::SendMessage {
                session_id,
                device_id,
                content,
                priority,
            } => match self
                .sessions
                .submit_message(&session_id, &device_id, &content, priority)
            {
                Ok(outcome) => ServerMessage::Submitted {
                    session_id,
                    outcome,
                },
                Err(e) => e.into(),
            },
            ClientMessage::PauseQueue { session_id } => match self.require_session(&session_id) {
                Err(e) => e,
                Ok(()) => {
                    self.queue.pause_queue(&session_id);
                    ServerMessage::ack("pause_queue", true)
                }
            },
            ClientMessage::ResumeQueue { session_id } => match self.require_session(&session_id) {
                Err(e) => e,
                Ok(()) => {
                    self.queue.resume_queue(&session_id);
                    self.sessions.pump(&session_id);
                    ServerMessage::ack("resume_queue", true)
                }
            },
            ClientMessage::GetQueueStatus { session_id } => ServerMessage::QueueStatus {
                status: self.queue.get_queue_status(&session_id),
                session_id,
            },
            ClientMessage::GetMessages {
                session_id,
                limit,
                offset,
            } => ServerMessage::Messages {
                messages: self.buffers.get_messages(&session_id, limit, offset),
                total: self.buffers.message_count(&session_id),
                session_id,
            },
            ClientMessage::ClearMessages { session_id } => {
                ServerMessage::ack("clear_messages", self.buffers.clear_buffer(&session_id))
            }
            ClientMessage::ExportMessages { session_id } => {
                match self.buffers.export_session_messages(&session_id) {
                    Some(data) => ServerMessage::Export { data },
                    None => ServerMessage::error(
                        "no_buffer",
                        format!("no messages stored for session {}", session_id),
                    ),
                }
            }
            ClientMessage::ImportMessages { session_id, data } => ServerMessage::ack(
                "import_messages",
                self.buffers.import_session_messages(&session_id, data),
            ),
            ClientMessage::GetSessionStatus { session_id } => ServerMessage::SessionStatus {
                status: self.resources.get_session_status(&session_id),
                session_id,
            },
            ClientMessage::GetSystemStatus => ServerMessage::SystemStatus {
                status: self.resources.get_system_status(),
            },
            ClientMessage::CalculateTimeout { command } => ServerMessage::Timeout {
                timeout_ms: calculate_timeout_for_command(&command).as_millis() as u64,
                command,
            },
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Stop background tasks and close every session
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.sessions.shutdown().await;
        self.resources.shutdown().await;
        self.devices.shutdown().await;
    }
}
