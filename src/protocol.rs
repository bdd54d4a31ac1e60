//! Wire protocol
//!
//! Newline-delimited JSON. Every request gets exactly one response in
//! order; events and turn completions are interleaved as they happen.

use crate::buffer::{BufferExport, Message, DEFAULT_PAGE_LIMIT};
use crate::device::{Device, DeviceEvent, DeviceMetadata, DeviceStats, DeviceView, ElectionResult, TransferResult};
use crate::error::SessionError;
use crate::queue::{Priority, QueueEvent, QueueOutcome, QueueStatus};
use crate::resources::{ResourceEvent, SessionResourceStatus, SystemStatus};
use crate::session::{Session, SessionEvent, TurnOutcome};
use serde::{Deserialize, Serialize};

/// Requests from a device-facing transport
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterDevice {
        user_id: String,
        device_id: String,
        #[serde(default)]
        metadata: DeviceMetadata,
    },
    Heartbeat {
        device_id: String,
    },
    UnregisterDevice {
        device_id: String,
    },
    GetActiveDevices {
        user_id: String,
    },
    GetDeviceStats,
    ElectPrimary {
        user_id: String,
        session_id: String,
        device_id: String,
    },
    TransferPrimary {
        session_id: String,
        from_device_id: String,
        to_device_id: String,
    },
    ReleasePrimary {
        session_id: String,
        device_id: String,
    },
    GetPrimaryDevice {
        session_id: String,
    },
    SubscribeSession {
        device_id: String,
        session_id: String,
    },
    UnsubscribeSession {
        device_id: String,
        session_id: String,
    },
    CreateSession {
        project_path: String,
        user_id: String,
        device_id: String,
    },
    /// Adopt `session` if given, otherwise restore the project's last session
    ResumeSession {
        project_path: String,
        user_id: String,
        device_id: String,
        #[serde(default)]
        session: Option<Session>,
    },
    CloseSession {
        session_id: String,
    },
    ListSessions,
    SendMessage {
        session_id: String,
        device_id: String,
        content: String,
        #[serde(default)]
        priority: Priority,
    },
    PauseQueue {
        session_id: String,
    },
    ResumeQueue {
        session_id: String,
    },
    GetQueueStatus {
        session_id: String,
    },
    GetMessages {
        session_id: String,
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },
    ClearMessages {
        session_id: String,
    },
    ExportMessages {
        session_id: String,
    },
    ImportMessages {
        session_id: String,
        data: BufferExport,
    },
    GetSessionStatus {
        session_id: String,
    },
    GetSystemStatus,
    CalculateTimeout {
        command: String,
    },
    Ping,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// Responses and pushed events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        success: bool,
        device: Device,
    },
    /// Outcome of an operation with no other payload
    Ack {
        operation: String,
        success: bool,
    },
    ActiveDevices {
        user_id: String,
        devices: Vec<DeviceView>,
    },
    DeviceStats {
        stats: DeviceStats,
    },
    Election {
        session_id: String,
        #[serde(flatten)]
        result: ElectionResult,
    },
    Transfer {
        session_id: String,
        #[serde(flatten)]
        result: TransferResult,
    },
    PrimaryDevice {
        session_id: String,
        device_id: Option<String>,
    },
    Session {
        session: Session,
    },
    Sessions {
        sessions: Vec<Session>,
    },
    Submitted {
        session_id: String,
        #[serde(flatten)]
        outcome: QueueOutcome,
    },
    QueueStatus {
        session_id: String,
        #[serde(flatten)]
        status: QueueStatus,
    },
    Messages {
        session_id: String,
        messages: Vec<Message>,
        total: usize,
    },
    Export {
        data: BufferExport,
    },
    SessionStatus {
        session_id: String,
        status: SessionResourceStatus,
    },
    SystemStatus {
        status: SystemStatus,
    },
    Timeout {
        command: String,
        timeout_ms: u64,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
    TurnCompleted {
        session_id: String,
        request_id: String,
        device_id: String,
        outcome: TurnOutcome,
    },
    DeviceEvent {
        event: DeviceEvent,
    },
    QueueEvent {
        event: QueueEvent,
    },
    SessionEvent {
        event: SessionEvent,
    },
    ResourceEvent {
        event: ResourceEvent,
    },
}

impl ServerMessage {
    pub fn ack(operation: &str, success: bool) -> Self {
        ServerMessage::Ack {
            operation: operation.to_string(),
            success,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Turn completions get their own message type; other session
    /// events are wrapped
    pub fn from_session_event(event: SessionEvent) -> Self {
        match event {
            SessionEvent::TurnCompleted {
                session_id,
                request_id,
                device_id,
                outcome,
            } => ServerMessage::TurnCompleted {
                session_id,
                request_id,
                device_id,
                outcome,
            },
            other => ServerMessage::SessionEvent { event: other },
        }
    }

    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize server message: {}", e);
                r#"{"type":"error","code":"serialization","message":"failed to serialize response"}"#
                    .to_string()
            }
        }
    }
}

impl From<SessionError> for ServerMessage {
    fn from(err: SessionError) -> Self {
        let code = match &err {
            SessionError::NotFound(_) => "session_not_found",
            SessionError::Closed(_) => "session_closed",
            SessionError::NotPrimary { .. } => "not_primary",
            SessionError::Restore(restore) => restore.code(),
        };
        ServerMessage::error(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionRestoreError;
    use serde_json::Value;

    #[test]
    fn parses_send_message_with_default_priority() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"send_message","session_id":"s1","device_id":"d1","content":"hi"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SendMessage { priority, content, .. } => {
                assert_eq!(priority, Priority::Normal);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn get_messages_defaults_page() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"get_messages","session_id":"s1"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::GetMessages { limit: 50, offset: 0, .. }
        ));
    }

    #[test]
    fn unit_requests_parse() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_system_status"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetSystemStatus));
    }

    #[test]
    fn election_result_is_flattened() {
        let msg = ServerMessage::Election {
            session_id: "s1".to_string(),
            result: ElectionResult {
                success: false,
                is_primary: false,
                primary_device_id: Some("d1".to_string()),
                reason: Some(crate::error::PrimaryConflict::PrimaryExists),
            },
        };
        let value: Value = serde_json::from_str(&msg.to_line()).unwrap();
        assert_eq!(value["type"], "election");
        assert_eq!(value["reason"], "primary_exists");
        assert_eq!(value["primaryDeviceId"], "d1");
    }

    #[test]
    fn restore_errors_keep_distinct_codes() {
        let none: ServerMessage = SessionError::from(SessionRestoreError::NoExistingSession {
            project_path: "/p".to_string(),
        })
        .into();
        let bad: ServerMessage = SessionError::from(SessionRestoreError::InvalidSessionMetadata {
            project_path: "/p".to_string(),
        })
        .into();
        let none: Value = serde_json::from_str(&none.to_line()).unwrap();
        let bad: Value = serde_json::from_str(&bad.to_line()).unwrap();
        assert_eq!(none["code"], "no_existing_session");
        assert_eq!(bad["code"], "invalid_session_metadata");
    }
}
