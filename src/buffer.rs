//! Message buffer store
//!
//! Per-session history of user and assistant messages with pagination,
//! export/import for handoff, and trimming under memory pressure.

use crate::resources::ActiveSessions;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Insertion order within the buffer; breaks timestamp ties
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBuffer {
    pub user_messages: Vec<Message>,
    pub assistant_messages: Vec<Message>,
    pub thinking_metadata: Map<String, Value>,
    #[serde(skip)]
    next_sequence: u64,
    #[serde(skip)]
    last_timestamp: Option<DateTime<Utc>>,
}

impl MessageBuffer {
    fn push(&mut self, role: Role, content: &str, metadata: Map<String, Value>) {
        // Never go backwards, even if the wall clock does
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let message = Message {
            role,
            content: content.to_string(),
            timestamp,
            sequence: self.next_sequence,
            metadata,
        };
        self.next_sequence += 1;
        self.last_timestamp = Some(timestamp);
        match role {
            Role::User => self.user_messages.push(message),
            Role::Assistant => self.assistant_messages.push(message),
        }
    }

    fn merged(&self) -> Vec<Message> {
        let mut all: Vec<Message> = self
            .user_messages
            .iter()
            .chain(self.assistant_messages.iter())
            .cloned()
            .collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.sequence.cmp(&b.sequence)));
        all
    }

    pub fn message_count(&self) -> usize {
        self.user_messages.len() + self.assistant_messages.len()
    }

    fn reindex(&mut self) {
        let (next_sequence, last_timestamp) = self
            .user_messages
            .iter()
            .chain(self.assistant_messages.iter())
            .fold((0, None), |(seq, ts): (u64, Option<DateTime<Utc>>), m| {
                (seq.max(m.sequence + 1), ts.max(Some(m.timestamp)))
            });
        self.next_sequence = next_sequence;
        self.last_timestamp = last_timestamp;
    }
}

/// Serialized buffer contents for handoff and backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferExport {
    pub session_id: String,
    pub user_messages: Vec<Message>,
    pub assistant_messages: Vec<Message>,
    #[serde(default)]
    pub thinking_metadata: Map<String, Value>,
    pub exported_at: DateTime<Utc>,
}

pub struct MessageBufferStore {
    buffers: DashMap<String, MessageBuffer>,
    activity: Arc<ActiveSessions>,
}

impl MessageBufferStore {
    pub fn new(activity: Arc<ActiveSessions>) -> Self {
        Self {
            buffers: DashMap::new(),
            activity,
        }
    }

    pub fn get_or_create_buffer(&self, session_id: &str) {
        self.buffers.entry(session_id.to_string()).or_default();
    }

    pub fn has_buffer(&self, session_id: &str) -> bool {
        self.buffers.contains_key(session_id)
    }

    /// Append a message; roles other than `user`/`assistant` are rejected
    pub fn store_message(&self, session_id: &str, role: &str, content: &str, metadata: Value) -> bool {
        let Some(role) = Role::parse(role) else {
            tracing::warn!("Rejecting message with role {:?} for session {}", role, session_id);
            return false;
        };

        let mut metadata = match metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let thinking = metadata.remove("thinkingMetadata");

        {
            let mut buffer = self.buffers.entry(session_id.to_string()).or_default();
            if let Some(Value::Object(thinking)) = thinking {
                buffer.thinking_metadata.extend(thinking);
            }
            buffer.push(role, content, metadata);
        }

        self.activity.touch(session_id);
        true
    }

    pub fn get_messages(&self, session_id: &str, limit: usize, offset: usize) -> Vec<Message> {
        match self.buffers.get(session_id) {
            Some(buffer) => buffer.merged().into_iter().skip(offset).take(limit).collect(),
            None => Vec::new(),
        }
    }

    pub fn message_count(&self, session_id: &str) -> usize {
        self.buffers
            .get(session_id)
            .map(|b| b.message_count())
            .unwrap_or(0)
    }

    pub fn thinking_metadata(&self, session_id: &str) -> Map<String, Value> {
        self.buffers
            .get(session_id)
            .map(|b| b.thinking_metadata.clone())
            .unwrap_or_default()
    }

    pub fn clear_buffer(&self, session_id: &str) -> bool {
        match self.buffers.get_mut(session_id) {
            Some(mut buffer) => {
                buffer.user_messages.clear();
                buffer.assistant_messages.clear();
                buffer.thinking_metadata.clear();
                true
            }
            None => false,
        }
    }

    /// Drop the buffer entirely (session closed)
    pub fn remove_buffer(&self, session_id: &str) -> bool {
        self.buffers.remove(session_id).is_some()
    }

    pub fn export_session_messages(&self, session_id: &str) -> Option<BufferExport> {
        self.buffers.get(session_id).map(|buffer| BufferExport {
            session_id: session_id.to_string(),
            user_messages: buffer.user_messages.clone(),
            assistant_messages: buffer.assistant_messages.clone(),
            thinking_metadata: buffer.thinking_metadata.clone(),
            exported_at: Utc::now(),
        })
    }

    /// Replace the buffer with imported contents in one step
    pub fn import_session_messages(&self, session_id: &str, data: BufferExport) -> bool {
        let mut buffer = MessageBuffer {
            user_messages: data.user_messages,
            assistant_messages: data.assistant_messages,
            thinking_metadata: data.thinking_metadata,
            ..Default::default()
        };
        let misfiled = buffer.user_messages.iter().any(|m| m.role != Role::User)
            || buffer
                .assistant_messages
                .iter()
                .any(|m| m.role != Role::Assistant);
        if misfiled {
            tracing::warn!("Rejecting import for session {}: roles do not match lists", session_id);
            return false;
        }
        buffer.reindex();
        let count = buffer.message_count();
        self.buffers.insert(session_id.to_string(), buffer);
        tracing::info!("Imported {} message(s) into session {}", count, session_id);
        true
    }

    /// Keep only the most recent `keep` messages per role
    pub fn trim_buffer(&self, session_id: &str, keep: usize) -> usize {
        let Some(mut guard) = self.buffers.get_mut(session_id) else {
            return 0;
        };
        let buffer = &mut *guard;
        let mut dropped = 0;
        for list in [&mut buffer.user_messages, &mut buffer.assistant_messages] {
            if list.len() > keep {
                let excess = list.len() - keep;
                list.drain(..excess);
                dropped += excess;
            }
        }
        dropped
    }

    /// Serialized size of a buffer in bytes
    pub fn estimate_size(&self, session_id: &str) -> u64 {
        self.buffers
            .get(session_id)
            .and_then(|b| serde_json::to_vec(&*b).ok())
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.buffers.iter().map(|b| b.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MessageBufferStore {
        MessageBufferStore::new(Arc::new(ActiveSessions::new()))
    }

    #[test]
    fn unknown_role_is_rejected_without_mutation() {
        let store = store();
        assert!(!store.store_message("s1", "system", "boot", Value::Null));
        assert!(!store.has_buffer("s1"));
        assert!(store.store_message("s1", "user", "hi", Value::Null));
        assert!(!store.store_message("s1", "tool", "x", Value::Null));
        assert_eq!(store.message_count("s1"), 1);
    }

    #[test]
    fn interleaved_roles_come_back_chronological() {
        let store = store();
        store.store_message("s1", "user", "q1", Value::Null);
        store.store_message("s1", "assistant", "a1", Value::Null);
        store.store_message("s1", "user", "q2", Value::Null);
        store.store_message("s1", "user", "q3", Value::Null);
        store.store_message("s1", "assistant", "a2", Value::Null);

        let messages = store.get_messages("s1", DEFAULT_PAGE_LIMIT, 0);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "q3", "a2"]);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn pagination_applies_offset_then_limit() {
        let store = store();
        for i in 0..5 {
            store.store_message("s1", "user", &format!("m{}", i), Value::Null);
        }
        let page: Vec<String> = store
            .get_messages("s1", 2, 1)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(page, vec!["m1", "m2"]);
        assert!(store.get_messages("s1", 10, 10).is_empty());
        assert!(store.get_messages("missing", 10, 0).is_empty());
    }

    #[test]
    fn thinking_metadata_is_merged() {
        let store = store();
        store.store_message(
            "s1",
            "assistant",
            "a",
            json!({"thinkingMetadata": {"level": "high"}, "model": "m"}),
        );
        store.store_message(
            "s1",
            "assistant",
            "b",
            json!({"thinkingMetadata": {"budget": 1024}}),
        );
        let thinking = store.thinking_metadata("s1");
        assert_eq!(thinking.get("level"), Some(&json!("high")));
        assert_eq!(thinking.get("budget"), Some(&json!(1024)));

        let first = &store.get_messages("s1", 1, 0)[0];
        assert_eq!(first.metadata.get("model"), Some(&json!("m")));
        assert!(!first.metadata.contains_key("thinkingMetadata"));
    }

    #[test]
    fn export_import_round_trip_is_idempotent() {
        let store = store();
        store.store_message("s1", "user", "q", json!({"deviceId": "d1"}));
        store.store_message("s1", "assistant", "a", json!({"thinkingMetadata": {"k": 1}}));

        let before = store.export_session_messages("s1").unwrap();
        assert!(store.import_session_messages("s1", before.clone()));
        let after = store.export_session_messages("s1").unwrap();

        assert_eq!(before.user_messages, after.user_messages);
        assert_eq!(before.assistant_messages, after.assistant_messages);
        assert_eq!(before.thinking_metadata, after.thinking_metadata);

        // New messages continue after imported history
        store.store_message("s1", "user", "q2", Value::Null);
        let all = store.get_messages("s1", 10, 0);
        assert_eq!(all.last().map(|m| m.content.as_str()), Some("q2"));
    }

    #[test]
    fn import_replaces_existing_content() {
        let source = store();
        source.store_message("s1", "user", "from phone", Value::Null);
        let export = source.export_session_messages("s1").unwrap();

        let target = store();
        target.store_message("s2", "user", "old", Value::Null);
        target.store_message("s2", "assistant", "old reply", Value::Null);
        assert!(target.import_session_messages("s2", export));
        let contents: Vec<String> = target
            .get_messages("s2", 10, 0)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["from phone"]);
    }

    #[test]
    fn clear_and_trim() {
        let store = store();
        assert!(!store.clear_buffer("s1"));
        for i in 0..15 {
            store.store_message("s1", "user", &format!("u{}", i), Value::Null);
            store.store_message("s1", "assistant", &format!("a{}", i), Value::Null);
        }
        assert!(store.estimate_size("s1") > 0);
        assert_eq!(store.trim_buffer("s1", 10), 10);
        let messages = store.get_messages("s1", 100, 0);
        assert_eq!(messages.len(), 20);
        assert_eq!(messages[0].content, "u5");

        assert!(store.clear_buffer("s1"));
        assert_eq!(store.message_count("s1"), 0);
    }

    #[test]
    fn storing_refreshes_session_activity() {
        let activity = Arc::new(ActiveSessions::new());
        let past = Utc::now() - chrono::Duration::seconds(600);
        activity.insert_at("s1", past);
        let store = MessageBufferStore::new(activity.clone());

        store.store_message("s1", "user", "hi", Value::Null);
        let session = activity.get("s1").unwrap();
        assert!(session.last_activity > past);
    }
}
