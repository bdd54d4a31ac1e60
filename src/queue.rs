//! Per-session message queue
//!
//! Orders turns by priority then arrival, suppresses identical submissions
//! within the dedup window, and hands out at most one in-flight message per
//! session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message_id: String,
    pub session_id: String,
    pub content_hash: String,
    pub priority: Priority,
    pub device_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateInfo {
    pub original_device_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueueOutcome {
    #[serde(rename_all = "camelCase")]
    Queued {
        queued: bool,
        message_id: String,
        message_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    Duplicate {
        queued: bool,
        reason: String,
        duplicate_info: DuplicateInfo,
    },
}

impl QueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, QueueOutcome::Queued { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue: Vec<QueuedMessage>,
    pub paused: bool,
    pub processing: bool,
    pub in_flight: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    MessageQueued {
        session_id: String,
        message_id: String,
        device_id: String,
        priority: Priority,
    },
    DuplicateMessage {
        session_id: String,
        message_hash: String,
        device_id: String,
        original_device_id: String,
        original_message_id: String,
    },
}

/// Submitter attribution for `queue_message`
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub device_id: String,
    pub project_path: String,
}

#[derive(Debug, Clone)]
struct DedupRecord {
    message_id: String,
    device_id: String,
    seen_at: DateTime<Utc>,
    /// Still queued or in flight; such records never expire
    pending: bool,
}

#[derive(Debug, Default)]
struct SessionQueue {
    tiers: BTreeMap<Priority, VecDeque<QueuedMessage>>,
    paused: bool,
    in_flight: Option<QueuedMessage>,
    recent: HashMap<String, DedupRecord>,
}

impl SessionQueue {
    fn purge_expired(&mut self, now: DateTime<Utc>, window: Duration) {
        self.recent.retain(|_, record| {
            record.pending
                || now
                    .signed_duration_since(record.seen_at)
                    .to_std()
                    .map(|age| age < window)
                    .unwrap_or(true)
        });
    }

    fn ordered(&self) -> Vec<QueuedMessage> {
        self.tiers
            .iter()
            .rev()
            .flat_map(|(_, tier)| tier.iter().cloned())
            .collect()
    }

    fn pop_next(&mut self) -> Option<QueuedMessage> {
        let next = self
            .tiers
            .iter_mut()
            .rev()
            .find_map(|(_, tier)| tier.pop_front());
        self.tiers.retain(|_, tier| !tier.is_empty());
        next
    }

    fn len(&self) -> usize {
        self.tiers.values().map(VecDeque::len).sum()
    }
}

/// Collapse whitespace so cosmetic differences still deduplicate
fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Device-independent content hash (md5 hex over session, project, content)
pub fn content_hash(session_id: &str, project_path: &str, content: &str) -> String {
    let canonical = format!(
        "{}\0{}\0{}",
        session_id,
        project_path,
        normalize_content(content)
    );
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

pub struct MessageQueue {
    sessions: DashMap<String, SessionQueue>,
    dedup_window: Duration,
    events: broadcast::Sender<QueueEvent>,
}

impl MessageQueue {
    pub fn new(dedup_window: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            dedup_window,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn queue_message(
        &self,
        session_id: &str,
        content: &str,
        priority: Priority,
        options: QueueOptions,
    ) -> QueueOutcome {
        self.queue_message_at(session_id, content, priority, options, Utc::now())
    }

    pub fn queue_message_at(
        &self,
        session_id: &str,
        content: &str,
        priority: Priority,
        options: QueueOptions,
        now: DateTime<Utc>,
    ) -> QueueOutcome {
        let hash = content_hash(session_id, &options.project_path, content);
        let mut queue = self.sessions.entry(session_id.to_string()).or_default();
        queue.purge_expired(now, self.dedup_window);

        if let Some(original) = queue.recent.get(&hash) {
            let duplicate_info = DuplicateInfo {
                original_device_id: original.device_id.clone(),
                message_id: original.message_id.clone(),
            };
            drop(queue);
            tracing::warn!(
                "Duplicate message for session {} from {} (original {} by {})",
                session_id,
                options.device_id,
                duplicate_info.message_id,
                duplicate_info.original_device_id
            );
            let _ = self.events.send(QueueEvent::DuplicateMessage {
                session_id: session_id.to_string(),
                message_hash: hash,
                device_id: options.device_id,
                original_device_id: duplicate_info.original_device_id.clone(),
                original_message_id: duplicate_info.message_id.clone(),
            });
            return QueueOutcome::Duplicate {
                queued: false,
                reason: "duplicate".to_string(),
                duplicate_info,
            };
        }

        let message = QueuedMessage {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            content_hash: hash.clone(),
            priority,
            device_id: options.device_id,
            enqueued_at: now,
            payload: content.to_string(),
        };
        queue.recent.insert(
            hash.clone(),
            DedupRecord {
                message_id: message.message_id.clone(),
                device_id: message.device_id.clone(),
                seen_at: now,
                pending: true,
            },
        );
        queue
            .tiers
            .entry(priority)
            .or_default()
            .push_back(message.clone());
        let depth = queue.len();
        drop(queue);

        tracing::debug!(
            "Queued message {} for session {} ({:?}, depth {})",
            message.message_id,
            session_id,
            priority,
            depth
        );
        let _ = self.events.send(QueueEvent::MessageQueued {
            session_id: session_id.to_string(),
            message_id: message.message_id.clone(),
            device_id: message.device_id.clone(),
            priority,
        });
        QueueOutcome::Queued {
            queued: true,
            message_id: message.message_id,
            message_hash: hash,
        }
    }

    /// Take the next message unless the session is paused or already busy
    pub fn begin_next(&self, session_id: &str) -> Option<QueuedMessage> {
        let mut queue = self.sessions.get_mut(session_id)?;
        if queue.paused || queue.in_flight.is_some() {
            return None;
        }
        let next = queue.pop_next()?;
        queue.in_flight = Some(next.clone());
        Some(next)
    }

    /// Release the in-flight slot; the hash stays until the window passes
    pub fn complete(&self, session_id: &str, message_id: &str) -> bool {
        self.complete_at(session_id, message_id, Utc::now())
    }

    pub fn complete_at(&self, session_id: &str, message_id: &str, now: DateTime<Utc>) -> bool {
        let Some(mut queue) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let matches = queue
            .in_flight
            .as_ref()
            .map(|m| m.message_id == message_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(done) = queue.in_flight.take() {
            if let Some(record) = queue.recent.get_mut(&done.content_hash) {
                record.pending = false;
                record.seen_at = now;
            }
        }
        true
    }

    pub fn pause_queue(&self, session_id: &str) {
        self.sessions.entry(session_id.to_string()).or_default().paused = true;
        tracing::debug!("Queue paused for session {}", session_id);
    }

    pub fn resume_queue(&self, session_id: &str) {
        if let Some(mut queue) = self.sessions.get_mut(session_id) {
            queue.paused = false;
        }
        tracing::debug!("Queue resumed for session {}", session_id);
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|q| q.paused)
            .unwrap_or(false)
    }

    pub fn get_queue_status(&self, session_id: &str) -> QueueStatus {
        match self.sessions.get(session_id) {
            Some(queue) => QueueStatus {
                queue: queue.ordered(),
                paused: queue.paused,
                processing: queue.in_flight.is_some(),
                in_flight: queue.in_flight.as_ref().map(|m| m.message_id.clone()),
            },
            None => QueueStatus {
                queue: Vec::new(),
                paused: false,
                processing: false,
                in_flight: None,
            },
        }
    }

    /// Drop all state for a closed session; returns how many queued entries were cancelled
    pub fn remove_queue(&self, session_id: &str) -> usize {
        match self.sessions.remove(session_id) {
            Some((_, queue)) => {
                let cancelled = queue.len();
                if cancelled > 0 {
                    tracing::info!(
                        "Cancelled {} queued message(s) for session {}",
                        cancelled,
                        session_id
                    );
                }
                cancelled
            }
            None => 0,
        }
    }

    /// Sessions that have queued work and nothing in flight
    pub fn ready_sessions(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|q| !q.paused && q.in_flight.is_none() && q.len() > 0)
            .map(|q| q.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(device: &str) -> QueueOptions {
        QueueOptions {
            device_id: device.to_string(),
            project_path: "/work/app".to_string(),
        }
    }

    fn queue() -> MessageQueue {
        MessageQueue::new(Duration::from_secs(30))
    }

    #[test]
    fn identical_content_from_two_devices_collapses() {
        let q = queue();
        let mut events = q.subscribe();

        let first = q.queue_message("s1", "fix the build", Priority::Normal, from("phone"));
        let second = q.queue_message("s1", "fix the build", Priority::Normal, from("laptop"));

        let QueueOutcome::Queued { message_id, .. } = first else {
            panic!("first submission should queue");
        };
        match second {
            QueueOutcome::Duplicate {
                queued,
                reason,
                duplicate_info,
            } => {
                assert!(!queued);
                assert_eq!(reason, "duplicate");
                assert_eq!(duplicate_info.original_device_id, "phone");
                assert_eq!(duplicate_info.message_id, message_id);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(q.get_queue_status("s1").queue.len(), 1);

        let mut saw_duplicate = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::DuplicateMessage { device_id, .. } = event {
                assert_eq!(device_id, "laptop");
                saw_duplicate = true;
            }
        }
        assert!(saw_duplicate);
    }

    #[test]
    fn hash_ignores_device_and_whitespace_but_not_session() {
        assert_eq!(
            content_hash("s1", "/p", "  run   tests "),
            content_hash("s1", "/p", "run tests")
        );
        assert_ne!(content_hash("s1", "/p", "run tests"), content_hash("s2", "/p", "run tests"));
        assert_ne!(content_hash("s1", "/p", "run tests"), content_hash("s1", "/q", "run tests"));
        assert_eq!(content_hash("s1", "/p", "x").len(), 32);
    }

    #[test]
    fn duplicates_are_accepted_again_after_window() {
        let q = queue();
        let start = Utc::now();
        let QueueOutcome::Queued { message_id, .. } =
            q.queue_message_at("s1", "hello", Priority::Normal, from("phone"), start)
        else {
            panic!("should queue");
        };
        let taken = q.begin_next("s1").unwrap();
        assert_eq!(taken.message_id, message_id);
        q.complete_at("s1", &message_id, start);

        let inside = start + chrono::Duration::seconds(10);
        assert!(!q
            .queue_message_at("s1", "hello", Priority::Normal, from("laptop"), inside)
            .is_queued());

        let outside = start + chrono::Duration::seconds(31);
        assert!(q
            .queue_message_at("s1", "hello", Priority::Normal, from("laptop"), outside)
            .is_queued());
    }

    #[test]
    fn pending_messages_never_expire_from_dedup() {
        let q = queue();
        let start = Utc::now();
        q.queue_message_at("s1", "long job", Priority::Normal, from("phone"), start);
        let much_later = start + chrono::Duration::seconds(600);
        assert!(!q
            .queue_message_at("s1", "long job", Priority::Normal, from("laptop"), much_later)
            .is_queued());
    }

    #[test]
    fn dequeues_by_priority_then_arrival() {
        let q = queue();
        q.queue_message("s1", "low", Priority::Low, from("d"));
        q.queue_message("s1", "normal 1", Priority::Normal, from("d"));
        q.queue_message("s1", "high", Priority::High, from("d"));
        q.queue_message("s1", "normal 2", Priority::Normal, from("d"));

        let order: Vec<String> = q
            .get_queue_status("s1")
            .queue
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(order, vec!["high", "normal 1", "normal 2", "low"]);

        let mut drained = Vec::new();
        while let Some(next) = q.begin_next("s1") {
            q.complete("s1", &next.message_id);
            drained.push(next.payload);
        }
        assert_eq!(drained, order);
    }

    #[test]
    fn only_one_message_in_flight() {
        let q = queue();
        q.queue_message("s1", "a", Priority::Normal, from("d"));
        q.queue_message("s1", "b", Priority::Normal, from("d"));

        let first = q.begin_next("s1").unwrap();
        assert!(q.begin_next("s1").is_none());
        let status = q.get_queue_status("s1");
        assert!(status.processing);
        assert_eq!(status.in_flight.as_deref(), Some(first.message_id.as_str()));

        assert!(!q.complete("s1", "not-the-one"));
        assert!(q.complete("s1", &first.message_id));
        assert_eq!(q.begin_next("s1").unwrap().payload, "b");
    }

    #[test]
    fn pause_blocks_dequeue_and_keeps_order() {
        let q = queue();
        q.queue_message("s1", "a", Priority::Normal, from("d"));
        q.pause_queue("s1");
        q.queue_message("s1", "b", Priority::Normal, from("d"));
        assert!(q.begin_next("s1").is_none());
        assert!(q.get_queue_status("s1").paused);
        assert!(q.ready_sessions().is_empty());

        q.resume_queue("s1");
        assert_eq!(q.ready_sessions(), vec!["s1".to_string()]);
        assert_eq!(q.begin_next("s1").unwrap().payload, "a");
    }

    #[test]
    fn remove_queue_cancels_pending() {
        let q = queue();
        q.queue_message("s1", "a", Priority::Normal, from("d"));
        q.queue_message("s1", "b", Priority::Normal, from("d"));
        assert_eq!(q.remove_queue("s1"), 2);
        assert!(q.get_queue_status("s1").queue.is_empty());
        assert!(q.queue_message("s1", "a", Priority::Normal, from("d")).is_queued());
    }
}
