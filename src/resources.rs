//! Resource manager
//!
//! Audits session count, process memory and CPU against configured
//! ceilings. Violations are handled here (eviction, buffer trimming) and
//! only logged; the session lifecycle manager finishes any teardown.

use crate::buffer::MessageBufferStore;
use crate::config::Config;
use crate::ticker::Ticker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;

/// Entry in the active-session index
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub has_interactive_process: bool,
}

/// Index of sessions currently counted against the concurrency ceiling
#[derive(Debug, Default)]
pub struct ActiveSessions {
    sessions: DashMap<String, ActiveSession>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: &str) {
        self.insert_at(session_id, Utc::now());
    }

    pub fn insert_at(&self, session_id: &str, at: DateTime<Utc>) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ActiveSession {
                session_id: session_id.to_string(),
                created_at: at,
                last_activity: at,
                has_interactive_process: false,
            });
    }

    pub fn touch(&self, session_id: &str) {
        self.touch_at(session_id, Utc::now());
    }

    pub fn touch_at(&self, session_id: &str, at: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = at;
        }
    }

    pub fn set_interactive(&self, session_id: &str, running: bool) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.has_interactive_process = running;
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<ActiveSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session with the longest idle time, with that idle time. Sessions
    /// with a turn running are never idle.
    pub fn idlest(&self, now: DateTime<Utc>) -> Option<(String, Duration)> {
        self.sessions
            .iter()
            .filter(|s| !s.has_interactive_process)
            .map(|s| (s.session_id.clone(), idle_for(s.last_activity, now)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    pub fn idle_longer_than(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| !s.has_interactive_process && idle_for(s.last_activity, now) > threshold)
            .map(|s| s.session_id.clone())
            .collect()
    }
}

fn idle_for(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(last_activity)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_concurrent_sessions: usize,
    pub max_memory_per_session: u64,
    pub max_total_memory: u64,
    pub max_cpu_usage: f32,
}

impl From<&Config> for ResourceLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_sessions: config.max_concurrent_sessions,
            max_memory_per_session: config.max_memory_per_session,
            max_total_memory: config.max_total_memory,
            max_cpu_usage: config.max_cpu_usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub active_session_count: usize,
    pub heap_used: u64,
    pub cpu_usage_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    ConcurrentSessions,
    TotalMemory,
    CpuUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub current: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub usage: ResourceUsage,
    pub violations: Vec<Violation>,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResourceStatus {
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub message_count: usize,
    pub has_interactive_process: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub usage: ResourceUsage,
    pub limits: ResourceLimits,
    pub violations: Vec<Violation>,
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    SessionEvicted { session_id: String, idle_secs: u64 },
    BuffersTrimmed { session_ids: Vec<String>, keep: usize },
    CpuPressure { current: f32, limit: f32 },
}

/// Source of process memory and CPU readings
pub trait SystemProbe: Send + Sync {
    /// Resident memory of this process in bytes
    fn memory_used(&self) -> u64;

    /// Global CPU usage in percent since the previous call
    fn cpu_usage(&self) -> f32;
}

/// `sysinfo`-backed probe. CPU usage is the delta between consecutive
/// refreshes, so the first reading is 0.
pub struct SysinfoProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self {
            sys: Mutex::new(sys),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_used(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut sys) = self.sys.lock() else {
            return 0;
        };
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn cpu_usage(&self) -> f32 {
        let Ok(mut sys) = self.sys.lock() else {
            return 0.0;
        };
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }
}

pub struct ResourceManager {
    limits: ResourceLimits,
    sessions: Arc<ActiveSessions>,
    buffers: Arc<MessageBufferStore>,
    probe: Box<dyn SystemProbe>,
    idle_eviction: Duration,
    buffer_trim_idle: Duration,
    buffer_trim_keep: usize,
    events: broadcast::Sender<ResourceEvent>,
    audit: Mutex<Option<Ticker>>,
}

impl ResourceManager {
    pub fn new(
        config: &Config,
        sessions: Arc<ActiveSessions>,
        buffers: Arc<MessageBufferStore>,
        probe: Box<dyn SystemProbe>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            limits: ResourceLimits::from(config),
            sessions,
            buffers,
            probe,
            idle_eviction: config.idle_eviction(),
            buffer_trim_idle: config.buffer_trim_idle(),
            buffer_trim_keep: config.buffer_trim_keep,
            events,
            audit: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> &Arc<ActiveSessions> {
        &self.sessions
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Compare live usage against the ceilings without acting on it
    pub fn check_usage(&self) -> UsageReport {
        let usage = ResourceUsage {
            active_session_count: self.sessions.len(),
            heap_used: self.probe.memory_used(),
            cpu_usage_percent: self.probe.cpu_usage(),
        };

        let mut violations = Vec::new();
        if usage.active_session_count > self.limits.max_concurrent_sessions {
            violations.push(Violation {
                violation_type: ViolationType::ConcurrentSessions,
                current: usage.active_session_count as f64,
                limit: self.limits.max_concurrent_sessions as f64,
            });
        }
        if usage.heap_used > self.limits.max_total_memory {
            violations.push(Violation {
                violation_type: ViolationType::TotalMemory,
                current: usage.heap_used as f64,
                limit: self.limits.max_total_memory as f64,
            });
        }
        if usage.cpu_usage_percent > self.limits.max_cpu_usage {
            violations.push(Violation {
                violation_type: ViolationType::CpuUsage,
                current: f64::from(usage.cpu_usage_percent),
                limit: f64::from(self.limits.max_cpu_usage),
            });
        }

        UsageReport {
            healthy: violations.is_empty(),
            usage,
            violations,
        }
    }

    /// One audit tick: check, then handle every violation
    pub fn audit(&self) -> UsageReport {
        let report = self.check_usage();
        for violation in &report.violations {
            self.handle_violation(violation, Utc::now());
        }
        report
    }

    pub fn handle_violation(&self, violation: &Violation, now: DateTime<Utc>) {
        tracing::warn!(
            "Resource violation {:?}: {} > {}",
            violation.violation_type,
            violation.current,
            violation.limit
        );
        match violation.violation_type {
            ViolationType::ConcurrentSessions => {
                self.evict_idlest(now);
            }
            ViolationType::TotalMemory => {
                // No GC to request; trim idle history instead
                self.trim_idle_buffers(now);
            }
            ViolationType::CpuUsage => {
                let _ = self.events.send(ResourceEvent::CpuPressure {
                    current: violation.current as f32,
                    limit: violation.limit as f32,
                });
            }
        }
    }

    /// Remove the longest-idle session from the index if it has been idle
    /// past the eviction threshold
    pub fn evict_idlest(&self, now: DateTime<Utc>) -> Option<String> {
        let (session_id, idle) = self.sessions.idlest(now)?;
        if idle <= self.idle_eviction {
            tracing::info!(
                "No session idle long enough to evict (longest: {} for {}s)",
                session_id,
                idle.as_secs()
            );
            return None;
        }
        if !self.sessions.remove(&session_id) {
            return None;
        }
        tracing::info!(
            "Evicted session {} after {}s idle",
            session_id,
            idle.as_secs()
        );
        let _ = self.events.send(ResourceEvent::SessionEvicted {
            session_id: session_id.clone(),
            idle_secs: idle.as_secs(),
        });
        Some(session_id)
    }

    /// Free a slot before admitting a new session. Returns evicted ids.
    pub fn make_room(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.sessions.len() >= self.limits.max_concurrent_sessions {
            match self.evict_idlest(now) {
                Some(id) => evicted.push(id),
                None => {
                    tracing::warn!(
                        "Admitting session over the limit of {} (nothing idle to evict)",
                        self.limits.max_concurrent_sessions
                    );
                    break;
                }
            }
        }
        evicted
    }

    pub fn trim_idle_buffers(&self, now: DateTime<Utc>) -> Vec<String> {
        let trimmed: Vec<String> = self
            .sessions
            .idle_longer_than(self.buffer_trim_idle, now)
            .into_iter()
            .filter(|id| self.buffers.trim_buffer(id, self.buffer_trim_keep) > 0)
            .collect();
        if !trimmed.is_empty() {
            tracing::info!("Trimmed message buffers for {} idle session(s)", trimmed.len());
            let _ = self.events.send(ResourceEvent::BuffersTrimmed {
                session_ids: trimmed.clone(),
                keep: self.buffer_trim_keep,
            });
        }
        trimmed
    }

    pub fn get_session_status(&self, session_id: &str) -> SessionResourceStatus {
        let entry = self.sessions.get(session_id);
        SessionResourceStatus {
            active: entry.is_some(),
            created_at: entry.as_ref().map(|s| s.created_at),
            last_activity: entry.as_ref().map(|s| s.last_activity),
            memory_usage: self.buffers.estimate_size(session_id),
            memory_limit: self.limits.max_memory_per_session,
            message_count: self.buffers.message_count(session_id),
            has_interactive_process: entry.map(|s| s.has_interactive_process).unwrap_or(false),
        }
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let report = self.check_usage();
        SystemStatus {
            usage: report.usage,
            limits: self.limits.clone(),
            violations: report.violations,
            healthy: report.healthy,
            timestamp: Utc::now(),
        }
    }

    pub fn start_audit(self: &Arc<Self>, period: Duration) {
        let manager = Arc::downgrade(self);
        let ticker = Ticker::spawn("resource audit", period, move || {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    let report = manager.audit();
                    tracing::debug!(
                        "Resource audit: {} session(s), {} bytes, {:.1}% cpu",
                        report.usage.active_session_count,
                        report.usage.heap_used,
                        report.usage.cpu_usage_percent
                    );
                }
            }
        });
        if let Ok(mut slot) = self.audit.lock() {
            *slot = Some(ticker);
        }
    }

    pub async fn shutdown(&self) {
        let ticker = self.audit.lock().ok().and_then(|mut t| t.take());
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed readings for tests
    #[derive(Default)]
    struct FixedProbe {
        memory: AtomicU64,
        cpu_tenths: AtomicU64,
    }

    impl SystemProbe for Arc<FixedProbe> {
        fn memory_used(&self) -> u64 {
            self.memory.load(Ordering::SeqCst)
        }

        fn cpu_usage(&self) -> f32 {
            self.cpu_tenths.load(Ordering::SeqCst) as f32 / 10.0
        }
    }

    fn manager(config: &Config) -> (ResourceManager, Arc<FixedProbe>, Arc<MessageBufferStore>) {
        let sessions = Arc::new(ActiveSessions::new());
        let buffers = Arc::new(MessageBufferStore::new(sessions.clone()));
        let probe = Arc::new(FixedProbe::default());
        let manager = ResourceManager::new(config, sessions, buffers.clone(), Box::new(probe.clone()));
        (manager, probe, buffers)
    }

    #[test]
    fn healthy_when_under_limits() {
        let (manager, _, _) = manager(&Config::default());
        manager.sessions().insert("s1");
        let report = manager.check_usage();
        assert!(report.healthy);
        assert_eq!(report.usage.active_session_count, 1);
    }

    #[test]
    fn each_exceeded_ceiling_is_a_violation() {
        let config = Config {
            max_concurrent_sessions: 1,
            max_total_memory: 1000,
            max_cpu_usage: 50.0,
            ..Default::default()
        };
        let (manager, probe, _) = manager(&config);
        manager.sessions().insert("s1");
        manager.sessions().insert("s2");
        probe.memory.store(2000, Ordering::SeqCst);
        probe.cpu_tenths.store(900, Ordering::SeqCst);

        let report = manager.check_usage();
        assert!(!report.healthy);
        let types: Vec<ViolationType> = report.violations.iter().map(|v| v.violation_type).collect();
        assert_eq!(
            types,
            vec![
                ViolationType::ConcurrentSessions,
                ViolationType::TotalMemory,
                ViolationType::CpuUsage
            ]
        );
    }

    #[test]
    fn concurrent_violation_evicts_only_long_idle_sessions() {
        let config = Config {
            max_concurrent_sessions: 1,
            ..Default::default()
        };
        let (manager, _, _) = manager(&config);
        let mut events = manager.subscribe();
        let now = Utc::now();
        manager.sessions().insert_at("fresh", now - chrono::Duration::seconds(5));
        manager.sessions().insert_at("recent", now - chrono::Duration::seconds(30));

        assert_eq!(manager.evict_idlest(now), None);

        manager.sessions().insert_at("stale", now - chrono::Duration::seconds(120));
        assert_eq!(manager.evict_idlest(now).as_deref(), Some("stale"));
        assert!(!manager.sessions().contains("stale"));
        assert!(matches!(
            events.try_recv(),
            Ok(ResourceEvent::SessionEvicted { session_id, .. }) if session_id == "stale"
        ));
    }

    #[test]
    fn session_with_running_turn_is_not_evicted() {
        let config = Config {
            max_concurrent_sessions: 1,
            ..Default::default()
        };
        let (manager, _, _) = manager(&config);
        let now = Utc::now();
        manager.sessions().insert_at("working", now - chrono::Duration::seconds(120));
        manager.sessions().insert_at("waiting", now - chrono::Duration::seconds(90));
        manager.sessions().set_interactive("working", true);

        assert_eq!(manager.evict_idlest(now).as_deref(), Some("waiting"));
        assert_eq!(manager.evict_idlest(now), None);
        assert!(manager.sessions().contains("working"));
        assert!(manager
            .sessions()
            .idle_longer_than(Duration::from_secs(60), now)
            .is_empty());

        manager.sessions().set_interactive("working", false);
        assert_eq!(manager.evict_idlest(now).as_deref(), Some("working"));
    }

    #[test]
    fn memory_violation_trims_long_idle_buffers() {
        let (manager, _, buffers) = manager(&Config::default());
        let now = Utc::now();
        manager.sessions().insert("busy");
        manager.sessions().insert("idle");
        for i in 0..20 {
            buffers.store_message("busy", "user", &format!("b{}", i), Value::Null);
            buffers.store_message("idle", "user", &format!("i{}", i), Value::Null);
        }
        manager
            .sessions()
            .touch_at("idle", now - chrono::Duration::hours(2));

        let violation = Violation {
            violation_type: ViolationType::TotalMemory,
            current: 2.0,
            limit: 1.0,
        };
        manager.handle_violation(&violation, now);
        assert_eq!(buffers.message_count("idle"), 10);
        assert_eq!(buffers.message_count("busy"), 20);
    }

    #[test]
    fn session_status_reports_buffer_size() {
        let (manager, _, buffers) = manager(&Config::default());
        manager.sessions().insert("s1");
        buffers.store_message("s1", "user", "hello", Value::Null);

        let status = manager.get_session_status("s1");
        assert!(status.active);
        assert_eq!(status.message_count, 1);
        assert!(status.memory_usage > 0);
        assert!(!status.has_interactive_process);

        let missing = manager.get_session_status("nope");
        assert!(!missing.active);
        assert_eq!(missing.memory_usage, 0);
    }
}
