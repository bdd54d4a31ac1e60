//! Device registry
//!
//! Tracks which devices are online for which users, drops devices that stop
//! sending heartbeats, and holds the single primary device per session.

use crate::error::PrimaryConflict;
use crate::ticker::Ticker;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Client-reported device details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub platform: String,
    pub app_version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Device annotated for `get_active_devices`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub is_primary: bool,
    pub primary_sessions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResult {
    pub success: bool,
    pub device: Device,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResult {
    pub success: bool,
    pub is_primary: bool,
    pub primary_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PrimaryConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub success: bool,
    pub new_primary_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PrimaryConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub total_devices: usize,
    pub active_devices: usize,
    pub inactive_devices: usize,
    pub total_users: usize,
    pub primary_devices: usize,
    pub average_devices_per_user: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterReason {
    Explicit,
    LivenessTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    DeviceRegistered {
        device: Device,
    },
    DeviceUnregistered {
        device_id: String,
        user_id: String,
        reason: UnregisterReason,
    },
    PrimaryElected {
        session_id: String,
        device_id: String,
    },
    PrimaryTransferred {
        session_id: String,
        from_device_id: String,
        to_device_id: String,
    },
    PrimaryDeviceOffline {
        session_id: String,
        device_id: String,
    },
}

pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    user_devices: DashMap<String, HashSet<String>>,
    /// session_id -> primary device_id
    primaries: DashMap<String, String>,
    /// device_id -> subscribed session ids
    subscriptions: DashMap<String, HashSet<String>>,
    liveness_timeout: Duration,
    events: broadcast::Sender<DeviceEvent>,
    sweep: Mutex<Option<Ticker>>,
}

impl DeviceRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            devices: DashMap::new(),
            user_devices: DashMap::new(),
            primaries: DashMap::new(),
            subscriptions: DashMap::new(),
            liveness_timeout,
            events,
            sweep: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    /// Register (or refresh) a device for a user
    pub fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
        metadata: DeviceMetadata,
    ) -> RegisterResult {
        let now = Utc::now();
        let (device, previous_user) = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut existing) => {
                let device = existing.get_mut();
                let previous_user = (device.user_id != user_id).then(|| device.user_id.clone());
                device.user_id = user_id.to_string();
                device.platform = metadata.platform;
                device.app_version = metadata.app_version;
                device.last_seen = now;
                (device.clone(), previous_user)
            }
            Entry::Vacant(slot) => {
                let device = Device {
                    device_id: device_id.to_string(),
                    user_id: user_id.to_string(),
                    platform: metadata.platform,
                    app_version: metadata.app_version,
                    registered_at: now,
                    last_seen: now,
                };
                slot.insert(device.clone());
                (device, None)
            }
        };

        if let Some(previous) = previous_user {
            self.detach_from_user(&previous, device_id);
        }
        self.user_devices
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string());

        tracing::info!(
            "Device registered: {} (user {}, {} {})",
            device_id,
            user_id,
            device.platform,
            device.app_version
        );
        self.emit(DeviceEvent::DeviceRegistered {
            device: device.clone(),
        });
        RegisterResult {
            success: true,
            device,
        }
    }

    pub fn update_last_seen(&self, device_id: &str) {
        self.update_last_seen_at(device_id, Utc::now());
    }

    pub fn update_last_seen_at(&self, device_id: &str, at: DateTime<Utc>) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.last_seen = at;
        }
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn is_device_active(&self, device_id: &str) -> bool {
        self.is_device_active_at(device_id, Utc::now())
    }

    fn is_device_active_at(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.devices
            .get(device_id)
            .map(|d| self.is_live(&d, now))
            .unwrap_or(false)
    }

    fn is_live(&self, device: &Device, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(device.last_seen);
        match idle.to_std() {
            Ok(idle) => idle < self.liveness_timeout,
            // last_seen in the future
            Err(_) => true,
        }
    }

    /// Sessions for which the device currently holds primary
    fn primary_sessions_of(&self, device_id: &str) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .primaries
            .iter()
            .filter(|entry| entry.value() == device_id)
            .map(|entry| entry.key().clone())
            .collect();
        sessions.sort();
        sessions
    }

    pub fn get_active_devices(&self, user_id: &str) -> Vec<DeviceView> {
        let now = Utc::now();
        let ids: Vec<String> = match self.user_devices.get(user_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut views: Vec<DeviceView> = ids
            .iter()
            .filter_map(|id| self.devices.get(id).map(|d| d.clone()))
            .filter(|d| self.is_live(d, now))
            .map(|device| {
                let primary_sessions = self.primary_sessions_of(&device.device_id);
                DeviceView {
                    is_primary: !primary_sessions.is_empty(),
                    primary_sessions,
                    device,
                }
            })
            .collect();
        views.sort_by(|a, b| a.device.registered_at.cmp(&b.device.registered_at));
        views
    }

    pub fn get_primary_device(&self, session_id: &str) -> Option<String> {
        self.primaries.get(session_id).map(|d| d.clone())
    }

    /// First writer wins: succeeds only while no primary exists for the session
    pub fn elect_primary(&self, user_id: &str, session_id: &str, device_id: &str) -> ElectionResult {
        match self.primaries.entry(session_id.to_string()) {
            Entry::Occupied(existing) => {
                let current = existing.get().clone();
                drop(existing);
                tracing::debug!(
                    "Primary election for {} by {} refused; {} holds it",
                    session_id,
                    device_id,
                    current
                );
                ElectionResult {
                    success: false,
                    is_primary: current == device_id,
                    primary_device_id: Some(current),
                    reason: Some(PrimaryConflict::PrimaryExists),
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(device_id.to_string());
                tracing::info!(
                    "Device {} (user {}) elected primary for session {}",
                    device_id,
                    user_id,
                    session_id
                );
                self.emit(DeviceEvent::PrimaryElected {
                    session_id: session_id.to_string(),
                    device_id: device_id.to_string(),
                });
                ElectionResult {
                    success: true,
                    is_primary: true,
                    primary_device_id: Some(device_id.to_string()),
                    reason: None,
                }
            }
        }
    }

    pub fn transfer_primary(
        &self,
        session_id: &str,
        from_device_id: &str,
        to_device_id: &str,
    ) -> TransferResult {
        let outcome = match self.primaries.get_mut(session_id) {
            Some(mut current) if *current == from_device_id => {
                *current = to_device_id.to_string();
                Ok(())
            }
            Some(current) => Err(Some(current.clone())),
            None => Err(None),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    "Primary for session {} transferred {} -> {}",
                    session_id,
                    from_device_id,
                    to_device_id
                );
                self.emit(DeviceEvent::PrimaryTransferred {
                    session_id: session_id.to_string(),
                    from_device_id: from_device_id.to_string(),
                    to_device_id: to_device_id.to_string(),
                });
                TransferResult {
                    success: true,
                    new_primary_device_id: Some(to_device_id.to_string()),
                    reason: None,
                }
            }
            Err(current) => TransferResult {
                success: false,
                new_primary_device_id: current,
                reason: Some(PrimaryConflict::NotCurrentPrimary),
            },
        }
    }

    /// Give up primary voluntarily. Only the holder can release it.
    pub fn release_primary(&self, session_id: &str, device_id: &str) -> bool {
        self.primaries
            .remove_if(session_id, |_, holder| holder == device_id)
            .is_some()
    }

    pub fn subscribe_session(&self, device_id: &str, session_id: &str) {
        self.subscriptions
            .entry(device_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn unsubscribe_session(&self, device_id: &str, session_id: &str) {
        if let Some(mut sessions) = self.subscriptions.get_mut(device_id) {
            sessions.remove(session_id);
        }
        self.subscriptions
            .remove_if(device_id, |_, sessions| sessions.is_empty());
    }

    /// Devices subscribed to a session
    pub fn session_devices(&self, session_id: &str) -> Vec<String> {
        let mut devices: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().contains(session_id))
            .map(|entry| entry.key().clone())
            .collect();
        devices.sort();
        devices
    }

    /// Drop the primary assignment and every subscription for a closed session
    pub fn clear_session(&self, session_id: &str) {
        self.primaries.remove(session_id);
        for mut entry in self.subscriptions.iter_mut() {
            entry.value_mut().remove(session_id);
        }
        self.subscriptions.retain(|_, sessions| !sessions.is_empty());
    }

    pub fn unregister_device(&self, device_id: &str) -> bool {
        self.remove_device(device_id, UnregisterReason::Explicit)
    }

    fn remove_device(&self, device_id: &str, reason: UnregisterReason) -> bool {
        let Some((_, device)) = self.devices.remove(device_id) else {
            return false;
        };
        self.detach_from_user(&device.user_id, device_id);
        self.subscriptions.remove(device_id);

        for session_id in self.primary_sessions_of(device_id) {
            if self
                .primaries
                .remove_if(&session_id, |_, holder| holder == device_id)
                .is_some()
            {
                tracing::warn!(
                    "Primary device {} for session {} went offline",
                    device_id,
                    session_id
                );
                self.emit(DeviceEvent::PrimaryDeviceOffline {
                    session_id,
                    device_id: device_id.to_string(),
                });
            }
        }

        tracing::info!("Device unregistered: {} ({:?})", device_id, reason);
        self.emit(DeviceEvent::DeviceUnregistered {
            device_id: device_id.to_string(),
            user_id: device.user_id,
            reason,
        });
        true
    }

    fn detach_from_user(&self, user_id: &str, device_id: &str) {
        if let Some(mut ids) = self.user_devices.get_mut(user_id) {
            ids.remove(device_id);
        }
        self.user_devices.remove_if(user_id, |_, ids| ids.is_empty());
    }

    /// Unregister every device not seen within the liveness timeout
    pub fn sweep_inactive(&self) -> Vec<String> {
        self.sweep_inactive_at(Utc::now())
    }

    pub fn sweep_inactive_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| !self.is_live(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|id| {
                // Re-check: a heartbeat may have landed since the scan
                let still_stale = self
                    .devices
                    .get(id)
                    .map(|d| !self.is_live(&d, now))
                    .unwrap_or(false);
                still_stale && self.remove_device(id, UnregisterReason::LivenessTimeout)
            })
            .collect()
    }

    pub fn get_stats(&self) -> DeviceStats {
        let now = Utc::now();
        let (total_devices, active_devices) =
            self.devices.iter().fold((0, 0), |(total, active), entry| {
                let live = self.is_live(entry.value(), now);
                (total + 1, active + usize::from(live))
            });
        let total_users = self.user_devices.len();
        let primary_devices = self
            .primaries
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<HashSet<_>>()
            .len();
        let average_devices_per_user = if total_users == 0 {
            0.0
        } else {
            total_devices as f64 / total_users as f64
        };

        DeviceStats {
            total_devices,
            active_devices,
            inactive_devices: total_devices - active_devices,
            total_users,
            primary_devices,
            average_devices_per_user,
        }
    }

    /// Start the periodic liveness sweep
    pub fn start_liveness_sweep(self: &Arc<Self>, period: Duration) {
        let registry = Arc::downgrade(self);
        let ticker = Ticker::spawn("liveness sweep", period, move || {
            let registry = registry.clone();
            async move {
                if let Some(registry) = registry.upgrade() {
                    let dropped = registry.sweep_inactive();
                    if !dropped.is_empty() {
                        tracing::info!("Liveness sweep dropped {} device(s)", dropped.len());
                    }
                }
            }
        });
        if let Ok(mut slot) = self.sweep.lock() {
            *slot = Some(ticker);
        }
    }

    pub async fn shutdown(&self) {
        let ticker = self.sweep.lock().ok().and_then(|mut t| t.take());
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }
    }
}
