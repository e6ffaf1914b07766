//! Device sync state and the status color shown to operators.

use crate::{DeviceId, Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Live connectivity indicator of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Syncing,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Syncing => "syncing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            "syncing" => Some(DeviceStatus::Syncing),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device sync bookkeeping.
///
/// The cursor pair (`last_successful_sync_at`, `last_acked_sequence`) only
/// moves at the end of a fully successful cycle. `status`, `last_error` and
/// `schema_blocked` are live indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSyncState {
    pub device_id: DeviceId,
    pub last_successful_sync_at: Option<Timestamp>,
    pub last_acked_sequence: Sequence,
    pub status: DeviceStatus,
    pub last_error: Option<String>,
    /// The last cycle was refused because the schemas differ
    #[serde(default)]
    pub schema_blocked: bool,
}

impl DeviceSyncState {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            last_successful_sync_at: None,
            last_acked_sequence: 0,
            status: DeviceStatus::Offline,
            last_error: None,
            schema_blocked: false,
        }
    }

    /// Advance the cursor after a fully committed cycle.
    pub fn commit_cycle(&mut self, sequence: Sequence, now: Timestamp) {
        self.last_acked_sequence = self.last_acked_sequence.max(sequence);
        self.last_successful_sync_at = Some(now);
        self.status = DeviceStatus::Online;
        self.last_error = None;
        self.schema_blocked = false;
    }
}

/// Traffic-light summary of a device's sync health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncColor {
    /// Everything is in the cloud
    Green,
    /// Work is waiting, or the device cannot reach the cloud
    Yellow,
    /// An operator has to act
    Red,
    /// A cycle is running
    Blue,
}

impl SyncColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncColor::Green => "green",
            SyncColor::Yellow => "yellow",
            SyncColor::Red => "red",
            SyncColor::Blue => "blue",
        }
    }
}

impl fmt::Display for SyncColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts the color is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSignals {
    pub syncing: bool,
    pub offline: bool,
    pub schema_blocked: bool,
    pub pending_count: u64,
    pub open_conflicts: u64,
    pub abandoned_count: u64,
}

impl SyncSignals {
    pub fn from_state(state: &DeviceSyncState) -> Self {
        Self {
            syncing: state.status == DeviceStatus::Syncing,
            offline: state.status == DeviceStatus::Offline,
            schema_blocked: state.schema_blocked,
            ..Self::default()
        }
    }

    pub fn color(&self) -> SyncColor {
        if self.syncing {
            SyncColor::Blue
        } else if self.open_conflicts > 0 || self.abandoned_count > 0 || self.schema_blocked {
            SyncColor::Red
        } else if self.pending_count > 0 || self.offline {
            SyncColor::Yellow
        } else {
            SyncColor::Green
        }
    }
}

/// What `sync_state()` reports to a status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateView {
    pub device_id: DeviceId,
    pub color: SyncColor,
    pub status: DeviceStatus,
    pub enabled: bool,
    pub server_url: Option<String>,
    pub pending_count: u64,
    pub open_conflicts: u64,
    pub abandoned_count: u64,
    pub last_sync_at: Option<Timestamp>,
    pub last_acked_sequence: Sequence,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn color_precedence() {
        let mut signals = SyncSignals::default();
        assert_eq!(signals.color(), SyncColor::Green);

        signals.pending_count = 3;
        assert_eq!(signals.color(), SyncColor::Yellow);

        signals.open_conflicts = 1;
        assert_eq!(signals.color(), SyncColor::Red);

        signals.syncing = true;
        assert_eq!(signals.color(), SyncColor::Blue);
    }

    #[test]
    fn offline_is_yellow_and_schema_block_is_red() {
        let mut state = DeviceSyncState::new("till-1");
        assert_eq!(SyncSignals::from_state(&state).color(), SyncColor::Yellow);

        state.status = DeviceStatus::Online;
        assert_eq!(SyncSignals::from_state(&state).color(), SyncColor::Green);

        state.schema_blocked = true;
        assert_eq!(SyncSignals::from_state(&state).color(), SyncColor::Red);
    }

    #[test]
    fn commit_never_rewinds_cursor() {
        let mut state = DeviceSyncState::new("till-1");
        let now = Utc::now();
        state.commit_cycle(12, now);
        state.commit_cycle(4, now);
        assert_eq!(state.last_acked_sequence, 12);
        assert_eq!(state.last_successful_sync_at, Some(now));
        assert_eq!(state.status, DeviceStatus::Online);
    }
}
