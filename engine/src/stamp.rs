//! Write stamps for last-write-wins ordering.
//!
//! A stamp provides a total ordering over writes from all devices, which is
//! what makes last-write-wins resolution deterministic.

use crate::{DeviceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The wall-clock identity of a write.
///
/// Ordering rules:
/// 1. Later `last_modified` wins
/// 2. If equal, lexicographically higher `device_id` wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStamp {
    /// When the write happened (UTC)
    pub last_modified: Timestamp,
    /// Terminal that produced the write
    pub device_id: DeviceId,
}

impl WriteStamp {
    pub fn new(last_modified: Timestamp, device_id: impl Into<DeviceId>) -> Self {
        Self {
            last_modified,
            device_id: device_id.into(),
        }
    }

    /// Check whether this stamp strictly supersedes another.
    pub fn supersedes(&self, other: &WriteStamp) -> bool {
        self > other
    }
}

impl Ord for WriteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.last_modified.cmp(&other.last_modified) {
            Ordering::Equal => self.device_id.cmp(&other.device_id),
            other => other,
        }
    }
}

impl PartialOrd for WriteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_706_745_600 + secs, 0).unwrap()
    }

    #[test]
    fn ordering_by_time() {
        let earlier = WriteStamp::new(at(1), "till-b");
        let later = WriteStamp::new(at(2), "till-a");
        assert!(earlier < later);
        assert!(later.supersedes(&earlier));
    }

    #[test]
    fn ordering_by_device_when_time_equal() {
        let a = WriteStamp::new(at(5), "till-a");
        let b = WriteStamp::new(at(5), "till-b");
        assert!(a < b); // "till-a" < "till-b" lexicographically
        assert!(b.supersedes(&a));
    }

    #[test]
    fn identical_stamps_do_not_supersede() {
        let a = WriteStamp::new(at(5), "till-a");
        assert!(!a.supersedes(&a.clone()));
    }
}
