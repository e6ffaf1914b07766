//! PostgreSQL persistence for the cloud store.

mod conflicts;
mod feed;
mod pool;
mod records;

pub use conflicts::*;
pub use feed::*;
pub use pool::*;
pub use records::*;

use chrono::{SubsecRound, Utc};
use tillsync_engine::Timestamp;

/// Current time at the precision PostgreSQL stores.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}
