//! Request handlers for sync operations.

mod batch;
mod conflicts;
mod pull;

pub use batch::*;
pub use conflicts::*;
pub use pull::*;
