//! Short-lived protocol state: outstanding request IDs and accepted
//! assertion IDs.

pub mod cleanup;
pub mod store;

pub use cleanup::{spawn_sweep_task, DEFAULT_SWEEP_INTERVAL_SECS};
pub use store::{AssertionReplayCache, PendingRequest, PendingRequestStore, RequestKind};
