//! Bitcoin Header Relay Module
//!
//! Client side of the on-chain header relay:
//! - Stored header model and the pure chain transition
//! - Batch planner with the fork overtake rule
//! - Program wire formats (accounts, instructions, events)
//! - Relay client operations and the Esplora-driven synchronizer

pub mod client;
pub mod header;
pub mod planner;
pub mod program;
pub mod sync;

// Re-exports for convenience
pub use client::{ForkSweep, HeaderSubmission, RelayClient, RelayError, CLOSE_FORKS_PER_TX};
pub use header::{
    compute_chain, parse_raw_header, HeaderError, StoredHeader, DIFF_ADJUSTMENT_INTERVAL,
    PREV_TIMESTAMP_COUNT, RAW_HEADER_LEN,
};
pub use planner::{
    plan_submission, ForkTarget, HeaderBatch, PlanRejection, PlanVerdict, SubmissionPlan,
    FORK_HEADERS_PER_TX, MAIN_HEADERS_PER_TX, SHORT_FORK_HEADERS_PER_TX,
};
pub use program::{
    CommittedLog, ForkState, MainChainState, RelayEvent, RelayProgram, COMMITMENT_WINDOW,
};
pub use sync::{RelaySynchronizer, SyncError, SyncPlan, SyncStatus, MAX_SYNC_HEADERS};
