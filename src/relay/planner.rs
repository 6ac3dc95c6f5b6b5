//! Header Submission Planner
//!
//! Splits a run of headers into per-transaction batches sized to Solana's
//! 1232-byte packet budget, projecting the relay's stored state across the
//! whole run. The reorg rule lives here: a fork batch whose projected work
//! passes the main tip is retargeted at the main chain, and so is everything
//! after it. Planning outcomes are data, not errors; callers decide what a
//! rejection means.

use bitcoin::block::Header;
use bitcoin::pow::Work;

use super::header::{HeaderError, StoredHeader};

/// Headers per transaction when extending the main chain
pub const MAIN_HEADERS_PER_TX: usize = 5;

/// Headers per transaction on a tracked fork (fork id in instruction data)
pub const FORK_HEADERS_PER_TX: usize = 4;

/// Headers per transaction on an ephemeral short fork
pub const SHORT_FORK_HEADERS_PER_TX: usize = 4;

/// Where a batch of headers is aimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkTarget {
    /// Extend the canonical chain
    Main,
    /// Ephemeral fork expected to overtake within the submission
    Short,
    /// Tracked fork with persistent per-submitter state
    Fork(u64),
}

impl ForkTarget {
    /// Wire encoding: 0 = main, -1 = short, positive = tracked fork id
    pub fn wire_id(self) -> i64 {
        match self {
            ForkTarget::Main => 0,
            ForkTarget::Short => -1,
            ForkTarget::Fork(id) => id as i64,
        }
    }

    pub fn headers_per_tx(self) -> usize {
        match self {
            ForkTarget::Main => MAIN_HEADERS_PER_TX,
            ForkTarget::Short => SHORT_FORK_HEADERS_PER_TX,
            ForkTarget::Fork(_) => FORK_HEADERS_PER_TX,
        }
    }
}

/// One transaction's worth of headers plus the state projection around it
#[derive(Debug, Clone)]
pub struct HeaderBatch {
    pub target: ForkTarget,
    /// Projected stored state the batch builds on
    pub parent: StoredHeader,
    pub headers: Vec<Header>,
    /// Projected stored state after each header in the batch
    pub computed: Vec<StoredHeader>,
}

/// A full submission: batches plus the final projected tip
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub batches: Vec<HeaderBatch>,
    pub tip: StoredHeader,
}

impl SubmissionPlan {
    /// All projected entries across all batches, in order
    pub fn computed_headers(&self) -> Vec<StoredHeader> {
        self.batches
            .iter()
            .flat_map(|b| b.computed.iter().copied())
            .collect()
    }
}

/// Expected planning failures, carried as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRejection {
    EmptyHeaderList,
    /// Header at `position` does not extend the projected chain
    BrokenLink {
        position: usize,
        expected: String,
        actual: String,
    },
    /// Fork plans need the main tip's work for the overtake comparison
    MissingMainTipWork,
    MalformedHeader {
        position: usize,
        reason: String,
    },
}

impl std::fmt::Display for PlanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanRejection::EmptyHeaderList => write!(f, "empty header list"),
            PlanRejection::BrokenLink {
                position,
                expected,
                actual,
            } => write!(
                f,
                "header {} does not connect: expected prev {}, got {}",
                position, expected, actual
            ),
            PlanRejection::MissingMainTipWork => {
                write!(f, "fork submission requires the main tip work")
            }
            PlanRejection::MalformedHeader { position, reason } => {
                write!(f, "header {} malformed: {}", position, reason)
            }
        }
    }
}

/// Planning outcome
#[derive(Debug, Clone)]
pub enum PlanVerdict {
    Planned(SubmissionPlan),
    Rejected(PlanRejection),
}

impl PlanVerdict {
    pub fn planned(self) -> Option<SubmissionPlan> {
        match self {
            PlanVerdict::Planned(plan) => Some(plan),
            PlanVerdict::Rejected(_) => None,
        }
    }
}

/// Plan the submission of `headers` on top of `stored`.
///
/// `main_tip_work` is required for every non-main target. After each fork
/// batch the projected work is compared against it; once a batch carries the
/// fork past the main tip (the relay performs the reorg while executing that
/// fork submission), every later batch targets `ForkTarget::Main`.
pub fn plan_submission(
    target: ForkTarget,
    stored: &StoredHeader,
    headers: &[Header],
    main_tip_work: Option<Work>,
) -> PlanVerdict {
    if headers.is_empty() {
        return PlanVerdict::Rejected(PlanRejection::EmptyHeaderList);
    }
    if target != ForkTarget::Main && main_tip_work.is_none() {
        return PlanVerdict::Rejected(PlanRejection::MissingMainTipWork);
    }

    let mut batches = Vec::new();
    let mut current = *stored;
    let mut current_target = target;
    let mut idx = 0usize;

    while idx < headers.len() {
        let cap = current_target.headers_per_tx();
        let end = (idx + cap).min(headers.len());
        let chunk = &headers[idx..end];

        let parent = current;
        let mut computed = Vec::with_capacity(chunk.len());
        for (offset, header) in chunk.iter().enumerate() {
            match current.compute_next(*header) {
                Ok(next) => {
                    current = next;
                    computed.push(next);
                }
                Err(HeaderError::BrokenLink {
                    expected, actual, ..
                }) => {
                    return PlanVerdict::Rejected(PlanRejection::BrokenLink {
                        position: idx + offset,
                        expected,
                        actual,
                    })
                }
                Err(e) => {
                    return PlanVerdict::Rejected(PlanRejection::MalformedHeader {
                        position: idx + offset,
                        reason: e.to_string(),
                    })
                }
            }
        }

        batches.push(HeaderBatch {
            target: current_target,
            parent,
            headers: chunk.to_vec(),
            computed,
        });
        idx = end;

        // Overtake rule, checked at every batch boundary: the fork batch that
        // passes the main tip triggers the on-chain reorg, so the batches
        // after it extend the (new) main chain.
        if current_target != ForkTarget::Main {
            if let Some(main_work) = main_tip_work {
                if current.work() > main_work {
                    current_target = ForkTarget::Main;
                }
            }
        }
    }

    PlanVerdict::Planned(SubmissionPlan {
        batches,
        tip: current,
    })
}
