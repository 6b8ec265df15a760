use std::path::PathBuf;

use crate::remote::RemoteError;

/// Where the rotation loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Selecting,
    Uploading,
    Evicting,
    Sleeping,
    Terminated,
}

/// Result of one select/upload/evict cycle. Every variant is logged and the
/// loop carries on; none of them stop rotation.
#[derive(Debug)]
pub enum CycleOutcome {
    Rotated {
        image: PathBuf,
        /// `None` when retention is disabled.
        evicted: Option<usize>,
    },
    UploadFailed {
        image: PathBuf,
        error: RemoteError,
    },
    /// The upload went through but pruning the history did not.
    EvictionFailed {
        image: PathBuf,
        error: RemoteError,
    },
    /// Something panicked inside the cycle.
    Panicked { message: String },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Rotated { .. })
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing to rotate; only a restart with images present can recover.
    EmptyPool,
    /// Shutdown was requested.
    Cancelled,
    /// A single cycle was requested and has run.
    Completed,
}

/// Process exit status for an empty pool. Distinct from clap's usage error (2)
/// and from startup failures (1).
pub const EXIT_EMPTY_POOL: u8 = 3;

impl ExitReason {
    pub fn exit_code(self) -> u8 {
        match self {
            ExitReason::EmptyPool => EXIT_EMPTY_POOL,
            ExitReason::Cancelled | ExitReason::Completed => 0,
        }
    }
}
