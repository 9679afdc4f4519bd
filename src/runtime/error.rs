//! Runtime error taxonomy.
//!
//! Every variant is fatal: the run aborts and no partial recovery is
//! promised. Child termination is not an error; it is observed through the
//! child's return channel.

use crate::runtime::time::LogicalTime;

/// Fatal runtime errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Logical time would move backwards or stand still.
    TimeNotMonotonic {
        now: LogicalTime,
        attempted: LogicalTime,
    },
    /// `after` called with a zero duration.
    ZeroDelay,
    /// A channel was committed at a time other than its earliest pending
    /// update.
    CommitOutOfOrder {
        now: LogicalTime,
        earliest: LogicalTime,
    },
    /// The priority label arena cannot admit another node.
    PriorityExhaustion,
    /// A deleted priority was used, or priorities from distinct runtimes
    /// were mixed.
    PriorityMisuse,
    /// The public API was driven in an unsupported way.
    UsageError(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeNotMonotonic { now, attempted } => {
                write!(f, "logical time must advance strictly: now {}, attempted {}", now, attempted)
            }
            Self::ZeroDelay => write!(f, "delayed update requires a positive duration"),
            Self::CommitOutOfOrder { now, earliest } => {
                write!(f, "commit at {} but earliest pending update is at {}", now, earliest)
            }
            Self::PriorityExhaustion => write!(f, "priority label arena exhausted"),
            Self::PriorityMisuse => write!(f, "priority used after delete or across runtimes"),
            Self::UsageError(msg) => write!(f, "usage error: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
