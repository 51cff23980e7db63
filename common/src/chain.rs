//! Collaborator seams consumed by the chain organizer.
//!
//! `ChainStore` is the authoritative, already-validated chain and
//! `Validator` applies the consensus rules to a candidate branch. Each has
//! one production implementation and test doubles in the organizer tests.

use crate::{block::Block, hash::BlockHash, work::Work};
use serde::{Deserialize, Serialize};

/// Height of a block in the canonical chain; genesis is 0.
pub type Position = u64;

/// Failures of the chain store. Any of these aborts the organizer's
/// current processing attempt.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chain store is not running")]
    Stopped,

    #[error("position {position} is above the tip at {tip}")]
    PositionOutOfRange { position: Position, tip: Position },

    #[error("chain store is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The canonical chain.
pub trait ChainStore {
    /// Idempotent.
    fn start(&mut self) -> Result<(), StoreError>;

    /// Idempotent: calling twice is safe.
    fn stop(&mut self);

    /// Position of `hash` in the canonical chain, if present.
    fn find_index(&self, hash: &BlockHash) -> Result<Option<Position>, StoreError>;

    /// Cumulative work from `position` (exclusive) to the tip (inclusive).
    fn work_from(&self, position: Position) -> Result<Work, StoreError>;

    /// Remove every block above `fork_position` and append `new_blocks`
    /// in order, returning the removed blocks oldest first. On error the
    /// chain must be unchanged.
    fn replace_tail(
        &mut self,
        fork_position: Position,
        new_blocks: Vec<Block>,
    ) -> Result<Vec<Block>, StoreError>;

    /// Extend the tip by exactly one block.
    fn append(&mut self, block: Block) -> Result<(), StoreError>;

    /// Position and hash of the current tip.
    fn tip(&self) -> Result<(Position, BlockHash), StoreError>;

    fn block_at(&self, position: Position) -> Result<Option<Block>, StoreError>;
}

/// Why a block was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RejectReason {
    #[error("previous hash does not link to the preceding block")]
    PreviousMismatch,

    #[error("compact target {bits:#010x} is not a valid positive target")]
    InvalidBits { bits: u32 },

    #[error("block hash does not meet its target")]
    InsufficientProofOfWork,

    #[error("payload does not match the header commitment")]
    PayloadMismatch,

    #[error("timestamp {timestamp} is too far ahead of {now}")]
    TimestampTooFar { timestamp: u32, now: i64 },

    /// Inherited by every descendant of a rejected block.
    #[error("an ancestor of this block is invalid")]
    PreviousBlockInvalid,
}

/// Outcome of validating a candidate branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// `index` is the first failing block within the candidate list.
    Invalid { index: usize, reason: RejectReason },
}

/// Consensus rules over a candidate branch.
pub trait Validator {
    /// Validate `candidates` (root to tip) as an extension of the chain at
    /// `fork_position`, stopping at the first failure. Must be
    /// deterministic and must not mutate anything.
    fn validate(&self, fork_position: Position, candidates: &[Block]) -> Validation;

    /// Work added by `candidates`.
    fn work(&self, candidates: &[Block]) -> Work {
        Work::of(candidates)
    }
}

/// Where a stored block ended up.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Pooled, waiting for ancestry or more work
    #[default]
    Orphan,

    /// Part of the canonical chain
    Confirmed { height: Position },

    /// Failed validation, directly or through an ancestor
    Rejected { reason: RejectReason },

    /// Refused by a full orphan pool
    Dropped,
}
