//! Header-level consensus rules for candidate branches.

use crate::{
    block::Block,
    chain::{Position, RejectReason, Validation, Validator},
    work::{compact_to_target, meets_target},
};
use tracing::debug;

/// Default allowance for timestamps ahead of the local clock, in seconds.
pub const DEFAULT_MAX_FUTURE_DRIFT: i64 = 2 * 60 * 60;

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

/// Production validator: checks linkage, proof-of-work, payload
/// commitment and timestamp drift of each block in turn.
pub struct HeaderValidator {
    max_future_drift: i64,
    clock: Clock,
}

impl HeaderValidator {
    pub fn new(max_future_drift: i64) -> Self {
        Self {
            max_future_drift,
            clock: Box::new(|| chrono::Utc::now().timestamp()),
        }
    }

    /// Replace the wall clock, in unix seconds.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn check(&self, block: &Block, parent: Option<&Block>, now: i64) -> Result<(), RejectReason> {
        if let Some(parent) = parent {
            if block.previous_hash() != parent.hash() {
                return Err(RejectReason::PreviousMismatch);
            }
        }

        let bits = block.header.bits;
        let target = compact_to_target(bits).ok_or(RejectReason::InvalidBits { bits })?;
        if !meets_target(block.hash().as_ref(), &target) {
            return Err(RejectReason::InsufficientProofOfWork);
        }

        if !block.payload_matches() {
            return Err(RejectReason::PayloadMismatch);
        }

        let timestamp = block.header.timestamp;
        if i64::from(timestamp) > now + self.max_future_drift {
            return Err(RejectReason::TimestampTooFar { timestamp, now });
        }

        Ok(())
    }
}

impl Default for HeaderValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FUTURE_DRIFT)
    }
}

impl Validator for HeaderValidator {
    fn validate(&self, fork_position: Position, candidates: &[Block]) -> Validation {
        let now = (self.clock)();
        for (index, block) in candidates.iter().enumerate() {
            let parent = index.checked_sub(1).map(|i| &candidates[i]);
            if let Err(reason) = self.check(block, parent, now) {
                debug!(
                    hash = %block.hash(),
                    fork_position,
                    index,
                    %reason,
                    "Candidate failed header validation"
                );
                return Validation::Invalid { index, reason };
            }
        }
        Validation::Valid
    }
}
