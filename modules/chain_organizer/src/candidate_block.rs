//! A pooled block plus the organizer's bookkeeping for it.

use forkline_common::{Block, BlockHash, Position, RejectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Waiting for ancestry, validation or more work.
    Unprocessed,
    /// Failed validation; terminal.
    Rejected,
}

/// A block that is not, or not yet, part of the canonical chain.
///
/// Identity is fixed at construction. Only the organizer moves the state
/// forward, and only from `Unprocessed` to `Rejected`.
#[derive(Debug, Clone)]
pub struct CandidateBlock {
    hash: BlockHash,
    block: Block,
    state: CandidateState,
    chain_position: Option<Position>,
    failure_reason: Option<RejectReason>,
}

impl CandidateBlock {
    pub fn new(block: Block) -> Self {
        Self {
            hash: block.hash(),
            block,
            state: CandidateState::Unprocessed,
            chain_position: None,
            failure_reason: None,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.block.previous_hash()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn state(&self) -> CandidateState {
        self.state
    }

    pub fn is_unprocessed(&self) -> bool {
        self.state == CandidateState::Unprocessed
    }

    /// Height this block would take if its traced branch were integrated.
    pub fn chain_position(&self) -> Option<Position> {
        self.chain_position
    }

    pub fn failure_reason(&self) -> Option<&RejectReason> {
        self.failure_reason.as_ref()
    }

    pub(crate) fn set_chain_position(&mut self, position: Position) {
        self.chain_position = Some(position);
    }

    pub(crate) fn reject(&mut self, reason: RejectReason) {
        self.state = CandidateState::Rejected;
        self.failure_reason = Some(reason);
    }
}

impl PartialEq for CandidateBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for CandidateBlock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_candidate_is_unprocessed() {
        let block = Block::genesis(5, 0x207fffff);
        let candidate = CandidateBlock::new(block.clone());
        assert_eq!(candidate.hash(), block.hash());
        assert!(candidate.is_unprocessed());
        assert_eq!(candidate.chain_position(), None);
        assert_eq!(candidate.failure_reason(), None);
    }

    #[test]
    fn rejection_records_reason() {
        let mut candidate = CandidateBlock::new(Block::genesis(5, 0x207fffff));
        candidate.reject(RejectReason::PayloadMismatch);
        assert_eq!(candidate.state(), CandidateState::Rejected);
        assert_eq!(candidate.failure_reason(), Some(&RejectReason::PayloadMismatch));
    }

    #[test]
    fn equality_is_by_hash() {
        let block = Block::genesis(5, 0x207fffff);
        let a = CandidateBlock::new(block.clone());
        let mut b = CandidateBlock::new(block);
        b.set_chain_position(3);
        assert_eq!(a, b);
        assert_ne!(a, CandidateBlock::new(Block::genesis(6, 0x207fffff)));
    }
}
