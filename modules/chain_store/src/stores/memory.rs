use std::collections::HashMap;

use forkline_common::{Block, BlockHash, ChainStore, Position, StoreError, Work};
use tracing::debug;

use super::ensure_running;

/// Volatile chain, seeded with a genesis block.
pub struct InMemoryChainStore {
    blocks: Vec<Block>,
    heights: HashMap<BlockHash, Position>,
    running: bool,
}

impl InMemoryChainStore {
    pub fn new(genesis: Block) -> Self {
        let mut heights = HashMap::new();
        heights.insert(genesis.hash(), 0);
        Self {
            blocks: vec![genesis],
            heights,
            running: false,
        }
    }

    /// Number of blocks including genesis.
    pub fn len(&self) -> Result<u64, StoreError> {
        ensure_running(self.running)?;
        Ok(self.blocks.len() as u64)
    }

    fn tip_position(&self) -> Position {
        self.blocks.len() as Position - 1
    }
}

impl ChainStore for InMemoryChainStore {
    fn start(&mut self) -> Result<(), StoreError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn find_index(&self, hash: &BlockHash) -> Result<Option<Position>, StoreError> {
        ensure_running(self.running)?;
        Ok(self.heights.get(hash).copied())
    }

    fn work_from(&self, position: Position) -> Result<Work, StoreError> {
        ensure_running(self.running)?;
        let start = (position as usize).saturating_add(1).min(self.blocks.len());
        Ok(Work::of(&self.blocks[start..]))
    }

    fn replace_tail(
        &mut self,
        fork_position: Position,
        new_blocks: Vec<Block>,
    ) -> Result<Vec<Block>, StoreError> {
        ensure_running(self.running)?;
        let tip = self.tip_position();
        if fork_position > tip {
            return Err(StoreError::PositionOutOfRange {
                position: fork_position,
                tip,
            });
        }

        // Nothing below can fail, so the swap is all-or-nothing
        let displaced = self.blocks.split_off(fork_position as usize + 1);
        for block in &displaced {
            self.heights.remove(&block.hash());
        }
        for block in new_blocks {
            self.heights.insert(block.hash(), self.blocks.len() as Position);
            self.blocks.push(block);
        }

        debug!(
            fork_position,
            displaced = displaced.len(),
            tip = self.tip_position(),
            "Replaced chain tail"
        );
        Ok(displaced)
    }

    fn append(&mut self, block: Block) -> Result<(), StoreError> {
        ensure_running(self.running)?;
        let height = self.blocks.len() as Position;
        self.heights.insert(block.hash(), height);
        self.blocks.push(block);
        Ok(())
    }

    fn tip(&self) -> Result<(Position, BlockHash), StoreError> {
        ensure_running(self.running)?;
        let tip = self.tip_position();
        Ok((tip, self.blocks[tip as usize].hash()))
    }

    fn block_at(&self, position: Position) -> Result<Option<Block>, StoreError> {
        ensure_running(self.running)?;
        Ok(self.blocks.get(position as usize).cloned())
    }
}
