//! Definition of Forkline messages

use crate::{
    block::Block,
    chain::{BlockStatus, Position},
    hash::BlockHash,
};

/// A block has arrived from the network and should be organized
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAvailableMessage {
    pub block: Block,
}

/// Where a block ended up after organization
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockStatusMessage {
    pub hash: BlockHash,
    pub status: BlockStatus,
}

/// The canonical chain changed
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainReorganizedMessage {
    /// Last block shared by the old and new chains
    pub fork_point: Position,

    /// Blocks now canonical, root to tip
    pub arrivals: Vec<Block>,

    /// Blocks displaced from the chain, oldest first
    pub replaced: Vec<Block>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages
    String(String),
    JSON(serde_json::Value),

    // Forkline messages
    BlockAvailable(BlockAvailableMessage),     // Block received
    BlockStatus(BlockStatusMessage),           // Block organized
    ChainReorganized(ChainReorganizedMessage), // Tip changed
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<BlockAvailableMessage> for Message {
    fn from(msg: BlockAvailableMessage) -> Self {
        Message::BlockAvailable(msg)
    }
}

impl From<BlockStatusMessage> for Message {
    fn from(msg: BlockStatusMessage) -> Self {
        Message::BlockStatus(msg)
    }
}

impl From<ChainReorganizedMessage> for Message {
    fn from(msg: ChainReorganizedMessage) -> Self {
        Message::ChainReorganized(msg)
    }
}
