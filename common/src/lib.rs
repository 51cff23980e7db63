//! Forkline common library - main library exports

pub mod block;
pub mod chain;
pub mod configuration;
pub mod hash;
pub mod messages;
pub mod validation;
pub mod work;

// Flattened re-exports
pub use self::block::{Block, BlockHeader};
pub use self::chain::{
    BlockStatus, ChainStore, Position, RejectReason, StoreError, Validation, Validator,
};
pub use self::hash::BlockHash;
pub use self::work::Work;
