//! Block and header values as seen by the chain organizer.
//!
//! The payload is opaque here; only the header participates in identity
//! and fork choice.

use crate::hash::BlockHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the canonical header encoding.
pub const HEADER_SIZE: usize = 80;

#[derive(
    Debug,
    Default,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct BlockHeader {
    #[n(0)]
    pub version: u32,

    /// Parent link
    #[n(1)]
    pub previous_hash: BlockHash,

    /// Commitment to the payload
    #[n(2)]
    pub payload_hash: BlockHash,

    #[n(3)]
    pub timestamp: u32,

    /// Compact proof-of-work target
    #[n(4)]
    pub bits: u32,

    #[n(5)]
    pub nonce: u32,
}

impl BlockHeader {
    /// Fixed little-endian encoding the block hash is computed over.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(self.previous_hash.as_ref());
        bytes[36..68].copy_from_slice(self.payload_hash.as_ref());
        bytes[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> BlockHash {
        double_sha256(&self.encode())
    }
}

/// A block: header plus opaque payload.
#[derive(
    Debug,
    Default,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct Block {
    #[n(0)]
    pub header: BlockHeader,

    #[cbor(n(1), with = "minicbor::bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    /// Build a block whose header commits to `payload`.
    pub fn new(previous_hash: BlockHash, timestamp: u32, bits: u32, payload: Vec<u8>) -> Self {
        Self {
            header: BlockHeader {
                version: 1,
                previous_hash,
                payload_hash: double_sha256(&payload),
                timestamp,
                bits,
                nonce: 0,
            },
            payload,
        }
    }

    /// Deterministic genesis block: zero parent, empty payload.
    pub fn genesis(timestamp: u32, bits: u32) -> Self {
        Self::new(BlockHash::default(), timestamp, bits, Vec::new())
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.header.previous_hash
    }

    /// True when the header's payload commitment matches the payload carried.
    pub fn payload_matches(&self) -> bool {
        double_sha256(&self.payload) == self.header.payload_hash
    }
}

pub fn double_sha256(data: &[u8]) -> BlockHash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&second);
    BlockHash::new(bytes)
}
