//! Bounded pool of candidate blocks not yet part of the canonical chain.
//!
//! Blocks live in an arena of slots indexed by hash; ancestry is followed
//! through `previous_hash` lookups in that index, so competing children
//! of one parent need no special handling.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use forkline_common::{BlockHash, ChainStore, StoreError};
use tracing::debug;

use crate::candidate_block::CandidateBlock;

pub const DEFAULT_CAPACITY: usize = 20;

/// What `insert` does when the pool is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Refuse the new block
    #[default]
    RejectNewest,

    /// Drop the oldest pooled block to make room
    EvictOldest,
}

impl FromStr for EvictionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject-newest" => Ok(EvictionPolicy::RejectNewest),
            "evict-oldest" => Ok(EvictionPolicy::EvictOldest),
            other => Err(anyhow::anyhow!("Unknown orphan eviction policy '{other}'")),
        }
    }
}

impl Display for EvictionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::RejectNewest => write!(f, "reject-newest"),
            EvictionPolicy::EvictOldest => write!(f, "evict-oldest"),
        }
    }
}

pub struct OrphanPool {
    capacity: usize,
    policy: EvictionPolicy,
    slots: Vec<Option<CandidateBlock>>,
    free: Vec<usize>,
    index: HashMap<BlockHash, usize>,
    /// Hashes in arrival order, oldest at the front
    arrivals: VecDeque<BlockHash>,
    /// Blocks returned from the chain by a reorganization
    displaced: HashSet<BlockHash>,
}

impl OrphanPool {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            arrivals: VecDeque::with_capacity(capacity),
            displaced: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&CandidateBlock> {
        self.index.get(hash).and_then(|slot| self.slots[*slot].as_ref())
    }

    pub(crate) fn get_mut(&mut self, hash: &BlockHash) -> Option<&mut CandidateBlock> {
        let slot = *self.index.get(hash)?;
        self.slots[slot].as_mut()
    }

    /// Add `candidate` unless its hash is already pooled or the pool is
    /// full under `RejectNewest`. Returns whether it was added.
    pub fn insert(&mut self, candidate: CandidateBlock) -> bool {
        let hash = candidate.hash();
        if self.contains(&hash) {
            return false;
        }

        if self.len() >= self.capacity {
            match self.policy {
                EvictionPolicy::RejectNewest => {
                    debug!(hash = %hash, "Orphan pool full, refusing block");
                    return false;
                }
                EvictionPolicy::EvictOldest => {
                    let Some(oldest) = self.arrivals.front().copied() else {
                        // Zero capacity
                        return false;
                    };
                    self.remove(&oldest);
                    debug!(hash = %oldest, "Evicted oldest orphan");
                }
            }
        }

        self.place(hash, candidate);
        true
    }

    /// Return a block displaced from the chain to the pool. Room is made
    /// whatever the policy, preferring to evict the oldest block that was
    /// not itself displaced. Returns false only for a duplicate or a pool
    /// of zero capacity.
    pub fn insert_displaced(&mut self, candidate: CandidateBlock) -> bool {
        let hash = candidate.hash();
        if self.contains(&hash) || self.capacity == 0 {
            return false;
        }

        if self.len() >= self.capacity {
            let victim = self
                .arrivals
                .iter()
                .find(|h| !self.displaced.contains(*h))
                .or(self.arrivals.front())
                .copied();
            if let Some(victim) = victim {
                self.remove(&victim);
                debug!(hash = %victim, "Evicted orphan for displaced block");
            }
        }

        self.place(hash, candidate);
        self.displaced.insert(hash);
        true
    }

    fn place(&mut self, hash: BlockHash, candidate: CandidateBlock) {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(candidate);
                slot
            }
            None => {
                self.slots.push(Some(candidate));
                self.slots.len() - 1
            }
        };
        self.index.insert(hash, slot);
        self.arrivals.push_back(hash);
    }

    /// Walk back from `start` through pooled ancestors until one's parent
    /// is in `chain`. Returns the walked hashes root first, or an empty
    /// list if the branch does not connect.
    pub fn trace(
        &self,
        start: &BlockHash,
        chain: &dyn ChainStore,
    ) -> Result<Vec<BlockHash>, StoreError> {
        let mut path = Vec::new();
        let mut current = *start;

        // Each step consumes a distinct pooled block
        while path.len() < self.len() {
            let Some(candidate) = self.get(&current) else {
                return Ok(Vec::new());
            };
            path.push(current);

            let parent = candidate.previous_hash();
            if chain.find_index(&parent)?.is_some() {
                path.reverse();
                return Ok(path);
            }
            current = parent;
        }
        Ok(Vec::new())
    }

    /// Hashes of all unprocessed blocks, oldest first.
    pub fn unprocessed(&self) -> Vec<BlockHash> {
        self.arrivals
            .iter()
            .filter(|hash| self.get(hash).is_some_and(CandidateBlock::is_unprocessed))
            .copied()
            .collect()
    }

    pub fn remove(&mut self, hash: &BlockHash) -> Option<CandidateBlock> {
        let slot = self.index.remove(hash)?;
        self.arrivals.retain(|h| h != hash);
        self.displaced.remove(hash);
        self.free.push(slot);
        self.slots[slot].take()
    }

    /// Remove every hash in `hashes`, returning the removed candidates in
    /// the same order. Hashes not pooled are skipped.
    pub fn remove_all(&mut self, hashes: &[BlockHash]) -> Vec<CandidateBlock> {
        hashes.iter().filter_map(|hash| self.remove(hash)).collect()
    }
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, EvictionPolicy::default())
    }
}
