//! Fork choice: turns submitted blocks into canonical chain changes.
//!
//! Every pooled block queued for processing is traced back towards the
//! canonical chain. A connected branch is validated root to tip, weighed
//! against the chain above its fork point, and swapped into the chain if
//! it carries strictly more work. Each successful swap re-queues every
//! unprocessed orphan, since a longer chain may let them connect.

use std::collections::{HashSet, VecDeque};

use forkline_common::{
    Block, BlockHash, BlockStatus, ChainStore, Position, RejectReason, Validation, Validator,
};
use tracing::{debug, info, warn};

use crate::{
    candidate_block::CandidateBlock,
    orphan_pool::OrphanPool,
    organizer_error::OrganizerError,
    reorganization::{ReorganizationEvent, ReorganizationSink},
};

/// What happened during one drain of the queue.
#[derive(Debug, Default, Clone)]
pub struct ProcessSummary {
    /// Reorganizations, in the order they were applied
    pub events: Vec<ReorganizationEvent>,

    /// Blocks clipped from the pool, each carrying its reason
    pub rejected: Vec<CandidateBlock>,
}

/// Outcome of [`Organizer::store`] for one block.
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub hash: BlockHash,

    /// The block was already known, in the chain or in the pool
    pub duplicate: bool,

    pub status: BlockStatus,

    pub summary: ProcessSummary,
}

pub struct Organizer {
    pool: OrphanPool,
    chain: Box<dyn ChainStore + Send>,
    validator: Box<dyn Validator + Send>,
    sink: Box<dyn ReorganizationSink + Send>,
    queue: VecDeque<BlockHash>,
    queued: HashSet<BlockHash>,
    /// Blocks clipped since the last completed drain
    rejected: Vec<CandidateBlock>,
    running: bool,
}

impl Organizer {
    pub fn new(
        pool: OrphanPool,
        chain: Box<dyn ChainStore + Send>,
        validator: Box<dyn Validator + Send>,
        sink: Box<dyn ReorganizationSink + Send>,
    ) -> Self {
        Self {
            pool,
            chain,
            validator,
            sink,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            rejected: Vec::new(),
            running: false,
        }
    }

    /// Start the chain store and queue every unprocessed pooled block.
    pub fn start(&mut self) -> Result<(), OrganizerError> {
        self.chain.start()?;
        self.running = true;
        for hash in self.pool.unprocessed() {
            self.enqueue(hash);
        }
        let (tip, hash) = self.chain.tip()?;
        info!(tip, hash = %hash, queued = self.queue.len(), "Organizer started");
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.chain.stop();
        self.sink.stopped();
        info!("Organizer stopped");
    }

    pub fn pool(&self) -> &OrphanPool {
        &self.pool
    }

    pub fn chain(&self) -> &dyn ChainStore {
        self.chain.as_ref()
    }

    /// Hashes waiting to be processed, next first.
    pub fn queued(&self) -> Vec<BlockHash> {
        self.queue.iter().copied().collect()
    }

    /// Pool `block` and queue it for processing. Returns false, changing
    /// nothing, if the block is already known or the pool refuses it.
    pub fn submit(&mut self, block: Block) -> Result<bool, OrganizerError> {
        self.ensure_running()?;
        let candidate = CandidateBlock::new(block);
        let hash = candidate.hash();
        if self.chain.find_index(&hash)?.is_some() {
            debug!(hash = %hash, "Block already in chain");
            return Ok(false);
        }
        if !self.pool.insert(candidate) {
            debug!(hash = %hash, "Block not pooled");
            return Ok(false);
        }
        self.enqueue(hash);
        Ok(true)
    }

    /// Submit `block`, drain the queue and report where the block ended up.
    pub fn store(&mut self, block: Block) -> Result<StoreReport, OrganizerError> {
        self.ensure_running()?;
        let hash = block.hash();

        if let Some(height) = self.chain.find_index(&hash)? {
            return Ok(StoreReport {
                hash,
                duplicate: true,
                status: BlockStatus::Confirmed { height },
                summary: ProcessSummary::default(),
            });
        }
        if self.pool.contains(&hash) {
            return Ok(StoreReport {
                hash,
                duplicate: true,
                status: BlockStatus::Orphan,
                summary: ProcessSummary::default(),
            });
        }
        if !self.submit(block)? {
            return Ok(StoreReport {
                hash,
                duplicate: false,
                status: BlockStatus::Dropped,
                summary: ProcessSummary::default(),
            });
        }

        let summary = self.process_queue()?;
        let status = self.status_of(&hash, &summary)?;
        debug!(hash = %hash, ?status, "Stored block");
        Ok(StoreReport {
            hash,
            duplicate: false,
            status,
            summary,
        })
    }

    /// Process queued blocks until the queue is empty.
    ///
    /// A store error aborts the drain; the failing entry and everything
    /// after it stay queued for the next call. Blocks rejected before the
    /// failure are kept for [`Organizer::take_rejected`] or the next
    /// completed drain.
    pub fn process_queue(&mut self) -> Result<ProcessSummary, OrganizerError> {
        self.ensure_running()?;
        let mut summary = ProcessSummary::default();
        while let Some(hash) = self.queue.front().copied() {
            self.process(hash, &mut summary)?;
            self.queue.pop_front();
            self.queued.remove(&hash);
        }
        summary.rejected = self.take_rejected();
        Ok(summary)
    }

    /// Blocks rejected by a drain that has not yet reported them.
    pub fn take_rejected(&mut self) -> Vec<CandidateBlock> {
        std::mem::take(&mut self.rejected)
    }

    fn process(
        &mut self,
        hash: BlockHash,
        summary: &mut ProcessSummary,
    ) -> Result<(), OrganizerError> {
        if !self.pool.contains(&hash) {
            debug!(hash = %hash, "Queued block no longer pooled");
            return Ok(());
        }

        let path = self.pool.trace(&hash, self.chain.as_ref())?;
        let Some(root) = path.first().and_then(|h| self.pool.get(h)) else {
            debug!(hash = %hash, "Block not connected to chain");
            return Ok(());
        };
        let Some(fork_position) = self.chain.find_index(&root.previous_hash())? else {
            return Ok(());
        };

        let mut candidates = Vec::with_capacity(path.len());
        for (offset, step) in path.iter().enumerate() {
            if let Some(candidate) = self.pool.get_mut(step) {
                candidate.set_chain_position(fork_position + 1 + offset as Position);
                candidates.push(candidate.block().clone());
            }
        }

        match self.validator.validate(fork_position, &candidates) {
            Validation::Valid => {}
            Validation::Invalid { index, reason } => {
                self.clip(&path, index, reason);
                return Ok(());
            }
        }

        let candidate_work = self.validator.work(&candidates);
        let incumbent_work = self.chain.work_from(fork_position)?;
        if candidate_work <= incumbent_work {
            debug!(
                hash = %hash,
                fork_position,
                %candidate_work,
                %incumbent_work,
                "Branch outweighed by current chain"
            );
            return Ok(());
        }

        let (tip, _) = self.chain.tip()?;
        let replaced = if fork_position == tip && candidates.len() == 1 {
            self.chain.append(candidates[0].clone())?;
            Vec::new()
        } else {
            self.chain.replace_tail(fork_position, candidates.clone())?
        };

        // The store now owns the arrivals
        self.pool.remove_all(&path);
        for block in &replaced {
            let displaced = CandidateBlock::new(block.clone());
            let displaced_hash = displaced.hash();
            if !self.pool.insert_displaced(displaced) {
                warn!(hash = %displaced_hash, "No room to pool displaced block");
            }
        }

        let event = ReorganizationEvent {
            fork_point: fork_position,
            arrivals: candidates,
            replaced,
        };
        info!(
            fork_point = event.fork_point,
            arrivals = event.arrivals.len(),
            replaced = event.replaced.len(),
            tip = event.tip(),
            "Chain reorganized"
        );
        self.sink.reorganized(&event);
        summary.events.push(event);

        for hash in self.pool.unprocessed() {
            self.enqueue(hash);
        }
        Ok(())
    }

    /// Reject `path[index]` with `reason` and everything after it as a
    /// descendant of an invalid block, removing them from the pool.
    fn clip(&mut self, path: &[BlockHash], index: usize, reason: RejectReason) {
        let Some(failed) = path.get(index..) else {
            warn!(index, len = path.len(), "Validator reported an index outside the branch");
            return;
        };

        for (offset, mut candidate) in self.pool.remove_all(failed).into_iter().enumerate() {
            let reason = if offset == 0 {
                reason.clone()
            } else {
                RejectReason::PreviousBlockInvalid
            };
            info!(hash = %candidate.hash(), %reason, "Block rejected");
            candidate.reject(reason);
            self.rejected.push(candidate);
        }
    }

    fn status_of(
        &self,
        hash: &BlockHash,
        summary: &ProcessSummary,
    ) -> Result<BlockStatus, OrganizerError> {
        if let Some(height) = self.chain.find_index(hash)? {
            return Ok(BlockStatus::Confirmed { height });
        }
        if let Some(reason) = summary
            .rejected
            .iter()
            .find(|c| c.hash() == *hash)
            .and_then(CandidateBlock::failure_reason)
        {
            return Ok(BlockStatus::Rejected {
                reason: reason.clone(),
            });
        }
        if self.pool.contains(hash) {
            return Ok(BlockStatus::Orphan);
        }
        Ok(BlockStatus::Dropped)
    }

    fn enqueue(&mut self, hash: BlockHash) {
        if self.queued.insert(hash) {
            self.queue.push_back(hash);
        }
    }

    fn ensure_running(&self) -> Result<(), OrganizerError> {
        if self.running {
            Ok(())
        } else {
            Err(OrganizerError::Stopped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        candidate_block::CandidateState,
        orphan_pool::EvictionPolicy,
        reorganization::{EventQueue, QueueSink},
    };
    use forkline_common::{
        validation::HeaderValidator,
        work::{compact_to_target, meets_target},
        StoreError, Work,
    };
    use forkline_module_chain_store::InMemoryChainStore;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    const LIGHT: u32 = 0x207fffff;
    const HEAVY: u32 = 0x1f00ffff;

    /// Counters and failure switches shared with a boxed `TestChain`.
    #[derive(Default)]
    struct StoreCounters {
        appends: usize,
        replacements: usize,
        stops: usize,
        fail_writes: bool,
    }

    /// In-memory chain whose writes can be made to fail.
    struct TestChain {
        inner: InMemoryChainStore,
        counters: Arc<Mutex<StoreCounters>>,
    }

    impl ChainStore for TestChain {
        fn start(&mut self) -> Result<(), StoreError> {
            self.inner.start()
        }

        fn stop(&mut self) {
            self.counters.lock().unwrap().stops += 1;
            self.inner.stop()
        }

        fn find_index(&self, hash: &BlockHash) -> Result<Option<Position>, StoreError> {
            self.inner.find_index(hash)
        }

        fn work_from(&self, position: Position) -> Result<Work, StoreError> {
            self.inner.work_from(position)
        }

        fn replace_tail(
            &mut self,
            fork_position: Position,
            new_blocks: Vec<Block>,
        ) -> Result<Vec<Block>, StoreError> {
            let mut counters = self.counters.lock().unwrap();
            counters.replacements += 1;
            if counters.fail_writes {
                return Err(StoreError::Backend(anyhow::anyhow!("disk full")));
            }
            self.inner.replace_tail(fork_position, new_blocks)
        }

        fn append(&mut self, block: Block) -> Result<(), StoreError> {
            let mut counters = self.counters.lock().unwrap();
            counters.appends += 1;
            if counters.fail_writes {
                return Err(StoreError::Backend(anyhow::anyhow!("disk full")));
            }
            self.inner.append(block)
        }

        fn tip(&self) -> Result<(Position, BlockHash), StoreError> {
            self.inner.tip()
        }

        fn block_at(&self, position: Position) -> Result<Option<Block>, StoreError> {
            self.inner.block_at(position)
        }
    }

    type ValidateCalls = Arc<Mutex<Vec<(Position, Vec<BlockHash>)>>>;

    /// Validator that fails exactly the blocks it was told to.
    struct ScriptedValidator {
        bad: HashMap<BlockHash, RejectReason>,
        calls: ValidateCalls,
    }

    impl Validator for ScriptedValidator {
        fn validate(&self, fork_position: Position, candidates: &[Block]) -> Validation {
            self.calls
                .lock()
                .unwrap()
                .push((fork_position, candidates.iter().map(Block::hash).collect()));
            for (index, block) in candidates.iter().enumerate() {
                if let Some(reason) = self.bad.get(&block.hash()) {
                    return Validation::Invalid {
                        index,
                        reason: reason.clone(),
                    };
                }
            }
            Validation::Valid
        }
    }

    struct Harness {
        organizer: Organizer,
        genesis: Block,
        events: EventQueue,
        counters: Arc<Mutex<StoreCounters>>,
        calls: ValidateCalls,
    }

    impl Harness {
        fn event_forks(&self) -> Vec<Position> {
            self.events.lock().unwrap().iter().map(|e| e.fork_point).collect()
        }

        fn tip(&self) -> (Position, BlockHash) {
            self.organizer.chain().tip().unwrap()
        }

        fn in_chain(&self, block: &Block) -> Option<Position> {
            self.organizer.chain().find_index(&block.hash()).unwrap()
        }

        fn pooled(&self, block: &Block) -> bool {
            self.organizer.pool().contains(&block.hash())
        }

        /// No block may be pooled and canonical at once.
        fn assert_disjoint(&self) {
            for hash in self.organizer.pool().unprocessed() {
                assert_eq!(self.organizer.chain().find_index(&hash).unwrap(), None);
            }
        }
    }

    fn harness_with(pool: OrphanPool, bad: &[(&Block, RejectReason)]) -> Harness {
        let calls: ValidateCalls = Arc::new(Mutex::new(Vec::new()));
        let validator = ScriptedValidator {
            bad: bad.iter().map(|(b, r)| (b.hash(), r.clone())).collect(),
            calls: calls.clone(),
        };
        harness_using(pool, Box::new(validator), calls)
    }

    fn harness_using(
        pool: OrphanPool,
        validator: Box<dyn Validator + Send>,
        calls: ValidateCalls,
    ) -> Harness {
        let genesis = Block::genesis(0, LIGHT);
        let counters = Arc::new(Mutex::new(StoreCounters::default()));
        let events: EventQueue = Arc::new(Mutex::new(Vec::new()));
        let chain = TestChain {
            inner: InMemoryChainStore::new(genesis.clone()),
            counters: counters.clone(),
        };
        let mut organizer = Organizer::new(
            pool,
            Box::new(chain),
            validator,
            Box::new(QueueSink::new(events.clone())),
        );
        organizer.start().unwrap();
        Harness {
            organizer,
            genesis,
            events,
            counters,
            calls,
        }
    }

    fn harness(bad: &[(&Block, RejectReason)]) -> Harness {
        harness_with(OrphanPool::default(), bad)
    }

    fn block(parent: &Block, bits: u32, nonce: u32) -> Block {
        let mut block = Block::new(parent.hash(), parent.header.timestamp + 1, bits, vec![]);
        block.header.nonce = nonce;
        block
    }

    fn genesis() -> Block {
        Block::genesis(0, LIGHT)
    }

    /// Child of `parent` whose header meets its own target.
    fn mine(parent: &Block, payload: Vec<u8>) -> Block {
        let mut block = Block::new(parent.hash(), parent.header.timestamp + 1, LIGHT, payload);
        let target = compact_to_target(LIGHT).unwrap();
        while !meets_target(block.hash().as_ref(), &target) {
            block.header.nonce += 1;
        }
        block
    }

    #[test]
    fn child_of_tip_is_appended() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);

        let report = h.organizer.store(b2.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        assert!(!report.duplicate);
        assert_eq!(report.summary.events.len(), 1);
        let event = &report.summary.events[0];
        assert_eq!(event.fork_point, 0);
        assert_eq!(event.arrivals, vec![b2.clone()]);
        assert!(event.replaced.is_empty());
        assert_eq!(h.tip(), (1, b2.hash()));
        assert!(!h.pooled(&b2));

        let counters = h.counters.lock().unwrap();
        assert_eq!(counters.appends, 1);
        assert_eq!(counters.replacements, 0);
    }

    #[test]
    fn heavier_competitor_displaces_tip() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let rival = block(&h.genesis, HEAVY, 2);

        h.organizer.store(b2.clone()).unwrap();
        let report = h.organizer.store(rival.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        let event = &report.summary.events[0];
        assert_eq!(event.fork_point, 0);
        assert_eq!(event.arrivals, vec![rival.clone()]);
        assert_eq!(event.replaced, vec![b2.clone()]);

        assert_eq!(h.tip(), (1, rival.hash()));
        assert!(!h.pooled(&rival));
        let returned = h.organizer.pool().get(&b2.hash()).unwrap();
        assert_eq!(returned.state(), CandidateState::Unprocessed);
        assert_eq!(h.counters.lock().unwrap().replacements, 1);
        assert_eq!(h.event_forks(), vec![0, 0]);
        h.assert_disjoint();
    }

    #[test]
    fn unknown_parent_stays_orphaned() {
        let mut h = harness(&[]);
        let missing = block(&h.genesis, LIGHT, 1);
        let b3 = block(&missing, LIGHT, 2);

        let report = h.organizer.store(b3.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Orphan);
        assert!(report.summary.events.is_empty());
        assert!(h.pooled(&b3));
        assert!(h.calls.lock().unwrap().is_empty());
        assert!(h.events.lock().unwrap().is_empty());
    }

    #[test]
    fn parent_arrival_connects_waiting_child() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let b3 = block(&b2, LIGHT, 2);

        assert_eq!(h.organizer.store(b3.clone()).unwrap().status, BlockStatus::Orphan);
        let report = h.organizer.store(b2.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        assert_eq!(report.summary.events.len(), 2);
        assert_eq!(report.summary.events[0].arrivals, vec![b2.clone()]);
        assert_eq!(report.summary.events[1].fork_point, 1);
        assert_eq!(report.summary.events[1].arrivals, vec![b3.clone()]);
        assert_eq!(h.tip(), (2, b3.hash()));
        assert!(h.organizer.pool().is_empty());
        assert!(h.organizer.queued().is_empty());
    }

    #[test]
    fn invalid_block_purges_descendants_but_keeps_prefix() {
        let g = genesis();
        let t = block(&g, LIGHT, 1);
        let c1 = block(&t, LIGHT, 2);
        let c2 = block(&c1, LIGHT, 3);
        let b2 = block(&t, LIGHT, 10);
        let b3 = block(&b2, LIGHT, 11);
        let b4 = block(&b3, LIGHT, 12);
        let mut h = harness(&[(&b3, RejectReason::InsufficientProofOfWork)]);

        h.organizer.store(t.clone()).unwrap();
        h.organizer.store(c1.clone()).unwrap();

        // Disconnected until b2 arrives; b2 alone only ties c1
        assert_eq!(h.organizer.store(b4.clone()).unwrap().status, BlockStatus::Orphan);
        assert_eq!(h.organizer.store(b3.clone()).unwrap().status, BlockStatus::Orphan);
        assert_eq!(h.organizer.store(b2.clone()).unwrap().status, BlockStatus::Orphan);

        // Extending the chain re-traces the orphans, oldest (b4) first
        let report = h.organizer.store(c2.clone()).unwrap();
        assert_eq!(report.status, BlockStatus::Confirmed { height: 3 });

        assert!(h
            .calls
            .lock()
            .unwrap()
            .contains(&(1, vec![b2.hash(), b3.hash(), b4.hash()])));

        let rejected: Vec<(BlockHash, Option<RejectReason>)> = report
            .summary
            .rejected
            .iter()
            .map(|c| (c.hash(), c.failure_reason().cloned()))
            .collect();
        assert_eq!(
            rejected,
            vec![
                (b3.hash(), Some(RejectReason::InsufficientProofOfWork)),
                (b4.hash(), Some(RejectReason::PreviousBlockInvalid)),
            ]
        );
        assert!(report.summary.rejected.iter().all(|c| c.state() == CandidateState::Rejected));

        assert!(h.pooled(&b2));
        assert!(h.organizer.pool().get(&b2.hash()).unwrap().is_unprocessed());
        assert!(!h.pooled(&b3));
        assert!(!h.pooled(&b4));
        assert_eq!(h.tip(), (3, c2.hash()));
    }

    #[test]
    fn store_failure_leaves_branch_pooled() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        h.counters.lock().unwrap().fail_writes = true;

        let result = h.organizer.store(b2.clone());

        assert!(matches!(
            result,
            Err(OrganizerError::Store(StoreError::Backend(_)))
        ));
        assert!(h.pooled(&b2));
        assert!(h.organizer.pool().get(&b2.hash()).unwrap().is_unprocessed());
        assert_eq!(h.organizer.queued(), vec![b2.hash()]);
        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(h.tip(), (0, h.genesis.hash()));

        // Retried once the store recovers
        h.counters.lock().unwrap().fail_writes = false;
        let summary = h.organizer.process_queue().unwrap();
        assert_eq!(summary.events.len(), 1);
        assert_eq!(h.tip(), (1, b2.hash()));
    }

    #[test]
    fn failed_tail_replacement_keeps_incumbent() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let rival = block(&h.genesis, HEAVY, 2);
        h.organizer.store(b2.clone()).unwrap();
        h.counters.lock().unwrap().fail_writes = true;

        assert!(h.organizer.store(rival.clone()).is_err());

        assert_eq!(h.counters.lock().unwrap().replacements, 1);
        assert_eq!(h.tip(), (1, b2.hash()));
        assert!(h.pooled(&rival));
        assert_eq!(h.event_forks(), vec![0]);
    }

    #[test]
    fn equal_work_never_reorganizes() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let twin = block(&h.genesis, LIGHT, 2);

        h.organizer.store(b2.clone()).unwrap();
        let report = h.organizer.store(twin.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Orphan);
        assert!(report.summary.events.is_empty());
        assert_eq!(h.counters.lock().unwrap().replacements, 0);
        assert_eq!(h.tip(), (1, b2.hash()));
        assert!(h.pooled(&twin));
    }

    #[test]
    fn longer_branch_from_deeper_fork_wins() {
        let mut h = harness(&[]);
        let a1 = block(&h.genesis, LIGHT, 1);
        let a2 = block(&a1, LIGHT, 2);
        let b1 = block(&h.genesis, LIGHT, 10);
        let b2 = block(&b1, LIGHT, 11);
        let b3 = block(&b2, LIGHT, 12);

        for b in [&a1, &a2, &b1, &b2] {
            h.organizer.store(b.clone()).unwrap();
        }
        assert_eq!(h.tip(), (2, a2.hash()));

        let report = h.organizer.store(b3.clone()).unwrap();
        let event = &report.summary.events[0];
        assert_eq!(event.fork_point, 0);
        assert_eq!(event.arrivals, vec![b1.clone(), b2.clone(), b3.clone()]);
        assert_eq!(event.replaced, vec![a1.clone(), a2.clone()]);
        assert_eq!(h.tip(), (3, b3.hash()));
        assert!(h.pooled(&a1) && h.pooled(&a2));
        h.assert_disjoint();
    }

    #[test]
    fn processing_is_deterministic() {
        let run = || {
            let mut h = harness(&[]);
            let b2 = block(&h.genesis, LIGHT, 1);
            let b3 = block(&b2, LIGHT, 2);
            let rival = block(&h.genesis, HEAVY, 3);
            for b in [&b3, &b2, &rival] {
                h.organizer.store(b.clone()).unwrap();
            }
            let events = h.events.lock().unwrap().clone();
            (events, h.tip())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn duplicates_are_reported_not_reprocessed() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let orphan = block(&b2, LIGHT, 5);
        let orphan_child = block(&orphan, LIGHT, 6);

        h.organizer.store(b2.clone()).unwrap();
        let again = h.organizer.store(b2.clone()).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.status, BlockStatus::Confirmed { height: 1 });

        h.organizer.store(orphan_child.clone()).unwrap();
        let again = h.organizer.store(orphan_child.clone()).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.status, BlockStatus::Orphan);

        assert!(!h.organizer.submit(b2.clone()).unwrap());
        assert_eq!(h.organizer.pool().len(), 1);
    }

    #[test]
    fn full_pool_drops_new_block() {
        let mut h = harness_with(OrphanPool::new(1, EvictionPolicy::RejectNewest), &[]);
        let gap = block(&h.genesis, LIGHT, 1);
        let first = block(&gap, LIGHT, 2);
        let second = block(&gap, LIGHT, 3);

        assert_eq!(h.organizer.store(first).unwrap().status, BlockStatus::Orphan);
        let report = h.organizer.store(second.clone()).unwrap();
        assert_eq!(report.status, BlockStatus::Dropped);
        assert!(!report.duplicate);
        assert!(!h.pooled(&second));
    }

    #[test]
    fn start_queues_pooled_blocks() {
        let g = genesis();
        let b2 = block(&g, LIGHT, 1);
        let mut pool = OrphanPool::default();
        pool.insert(CandidateBlock::new(b2.clone()));

        let mut h = harness_with(pool, &[]);
        assert_eq!(h.organizer.queued(), vec![b2.hash()]);

        let summary = h.organizer.process_queue().unwrap();
        assert_eq!(summary.events.len(), 1);
        assert_eq!(h.in_chain(&b2), Some(1));
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let mut h = harness(&[]);
        h.organizer.stop();
        h.organizer.stop();

        assert_eq!(h.counters.lock().unwrap().stops, 1);
        assert!(matches!(
            h.organizer.store(block(&h.genesis, LIGHT, 1)),
            Err(OrganizerError::Stopped)
        ));
        assert!(matches!(h.organizer.process_queue(), Err(OrganizerError::Stopped)));
    }

    #[test]
    fn chain_positions_are_set_on_traced_blocks() {
        let mut h = harness(&[]);
        let b2 = block(&h.genesis, LIGHT, 1);
        let twin = block(&h.genesis, LIGHT, 2);
        h.organizer.store(b2).unwrap();
        h.organizer.store(twin.clone()).unwrap();

        let pooled = h.organizer.pool().get(&twin.hash()).unwrap();
        assert_eq!(pooled.chain_position(), Some(1));
    }

    #[test]
    fn displaced_blocks_take_room_from_stray_orphans() {
        let mut h = harness_with(OrphanPool::new(2, EvictionPolicy::RejectNewest), &[]);
        let a1 = block(&h.genesis, LIGHT, 1);
        let a2 = block(&a1, LIGHT, 2);
        let missing = block(&h.genesis, LIGHT, 3);
        let stray = block(&missing, LIGHT, 4);
        let heavy = block(&h.genesis, HEAVY, 5);

        h.organizer.store(a1.clone()).unwrap();
        h.organizer.store(a2.clone()).unwrap();
        assert_eq!(h.organizer.store(stray.clone()).unwrap().status, BlockStatus::Orphan);

        let report = h.organizer.store(heavy.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        assert_eq!(report.summary.events[0].replaced, vec![a1.clone(), a2.clone()]);
        assert!(h.pooled(&a1));
        assert!(h.pooled(&a2));
        assert!(!h.pooled(&stray));
        assert_eq!(h.organizer.pool().len(), 2);
        assert_eq!(h.tip(), (1, heavy.hash()));
        h.assert_disjoint();
    }

    #[test]
    fn rejections_survive_a_failed_drain() {
        let g = genesis();
        let bad = block(&g, LIGHT, 1);
        let bad_child = block(&bad, LIGHT, 2);
        let winner = block(&g, LIGHT, 3);
        let mut pool = OrphanPool::default();
        for b in [&bad_child, &bad, &winner] {
            pool.insert(CandidateBlock::new(b.clone()));
        }
        let mut h = harness_with(pool, &[(&bad, RejectReason::InsufficientProofOfWork)]);
        h.counters.lock().unwrap().fail_writes = true;

        assert!(matches!(
            h.organizer.process_queue(),
            Err(OrganizerError::Store(_))
        ));
        assert_eq!(h.organizer.queued(), vec![winner.hash()]);

        let rejected: Vec<(BlockHash, Option<RejectReason>)> = h
            .organizer
            .take_rejected()
            .iter()
            .map(|c| (c.hash(), c.failure_reason().cloned()))
            .collect();
        assert_eq!(
            rejected,
            vec![
                (bad.hash(), Some(RejectReason::InsufficientProofOfWork)),
                (bad_child.hash(), Some(RejectReason::PreviousBlockInvalid)),
            ]
        );
        assert!(h.organizer.take_rejected().is_empty());

        h.counters.lock().unwrap().fail_writes = false;
        let summary = h.organizer.process_queue().unwrap();
        assert!(summary.rejected.is_empty());
        assert_eq!(summary.events.len(), 1);
        assert_eq!(h.tip(), (1, winner.hash()));
    }

    #[test]
    fn rejections_from_a_failed_drain_join_the_next_summary() {
        let g = genesis();
        let bad = block(&g, LIGHT, 1);
        let winner = block(&g, LIGHT, 2);
        let mut pool = OrphanPool::default();
        for b in [&bad, &winner] {
            pool.insert(CandidateBlock::new(b.clone()));
        }
        let mut h = harness_with(pool, &[(&bad, RejectReason::PayloadMismatch)]);
        h.counters.lock().unwrap().fail_writes = true;
        assert!(h.organizer.process_queue().is_err());

        h.counters.lock().unwrap().fail_writes = false;
        let summary = h.organizer.process_queue().unwrap();
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].hash(), bad.hash());
    }

    #[test]
    fn full_pool_can_evict_oldest_orphan() {
        let mut h = harness_with(OrphanPool::new(2, EvictionPolicy::EvictOldest), &[]);
        let gap = block(&h.genesis, LIGHT, 1);
        let oldest = block(&gap, LIGHT, 2);
        let middle = block(&gap, LIGHT, 3);
        let newest = block(&gap, LIGHT, 4);

        h.organizer.store(oldest.clone()).unwrap();
        h.organizer.store(middle.clone()).unwrap();
        let report = h.organizer.store(newest.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Orphan);
        assert!(!h.pooled(&oldest));
        assert!(h.pooled(&middle));
        assert!(h.pooled(&newest));

        // The missing parent evicts `middle` on arrival and lets `newest` connect
        let report = h.organizer.store(gap.clone()).unwrap();
        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        assert_eq!(h.tip(), (2, newest.hash()));
        assert!(!h.pooled(&middle));
        assert_eq!(h.in_chain(&middle), None);
        assert!(h.organizer.pool().is_empty());
    }

    #[test]
    fn header_validator_rejects_tampered_branch() {
        let validator = HeaderValidator::default().with_clock(|| 10_000);
        let mut h = harness_using(
            OrphanPool::default(),
            Box::new(validator),
            Arc::new(Mutex::new(Vec::new())),
        );
        let b2 = mine(&h.genesis, vec![2]);
        let mut b3 = mine(&b2, vec![3]);
        // Header, and so the link from b4, is untouched
        b3.payload = vec![0xff];
        let b4 = mine(&b3, vec![4]);

        assert_eq!(h.organizer.store(b4.clone()).unwrap().status, BlockStatus::Orphan);
        assert_eq!(h.organizer.store(b3.clone()).unwrap().status, BlockStatus::Orphan);
        let report = h.organizer.store(b2.clone()).unwrap();

        assert_eq!(report.status, BlockStatus::Confirmed { height: 1 });
        let rejected: Vec<(BlockHash, Option<RejectReason>)> = report
            .summary
            .rejected
            .iter()
            .map(|c| (c.hash(), c.failure_reason().cloned()))
            .collect();
        assert_eq!(
            rejected,
            vec![
                (b3.hash(), Some(RejectReason::PayloadMismatch)),
                (b4.hash(), Some(RejectReason::PreviousBlockInvalid)),
            ]
        );
        assert_eq!(h.tip(), (1, b2.hash()));
        assert!(h.organizer.pool().is_empty());
    }
}
