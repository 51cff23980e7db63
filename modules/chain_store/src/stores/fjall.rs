use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use config::Config;
use fjall::{Database, Keyspace, OwnedWriteBatch};
use forkline_common::{Block, BlockHash, ChainStore, Position, StoreError, Work};
use tracing::{debug, info};

use super::backend;

const DEFAULT_DATABASE_PATH: &str = "fjall-chain";
const DEFAULT_CLEAR_ON_START: bool = false;
const BLOCKS_KEYSPACE: &str = "blocks";
const HASHES_BY_HEIGHT_KEYSPACE: &str = "hashes-by-height";
const HEIGHTS_BY_HASH_KEYSPACE: &str = "heights-by-hash";

/// Persistent chain in a fjall database.
///
/// The database is opened by `start` and closed by `stop`. Every tail
/// replacement is committed as a single write batch.
pub struct FjallChainStore {
    path: PathBuf,
    clear: bool,
    genesis: Block,
    state: Option<FjallChain>,
}

impl FjallChainStore {
    pub fn new(config: &Config, genesis: Block) -> Self {
        let path = config
            .get_string("database-path")
            .unwrap_or(DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        Self {
            path: PathBuf::from(path),
            clear,
            genesis,
            state: None,
        }
    }

    /// Number of blocks including genesis.
    pub fn len(&self) -> Result<u64, StoreError> {
        Ok(self.running()?.tip + 1)
    }

    fn running(&self) -> Result<&FjallChain, StoreError> {
        self.state.as_ref().ok_or(StoreError::Stopped)
    }

    fn running_mut(&mut self) -> Result<&mut FjallChain, StoreError> {
        self.state.as_mut().ok_or(StoreError::Stopped)
    }
}

impl ChainStore for FjallChainStore {
    fn start(&mut self) -> Result<(), StoreError> {
        if self.state.is_some() {
            return Ok(());
        }
        if self.clear && self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(backend)?;
        }
        let chain = FjallChain::open(&self.path, &self.genesis)?;
        info!(
            path = %self.path.display(),
            tip = chain.tip,
            "Opened chain store"
        );
        self.state = Some(chain);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            info!(path = %self.path.display(), "Closed chain store");
        }
    }

    fn find_index(&self, hash: &BlockHash) -> Result<Option<Position>, StoreError> {
        self.running()?.height_of(hash)
    }

    fn work_from(&self, position: Position) -> Result<Work, StoreError> {
        let chain = self.running()?;
        let mut work = Work::zero();
        for height in position.saturating_add(1)..=chain.tip {
            work = work + Work::from_bits(chain.expect_block(height)?.header.bits);
        }
        Ok(work)
    }

    fn replace_tail(
        &mut self,
        fork_position: Position,
        new_blocks: Vec<Block>,
    ) -> Result<Vec<Block>, StoreError> {
        self.running_mut()?.replace_tail(fork_position, &new_blocks)
    }

    fn append(&mut self, block: Block) -> Result<(), StoreError> {
        let chain = self.running_mut()?;
        let tip = chain.tip;
        chain.replace_tail(tip, std::slice::from_ref(&block))?;
        Ok(())
    }

    fn tip(&self) -> Result<(Position, BlockHash), StoreError> {
        let chain = self.running()?;
        let hash = chain
            .hash_at(chain.tip)?
            .ok_or_else(|| StoreError::Corrupt(format!("no hash at tip {}", chain.tip)))?;
        Ok((chain.tip, hash))
    }

    fn block_at(&self, position: Position) -> Result<Option<Block>, StoreError> {
        let chain = self.running()?;
        match chain.hash_at(position)? {
            Some(hash) => chain.get_block(&hash),
            None => Ok(None),
        }
    }
}

struct FjallChain {
    database: Database,
    blocks: Keyspace,
    hashes_by_height: Keyspace,
    heights_by_hash: Keyspace,
    tip: Position,
}

impl FjallChain {
    fn open(path: &Path, genesis: &Block) -> Result<Self, StoreError> {
        let database = Database::builder(path).open().map_err(backend)?;
        let blocks = database
            .keyspace(BLOCKS_KEYSPACE, fjall::KeyspaceCreateOptions::default)
            .map_err(backend)?;
        let hashes_by_height = database
            .keyspace(HASHES_BY_HEIGHT_KEYSPACE, fjall::KeyspaceCreateOptions::default)
            .map_err(backend)?;
        let heights_by_hash = database
            .keyspace(HEIGHTS_BY_HASH_KEYSPACE, fjall::KeyspaceCreateOptions::default)
            .map_err(backend)?;

        let last = match hashes_by_height.last_key_value() {
            Some(entry) => {
                let (key, _) = entry.into_inner().map_err(backend)?;
                Some(decode_height(&key)?)
            }
            None => None,
        };

        let mut chain = Self {
            database,
            blocks,
            hashes_by_height,
            heights_by_hash,
            tip: 0,
        };

        match last {
            Some(tip) => {
                chain.tip = tip;
                let stored = chain.hash_at(0)?;
                if stored != Some(genesis.hash()) {
                    return Err(StoreError::Corrupt(
                        "database holds a different genesis block".to_string(),
                    ));
                }
            }
            None => {
                let mut batch = chain.database.batch();
                chain.insert(&mut batch, 0, genesis)?;
                batch.commit().map_err(backend)?;
                debug!(hash = %genesis.hash(), "Seeded chain store with genesis");
            }
        }
        Ok(chain)
    }

    fn insert(
        &self,
        batch: &mut OwnedWriteBatch,
        height: Position,
        block: &Block,
    ) -> Result<(), StoreError> {
        let encoded = minicbor::to_vec(block)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("could not encode block: {e}")))?;
        let hash = block.hash();
        batch.insert(&self.blocks, *hash, encoded);
        batch.insert(&self.hashes_by_height, height.to_be_bytes(), *hash);
        batch.insert(&self.heights_by_hash, *hash, height.to_be_bytes());
        Ok(())
    }

    fn replace_tail(
        &mut self,
        fork_position: Position,
        new_blocks: &[Block],
    ) -> Result<Vec<Block>, StoreError> {
        if fork_position > self.tip {
            return Err(StoreError::PositionOutOfRange {
                position: fork_position,
                tip: self.tip,
            });
        }

        let mut displaced = Vec::new();
        for height in fork_position + 1..=self.tip {
            displaced.push(self.expect_block(height)?);
        }

        let new_tip = fork_position + new_blocks.len() as Position;
        let arriving: HashSet<BlockHash> = new_blocks.iter().map(Block::hash).collect();

        let mut batch = self.database.batch();
        for (offset, block) in displaced.iter().enumerate() {
            let height = fork_position + 1 + offset as Position;
            if height > new_tip {
                batch.remove(&self.hashes_by_height, height.to_be_bytes());
            }
            let hash = block.hash();
            if !arriving.contains(&hash) {
                batch.remove(&self.blocks, *hash);
                batch.remove(&self.heights_by_hash, *hash);
            }
        }
        for (offset, block) in new_blocks.iter().enumerate() {
            self.insert(&mut batch, fork_position + 1 + offset as Position, block)?;
        }
        batch.commit().map_err(backend)?;

        debug!(
            fork_position,
            displaced = displaced.len(),
            tip = new_tip,
            "Replaced chain tail"
        );
        self.tip = new_tip;
        Ok(displaced)
    }

    fn height_of(&self, hash: &BlockHash) -> Result<Option<Position>, StoreError> {
        match self.heights_by_hash.get(hash.as_ref()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    fn hash_at(&self, height: Position) -> Result<Option<BlockHash>, StoreError> {
        match self.hashes_by_height.get(height.to_be_bytes()).map_err(backend)? {
            Some(bytes) => BlockHash::try_from(&*bytes)
                .map(Some)
                .map_err(|_| StoreError::Corrupt(format!("bad hash at height {height}"))),
            None => Ok(None),
        }
    }

    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        let Some(bytes) = self.blocks.get(hash.as_ref()).map_err(backend)? else {
            return Ok(None);
        };
        minicbor::decode(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("could not decode block {hash}: {e}")))
    }

    fn expect_block(&self, height: Position) -> Result<Block, StoreError> {
        let hash = self
            .hash_at(height)?
            .ok_or_else(|| StoreError::Corrupt(format!("no hash at height {height}")))?;
        self.get_block(&hash)?
            .ok_or_else(|| StoreError::Corrupt(format!("block {hash} missing")))
    }
}

fn decode_height(bytes: &[u8]) -> Result<Position, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("bad height encoding".to_string()))?;
    Ok(Position::from_be_bytes(raw))
}
