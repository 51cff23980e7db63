//! Canonical chain storage backends.

mod stores;

use anyhow::Result;
use config::Config;
use forkline_common::{configuration::StoreKind, Block, ChainStore};
use tracing::info;

pub use crate::stores::{fjall::FjallChainStore, memory::InMemoryChainStore};

/// Build the chain store named by the `store` key, seeded with `genesis`.
/// The store is returned unstarted.
pub fn open_store(config: &Config, genesis: Block) -> Result<Box<dyn ChainStore + Send>> {
    let kind = StoreKind::from_config(config)?;
    info!(store = %kind, genesis = %genesis.hash(), "Creating chain store");
    let store: Box<dyn ChainStore + Send> = match kind {
        StoreKind::Fjall => Box::new(FjallChainStore::new(config, genesis)),
        StoreKind::Memory => Box::new(InMemoryChainStore::new(genesis)),
    };
    Ok(store)
}
