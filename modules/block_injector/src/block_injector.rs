//! Forkline block injector module for Caryatid
//! Reads CBOR-encoded blocks from files and posts them onto the bus

use anyhow::{anyhow, Context as _, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use forkline_common::{
    messages::{BlockAvailableMessage, Message},
    Block,
};
use glob::glob;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

const CONFIG_BLOCK_PUBLISH_TOPIC: (&str, &str) =
    ("block-publish-topic", "forkline.block.available");
const CONFIG_BLOCK_FILES: &str = "block-files";

/// Block injector module
#[module(
    message_type(Message),
    name = "block-injector",
    description = "Block file injector"
)]
pub struct BlockInjector;

/// Files matching `pattern`, in lexicographic order.
fn block_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(pattern)
        .map_err(|e| anyhow!("Bad block-files pattern '{pattern}': {}", e.msg))?
        .collect::<Result<_, _>>()?;
    files.sort();
    Ok(files)
}

/// Decode one block file.
fn read_block(path: &Path) -> Result<Block> {
    let raw = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    minicbor::decode(&raw).with_context(|| format!("Decoding {}", path.display()))
}

impl BlockInjector {
    /// Read and publish all the blocks
    async fn process_blocks(context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let block_publish_topic = config
            .get_string(CONFIG_BLOCK_PUBLISH_TOPIC.0)
            .unwrap_or(CONFIG_BLOCK_PUBLISH_TOPIC.1.to_string());
        info!("Publishing blocks on '{block_publish_topic}'");

        let Ok(file_pattern) = config.get_string(CONFIG_BLOCK_FILES) else {
            error!("No block-files pattern given");
            return Err(anyhow!("No block-files"));
        };

        for path in block_files(&file_pattern)? {
            let block = read_block(&path)?;
            info!(hash = %block.hash(), "  {}", path.display());

            let message = Message::BlockAvailable(BlockAvailableMessage { block });
            context
                .message_bus
                .publish(&block_publish_topic, Arc::new(message))
                .await
                .unwrap_or_else(|e| error!("Failed to publish block message: {e}"));
        }

        Ok(())
    }

    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        context.clone().run(async move {
            if let Err(e) = Self::process_blocks(context, config).await {
                error!("Failed to process blocks: {e}");
            }
        });

        Ok(())
    }
}
