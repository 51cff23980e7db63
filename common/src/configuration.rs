use crate::{block::Block, validation::DEFAULT_MAX_FUTURE_DRIFT};
use anyhow::{anyhow, Result};
use config::Config;
use std::fmt::{self, Display, Formatter};

pub const CONFIG_KEY_STORE: &str = "store";
pub const CONFIG_KEY_GENESIS_TIMESTAMP: &str = "genesis-timestamp";
pub const CONFIG_KEY_GENESIS_BITS: &str = "genesis-bits";
pub const CONFIG_KEY_MAX_FUTURE_DRIFT: &str = "max-future-drift";

/// Easiest valid compact target, as used by regtest networks
pub const DEFAULT_GENESIS_BITS: u32 = 0x207fffff;

/// Which chain store backs the organizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Fjall,
    Memory,
}

impl StoreKind {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.get_string(CONFIG_KEY_STORE) {
            Ok(name) => name.parse(),
            Err(_) => Ok(StoreKind::Fjall),
        }
    }
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fjall" => Ok(StoreKind::Fjall),
            "memory" => Ok(StoreKind::Memory),
            other => Err(anyhow!("Unknown chain store '{other}'")),
        }
    }
}

impl Display for StoreKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Fjall => write!(f, "fjall"),
            StoreKind::Memory => write!(f, "memory"),
        }
    }
}

/// Parse a u32 that may be written in decimal or as `0x`-prefixed hex.
fn parse_u32(text: &str) -> Result<u32> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| anyhow!("Invalid number '{text}': {e}"))
}

/// Genesis block described by `genesis-timestamp` and `genesis-bits`.
pub fn genesis_from_config(config: &Config) -> Result<Block> {
    let timestamp = match config.get_string(CONFIG_KEY_GENESIS_TIMESTAMP) {
        Ok(text) => parse_u32(&text)?,
        Err(_) => 0,
    };
    let bits = match config.get_string(CONFIG_KEY_GENESIS_BITS) {
        Ok(text) => parse_u32(&text)?,
        Err(_) => DEFAULT_GENESIS_BITS,
    };
    Ok(Block::genesis(timestamp, bits))
}

pub fn max_future_drift_from_config(config: &Config) -> i64 {
    config.get_int(CONFIG_KEY_MAX_FUTURE_DRIFT).unwrap_or(DEFAULT_MAX_FUTURE_DRIFT)
}
