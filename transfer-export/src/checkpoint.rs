//! Export checkpoint persistence.
//!
//! The checkpoint is the sole source of truth for resumption. It is
//! carried explicitly between loop iterations and mirrored to
//! `<data_dir>/checkpoint.json` after each durable flush so a process
//! restart resumes from the same block. It is never re-derived by
//! reading the sink.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Last block known to be fully processed for one wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Wallet the checkpoint belongs to.
    pub address: Address,
    /// Upper bound of the last durably flushed range.
    pub last_processed_block: u64,
    /// Unix timestamp (seconds) of the last advance.
    pub updated_at: u64,
}

impl Checkpoint {
    /// Create a checkpoint at the given block with the current timestamp.
    #[must_use]
    pub fn new(address: Address, last_processed_block: u64) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            address,
            last_processed_block,
            updated_at,
        }
    }

    /// Successor checkpoint advanced to `block`.
    ///
    /// Advancing never moves backwards; a lower `block` keeps the current
    /// position.
    #[must_use]
    pub fn advanced(&self, block: u64) -> Self {
        Self::new(self.address, self.last_processed_block.max(block))
    }

    /// Read the checkpoint from `<dir>/checkpoint.json`.
    ///
    /// Returns `None` if the file does not exist (first run), if it holds
    /// invalid JSON, or if it belongs to a different wallet — the latter
    /// two log a warning and trigger a fresh start from the configured
    /// initial block.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read (I/O error).
    pub fn load(dir: &Path, address: Address) -> Result<Option<Self>> {
        let path = dir.join("checkpoint.json");
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Self>(&data) {
            Ok(checkpoint) if checkpoint.address == address => Ok(Some(checkpoint)),
            Ok(checkpoint) => {
                tracing::warn!(
                    path = %path.display(),
                    found = %checkpoint.address,
                    expected = %address,
                    "checkpoint belongs to another wallet, starting fresh"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupted checkpoint, starting fresh");
                Ok(None)
            }
        }
    }

    /// Persist the checkpoint to `<dir>/checkpoint.json` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join("checkpoint.json");
        let tmp = dir.join("checkpoint.json.tmp");

        std::fs::write(&tmp, serde_json::to_string_pretty(self)?.as_bytes())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} → {}", tmp.display(), path.display()))?;

        Ok(())
    }
}
