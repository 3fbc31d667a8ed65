//! Encoding of the persisted counter state
//!
//! The record is JSON wrapped in an envelope carrying a SHA-256 checksum of
//! the state body, so a torn or corrupted write is detected on restore
//! instead of resurrecting garbage counters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CounterConfig;
use crate::error::{Error, Result};
use crate::types::Timestamp;

/// Bumped whenever the persisted layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything about a counter that survives a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub config: CounterConfig,
    pub total_events: u64,
    /// Start of the open aggregation window
    pub last_aggregation: Timestamp,
    pub last_sync: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    state: PersistedState,
}

impl PersistedState {
    /// Encode into the on-disk record
    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            checksum: checksum(self)?,
            state: self.clone(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode an on-disk record, rejecting anything malformed
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(blob)
            .map_err(|e| Error::Storage(format!("malformed state record: {}", e)))?;

        if envelope.state.version != SNAPSHOT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported state version {} (expected {})",
                envelope.state.version, SNAPSHOT_VERSION
            )));
        }

        let expected = checksum(&envelope.state)?;
        if envelope.checksum != expected {
            return Err(Error::Storage("state record checksum mismatch".to_string()));
        }

        Ok(envelope.state)
    }
}

fn checksum(state: &PersistedState) -> Result<String> {
    let body = serde_json::to_vec(state)?;
    let digest = Sha256::digest(&body);
    Ok(hex::encode(digest))
}
