//! The counters document persisted between runs.
//!
//! The file is rewritten in place on every save. A crash mid-write can leave
//! it corrupt; the next load then fails and the server starts from defaults.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    pub games_complete: u64,
    pub online_count: usize,
    /// Unix time of the save, in milliseconds
    pub last_stats_heartbeat: u64,
    pub next_client_id: u64,
}

pub async fn load(path: &Path) -> Result<StatsSnapshot, RelayError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn save(path: &Path, snapshot: &StatsSnapshot) -> Result<(), RelayError> {
    let bytes = serde_json::to_vec(snapshot)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
