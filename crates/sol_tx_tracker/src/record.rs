//! Canonical transaction record stored in the dataset.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution outcome reported by the node's transaction metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the dataset. `signature` is unique across the whole dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub slot: u64,
    /// Unix seconds; `None` when the node did not report a block time.
    #[serde(default)]
    pub block_time: Option<i64>,
    pub status: TxStatus,
    pub tx_type: String,
    /// Lamports; `None` when metadata was missing.
    #[serde(default)]
    pub fee: Option<u64>,
    #[serde(default)]
    pub accounts: Vec<String>,
}
