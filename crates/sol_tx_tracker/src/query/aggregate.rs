//! Aggregate counts over records: overall stats and per-batch summaries.

use crate::record::{TransactionRecord, TxStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.success.saturating_add(self.failed)
    }

    pub(crate) fn add(&mut self, status: TxStatus) {
        match status {
            TxStatus::Success => self.success = self.success.saturating_add(1),
            TxStatus::Failed => self.failed = self.failed.saturating_add(1),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub cursor: u64,
    pub total: u64,
    pub by_status: StatusCounts,
    pub by_type: BTreeMap<String, u64>,
    pub first_slot: Option<u64>,
    pub last_slot: Option<u64>,
}

/// Counts for one bucket of `slots_per_batch` consecutive slots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Bucket index: `slot / slots_per_batch`.
    pub batch: u64,
    pub min_block_time: Option<i64>,
    pub max_slot: u64,
    pub by_status: StatusCounts,
    pub by_type: BTreeMap<String, u64>,
    pub success_by_type: BTreeMap<String, u64>,
    pub failed_by_type: BTreeMap<String, u64>,
    pub total: u64,
}

impl BatchSummary {
    fn add(&mut self, r: &TransactionRecord) {
        self.max_slot = self.max_slot.max(r.slot);
        if let Some(t) = r.block_time {
            self.min_block_time = Some(self.min_block_time.map_or(t, |m| m.min(t)));
        }
        self.by_status.add(r.status);
        bump(&mut self.by_type, &r.tx_type);
        match r.status {
            TxStatus::Success => bump(&mut self.success_by_type, &r.tx_type),
            TxStatus::Failed => bump(&mut self.failed_by_type, &r.tx_type),
        }
        self.total = self.total.saturating_add(1);
    }
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str) {
    match map.get_mut(key) {
        Some(n) => *n = n.saturating_add(1),
        None => {
            map.insert(key.to_string(), 1);
        }
    }
}

/// `slots_per_batch` must be non-zero; callers check.
pub(crate) fn summarize(records: &[TransactionRecord], slots_per_batch: u64) -> Vec<BatchSummary> {
    let mut buckets: BTreeMap<u64, BatchSummary> = BTreeMap::new();
    for r in records {
        let batch = r.slot / slots_per_batch;
        buckets
            .entry(batch)
            .or_insert_with(|| BatchSummary {
                batch,
                ..Default::default()
            })
            .add(r);
    }
    buckets.into_values().collect()
}
