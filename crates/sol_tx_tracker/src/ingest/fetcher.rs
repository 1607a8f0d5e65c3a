//! One fetch cycle: walk a contiguous slot range, normalize each block, and report how
//! far the cursor may safely advance.

use crate::chain::{normalize, BlockSource, Classifier, RpcError};
use crate::record::TransactionRecord;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Slots the cycle attempted, after clamping to the chain tip.
    pub planned: u64,
    pub blocks: u64,
    pub skipped_not_found: u64,
    pub dropped_malformed: u64,
    pub transactions_dropped: u64,
    /// Slot at which a retry-exhausted failure ended the cycle.
    pub aborted_at: Option<u64>,
    pub stopped: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CycleOutcome {
    /// Records in slot order.
    pub records: Vec<TransactionRecord>,
    /// Next slot to fetch. Never beyond a slot that failed or was not attempted.
    pub next_cursor: u64,
    pub stats: CycleStats,
}

pub struct BatchFetcher<S> {
    source: S,
    classifier: Classifier,
    stop: watch::Receiver<bool>,
}

impl<S: BlockSource> BatchFetcher<S> {
    pub fn new(source: S, classifier: Classifier, stop: watch::Receiver<bool>) -> Self {
        Self {
            source,
            classifier,
            stop,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Fetch `[cursor, cursor + batch_size)`, clamped to the latest finalized slot.
    ///
    /// Fails only when the chain tip cannot be determined; per-slot failures are
    /// contained and reflected in `next_cursor`.
    pub async fn run_cycle(&self, cursor: u64, batch_size: u64) -> Result<CycleOutcome, RpcError> {
        let tip = match self.source.latest_slot().await {
            Ok(tip) => Some(tip),
            // Offline: no tip; cache misses bound the range instead.
            Err(RpcError::OfflineMiss) => None,
            Err(e) => return Err(e),
        };
        let mut end = cursor.saturating_add(batch_size);
        if let Some(tip) = tip {
            end = end.min(tip.saturating_add(1));
        }
        let mut outcome = CycleOutcome {
            next_cursor: cursor,
            ..Default::default()
        };
        if end <= cursor {
            debug!(cursor, ?tip, "caught up with chain tip");
            return Ok(outcome);
        }
        outcome.stats.planned = end - cursor;

        for slot in cursor..end {
            if self.stop_requested() {
                info!(slot, "stop requested, ending cycle early");
                outcome.stats.stopped = true;
                break;
            }
            match self.source.fetch_block(slot).await {
                Ok(block) => {
                    let records = normalize(&block, &self.classifier);
                    let dropped = block.transactions.len().saturating_sub(records.len());
                    outcome.stats.transactions_dropped += dropped as u64;
                    outcome.stats.blocks += 1;
                    debug!(slot, count = records.len(), "block normalized");
                    outcome.records.extend(records);
                }
                Err(RpcError::NotFound(reason)) => {
                    debug!(slot, %reason, "slot has no block, skipping");
                    outcome.stats.skipped_not_found += 1;
                }
                Err(RpcError::Protocol(reason)) => {
                    warn!(slot, kind = "protocol", %reason, "malformed block dropped");
                    outcome.stats.dropped_malformed += 1;
                }
                Err(RpcError::Cancelled) => {
                    info!(slot, "fetch cancelled");
                    outcome.stats.stopped = true;
                    break;
                }
                Err(e) => {
                    warn!(slot, kind = e.kind(), error = %e, "cycle aborted");
                    outcome.stats.aborted_at = Some(slot);
                    break;
                }
            }
            outcome.next_cursor = slot + 1;
        }
        Ok(outcome)
    }
}
