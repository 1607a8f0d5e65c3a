//! sol_tx_tracker: incremental Solana transaction ingestion.
//!
//! Pulls finalized blocks from a JSON-RPC node in slot batches, normalizes them into
//! transaction records, and merges them into a crash-safe local dataset that readers
//! consume through immutable snapshots.

pub mod chain;
pub mod config;
pub mod ingest;
pub mod query;
pub mod record;
pub mod store;

pub use chain::{
    BlockPayload, BlockSource, Classifier, ResponseCache, RpcClient, RpcConfig, RpcError,
};
pub use config::{ConfigError, TrackerConfig};
pub use ingest::{BatchFetcher, CycleOutcome, SyncError, SyncService, SyncState};
pub use query::{parse_time_bound, BatchSummary, DatasetStats, QueryError, StatusCounts};
pub use record::{TransactionRecord, TxStatus};
pub use store::{Dataset, DatasetStore, MergeSummary, Snapshot, StoreError};
