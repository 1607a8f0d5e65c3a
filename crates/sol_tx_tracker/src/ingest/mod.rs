//! Ingestion: batch fetch cycles and the background sync service.

pub mod fetcher;
pub mod scheduler;

pub use fetcher::{BatchFetcher, CycleOutcome, CycleStats};
pub use scheduler::{CycleReport, SyncError, SyncService, SyncSettings, SyncState};
