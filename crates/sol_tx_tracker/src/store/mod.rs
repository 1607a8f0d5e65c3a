//! Crash-safe dataset persistence and snapshots.

mod dataset;

pub use dataset::{read_dataset, Dataset, DatasetStore, MergeSummary, Snapshot, StoreError};
