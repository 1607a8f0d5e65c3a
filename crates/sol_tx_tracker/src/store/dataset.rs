//! Durable, deduplicated dataset of transaction records plus the fetch cursor.
//!
//! Records and cursor live in one JSON file that is only ever replaced whole: the new
//! contents go to a sibling temp file, are fsynced, and renamed over the old file. A
//! crash therefore leaves either the previous or the next state on disk.

use crate::record::TransactionRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

const FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt dataset {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Records in slot order, their signature index, and the next slot to fetch.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    cursor: u64,
    records: Vec<TransactionRecord>,
    signatures: HashSet<String>,
}

impl Dataset {
    pub fn empty(cursor: u64) -> Self {
        Self {
            cursor,
            ..Default::default()
        }
    }

    /// Build from rows, keeping the first occurrence of each signature.
    pub fn from_records(cursor: u64, rows: Vec<TransactionRecord>) -> Self {
        let mut dataset = Self::empty(cursor);
        dataset.absorb(rows);
        dataset
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.signatures.contains(signature)
    }

    /// Append unseen records and restore slot order. Returns (added, duplicates).
    fn absorb(&mut self, rows: Vec<TransactionRecord>) -> (usize, usize) {
        let mut added = 0;
        let mut duplicates = 0;
        for row in rows {
            if self.signatures.insert(row.signature.clone()) {
                self.records.push(row);
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        if added > 0 && !self.records.windows(2).all(|w| w[0].slot <= w[1].slot) {
            self.records.sort_by_key(|r| r.slot);
        }
        (added, duplicates)
    }
}

#[derive(Serialize)]
struct DatasetFileRef<'a> {
    version: u32,
    cursor: u64,
    records: &'a [TransactionRecord],
}

#[derive(Deserialize)]
struct DatasetFile {
    version: u32,
    cursor: u64,
    records: Vec<TransactionRecord>,
}

/// Cheap, immutable view of the dataset at one point in time.
#[derive(Clone, Debug)]
pub struct Snapshot(Arc<Dataset>);

impl Deref for Snapshot {
    type Target = Dataset;

    fn deref(&self) -> &Dataset {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub duplicates: usize,
    pub previous_cursor: u64,
    pub cursor: u64,
    /// False when nothing changed and the file was left untouched.
    pub persisted: bool,
}

pub struct DatasetStore {
    path: PathBuf,
    current: RwLock<Arc<Dataset>>,
    writer: Mutex<()>,
}

impl DatasetStore {
    /// Open the dataset at `path`. A missing file starts an empty dataset at
    /// `start_cursor`; an unreadable or corrupt one is moved aside and likewise
    /// replaced. Never fails on the file's contents or readability.
    pub fn load(path: impl AsRef<Path>, start_cursor: u64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let dataset = match read_dataset(&path) {
            Ok(Some(dataset)) => {
                info!(
                    path = %path.display(),
                    records = dataset.len(),
                    cursor = dataset.cursor(),
                    "dataset loaded"
                );
                dataset
            }
            Ok(None) => {
                info!(
                    path = %path.display(),
                    cursor = start_cursor,
                    "no dataset yet, starting empty"
                );
                Dataset::empty(start_cursor)
            }
            Err(e) => {
                let aside = sibling(&path, "corrupt");
                warn!(
                    path = %path.display(),
                    error = %e,
                    moved_to = %aside.display(),
                    cursor = start_cursor,
                    "dataset unreadable, starting empty"
                );
                if let Err(e) = fs::rename(&path, &aside) {
                    warn!(error = %e, "could not move unreadable dataset aside");
                }
                Dataset::empty(start_cursor)
            }
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(dataset)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state. Never waits on a merge beyond the pointer swap.
    pub fn snapshot(&self) -> Snapshot {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Snapshot(Arc::clone(&current))
    }

    /// Add unseen records and advance the cursor to `max(current, next_cursor)`,
    /// durably and atomically. Readers see the new state only after the write lands.
    pub fn merge(
        &self,
        records: Vec<TransactionRecord>,
        next_cursor: u64,
    ) -> Result<MergeSummary, StoreError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        let base = self.snapshot();
        let mut next = Dataset::clone(&base);
        let (added, duplicates) = next.absorb(records);
        next.cursor = base.cursor.max(next_cursor);
        let mut summary = MergeSummary {
            added,
            duplicates,
            previous_cursor: base.cursor,
            cursor: next.cursor,
            persisted: false,
        };
        if added == 0 && next.cursor == base.cursor {
            debug!(duplicates, "merge is a no-op");
            return Ok(summary);
        }
        write_dataset(&self.path, &next)?;
        self.swap(next)?;
        summary.persisted = true;
        debug!(added, duplicates, cursor = summary.cursor, "merged");
        Ok(summary)
    }

    /// Operator reset: drop every record and rewind the cursor.
    pub fn reset(&self, start_cursor: u64) -> Result<(), StoreError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        let empty = Dataset::empty(start_cursor);
        write_dataset(&self.path, &empty)?;
        self.swap(empty)?;
        info!(cursor = start_cursor, "dataset reset");
        Ok(())
    }

    fn swap(&self, next: Dataset) -> Result<(), StoreError> {
        let mut current = self
            .current
            .write()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        *current = Arc::new(next);
        Ok(())
    }
}

/// Read the dataset file. `Ok(None)` when it does not exist.
pub fn read_dataset(path: &Path) -> Result<Option<Dataset>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let file: DatasetFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if file.version != FILE_VERSION {
        return Err(corrupt(format!("unsupported version {}", file.version)));
    }
    Ok(Some(Dataset::from_records(file.cursor, file.records)))
}

fn write_dataset(path: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let tmp = sibling(path, "tmp");
    let file = File::create(&tmp)?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer(
        &mut out,
        &DatasetFileRef {
            version: FILE_VERSION,
            cursor: dataset.cursor,
            records: &dataset.records,
        },
    )?;
    out.flush()?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    // Persist the rename itself; not all platforms allow opening a directory.
    if let Ok(d) = File::open(&dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
