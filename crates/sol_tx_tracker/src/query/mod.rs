//! Read-side views over a dataset snapshot. Nothing here is persisted.

mod aggregate;

pub use aggregate::{BatchSummary, DatasetStats, StatusCounts};

use crate::record::TransactionRecord;
use crate::store::Dataset;
use std::collections::BTreeMap;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid time bound {input:?}: expected unix seconds or RFC 3339")]
    TimeBound { input: String },
    #[error("slots_per_batch must be greater than zero")]
    ZeroBatch,
}

/// Accepts `1700000000` or `2023-11-14T22:13:20Z`.
pub fn parse_time_bound(s: &str) -> Result<i64, QueryError> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    OffsetDateTime::parse(s, &Rfc3339)
        .map(OffsetDateTime::unix_timestamp)
        .map_err(|_| QueryError::TimeBound {
            input: s.to_string(),
        })
}

impl Dataset {
    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for r in self.records() {
            counts.add(r.status);
        }
        counts
    }

    pub fn count_by_type(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for r in self.records() {
            *out.entry(r.tx_type.clone()).or_insert(0) += 1;
        }
        out
    }

    /// Records whose block time lies in `[from, to]`. Either bound may be open;
    /// records without a block time never match.
    pub fn in_time_range(&self, from: Option<i64>, to: Option<i64>) -> Vec<&TransactionRecord> {
        self.records()
            .iter()
            .filter(|r| match r.block_time {
                Some(t) => !matches!(from, Some(f) if t < f) && !matches!(to, Some(e) if t > e),
                None => false,
            })
            .collect()
    }

    /// Group records into consecutive slot buckets of `slots_per_batch`, in slot order.
    pub fn batch_summaries(&self, slots_per_batch: u64) -> Result<Vec<BatchSummary>, QueryError> {
        if slots_per_batch == 0 {
            return Err(QueryError::ZeroBatch);
        }
        Ok(aggregate::summarize(self.records(), slots_per_batch))
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            cursor: self.cursor(),
            total: self.len() as u64,
            by_status: self.count_by_status(),
            by_type: self.count_by_type(),
            first_slot: self.records().first().map(|r| r.slot),
            last_slot: self.records().last().map(|r| r.slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxStatus;

    fn rec(
        sig: &str,
        slot: u64,
        time: Option<i64>,
        status: TxStatus,
        ty: &str,
    ) -> TransactionRecord {
        TransactionRecord {
            signature: sig.into(),
            slot,
            block_time: time,
            status,
            tx_type: ty.into(),
            fee: Some(5000),
            accounts: vec![],
        }
    }

    fn sample() -> Dataset {
        Dataset::from_records(
            120,
            vec![
                rec("a", 100, Some(1_000), TxStatus::Success, "vote"),
                rec("b", 101, Some(1_001), TxStatus::Failed, "transfer"),
                rec("c", 105, None, TxStatus::Success, "vote"),
                rec("d", 112, Some(1_010), TxStatus::Success, "transfer"),
            ],
        )
    }

    #[test]
    fn counts() {
        let ds = sample();
        let s = ds.count_by_status();
        assert_eq!((s.success, s.failed, s.total()), (3, 1, 4));
        let t = ds.count_by_type();
        assert_eq!(t["vote"], 2);
        assert_eq!(t["transfer"], 2);
    }

    #[test]
    fn time_range_is_inclusive_and_skips_unknown_times() {
        let ds = sample();
        let sigs = |v: Vec<&TransactionRecord>| {
            v.iter().map(|r| r.signature.clone()).collect::<Vec<_>>()
        };
        assert_eq!(sigs(ds.in_time_range(Some(1_001), Some(1_010))), ["b", "d"]);
        assert_eq!(sigs(ds.in_time_range(None, Some(1_000))), ["a"]);
        assert_eq!(ds.in_time_range(None, None).len(), 3);
    }

    #[test]
    fn time_bounds() {
        assert_eq!(parse_time_bound("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_time_bound("2023-11-14T22:13:20Z").unwrap(), 1_700_000_000);
        assert_eq!(parse_time_bound("2023-11-14T23:13:20+01:00").unwrap(), 1_700_000_000);
        assert!(parse_time_bound("yesterday").is_err());
    }

    #[test]
    fn stats_of_empty_dataset() {
        let s = Dataset::empty(7).stats();
        assert_eq!(s.cursor, 7);
        assert_eq!(s.total, 0);
        assert_eq!(s.first_slot, None);
        assert!(s.by_type.is_empty());
    }

    #[test]
    fn zero_batch_rejected() {
        assert!(matches!(sample().batch_summaries(0), Err(QueryError::ZeroBatch)));
    }
}
