//! Per-cell daily dispatch quota, reset at UTC midnight.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub date: Option<NaiveDate>,
    pub used: BTreeMap<String, u32>,
}

#[derive(Debug)]
pub struct DailyQuota {
    path: PathBuf,
    limit: u32,
    ledger: QuotaLedger,
}

impl DailyQuota {
    pub fn load(path: impl Into<PathBuf>, limit: u32) -> Result<Self, StoreError> {
        let path = path.into();
        let ledger = store::read_json_or_default(&path)?;
        Ok(Self { path, limit, ledger })
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.ledger.date != Some(today) {
            self.ledger = QuotaLedger {
                date: Some(today),
                used: BTreeMap::new(),
            };
        }
    }

    pub fn used(&mut self, cell: &str, now: DateTime<Utc>) -> u32 {
        self.roll(now);
        self.ledger.used.get(cell).copied().unwrap_or(0)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn allow(&mut self, cell: &str, now: DateTime<Utc>) -> bool {
        self.used(cell, now) < self.limit
    }

    pub fn record(&mut self, cell: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.roll(now);
        *self.ledger.used.entry(cell.to_string()).or_insert(0) += 1;
        store::write_json(&self.path, &self.ledger)
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_resets_next_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = DailyQuota::load(dir.path().join("quota.json"), 2).unwrap();
        let day1 = DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z").unwrap().to_utc();
        let day2 = DateTime::parse_from_rfc3339("2025-03-02T00:00:01Z").unwrap().to_utc();

        for _ in 0..2 {
            assert!(q.allow("drone", day1));
            q.record("drone", day1).unwrap();
        }
        assert!(!q.allow("drone", day1));
        assert!(q.allow("scout", day1));
        assert!(q.allow("drone", day2));
        assert_eq!(q.used("drone", day2), 0);
    }

    #[test]
    fn usage_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let now = Utc::now();
        DailyQuota::load(&path, 1).unwrap().record("drone", now).unwrap();
        let mut q = DailyQuota::load(&path, 1).unwrap();
        assert!(!q.allow("drone", now));
    }
}
