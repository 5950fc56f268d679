use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::extract::ParsedPrice;
use crate::scoring::profile::HospitalProfile;
use crate::scoring::{ProductGrade, ProductMatchScore, ScoringChangeHistory};
use crate::signals::SalesSignal;
use crate::snapshot::{CrawlSnapshot, EquipmentChange};

/// Reads and writes the engine needs. Rows of different hospitals never
/// overlap, so implementations need no cross-hospital locking.
pub trait EngineStore {
    /// Most recent snapshot by crawl time, if the hospital was crawled before.
    fn latest_snapshot(&self, hospital_id: i64) -> Result<Option<CrawlSnapshot>>;

    fn insert_snapshot(&self, snapshot: &CrawlSnapshot) -> Result<i64>;

    /// Append-only price facts, stamped with the crawl time.
    fn insert_prices(
        &self,
        hospital_id: i64,
        crawled_at: DateTime<Utc>,
        prices: &[ParsedPrice],
    ) -> Result<usize>;

    fn insert_equipment_changes(&self, changes: &[EquipmentChange]) -> Result<usize>;

    fn insert_signals(&self, signals: &[SalesSignal]) -> Result<usize>;

    fn upsert_profile(&self, profile: &HospitalProfile) -> Result<()>;

    fn product_grade(&self, hospital_id: i64, product_id: &str) -> Result<Option<ProductGrade>>;

    fn upsert_product_score(&self, score: &ProductMatchScore) -> Result<()>;

    fn insert_grade_change(&self, change: &ScoringChangeHistory) -> Result<()>;
}

/// Best-effort writes: the failure is logged and the caller keeps going with
/// its in-memory result.
pub trait LogAndContinue<T> {
    fn log_and_continue(self, what: &str) -> Option<T>;
}

impl<T> LogAndContinue<T> for Result<T> {
    fn log_and_continue(self, what: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "{} failed, continuing", what);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_continue_turns_errors_into_none() {
        let ok: Result<u32> = Ok(3);
        assert_eq!(ok.log_and_continue("write"), Some(3));
        let err: Result<u32> = Err(anyhow::anyhow!("disk full"));
        assert_eq!(err.log_and_continue("write"), None);
    }
}

/// In-memory store for unit tests. `failing()` makes every write error out.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use anyhow::{bail, Result};
    use chrono::{DateTime, Utc};

    use super::EngineStore;
    use crate::extract::ParsedPrice;
    use crate::scoring::profile::HospitalProfile;
    use crate::scoring::{ProductGrade, ProductMatchScore, ScoringChangeHistory};
    use crate::signals::SalesSignal;
    use crate::snapshot::{CrawlSnapshot, EquipmentChange};

    #[derive(Default)]
    pub struct MemoryStore {
        pub fail_writes: bool,
        pub snapshots: RefCell<Vec<CrawlSnapshot>>,
        pub changes: RefCell<Vec<EquipmentChange>>,
        pub signals: RefCell<Vec<SalesSignal>>,
        pub profiles: RefCell<Vec<HospitalProfile>>,
        pub scores: RefCell<HashMap<(i64, String), ProductMatchScore>>,
        pub history: RefCell<Vec<ScoringChangeHistory>>,
    }

    impl MemoryStore {
        pub fn failing() -> Self {
            Self {
                fail_writes: true,
                ..Default::default()
            }
        }

        fn check(&self) -> Result<()> {
            if self.fail_writes {
                bail!("store is read-only");
            }
            Ok(())
        }
    }

    impl EngineStore for MemoryStore {
        fn latest_snapshot(&self, hospital_id: i64) -> Result<Option<CrawlSnapshot>> {
            Ok(self
                .snapshots
                .borrow()
                .iter()
                .filter(|s| s.hospital_id == hospital_id)
                .max_by_key(|s| (s.crawled_at, s.id))
                .cloned())
        }

        fn insert_snapshot(&self, snapshot: &CrawlSnapshot) -> Result<i64> {
            self.check()?;
            let mut all = self.snapshots.borrow_mut();
            let id = all.len() as i64 + 1;
            let mut stored = snapshot.clone();
            stored.id = Some(id);
            all.push(stored);
            Ok(id)
        }

        fn insert_prices(&self, _: i64, _: DateTime<Utc>, prices: &[ParsedPrice]) -> Result<usize> {
            self.check()?;
            Ok(prices.len())
        }

        fn insert_equipment_changes(&self, changes: &[EquipmentChange]) -> Result<usize> {
            self.check()?;
            self.changes.borrow_mut().extend_from_slice(changes);
            Ok(changes.len())
        }

        fn insert_signals(&self, signals: &[SalesSignal]) -> Result<usize> {
            self.check()?;
            self.signals.borrow_mut().extend_from_slice(signals);
            Ok(signals.len())
        }

        fn upsert_profile(&self, profile: &HospitalProfile) -> Result<()> {
            self.check()?;
            let mut all = self.profiles.borrow_mut();
            all.retain(|p| p.hospital_id != profile.hospital_id);
            all.push(profile.clone());
            Ok(())
        }

        fn product_grade(&self, hospital_id: i64, product_id: &str) -> Result<Option<ProductGrade>> {
            Ok(self
                .scores
                .borrow()
                .get(&(hospital_id, product_id.to_string()))
                .map(|s| s.grade))
        }

        fn upsert_product_score(&self, score: &ProductMatchScore) -> Result<()> {
            self.check()?;
            self.scores
                .borrow_mut()
                .insert((score.hospital_id, score.product_id.clone()), score.clone());
            Ok(())
        }

        fn insert_grade_change(&self, change: &ScoringChangeHistory) -> Result<()> {
            self.check()?;
            self.history.borrow_mut().push(change.clone());
            Ok(())
        }
    }
}
