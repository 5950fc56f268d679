use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::extract::ParsedPrice;
use crate::scoring::profile::HospitalProfile;
use crate::scoring::{ProductGrade, ProductMatchScore, ScoringChangeHistory};
use crate::signals::SalesSignal;
use crate::snapshot::{CrawlSnapshot, EquipmentChange};
use crate::store::EngineStore;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS crawl_snapshots (
                id             INTEGER PRIMARY KEY,
                hospital_id    INTEGER NOT NULL,
                crawled_at     TEXT NOT NULL,
                tier           INTEGER NOT NULL,
                text_hash      TEXT NOT NULL,
                stripped_hash  TEXT NOT NULL,
                equipment      TEXT NOT NULL,
                treatments     TEXT NOT NULL,
                pricing        TEXT NOT NULL,
                event_pricing  TEXT NOT NULL,
                diff_summary   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_hospital ON crawl_snapshots(hospital_id, crawled_at);

            CREATE TABLE IF NOT EXISTS parsed_prices (
                id             INTEGER PRIMARY KEY,
                hospital_id    INTEGER NOT NULL,
                crawled_at     TEXT NOT NULL,
                treatment_name TEXT NOT NULL,
                standard_name  TEXT,
                raw_text       TEXT NOT NULL,
                quantity       INTEGER,
                unit_type      TEXT NOT NULL,
                total_price    INTEGER NOT NULL CHECK(total_price > 0),
                unit_price     REAL,
                price_band     TEXT NOT NULL CHECK(price_band IN ('PREMIUM','MID','MASS')),
                is_package     BOOLEAN NOT NULL DEFAULT 0,
                is_event_price BOOLEAN NOT NULL DEFAULT 0,
                is_outlier     BOOLEAN NOT NULL DEFAULT 0,
                confidence     TEXT NOT NULL CHECK(confidence IN ('EXACT','CALCULATED','ESTIMATED')),
                event_context  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_prices_hospital ON parsed_prices(hospital_id);
            CREATE INDEX IF NOT EXISTS idx_prices_standard ON parsed_prices(standard_name);

            CREATE TABLE IF NOT EXISTS equipment_changes (
                id                  INTEGER PRIMARY KEY,
                hospital_id         INTEGER NOT NULL,
                change_type         TEXT NOT NULL CHECK(change_type IN ('ADDED','REMOVED')),
                item_type           TEXT NOT NULL CHECK(item_type IN ('EQUIPMENT','TREATMENT')),
                item_name           TEXT NOT NULL,
                standard_name       TEXT,
                detected_at         TEXT NOT NULL,
                prev_snapshot_id    INTEGER,
                current_snapshot_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_changes_hospital ON equipment_changes(hospital_id);

            CREATE TABLE IF NOT EXISTS sales_signals (
                id            INTEGER PRIMARY KEY,
                hospital_id   INTEGER NOT NULL,
                product_id    TEXT NOT NULL,
                rule_id       TEXT NOT NULL,
                signal_type   TEXT NOT NULL,
                priority      TEXT NOT NULL CHECK(priority IN ('HIGH','MEDIUM','LOW')),
                title         TEXT NOT NULL,
                description   TEXT NOT NULL,
                related_angle TEXT,
                status        TEXT NOT NULL DEFAULT 'NEW',
                item_name     TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_hospital ON sales_signals(hospital_id, product_id);

            CREATE TABLE IF NOT EXISTS hospital_profiles (
                hospital_id       INTEGER PRIMARY KEY,
                investment_score  INTEGER NOT NULL,
                portfolio_score   INTEGER NOT NULL,
                scale_trust_score INTEGER NOT NULL,
                marketing_score   INTEGER NOT NULL,
                profile_score     INTEGER NOT NULL,
                grade             TEXT NOT NULL CHECK(grade IN ('PRIME','HIGH','MID','LOW')),
                scored_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS product_match_scores (
                hospital_id      INTEGER NOT NULL,
                product_id       TEXT NOT NULL,
                angle_scores     TEXT NOT NULL,
                total_score      INTEGER NOT NULL,
                grade            TEXT NOT NULL CHECK(grade IN ('S','A','B','C','EXCLUDE')),
                top_pitch_points TEXT NOT NULL,
                exclusion_reason TEXT,
                criteria_version TEXT NOT NULL,
                scored_at        TEXT NOT NULL,
                UNIQUE(hospital_id, product_id)
            );

            CREATE TABLE IF NOT EXISTS scoring_change_history (
                id          INTEGER PRIMARY KEY,
                hospital_id INTEGER NOT NULL,
                product_id  TEXT NOT NULL,
                old_grade   TEXT,
                new_grade   TEXT NOT NULL,
                new_score   INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                changed_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_pair ON scoring_change_history(hospital_id, product_id);
            ",
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |r| r.get(0))?) };
        let mut stmt = self.conn.prepare(
            "SELECT grade, COUNT(*) FROM product_match_scores GROUP BY grade ORDER BY grade",
        )?;
        let grades = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Stats {
            hospitals: count("SELECT COUNT(DISTINCT hospital_id) FROM crawl_snapshots")?,
            snapshots: count("SELECT COUNT(*) FROM crawl_snapshots")?,
            prices: count("SELECT COUNT(*) FROM parsed_prices")?,
            event_prices: count("SELECT COUNT(*) FROM parsed_prices WHERE is_event_price = 1")?,
            changes: count("SELECT COUNT(*) FROM equipment_changes")?,
            signals: count("SELECT COUNT(*) FROM sales_signals")?,
            profiles: count("SELECT COUNT(*) FROM hospital_profiles")?,
            scores: count("SELECT COUNT(*) FROM product_match_scores")?,
            grade_changes: count("SELECT COUNT(*) FROM scoring_change_history")?,
            grades,
        })
    }

    pub fn grade_history(&self, hospital_id: i64, product_id: &str) -> Result<Vec<ScoringChangeHistory>> {
        let mut stmt = self.conn.prepare(
            "SELECT old_grade, new_grade, new_score, reason, changed_at
             FROM scoring_change_history
             WHERE hospital_id = ?1 AND product_id = ?2
             ORDER BY changed_at, id",
        )?;
        let rows = stmt
            .query_map(params![hospital_id, product_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(old, new, new_score, reason, changed_at)| {
                Ok(ScoringChangeHistory {
                    hospital_id,
                    product_id: product_id.to_string(),
                    old_grade: old.as_deref().and_then(ProductGrade::parse),
                    new_grade: ProductGrade::parse(&new)
                        .with_context(|| format!("unknown grade '{}'", new))?,
                    new_score,
                    reason,
                    changed_at: parse_ts(&changed_at)?,
                })
            })
            .collect()
    }

    pub fn signals_for(&self, hospital_id: i64) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT priority, signal_type, title FROM sales_signals
             WHERE hospital_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([hospital_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct Stats {
    pub hospitals: i64,
    pub snapshots: i64,
    pub prices: i64,
    pub event_prices: i64,
    pub changes: i64,
    pub signals: i64,
    pub profiles: i64,
    pub scores: i64,
    pub grade_changes: i64,
    pub grades: Vec<(String, i64)>,
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

impl EngineStore for SqliteStore {
    fn latest_snapshot(&self, hospital_id: i64) -> Result<Option<CrawlSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, crawled_at, tier, text_hash, stripped_hash, equipment, treatments,
                        pricing, event_pricing, diff_summary
                 FROM crawl_snapshots
                 WHERE hospital_id = ?1
                 ORDER BY crawled_at DESC, id DESC
                 LIMIT 1",
                [hospital_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u8>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, crawled_at, tier, text_hash, stripped_hash, equipment, treatments, pricing, event_pricing, diff_summary)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(CrawlSnapshot {
            id: Some(id),
            hospital_id,
            crawled_at: parse_ts(&crawled_at)?,
            tier,
            text_hash,
            stripped_hash,
            equipment: serde_json::from_str(&equipment).context("snapshot equipment column")?,
            treatments: serde_json::from_str(&treatments).context("snapshot treatments column")?,
            pricing: serde_json::from_str(&pricing).context("snapshot pricing column")?,
            event_pricing: serde_json::from_str(&event_pricing)
                .context("snapshot event_pricing column")?,
            diff_summary,
        }))
    }

    fn insert_snapshot(&self, s: &CrawlSnapshot) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO crawl_snapshots
             (hospital_id, crawled_at, tier, text_hash, stripped_hash, equipment, treatments,
              pricing, event_pricing, diff_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                s.hospital_id,
                ts(&s.crawled_at),
                s.tier,
                s.text_hash,
                s.stripped_hash,
                serde_json::to_string(&s.equipment)?,
                serde_json::to_string(&s.treatments)?,
                serde_json::to_string(&s.pricing)?,
                serde_json::to_string(&s.event_pricing)?,
                s.diff_summary,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_prices(&self, hospital_id: i64, crawled_at: DateTime<Utc>, prices: &[ParsedPrice]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO parsed_prices
                 (hospital_id, crawled_at, treatment_name, standard_name, raw_text, quantity,
                  unit_type, total_price, unit_price, price_band, is_package, is_event_price,
                  is_outlier, confidence, event_context)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?;
            let at = ts(&crawled_at);
            for p in prices {
                let event_context = p
                    .event_context
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                count += stmt.execute(params![
                    hospital_id,
                    at,
                    p.treatment_name,
                    p.standard_name,
                    p.raw_text,
                    p.quantity.map(|q| q as i64),
                    p.unit_type.as_str(),
                    p.total_price as i64,
                    p.unit_price,
                    p.price_band.as_str(),
                    p.is_package,
                    p.is_event_price,
                    p.is_outlier,
                    p.confidence.as_str(),
                    event_context,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn insert_equipment_changes(&self, changes: &[EquipmentChange]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO equipment_changes
                 (hospital_id, change_type, item_type, item_name, standard_name, detected_at,
                  prev_snapshot_id, current_snapshot_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in changes {
                count += stmt.execute(params![
                    c.hospital_id,
                    c.change_type.as_str(),
                    c.item_type.as_str(),
                    c.item_name,
                    c.standard_name,
                    ts(&c.detected_at),
                    c.prev_snapshot_id,
                    c.current_snapshot_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn insert_signals(&self, signals: &[SalesSignal]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sales_signals
                 (hospital_id, product_id, rule_id, signal_type, priority, title, description,
                  related_angle, status, item_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for s in signals {
                count += stmt.execute(params![
                    s.hospital_id,
                    s.product_id,
                    s.rule_id,
                    s.signal_type,
                    s.priority.as_str(),
                    s.title,
                    s.description,
                    s.related_angle,
                    s.status.as_str(),
                    s.item_name,
                    ts(&s.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn upsert_profile(&self, p: &HospitalProfile) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hospital_profiles
             (hospital_id, investment_score, portfolio_score, scale_trust_score, marketing_score,
              profile_score, grade, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(hospital_id) DO UPDATE SET
                investment_score = excluded.investment_score,
                portfolio_score = excluded.portfolio_score,
                scale_trust_score = excluded.scale_trust_score,
                marketing_score = excluded.marketing_score,
                profile_score = excluded.profile_score,
                grade = excluded.grade,
                scored_at = excluded.scored_at",
            params![
                p.hospital_id,
                p.investment_score,
                p.portfolio_score,
                p.scale_trust_score,
                p.marketing_score,
                p.profile_score,
                p.grade.as_str(),
                ts(&p.scored_at),
            ],
        )?;
        Ok(())
    }

    fn product_grade(&self, hospital_id: i64, product_id: &str) -> Result<Option<ProductGrade>> {
        let grade: Option<String> = self
            .conn
            .query_row(
                "SELECT grade FROM product_match_scores WHERE hospital_id = ?1 AND product_id = ?2",
                params![hospital_id, product_id],
                |row| row.get(0),
            )
            .optional()?;
        grade
            .map(|g| ProductGrade::parse(&g).with_context(|| format!("unknown grade '{}'", g)))
            .transpose()
    }

    fn upsert_product_score(&self, s: &ProductMatchScore) -> Result<()> {
        self.conn.execute(
            "INSERT INTO product_match_scores
             (hospital_id, product_id, angle_scores, total_score, grade, top_pitch_points,
              exclusion_reason, criteria_version, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(hospital_id, product_id) DO UPDATE SET
                angle_scores = excluded.angle_scores,
                total_score = excluded.total_score,
                grade = excluded.grade,
                top_pitch_points = excluded.top_pitch_points,
                exclusion_reason = excluded.exclusion_reason,
                criteria_version = excluded.criteria_version,
                scored_at = excluded.scored_at",
            params![
                s.hospital_id,
                s.product_id,
                serde_json::to_string(&s.angle_scores)?,
                s.total_score,
                s.grade.as_str(),
                serde_json::to_string(&s.top_pitch_points)?,
                s.exclusion_reason,
                s.criteria_version,
                ts(&s.scored_at),
            ],
        )?;
        Ok(())
    }

    fn insert_grade_change(&self, c: &ScoringChangeHistory) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scoring_change_history
             (hospital_id, product_id, old_grade, new_grade, new_score, reason, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                c.hospital_id,
                c.product_id,
                c.old_grade.map(|g| g.as_str()),
                c.new_grade.as_str(),
                c.new_score,
                c.reason,
                ts(&c.changed_at),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn snapshot(hospital_id: i64, at: DateTime<Utc>, hash: &str) -> CrawlSnapshot {
        CrawlSnapshot {
            id: None,
            hospital_id,
            crawled_at: at,
            tier: 1,
            text_hash: hash.to_string(),
            stripped_hash: hash.to_string(),
            equipment: vec!["울쎄라".to_string()],
            treatments: vec![],
            pricing: vec![],
            event_pricing: vec![],
            diff_summary: "변동 없음".to_string(),
        }
    }

    #[test]
    fn latest_snapshot_by_time_then_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        assert!(store.latest_snapshot(1).unwrap().is_none());

        store.insert_snapshot(&snapshot(1, t0 + Duration::days(1), "b")).unwrap();
        store.insert_snapshot(&snapshot(1, t0, "a")).unwrap();
        store.insert_snapshot(&snapshot(2, t0 + Duration::days(9), "other")).unwrap();
        let latest = store.latest_snapshot(1).unwrap().unwrap();
        assert_eq!(latest.text_hash, "b");
        assert_eq!(latest.equipment, vec!["울쎄라".to_string()]);

        let tie = store.insert_snapshot(&snapshot(1, t0 + Duration::days(1), "c")).unwrap();
        let latest = store.latest_snapshot(1).unwrap().unwrap();
        assert_eq!(latest.id, Some(tie));
    }

    #[test]
    fn product_grade_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut score = ProductMatchScore {
            hospital_id: 4,
            product_id: "torr".to_string(),
            angle_scores: vec![],
            total_score: 80,
            grade: ProductGrade::S,
            top_pitch_points: vec![],
            exclusion_reason: None,
            criteria_version: "v3.1".to_string(),
            scored_at: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
        };
        assert_eq!(store.product_grade(4, "torr").unwrap(), None);
        store.upsert_product_score(&score).unwrap();
        score.grade = ProductGrade::B;
        store.upsert_product_score(&score).unwrap();
        assert_eq!(store.product_grade(4, "torr").unwrap(), Some(ProductGrade::B));
        assert_eq!(store.stats().unwrap().scores, 1);
    }
}
