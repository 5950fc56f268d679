use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::dictionary::Dictionary;
use crate::extract::events::date_ranges;
use crate::extract::ParsedPrice;
use crate::store::{EngineStore, LogAndContinue};

pub const NO_CHANGES: &str = "변동 없음";

/// Applied in order after short `M.D~M.D` ranges; ranges before single
/// dates, dates before bare months.
static VOLATILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d{2,4}[./-]\d{1,2}[./-]\d{1,2}\s*[~\-–]\s*(?:\d{2,4}[./-])?\d{1,2}[./-]\d{1,2}",
        r"\d{1,2}\s*월\s*\d{1,2}\s*일\s*[~\-–]\s*(?:\d{1,2}\s*월\s*)?\d{1,2}\s*일",
        r"\d{4}[./-]\d{1,2}[./-]\d{1,2}",
        r"\d{4}\s*년\s*\d{1,2}\s*월(?:\s*\d{1,2}\s*일)?",
        r"\d{4}\s*년",
        r"\d{1,2}\s*월\s*\d{1,2}\s*일",
        r"\d{1,2}\s*월",
        r"\d{1,2}\s*일",
        r"마감\s*임박|오늘\s*만|오늘\s*하루|단\s*하루|곧\s*마감|품절\s*임박|조기\s*마감|마지막\s*기회|기간\s*한정|한정\s*수량|이번\s*(?:주|달)\s*만|D-\d+",
        r"선착순\s*\d+\s*(?:명|분|인)|\d+\s*(?:명|분)\s*한정",
        r"\d{1,3}\s*%\s*(?:할인|off|OFF|DC|dc|세일)?",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Removed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADDED" => Some(Self::Added),
            "REMOVED" => Some(Self::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemType {
    Equipment,
    Treatment,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equipment => "EQUIPMENT",
            Self::Treatment => "TREATMENT",
        }
    }
}

/// One added or removed item between two crawls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentChange {
    pub hospital_id: i64,
    pub change_type: ChangeType,
    pub item_type: ItemType,
    pub item_name: String,
    pub standard_name: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub prev_snapshot_id: Option<i64>,
    pub current_snapshot_id: Option<i64>,
}

/// Event price kept verbatim so promotions can be charted over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPriceSnapshot {
    pub treatment_name: String,
    pub standard_name: Option<String>,
    pub total_price: u64,
    pub unit_price: Option<f64>,
    pub label: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub discount: Option<u8>,
}

impl EventPriceSnapshot {
    fn from_price(p: &ParsedPrice) -> Self {
        let ctx = p.event_context.as_ref();
        Self {
            treatment_name: p.treatment_name.clone(),
            standard_name: p.standard_name.clone(),
            total_price: p.total_price,
            unit_price: p.unit_price,
            label: ctx.and_then(|c| c.label.clone()),
            start_date: ctx.and_then(|c| c.start_date),
            end_date: ctx.and_then(|c| c.end_date),
            discount: ctx.and_then(|c| c.conditions.discount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSnapshot {
    pub id: Option<i64>,
    pub hospital_id: i64,
    pub crawled_at: DateTime<Utc>,
    pub tier: u8,
    pub text_hash: String,
    pub stripped_hash: String,
    pub equipment: Vec<String>,
    pub treatments: Vec<String>,
    pub pricing: Vec<ParsedPrice>,
    pub event_pricing: Vec<EventPriceSnapshot>,
    pub diff_summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added_equipment: Vec<String>,
    pub removed_equipment: Vec<String>,
    pub added_treatments: Vec<String>,
    pub removed_treatments: Vec<String>,
}

impl SnapshotDiff {
    pub fn between(
        prev_equipment: &[String],
        prev_treatments: &[String],
        equipment: &[String],
        treatments: &[String],
    ) -> Self {
        let (added_equipment, removed_equipment) = diff_names(prev_equipment, equipment);
        let (added_treatments, removed_treatments) = diff_names(prev_treatments, treatments);
        Self {
            added_equipment,
            removed_equipment,
            added_treatments,
            removed_treatments,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_equipment.is_empty()
            && self.removed_equipment.is_empty()
            && self.added_treatments.is_empty()
            && self.removed_treatments.is_empty()
    }

    /// `"장비 추가: X, Y | 시술 제거: Z"`, or `"변동 없음"`.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            ("장비 추가", &self.added_equipment),
            ("장비 제거", &self.removed_equipment),
            ("시술 추가", &self.added_treatments),
            ("시술 제거", &self.removed_treatments),
        ]
        .into_iter()
        .filter(|(_, items)| !items.is_empty())
        .map(|(label, items)| format!("{}: {}", label, items.join(", ")))
        .collect();

        if parts.is_empty() {
            NO_CHANGES.to_string()
        } else {
            parts.join(" | ")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDetectionResult {
    pub hospital_id: i64,
    pub is_first_crawl: bool,
    /// Stripped text differs. Drives `should_run_ocr`.
    pub has_text_changed: bool,
    /// Verbatim text differs. Audit only.
    pub has_full_text_changed: bool,
    pub should_run_ocr: bool,
    pub text_hash: String,
    pub stripped_hash: String,
    pub previous: Option<CrawlSnapshot>,
    pub diff: SnapshotDiff,
    pub diff_summary: String,
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Remove volatile tokens and collapse whitespace.
pub fn strip_volatile(text: &str) -> String {
    let mut without_ranges = String::with_capacity(text.len());
    let mut last = 0;
    for range in date_ranges(text) {
        without_ranges.push_str(&text[last..range.span.0]);
        without_ranges.push(' ');
        last = range.span.1;
    }
    without_ranges.push_str(&text[last..]);

    let stripped = VOLATILE_PATTERNS
        .iter()
        .fold(without_ranges, |acc, re| re.replace_all(&acc, " ").into_owned());
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Case-insensitive set difference. Returns `(added, removed)` in input
/// order, each name once.
pub fn diff_names(previous: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let prev_keys: HashSet<String> = previous.iter().map(|n| name_key(n)).collect();
    let cur_keys: HashSet<String> = current.iter().map(|n| name_key(n)).collect();

    let pick = |names: &[String], other: &HashSet<String>| -> Vec<String> {
        names
            .iter()
            .filter(|n| !n.trim().is_empty() && !other.contains(&name_key(n)))
            .unique_by(|n| name_key(n))
            .map(|n| n.trim().to_string())
            .collect()
    };

    (pick(current, &prev_keys), pick(previous, &cur_keys))
}

pub struct ChangeDetector<'a> {
    dict: &'a Dictionary,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(dict: &'a Dictionary) -> Self {
        Self { dict }
    }

    /// Compare the current crawl with the hospital's latest snapshot.
    ///
    /// A missing snapshot is the first-crawl case, not an error. A failing
    /// read is an error.
    pub fn detect_changes(
        &self,
        store: &dyn EngineStore,
        hospital_id: i64,
        current_text: &str,
        current_ocr_text: Option<&str>,
        current_equipment: &[String],
        current_treatments: &[String],
    ) -> Result<ChangeDetectionResult> {
        let full_text = match current_ocr_text {
            Some(ocr) if !ocr.trim().is_empty() => format!("{}\n{}", current_text, ocr),
            _ => current_text.to_string(),
        };
        let text_hash = sha256_hex(&full_text);
        let stripped_hash = sha256_hex(&strip_volatile(&full_text));

        let previous = store
            .latest_snapshot(hospital_id)
            .with_context(|| format!("loading latest snapshot for hospital {}", hospital_id))?;

        let empty: &[String] = &[];
        let (prev_equipment, prev_treatments) = match &previous {
            Some(p) => (p.equipment.as_slice(), p.treatments.as_slice()),
            None => (empty, empty),
        };
        let diff = SnapshotDiff::between(
            prev_equipment,
            prev_treatments,
            current_equipment,
            current_treatments,
        );
        let diff_summary = diff.summary();

        let result = match &previous {
            None => ChangeDetectionResult {
                hospital_id,
                is_first_crawl: true,
                has_text_changed: true,
                has_full_text_changed: true,
                should_run_ocr: true,
                text_hash,
                stripped_hash,
                previous: None,
                diff,
                diff_summary,
            },
            Some(prev) => {
                let has_text_changed = prev.stripped_hash != stripped_hash;
                let has_full_text_changed = prev.text_hash != text_hash;
                ChangeDetectionResult {
                    hospital_id,
                    is_first_crawl: false,
                    has_text_changed,
                    has_full_text_changed,
                    should_run_ocr: has_text_changed,
                    text_hash,
                    stripped_hash,
                    previous: previous.clone(),
                    diff,
                    diff_summary,
                }
            }
        };

        debug!(
            hospital_id,
            first = result.is_first_crawl,
            text_changed = result.has_text_changed,
            full_text_changed = result.has_full_text_changed,
            "change detection"
        );
        Ok(result)
    }

    /// One row per added or removed item, persisted best-effort. The rows are
    /// returned whether or not the write succeeded.
    #[allow(clippy::too_many_arguments)]
    pub fn detect_equipment_changes(
        &self,
        store: &dyn EngineStore,
        hospital_id: i64,
        previous: Option<&CrawlSnapshot>,
        current_snapshot_id: Option<i64>,
        current_equipment: &[String],
        current_treatments: &[String],
        detected_at: DateTime<Utc>,
    ) -> Vec<EquipmentChange> {
        let empty: &[String] = &[];
        let diff = match previous {
            Some(p) => SnapshotDiff::between(
                &p.equipment,
                &p.treatments,
                current_equipment,
                current_treatments,
            ),
            None => SnapshotDiff::between(empty, empty, current_equipment, current_treatments),
        };
        let prev_snapshot_id = previous.and_then(|p| p.id);

        let make = |change_type: ChangeType, item_type: ItemType, name: &String| {
            let standard_name = match item_type {
                ItemType::Equipment => self.dict.lookup_equipment(name).map(|e| e.standard_name.clone()),
                ItemType::Treatment => self.dict.lookup_treatment(name).map(|t| t.standard_name.clone()),
            };
            EquipmentChange {
                hospital_id,
                change_type,
                item_type,
                item_name: name.clone(),
                standard_name,
                detected_at,
                prev_snapshot_id,
                current_snapshot_id,
            }
        };

        let changes: Vec<EquipmentChange> = diff
            .added_equipment
            .iter()
            .map(|n| make(ChangeType::Added, ItemType::Equipment, n))
            .chain(diff.removed_equipment.iter().map(|n| make(ChangeType::Removed, ItemType::Equipment, n)))
            .chain(diff.added_treatments.iter().map(|n| make(ChangeType::Added, ItemType::Treatment, n)))
            .chain(diff.removed_treatments.iter().map(|n| make(ChangeType::Removed, ItemType::Treatment, n)))
            .collect();

        if !changes.is_empty() {
            store
                .insert_equipment_changes(&changes)
                .log_and_continue("saving equipment changes");
        }
        changes
    }

    /// Assemble the snapshot record for the current crawl.
    pub fn build_snapshot(
        &self,
        detection: &ChangeDetectionResult,
        tier: u8,
        equipment: &[String],
        treatments: &[String],
        pricing: Vec<ParsedPrice>,
        crawled_at: DateTime<Utc>,
    ) -> CrawlSnapshot {
        let event_pricing = pricing
            .iter()
            .filter(|p| p.is_event_price)
            .map(EventPriceSnapshot::from_price)
            .collect();
        CrawlSnapshot {
            id: None,
            hospital_id: detection.hospital_id,
            crawled_at,
            tier,
            text_hash: detection.text_hash.clone(),
            stripped_hash: detection.stripped_hash.clone(),
            equipment: equipment.to_vec(),
            treatments: treatments.to_vec(),
            pricing,
            event_pricing,
            diff_summary: detection.diff_summary.clone(),
        }
    }

    /// Persist the snapshot and record its id. The only write this component
    /// makes that is not best-effort.
    pub fn save_snapshot(&self, store: &dyn EngineStore, snapshot: &mut CrawlSnapshot) -> Result<i64> {
        let id = store
            .insert_snapshot(snapshot)
            .with_context(|| format!("saving snapshot for hospital {}", snapshot.hospital_id))?;
        snapshot.id = Some(id);
        info!(
            hospital_id = snapshot.hospital_id,
            snapshot_id = id,
            diff = %snapshot.diff_summary,
            "snapshot saved"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dates_only_change_keeps_stripped_hash() {
        let feb = "2026년 2월 울쎄라 이벤트 300샷 150만원 (2/1~2/28)";
        let mar = "2026년 3월 울쎄라 이벤트 300샷 150만원 (3/1~3/31)";
        assert_eq!(sha256_hex(&strip_volatile(feb)), sha256_hex(&strip_volatile(mar)));
        assert_ne!(sha256_hex(feb), sha256_hex(mar));
    }

    #[test]
    fn urgency_and_discount_are_volatile() {
        let a = strip_volatile("써마지 마감 임박! 선착순 10명 30% 할인");
        let b = strip_volatile("써마지 오늘만 20%할인");
        assert_eq!(a, "써마지 !");
        assert_eq!(b, "써마지");
    }

    #[test]
    fn price_change_is_not_volatile() {
        assert_ne!(
            strip_volatile("울쎄라 300샷 150만원"),
            strip_volatile("울쎄라 300샷 130만원")
        );
    }

    #[test]
    fn decimal_price_range_is_not_a_date() {
        let a = strip_volatile("리쥬란 1.5~2.5만원");
        let b = strip_volatile("리쥬란 3.5~4.5만원");
        assert_eq!(a, "리쥬란 1.5~2.5만원");
        assert_ne!(a, b);
        assert_eq!(strip_volatile("리쥬란 3.1~3.15 한정"), "리쥬란 한정");
    }

    #[test]
    fn ocr_text_feeds_both_hashes() {
        let dict = Dictionary::builtin();
        let detector = ChangeDetector::new(&dict);
        let store = crate::store::testing::MemoryStore::default();
        let now = Utc::now();
        let page = "울쎄라 300샷 150만원";

        let first = detector
            .detect_changes(&store, 7, page, Some("리쥬란 20만원"), &[], &[])
            .unwrap();
        let without_ocr = detector.detect_changes(&store, 7, page, None, &[], &[]).unwrap();
        assert_ne!(first.text_hash, without_ocr.text_hash);
        assert_ne!(first.stripped_hash, without_ocr.stripped_hash);

        let mut snapshot = detector.build_snapshot(&first, 1, &[], &[], Vec::new(), now);
        detector.save_snapshot(&store, &mut snapshot).unwrap();

        let same = detector
            .detect_changes(&store, 7, page, Some("리쥬란 20만원"), &[], &[])
            .unwrap();
        assert!(!same.should_run_ocr);

        let repriced = detector
            .detect_changes(&store, 7, page, Some("리쥬란 25만원"), &[], &[])
            .unwrap();
        assert!(repriced.has_text_changed);
        assert!(repriced.should_run_ocr);
    }

    #[test]
    fn diff_is_case_insensitive() {
        let (added, removed) = diff_names(
            &names(&["Ulthera", "써마지"]),
            &names(&["ulthera", "인모드", "인모드"]),
        );
        assert_eq!(added, names(&["인모드"]));
        assert_eq!(removed, names(&["써마지"]));
    }

    #[test]
    fn summary_format() {
        let diff = SnapshotDiff::between(
            &names(&["써마지"]),
            &names(&["보톡스"]),
            &names(&["써마지", "울쎄라", "인모드"]),
            &[],
        );
        assert_eq!(diff.summary(), "장비 추가: 울쎄라, 인모드 | 시술 제거: 보톡스");
        assert_eq!(SnapshotDiff::default().summary(), NO_CHANGES);
    }
}
