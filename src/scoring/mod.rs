pub mod angles;
pub mod legacy;
pub mod profile;

use std::path::Path;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::HospitalInput;
use crate::store::{EngineStore, LogAndContinue};
use angles::{evaluate_sales_angles, AngleCriteria, AngleOutcome, MatchTarget};
use legacy::{evaluate_legacy, LegacyCriteria};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductGrade {
    S,
    A,
    B,
    C,
    Exclude,
}

impl ProductGrade {
    pub fn from_score(score: u32) -> Self {
        match score {
            75.. => Self::S,
            55..=74 => Self::A,
            35..=54 => Self::B,
            _ => Self::C,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S => "S",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::Exclude => "EXCLUDE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "S" => Some(Self::S),
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "EXCLUDE" => Some(Self::Exclude),
            _ => None,
        }
    }
}

/// Score of one sales angle, or one legacy factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleScore {
    pub angle_id: String,
    pub name: String,
    pub weight: f64,
    pub score: u32,
    pub matched_points: u32,
    pub total_points: u32,
    pub matched_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEvaluation {
    pub angle_scores: Vec<AngleScore>,
    pub total_score: u32,
    pub grade: ProductGrade,
    pub top_pitch_points: Vec<String>,
    pub exclusion_reason: Option<String>,
}

impl ProductEvaluation {
    pub fn excluded(reason: String) -> Self {
        Self {
            angle_scores: Vec::new(),
            total_score: 0,
            grade: ProductGrade::Exclude,
            top_pitch_points: Vec::new(),
            exclusion_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMatchScore {
    pub hospital_id: i64,
    pub product_id: String,
    pub angle_scores: Vec<AngleScore>,
    pub total_score: u32,
    pub grade: ProductGrade,
    pub top_pitch_points: Vec<String>,
    pub exclusion_reason: Option<String>,
    pub criteria_version: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringChangeHistory {
    pub hospital_id: i64,
    pub product_id: String,
    pub old_grade: Option<ProductGrade>,
    pub new_grade: ProductGrade,
    pub new_score: u32,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoringCriteria {
    Legacy(LegacyCriteria),
    Angles(AngleCriteria),
}

impl ScoringCriteria {
    /// Pick the variant from the object's shape and validate it.
    pub fn from_value(product: &str, value: Value) -> EngineResult<Self> {
        let Some(obj) = value.as_object() else {
            return Err(EngineError::UnknownCriteriaShape(product.to_string()));
        };
        let malformed = |source| EngineError::MalformedCriteria {
            product: product.to_string(),
            source,
        };

        if obj.contains_key("sales_angles") {
            let criteria: AngleCriteria = serde_json::from_value(value).map_err(malformed)?;
            criteria.validate(product)?;
            Ok(Self::Angles(criteria))
        } else if ["need", "fit", "timing"].iter().any(|k| obj.contains_key(*k)) {
            let criteria: LegacyCriteria = serde_json::from_value(value).map_err(malformed)?;
            criteria.validate(product)?;
            Ok(Self::Legacy(criteria))
        } else {
            Err(EngineError::UnknownCriteriaShape(product.to_string()))
        }
    }

    /// Load `<product_id>.json`; the file stem is the product id.
    pub fn load(path: &Path) -> EngineResult<(String, Self)> {
        let product = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| EngineError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        let criteria = Self::from_value(&product, value)?;
        Ok((product, criteria))
    }

    pub fn version(&self) -> &'static str {
        match self {
            Self::Legacy(_) => "v3.0",
            Self::Angles(_) => "v3.1",
        }
    }

    pub fn evaluate(&self, target: &MatchTarget, input: &HospitalInput, current_year: i32) -> ProductEvaluation {
        match self {
            Self::Angles(criteria) => match evaluate_sales_angles(criteria, target) {
                AngleOutcome::Scored(eval) => eval,
                AngleOutcome::Excluded { reason } => ProductEvaluation::excluded(reason),
            },
            Self::Legacy(criteria) => evaluate_legacy(criteria, target, input, current_year),
        }
    }
}

pub fn score_product(
    product_id: &str,
    criteria: &ScoringCriteria,
    target: &MatchTarget,
    input: &HospitalInput,
    now: DateTime<Utc>,
) -> ProductMatchScore {
    use chrono::Datelike;

    let eval = criteria.evaluate(target, input, now.year());
    ProductMatchScore {
        hospital_id: input.hospital_id,
        product_id: product_id.to_string(),
        angle_scores: eval.angle_scores,
        total_score: eval.total_score,
        grade: eval.grade,
        top_pitch_points: eval.top_pitch_points,
        exclusion_reason: eval.exclusion_reason,
        criteria_version: criteria.version().to_string(),
        scored_at: now,
    }
}

/// `"C → A | 브릿지 케어 40/70 [울쎄라, 리프팅]; 남성 고객 10/10 [남성 피부관리]"`
pub fn grade_change_reason(old: Option<ProductGrade>, score: &ProductMatchScore) -> String {
    let transition = format!(
        "{} → {}",
        old.map_or("NONE", |g| g.as_str()),
        score.grade.as_str()
    );
    if let Some(reason) = &score.exclusion_reason {
        return format!("{} | excluded: {}", transition, reason);
    }
    let angles = score
        .angle_scores
        .iter()
        .map(|a| {
            format!(
                "{} {}/{} [{}]",
                a.name,
                a.matched_points,
                a.total_points,
                a.matched_keywords.join(", ")
            )
        })
        .join("; ");
    format!("{} | {}", transition, angles)
}

/// Upsert the score and append a history row when the grade moved. The first
/// scoring of a pair counts as a move from no grade.
///
/// Returns the history row that was produced, written or not.
pub fn record_product_score(store: &dyn EngineStore, score: &ProductMatchScore) -> Option<ScoringChangeHistory> {
    let previous = match store.product_grade(score.hospital_id, &score.product_id) {
        Ok(previous) => previous,
        Err(e) => {
            warn!(
                hospital_id = score.hospital_id,
                product_id = %score.product_id,
                error = %format!("{e:#}"),
                "stored grade unavailable, skipping grade history"
            );
            store
                .upsert_product_score(score)
                .log_and_continue("saving product score");
            return None;
        }
    };

    store
        .upsert_product_score(score)
        .log_and_continue("saving product score");

    if previous == Some(score.grade) {
        return None;
    }

    let change = ScoringChangeHistory {
        hospital_id: score.hospital_id,
        product_id: score.product_id.clone(),
        old_grade: previous,
        new_grade: score.grade,
        new_score: score.total_score,
        reason: grade_change_reason(previous, score),
        changed_at: score.scored_at,
    };
    info!(
        hospital_id = score.hospital_id,
        product_id = %score.product_id,
        old = previous.map_or("NONE", |g| g.as_str()),
        new = score.grade.as_str(),
        "grade changed"
    );
    store
        .insert_grade_change(&change)
        .log_and_continue("saving grade history");
    Some(change)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::model::{Equipment, Treatment};
    use crate::store::testing::MemoryStore;

    fn input(equipment: &[&str], treatments: &[&str]) -> HospitalInput {
        HospitalInput {
            hospital_id: 11,
            equipment: equipment.iter().map(|n| Equipment::named(n, "")).collect(),
            treatments: treatments.iter().map(|n| Treatment::named(n)).collect(),
            raw_text: String::new(),
            ocr_text: None,
            doctor_count: Some(2),
            opened_year: Some(2022),
            marketing_score: None,
            crawl_tier: 1,
        }
    }

    fn angle_criteria() -> ScoringCriteria {
        ScoringCriteria::from_value(
            "torr",
            json!({
                "sales_angles": [
                    {"id": "bridge_care", "name": "브릿지 케어", "weight": 0.6, "keywords": [
                        {"term": "울쎄라", "tier": "primary", "point": 30},
                        {"term": "써마지", "tier": "primary", "point": 30},
                        "리프팅"
                    ]},
                    {"id": "men", "name": "남성 고객", "weight": 0.4, "keywords": ["남성 피부관리"]}
                ]
            }),
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(ProductGrade::from_score(75), ProductGrade::S);
        assert_eq!(ProductGrade::from_score(74), ProductGrade::A);
        assert_eq!(ProductGrade::from_score(55), ProductGrade::A);
        assert_eq!(ProductGrade::from_score(35), ProductGrade::B);
        assert_eq!(ProductGrade::from_score(34), ProductGrade::C);
    }

    #[test]
    fn shape_detection() {
        assert!(matches!(angle_criteria(), ScoringCriteria::Angles(_)));
        let legacy = ScoringCriteria::from_value(
            "old",
            json!({"need": {"weight": 1.0, "rules": []}}),
        )
        .unwrap();
        assert!(matches!(legacy, ScoringCriteria::Legacy(_)));
        assert!(matches!(
            ScoringCriteria::from_value("x", json!({"angles": []})),
            Err(EngineError::UnknownCriteriaShape(_))
        ));
        assert!(matches!(
            ScoringCriteria::from_value("x", json!({"sales_angles": "nope"})),
            Err(EngineError::MalformedCriteria { .. })
        ));
    }

    #[test]
    fn first_score_then_rescore_is_idempotent() {
        let store = MemoryStore::default();
        let criteria = angle_criteria();
        let hospital = input(&["울쎄라", "써마지"], &["리프팅", "남성피부관리"]);
        let dict = crate::dictionary::Dictionary::builtin();
        let target = MatchTarget::from_input(&hospital, &dict);

        let first = score_product("torr", &criteria, &target, &hospital, now());
        let history = record_product_score(&store, &first).unwrap();
        assert_eq!(history.old_grade, None);
        assert_eq!(history.new_grade, ProductGrade::S);

        let again = score_product("torr", &criteria, &target, &hospital, now());
        assert_eq!(first, again);
        assert!(record_product_score(&store, &again).is_none());
        assert_eq!(store.history.borrow().len(), 1);
    }

    #[test]
    fn grade_drop_is_explained() {
        let store = MemoryStore::default();
        let criteria = angle_criteria();
        let dict = crate::dictionary::Dictionary::builtin();

        let full = input(&["울쎄라", "써마지"], &["리프팅", "남성피부관리"]);
        let s = score_product("torr", &criteria, &MatchTarget::from_input(&full, &dict), &full, now());
        record_product_score(&store, &s);

        let less = input(&["울쎄라"], &["리프팅", "남성피부관리"]);
        let a = score_product("torr", &criteria, &MatchTarget::from_input(&less, &dict), &less, now());
        assert_eq!(a.grade, ProductGrade::A);
        let change = record_product_score(&store, &a).unwrap();
        assert_eq!(change.old_grade, Some(ProductGrade::S));
        assert!(change.reason.starts_with("S → A"));
        assert!(change.reason.contains("브릿지 케어 40/70 [울쎄라, 리프팅]"));
        assert!(change.reason.contains("남성 고객 10/10 [남성 피부관리]"));
    }

    #[test]
    fn failing_store_still_reports_history() {
        let store = MemoryStore::failing();
        let hospital = input(&["울쎄라"], &[]);
        let target = MatchTarget::new(&hospital.equipment_names(), &[]);
        let score = score_product("torr", &angle_criteria(), &target, &hospital, now());
        assert!(record_product_score(&store, &score).is_some());
    }
}
