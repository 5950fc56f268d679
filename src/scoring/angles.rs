use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;
use crate::error::{EngineError, EngineResult};
use crate::model::{compact_lower, HospitalInput};

use super::{AngleScore, ProductEvaluation, ProductGrade};

const DEFAULT_KEYWORD_POINT: u32 = 10;
const DEFAULT_MAX_PITCH_POINTS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordTier {
    Primary,
    #[default]
    Secondary,
    Tertiary,
}

fn default_point() -> u32 {
    DEFAULT_KEYWORD_POINT
}

fn default_max_pitch_points() -> usize {
    DEFAULT_MAX_PITCH_POINTS
}

/// Either `"리프팅"` or `{"term": "리프팅", "tier": "primary", "point": 30}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AngleKeyword {
    Weighted {
        term: String,
        #[serde(default)]
        tier: KeywordTier,
        #[serde(default = "default_point")]
        point: u32,
    },
    Bare(String),
}

impl AngleKeyword {
    pub fn term(&self) -> &str {
        match self {
            Self::Weighted { term, .. } => term,
            Self::Bare(term) => term,
        }
    }

    pub fn tier(&self) -> KeywordTier {
        match self {
            Self::Weighted { tier, .. } => *tier,
            Self::Bare(_) => KeywordTier::Secondary,
        }
    }

    pub fn point(&self) -> u32 {
        match self {
            Self::Weighted { point, .. } => *point,
            Self::Bare(_) => DEFAULT_KEYWORD_POINT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesAngle {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub keywords: Vec<AngleKeyword>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExcludeIf {
    #[serde(default)]
    pub owns_equipment: Vec<String>,
    #[serde(default)]
    pub offers_treatment: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleCriteria {
    pub sales_angles: Vec<SalesAngle>,
    #[serde(default = "default_max_pitch_points")]
    pub max_pitch_points: usize,
    #[serde(default)]
    pub exclude_if: ExcludeIf,
}

impl AngleCriteria {
    pub fn validate(&self, product: &str) -> EngineResult<()> {
        if self.sales_angles.is_empty() {
            return Err(EngineError::NoSalesAngles(product.to_string()));
        }
        for angle in &self.sales_angles {
            if !angle.weight.is_finite() || angle.weight <= 0.0 {
                return Err(EngineError::InvalidAngleWeight {
                    angle: angle.id.clone(),
                    weight: angle.weight,
                });
            }
        }
        Ok(())
    }
}

/// The hospital side of a match, normalized once per hospital.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchTarget {
    equipment: Vec<String>,
    treatments: Vec<String>,
    combined: String,
}

impl MatchTarget {
    pub fn new(equipment: &[String], treatments: &[String]) -> Self {
        let normalize = |names: &[String]| -> Vec<String> {
            names
                .iter()
                .map(|n| compact_lower(n))
                .filter(|n| !n.is_empty())
                .collect()
        };
        let equipment = normalize(equipment);
        let treatments = normalize(treatments);
        let combined = equipment.iter().chain(&treatments).map(String::as_str).collect();
        Self {
            equipment,
            treatments,
            combined,
        }
    }

    /// Raw names plus their dictionary standard names.
    pub fn from_input(input: &HospitalInput, dict: &Dictionary) -> Self {
        let equipment: Vec<String> = input
            .equipment
            .iter()
            .flat_map(|e| {
                let standard = dict.lookup_equipment(&e.name).map(|s| s.standard_name.clone());
                std::iter::once(e.name.clone()).chain(standard)
            })
            .collect();
        let treatments: Vec<String> = input
            .treatments
            .iter()
            .flat_map(|t| {
                let standard = dict.lookup_treatment(&t.name).map(|s| s.standard_name.clone());
                std::iter::once(t.name.clone()).chain(standard)
            })
            .collect();
        Self::new(&equipment, &treatments)
    }

    /// Whitespace- and case-insensitive: the keyword occurs in one item name
    /// or in the concatenation of all of them.
    pub fn contains(&self, keyword: &str) -> bool {
        let k = compact_lower(keyword);
        !k.is_empty()
            && (self.equipment.iter().chain(&self.treatments).any(|n| n.contains(&k))
                || self.combined.contains(&k))
    }

    pub fn owns_equipment(&self, keyword: &str) -> bool {
        let k = compact_lower(keyword);
        !k.is_empty() && self.equipment.iter().any(|n| n.contains(&k))
    }

    pub fn offers_treatment(&self, keyword: &str) -> bool {
        let k = compact_lower(keyword);
        !k.is_empty() && self.treatments.iter().any(|n| n.contains(&k))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AngleOutcome {
    Excluded { reason: String },
    Scored(ProductEvaluation),
}

fn score_angle(angle: &SalesAngle, target: &MatchTarget) -> AngleScore {
    let mut total_points = 0;
    let mut matched_points = 0;
    let mut matched_keywords = Vec::new();
    for kw in &angle.keywords {
        total_points += kw.point();
        if target.contains(kw.term()) {
            matched_points += kw.point();
            matched_keywords.push(kw.term().to_string());
        }
    }
    let score = if total_points == 0 {
        0
    } else {
        (matched_points as f64 / total_points as f64 * 100.0).round() as u32
    };
    AngleScore {
        angle_id: angle.id.clone(),
        name: angle.name.clone(),
        weight: angle.weight,
        score,
        matched_points,
        total_points,
        matched_keywords,
    }
}

fn exclusion(criteria: &AngleCriteria, target: &MatchTarget) -> Option<String> {
    if let Some(kw) = criteria.exclude_if.owns_equipment.iter().find(|k| target.owns_equipment(k)) {
        return Some(format!("already owns equipment matching '{}'", kw));
    }
    criteria
        .exclude_if
        .offers_treatment
        .iter()
        .find(|k| target.offers_treatment(k))
        .map(|kw| format!("already offers treatment matching '{}'", kw))
}

/// Angles with a positive score, best first, ties broken by weight.
pub fn top_pitch_points(scores: &[AngleScore], max: usize) -> Vec<String> {
    let mut ranked: Vec<&AngleScore> = scores.iter().filter(|s| s.score > 0).collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal))
    });
    ranked.into_iter().take(max).map(|s| s.angle_id.clone()).collect()
}

pub fn evaluate_sales_angles(criteria: &AngleCriteria, target: &MatchTarget) -> AngleOutcome {
    if let Some(reason) = exclusion(criteria, target) {
        return AngleOutcome::Excluded { reason };
    }

    let angle_scores: Vec<AngleScore> = criteria
        .sales_angles
        .iter()
        .map(|a| score_angle(a, target))
        .collect();

    let weight_sum: f64 = angle_scores.iter().map(|s| s.weight).sum();
    let total_score = if weight_sum > 0.0 {
        angle_scores
            .iter()
            .map(|s| s.score as f64 * (s.weight / weight_sum))
            .sum::<f64>()
            .round() as u32
    } else {
        0
    };

    AngleOutcome::Scored(ProductEvaluation {
        top_pitch_points: top_pitch_points(&angle_scores, criteria.max_pitch_points),
        grade: ProductGrade::from_score(total_score),
        total_score,
        angle_scores,
        exclusion_reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn kw(term: &str, tier: KeywordTier, point: u32) -> AngleKeyword {
        AngleKeyword::Weighted {
            term: term.to_string(),
            tier,
            point,
        }
    }

    fn criteria() -> AngleCriteria {
        AngleCriteria {
            sales_angles: vec![
                SalesAngle {
                    id: "bridge_care".into(),
                    name: "브릿지 케어".into(),
                    weight: 0.6,
                    keywords: vec![
                        kw("울쎄라", KeywordTier::Primary, 30),
                        kw("써마지", KeywordTier::Primary, 30),
                        kw("리프팅", KeywordTier::Secondary, 10),
                    ],
                },
                SalesAngle {
                    id: "men".into(),
                    name: "남성 고객".into(),
                    weight: 0.4,
                    keywords: vec![AngleKeyword::Bare("남성 피부관리".into())],
                },
            ],
            max_pitch_points: 2,
            exclude_if: ExcludeIf::default(),
        }
    }

    fn scored(outcome: AngleOutcome) -> ProductEvaluation {
        match outcome {
            AngleOutcome::Scored(e) => e,
            AngleOutcome::Excluded { reason } => panic!("unexpected exclusion: {reason}"),
        }
    }

    #[test]
    fn bare_keyword_defaults() {
        let parsed: Vec<AngleKeyword> =
            serde_json::from_str(r#"["리프팅", {"term": "울쎄라", "tier": "primary", "point": 30}]"#).unwrap();
        assert_eq!(parsed[0].tier(), KeywordTier::Secondary);
        assert_eq!(parsed[0].point(), 10);
        assert_eq!(parsed[1].tier(), KeywordTier::Primary);
        assert_eq!(parsed[1].point(), 30);
    }

    #[test]
    fn whitespace_insensitive_both_ways() {
        let target = MatchTarget::new(&[], &names(&["남성피부관리"]));
        assert!(target.contains("남성 피부관리"));
        let target = MatchTarget::new(&[], &names(&["남성 피부 관리"]));
        assert!(target.contains("남성피부관리"));
    }

    #[test]
    fn full_coverage_is_grade_s() {
        let target = MatchTarget::new(&names(&["울쎄라", "써마지 FLX"]), &names(&["리프팅", "남성피부관리"]));
        let eval = scored(evaluate_sales_angles(&criteria(), &target));
        assert_eq!(eval.total_score, 100);
        assert_eq!(eval.grade, ProductGrade::S);
        assert_eq!(eval.top_pitch_points, names(&["bridge_care", "men"]));
    }

    #[test]
    fn losing_primary_equipment_lowers_score() {
        let full = MatchTarget::new(&names(&["울쎄라", "써마지"]), &names(&["리프팅", "남성피부관리"]));
        let less = MatchTarget::new(&names(&["울쎄라"]), &names(&["리프팅", "남성피부관리"]));
        let a = scored(evaluate_sales_angles(&criteria(), &full));
        let b = scored(evaluate_sales_angles(&criteria(), &less));
        assert!(b.angle_scores[0].score < a.angle_scores[0].score);
        assert!(b.total_score < a.total_score);
        // 40/70 -> 57; 57*0.6 + 100*0.4 = 74.2
        assert_eq!(b.total_score, 74);
        assert_eq!(b.grade, ProductGrade::A);
    }

    #[test]
    fn weights_are_renormalized() {
        let mut c = criteria();
        c.sales_angles[0].weight = 3.0;
        c.sales_angles[1].weight = 2.0;
        let target = MatchTarget::new(&[], &names(&["남성피부관리"]));
        let eval = scored(evaluate_sales_angles(&c, &target));
        assert_eq!(eval.total_score, 40);
        assert_eq!(eval.top_pitch_points, names(&["men"]));
    }

    #[test]
    fn exclusion_short_circuits() {
        let mut c = criteria();
        c.exclude_if.owns_equipment = names(&["ulthera"]);
        let target = MatchTarget::new(&names(&["Ulthera Prime"]), &[]);
        assert!(matches!(
            evaluate_sales_angles(&c, &target),
            AngleOutcome::Excluded { .. }
        ));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let target = MatchTarget::new(&names(&["울쎄라"]), &names(&["리프팅"]));
        assert_eq!(
            evaluate_sales_angles(&criteria(), &target),
            evaluate_sales_angles(&criteria(), &target)
        );
    }

    #[test]
    fn invalid_weight_rejected() {
        let mut c = criteria();
        c.sales_angles[1].weight = 0.0;
        assert!(matches!(
            c.validate("torr"),
            Err(EngineError::InvalidAngleWeight { .. })
        ));
        c.sales_angles.clear();
        assert!(matches!(c.validate("torr"), Err(EngineError::NoSalesAngles(_))));
    }
}
