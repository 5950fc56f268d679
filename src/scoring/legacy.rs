use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::HospitalInput;

use super::angles::MatchTarget;
use super::{AngleScore, ProductEvaluation, ProductGrade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    HasEquipment { keywords: Vec<String> },
    LacksEquipment { keywords: Vec<String> },
    OffersTreatment { keywords: Vec<String> },
    LacksTreatment { keywords: Vec<String> },
    MinEquipmentCount { count: usize },
    MinDoctorCount { count: u32 },
    OpenedWithinYears { years: i32 },
    MinAveragePrice { price: u64 },
}

impl RuleCondition {
    pub fn holds(&self, target: &MatchTarget, input: &HospitalInput, current_year: i32) -> bool {
        match self {
            Self::HasEquipment { keywords } => keywords.iter().any(|k| target.owns_equipment(k)),
            Self::LacksEquipment { keywords } => !keywords.iter().any(|k| target.owns_equipment(k)),
            Self::OffersTreatment { keywords } => keywords.iter().any(|k| target.offers_treatment(k)),
            Self::LacksTreatment { keywords } => !keywords.iter().any(|k| target.offers_treatment(k)),
            Self::MinEquipmentCount { count } => input.equipment.len() >= *count,
            Self::MinDoctorCount { count } => input.doctor_count.is_some_and(|d| d >= *count),
            Self::OpenedWithinYears { years } => input
                .opened_year
                .is_some_and(|y| current_year - y <= *years),
            Self::MinAveragePrice { price } => {
                let prices: Vec<f64> = input
                    .treatments
                    .iter()
                    .filter_map(|t| t.reference_price())
                    .collect();
                !prices.is_empty() && prices.iter().sum::<f64>() / prices.len() as f64 >= *price as f64
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::HasEquipment { keywords } => format!("has_equipment({})", keywords.join("|")),
            Self::LacksEquipment { keywords } => format!("lacks_equipment({})", keywords.join("|")),
            Self::OffersTreatment { keywords } => format!("offers_treatment({})", keywords.join("|")),
            Self::LacksTreatment { keywords } => format!("lacks_treatment({})", keywords.join("|")),
            Self::MinEquipmentCount { count } => format!("equipment>={}", count),
            Self::MinDoctorCount { count } => format!("doctors>={}", count),
            Self::OpenedWithinYears { years } => format!("opened<={}y", years),
            Self::MinAveragePrice { price } => format!("avg_price>={}", price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRule {
    pub label: Option<String>,
    pub condition: RuleCondition,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyFactor {
    pub weight: f64,
    #[serde(default)]
    pub rules: Vec<LegacyRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCriteria {
    pub need: Option<LegacyFactor>,
    pub fit: Option<LegacyFactor>,
    pub timing: Option<LegacyFactor>,
    /// Any condition holding excludes the hospital.
    #[serde(default)]
    pub exclude: Vec<RuleCondition>,
}

impl LegacyCriteria {
    fn factors(&self) -> impl Iterator<Item = (&'static str, &LegacyFactor)> {
        [("need", &self.need), ("fit", &self.fit), ("timing", &self.timing)]
            .into_iter()
            .filter_map(|(id, f)| f.as_ref().map(|f| (id, f)))
    }

    pub fn validate(&self, product: &str) -> EngineResult<()> {
        let mut total = 0.0;
        for (id, factor) in self.factors() {
            if !factor.weight.is_finite() || factor.weight < 0.0 {
                return Err(EngineError::InvalidAngleWeight {
                    angle: id.to_string(),
                    weight: factor.weight,
                });
            }
            total += factor.weight;
        }
        if total <= 0.0 {
            return Err(EngineError::ZeroTotalWeight(product.to_string()));
        }
        Ok(())
    }
}

pub fn evaluate_legacy(
    criteria: &LegacyCriteria,
    target: &MatchTarget,
    input: &HospitalInput,
    current_year: i32,
) -> ProductEvaluation {
    if let Some(cond) = criteria
        .exclude
        .iter()
        .find(|c| c.holds(target, input, current_year))
    {
        return ProductEvaluation::excluded(cond.describe());
    }

    let angle_scores: Vec<AngleScore> = criteria
        .factors()
        .map(|(id, factor)| {
            let total_points: u32 = factor.rules.iter().map(|r| r.points).sum();
            let satisfied: Vec<&LegacyRule> = factor
                .rules
                .iter()
                .filter(|r| r.condition.holds(target, input, current_year))
                .collect();
            let matched_points: u32 = satisfied.iter().map(|r| r.points).sum();
            AngleScore {
                angle_id: id.to_string(),
                name: id.to_string(),
                weight: factor.weight,
                score: matched_points.min(100),
                matched_points,
                total_points,
                matched_keywords: satisfied
                    .iter()
                    .map(|r| r.label.clone().unwrap_or_else(|| r.condition.describe()))
                    .collect(),
            }
        })
        .collect();

    let weight_sum: f64 = angle_scores.iter().map(|s| s.weight).sum();
    let total_score = if weight_sum > 0.0 {
        angle_scores
            .iter()
            .map(|s| s.score as f64 * s.weight / weight_sum)
            .sum::<f64>()
            .round() as u32
    } else {
        0
    };

    ProductEvaluation {
        top_pitch_points: super::angles::top_pitch_points(&angle_scores, 2),
        grade: ProductGrade::from_score(total_score),
        total_score,
        angle_scores,
        exclusion_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{Equipment, Treatment};

    fn criteria() -> LegacyCriteria {
        serde_json::from_value(json!({
            "need": {"weight": 0.5, "rules": [
                {"label": "no RF device", "condition": {"type": "lacks_equipment", "keywords": ["써마지", "인모드"]}, "points": 60},
                {"condition": {"type": "offers_treatment", "keywords": ["리프팅"]}, "points": 40}
            ]},
            "fit": {"weight": 0.3, "rules": [
                {"condition": {"type": "min_doctor_count", "count": 2}, "points": 100}
            ]},
            "timing": {"weight": 0.2, "rules": [
                {"condition": {"type": "opened_within_years", "years": 3}, "points": 100}
            ]},
            "exclude": [{"type": "has_equipment", "keywords": ["온다"]}]
        }))
        .unwrap()
    }

    fn hospital(equipment: &[&str], treatments: &[&str]) -> HospitalInput {
        HospitalInput {
            hospital_id: 3,
            equipment: equipment.iter().map(|n| Equipment::named(n, "")).collect(),
            treatments: treatments.iter().map(|n| Treatment::named(n)).collect(),
            raw_text: String::new(),
            ocr_text: None,
            doctor_count: Some(1),
            opened_year: Some(2024),
            marketing_score: None,
            crawl_tier: 1,
        }
    }

    fn target(h: &HospitalInput) -> MatchTarget {
        MatchTarget::new(&h.equipment_names(), &h.treatment_names())
    }

    #[test]
    fn factors_combine_by_weight() {
        let h = hospital(&["울쎄라"], &["실 리프팅"]);
        let eval = evaluate_legacy(&criteria(), &target(&h), &h, 2026);
        // need 100, fit 0, timing 100 -> 50 + 0 + 20
        assert_eq!(eval.total_score, 70);
        assert_eq!(eval.grade, ProductGrade::A);
        assert_eq!(eval.angle_scores[0].matched_keywords[0], "no RF device");
        assert_eq!(eval.top_pitch_points, vec!["need".to_string(), "timing".to_string()]);
    }

    #[test]
    fn exclusion_yields_exclude_grade() {
        let h = hospital(&["온다"], &[]);
        let eval = evaluate_legacy(&criteria(), &target(&h), &h, 2026);
        assert_eq!(eval.grade, ProductGrade::Exclude);
        assert_eq!(eval.total_score, 0);
    }

    #[test]
    fn zero_weights_rejected() {
        let mut c = criteria();
        for f in [&mut c.need, &mut c.fit, &mut c.timing].into_iter().flatten() {
            f.weight = 0.0;
        }
        assert!(matches!(c.validate("old"), Err(EngineError::ZeroTotalWeight(_))));
    }
}
