use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;
use crate::error::{EngineError, EngineResult};
use crate::model::{Equipment, HospitalInput, Treatment};

/// Equipment categories a full-service clinic is expected to cover.
pub const PORTFOLIO_CATEGORIES: &[&str] = &["HIFU", "RF", "LASER", "IPL", "BODY", "MICRONEEDLE"];

const RECENT_PURCHASE_YEARS: i32 = 2;
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProfileGrade {
    Prime,
    High,
    Mid,
    Low,
}

impl ProfileGrade {
    pub fn from_score(score: u32) -> Self {
        match score {
            80.. => Self::Prime,
            60..=79 => Self::High,
            40..=59 => Self::Mid,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prime => "PRIME",
            Self::High => "HIGH",
            Self::Mid => "MID",
            Self::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileWeights {
    pub investment: f64,
    pub portfolio: f64,
    pub scale_trust: f64,
    pub marketing: f64,
}

impl Default for ProfileWeights {
    fn default() -> Self {
        Self {
            investment: 0.35,
            portfolio: 0.25,
            scale_trust: 0.25,
            marketing: 0.15,
        }
    }
}

impl ProfileWeights {
    pub fn validate(&self) -> EngineResult<()> {
        let parts = [self.investment, self.portfolio, self.scale_trust, self.marketing];
        let sum: f64 = parts.iter().sum();
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) || (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::ProfileWeightSum(sum));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalProfile {
    pub hospital_id: i64,
    pub investment_score: u32,
    pub portfolio_score: u32,
    pub scale_trust_score: u32,
    pub marketing_score: u32,
    pub profile_score: u32,
    pub grade: ProfileGrade,
    pub scored_at: DateTime<Utc>,
}

fn cap(score: f64) -> u32 {
    score.clamp(0.0, 100.0).round() as u32
}

/// Recent purchases, premium brands and the clinic-age sweet spot.
pub fn score_investment(
    equipment: &[Equipment],
    opened_year: Option<i32>,
    current_year: i32,
    dict: &Dictionary,
) -> u32 {
    let recent_ratio = if equipment.is_empty() {
        0.0
    } else {
        let recent = equipment
            .iter()
            .filter(|e| {
                e.estimated_year
                    .is_some_and(|y| current_year - y <= RECENT_PURCHASE_YEARS)
            })
            .count();
        recent as f64 / equipment.len() as f64
    };

    let premium = equipment
        .iter()
        .filter(|e| dict.is_premium_equipment(&e.name, e.brand.as_deref()))
        .count();
    let premium_points = match premium {
        5.. => 35.0,
        3..=4 => 25.0,
        1..=2 => 15.0,
        _ => 0.0,
    };

    let age_points = match opened_year.map(|y| current_year - y) {
        None => 10.0,
        Some(age) if age < 2 => 15.0,
        Some(2..=5) => 25.0,
        Some(6..=10) => 15.0,
        Some(_) => 8.0,
    };

    cap(recent_ratio * 40.0 + premium_points + age_points)
}

fn equipment_category(e: &Equipment, dict: &Dictionary) -> Option<String> {
    let own = e.category.trim();
    if !own.is_empty() {
        return Some(own.to_uppercase());
    }
    dict.lookup_equipment(&e.name)
        .and_then(|entry| entry.category.as_deref())
        .map(str::to_uppercase)
}

/// Category coverage, equipment count and menu size.
pub fn score_portfolio(equipment: &[Equipment], treatments: &[Treatment], dict: &Dictionary) -> u32 {
    let covered = PORTFOLIO_CATEGORIES
        .iter()
        .filter(|cat| {
            equipment
                .iter()
                .any(|e| equipment_category(e, dict).as_deref() == Some(**cat))
        })
        .count();
    let coverage = covered as f64 / PORTFOLIO_CATEGORIES.len() as f64;

    let equipment_points = match equipment.len() {
        15.. => 30.0,
        10..=14 => 25.0,
        5..=9 => 18.0,
        2..=4 => 10.0,
        1 => 5.0,
        _ => 0.0,
    };
    let menu_points = match treatments.len() {
        50.. => 30.0,
        30..=49 => 24.0,
        15..=29 => 16.0,
        5..=14 => 8.0,
        1..=4 => 3.0,
        _ => 0.0,
    };

    cap(coverage * 40.0 + equipment_points + menu_points)
}

fn treatment_category(t: &Treatment, dict: &Dictionary) -> Option<String> {
    t.category
        .clone()
        .filter(|c| !c.trim().is_empty())
        .or_else(|| dict.lookup_treatment(&t.name).and_then(|e| e.category.clone()))
}

/// Doctor count, average menu price and premium-category share.
pub fn score_scale_trust(doctor_count: Option<u32>, treatments: &[Treatment], dict: &Dictionary) -> u32 {
    let doctor_points = match doctor_count.unwrap_or(0) {
        5.. => 40.0,
        3..=4 => 30.0,
        2 => 20.0,
        1 => 10.0,
        _ => 0.0,
    };

    let prices: Vec<f64> = treatments.iter().filter_map(Treatment::reference_price).collect();
    let avg = if prices.is_empty() {
        0.0
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    };
    let price_points = match avg {
        a if a >= 500_000.0 => 35.0,
        a if a >= 300_000.0 => 28.0,
        a if a >= 150_000.0 => 20.0,
        a if a >= 50_000.0 => 12.0,
        a if a > 0.0 => 5.0,
        _ => 0.0,
    };

    let premium_ratio = if treatments.is_empty() {
        0.0
    } else {
        let premium = treatments
            .iter()
            .filter(|t| {
                treatment_category(t, dict).is_some_and(|c| dict.is_premium_treatment_category(&c))
            })
            .count();
        premium as f64 / treatments.len() as f64
    };

    cap(doctor_points + price_points + premium_ratio * 25.0)
}

pub fn build_profile(
    input: &HospitalInput,
    dict: &Dictionary,
    weights: &ProfileWeights,
    now: DateTime<Utc>,
) -> HospitalProfile {
    use chrono::Datelike;

    let year = now.year();
    let investment_score = score_investment(&input.equipment, input.opened_year, year, dict);
    let portfolio_score = score_portfolio(&input.equipment, &input.treatments, dict);
    let scale_trust_score = score_scale_trust(input.doctor_count, &input.treatments, dict);
    let marketing_score = cap(input.marketing_score.unwrap_or(0.0));

    let profile_score = cap(
        investment_score as f64 * weights.investment
            + portfolio_score as f64 * weights.portfolio
            + scale_trust_score as f64 * weights.scale_trust
            + marketing_score as f64 * weights.marketing,
    );

    HospitalProfile {
        hospital_id: input.hospital_id,
        investment_score,
        portfolio_score,
        scale_trust_score,
        marketing_score,
        profile_score,
        grade: ProfileGrade::from_score(profile_score),
        scored_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn equipment(name: &str, category: &str, year: Option<i32>) -> Equipment {
        let mut e = Equipment::named(name, category);
        e.estimated_year = year;
        e
    }

    #[test]
    fn default_weights_are_valid() {
        assert!(ProfileWeights::default().validate().is_ok());
        let bad = ProfileWeights {
            marketing: 0.3,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(EngineError::ProfileWeightSum(_))));
    }

    #[test]
    fn investment_tiers() {
        let dict = Dictionary::builtin();
        let eq = vec![
            equipment("울쎄라", "HIFU", Some(2025)),
            equipment("써마지", "RF", Some(2019)),
        ];
        // half recent (20) + two premium (15) + opened 3 years ago (25)
        assert_eq!(score_investment(&eq, Some(2023), 2026, &dict), 60);
        // unknown opening year
        assert_eq!(score_investment(&eq, None, 2026, &dict), 45);
        assert_eq!(score_investment(&[], None, 2026, &dict), 10);
    }

    #[test]
    fn portfolio_coverage_and_counts() {
        let dict = Dictionary::builtin();
        let eq = vec![
            equipment("울쎄라", "HIFU", None),
            equipment("써마지", "", None),
            equipment("피코슈어", "laser", None),
        ];
        let tx: Vec<Treatment> = ["보톡스", "필러", "리쥬란", "울쎄라", "써마지"]
            .iter()
            .map(|n| Treatment::named(n))
            .collect();
        // 3/6 coverage (20) + 3 devices (10) + 5 treatments (8)
        assert_eq!(score_portfolio(&eq, &tx, &dict), 38);
    }

    #[test]
    fn scale_trust_caps_at_100() {
        let dict = Dictionary::builtin();
        let tx: Vec<Treatment> = (0..4)
            .map(|_| {
                let mut t = Treatment::named("울쎄라");
                t.price = Some(1_500_000);
                t
            })
            .collect();
        assert_eq!(score_scale_trust(Some(6), &tx, &dict), 100);
        assert_eq!(score_scale_trust(None, &[], &dict), 0);
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(ProfileGrade::from_score(80), ProfileGrade::Prime);
        assert_eq!(ProfileGrade::from_score(79), ProfileGrade::High);
        assert_eq!(ProfileGrade::from_score(40), ProfileGrade::Mid);
        assert_eq!(ProfileGrade::from_score(39), ProfileGrade::Low);
    }
}
