use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::extract::numerals::parse_korean_number;
use crate::model::{Equipment, HospitalInput, Treatment};

const DEFAULT_TIER: u8 = 1;

/// A number the extractor may have written as text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Number(f64),
    Text(String),
}

impl RawNumber {
    /// Positive integer value; text may carry a 원/명/년/대 suffix and Korean
    /// multipliers.
    pub fn amount(&self) -> Option<u64> {
        match self {
            Self::Number(n) if n.is_finite() && *n > 0.0 => Some(n.round() as u64),
            Self::Number(_) => None,
            Self::Text(s) => {
                let trimmed = s
                    .trim()
                    .trim_end_matches(['원', '명', '년', '대', '~'])
                    .trim();
                parse_korean_number(trimmed).filter(|v| *v > 0)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEquipment {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub model: Option<String>,
    pub estimated_year: Option<RawNumber>,
    pub manufacturer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTreatment {
    pub name: Option<String>,
    pub category: Option<String>,
    pub price_min: Option<RawNumber>,
    pub price_max: Option<RawNumber>,
    pub price: Option<RawNumber>,
    pub price_event: Option<RawNumber>,
    #[serde(default)]
    pub is_promoted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawExtraction {
    pub hospital_id: i64,
    #[serde(default)]
    pub equipment: Vec<RawEquipment>,
    #[serde(default)]
    pub treatments: Vec<RawTreatment>,
    #[serde(default)]
    pub raw_text: String,
    pub ocr_text: Option<String>,
    pub doctor_count: Option<RawNumber>,
    pub opened_year: Option<RawNumber>,
    pub marketing_score: Option<f64>,
    pub crawl_tier: Option<u8>,
}

fn clean(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn year(raw: Option<&RawNumber>) -> Option<i32> {
    raw.and_then(RawNumber::amount)
        .filter(|y| (1900..=2100).contains(y))
        .map(|y| y as i32)
}

impl RawExtraction {
    pub fn into_input(self) -> EngineResult<HospitalInput> {
        if self.hospital_id <= 0 {
            return Err(EngineError::InvalidExtraction(format!(
                "hospital_id must be positive, got {}",
                self.hospital_id
            )));
        }
        let hospital_id = self.hospital_id;

        let equipment: Vec<Equipment> = self
            .equipment
            .into_iter()
            .filter_map(|e| {
                let Some(name) = clean(e.name) else {
                    debug!(hospital_id, "dropping equipment record without a name");
                    return None;
                };
                Some(Equipment {
                    name,
                    brand: clean(e.brand),
                    category: clean(e.category).unwrap_or_default(),
                    model: clean(e.model),
                    estimated_year: year(e.estimated_year.as_ref()),
                    manufacturer: clean(e.manufacturer),
                })
            })
            .collect();

        let treatments: Vec<Treatment> = self
            .treatments
            .into_iter()
            .filter_map(|t| {
                let Some(name) = clean(t.name) else {
                    debug!(hospital_id, "dropping treatment record without a name");
                    return None;
                };
                Some(Treatment {
                    name,
                    category: clean(t.category),
                    price_min: t.price_min.as_ref().and_then(RawNumber::amount),
                    price_max: t.price_max.as_ref().and_then(RawNumber::amount),
                    price: t.price.as_ref().and_then(RawNumber::amount),
                    price_event: t.price_event.as_ref().and_then(RawNumber::amount),
                    is_promoted: t.is_promoted,
                })
            })
            .collect();

        Ok(HospitalInput {
            hospital_id,
            equipment,
            treatments,
            raw_text: self.raw_text,
            ocr_text: clean(self.ocr_text),
            doctor_count: self
                .doctor_count
                .as_ref()
                .and_then(RawNumber::amount)
                .and_then(|d| u32::try_from(d).ok()),
            opened_year: year(self.opened_year.as_ref()),
            marketing_score: self.marketing_score.filter(|m| m.is_finite()),
            crawl_tier: self.crawl_tier.unwrap_or(DEFAULT_TIER),
        })
    }
}

/// Parse one extraction payload.
pub fn parse_extraction(raw: &str) -> EngineResult<HospitalInput> {
    let extraction: RawExtraction =
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidExtraction(e.to_string()))?;
    extraction.into_input()
}
