use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub name: String,
    pub brand: Option<String>,
    pub category: String,
    pub model: Option<String>,
    pub estimated_year: Option<i32>,
    pub manufacturer: Option<String>,
}

impl Equipment {
    pub fn named(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            brand: None,
            category: category.to_string(),
            model: None,
            estimated_year: None,
            manufacturer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    pub name: String,
    pub category: Option<String>,
    pub price_min: Option<u64>,
    pub price_max: Option<u64>,
    pub price: Option<u64>,
    pub price_event: Option<u64>,
    pub is_promoted: bool,
}

impl Treatment {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            category: None,
            price_min: None,
            price_max: None,
            price: None,
            price_event: None,
            is_promoted: false,
        }
    }

    /// Representative list price: explicit price, else the range midpoint,
    /// else whichever bound is known.
    pub fn reference_price(&self) -> Option<f64> {
        if let Some(p) = self.price {
            return Some(p as f64);
        }
        match (self.price_min, self.price_max) {
            (Some(lo), Some(hi)) => Some((lo + hi) as f64 / 2.0),
            (Some(v), None) | (None, Some(v)) => Some(v as f64),
            (None, None) => None,
        }
    }
}

/// Everything the engine needs to evaluate one hospital in one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalInput {
    pub hospital_id: i64,
    pub equipment: Vec<Equipment>,
    pub treatments: Vec<Treatment>,
    pub raw_text: String,
    pub ocr_text: Option<String>,
    pub doctor_count: Option<u32>,
    pub opened_year: Option<i32>,
    /// Produced by the external marketing-activity scorer (0–100).
    pub marketing_score: Option<f64>,
    pub crawl_tier: u8,
}

impl HospitalInput {
    pub fn equipment_names(&self) -> Vec<String> {
        self.equipment.iter().map(|e| e.name.clone()).collect()
    }

    pub fn treatment_names(&self) -> Vec<String> {
        self.treatments.iter().map(|t| t.name.clone()).collect()
    }
}

/// Lowercase with every whitespace character removed. Used wherever names
/// coming from different pages have to be compared.
pub fn compact_lower(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
