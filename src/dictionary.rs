use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::extract::units::UnitType;
use crate::model::compact_lower;

const DEFAULT_DICTIONARY_JSON: &str = include_str!("../data/dictionary.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentEntry {
    pub standard_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub base_unit: Option<UnitType>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentEntry {
    pub standard_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    treatments: Vec<TreatmentEntry>,
    #[serde(default)]
    equipment: Vec<EquipmentEntry>,
    #[serde(default)]
    joule_context: Vec<String>,
    #[serde(default)]
    line_context: Vec<String>,
    #[serde(default)]
    premium_treatment_categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Dictionary {
    treatments: Vec<TreatmentEntry>,
    equipment: Vec<EquipmentEntry>,
    // (normalized alias, entry index), longest alias first
    treatment_index: Vec<(String, usize)>,
    equipment_index: Vec<(String, usize)>,
    joule_context: Vec<String>,
    line_context: Vec<String>,
    premium_treatment_categories: Vec<String>,
}

impl Dictionary {
    /// The dictionary bundled with the crate.
    pub fn builtin() -> Self {
        Self::from_json(DEFAULT_DICTIONARY_JSON).unwrap_or_else(|e| {
            warn!(error = %e, "bundled dictionary is malformed, using an empty one");
            Self::empty()
        })
    }

    pub fn empty() -> Self {
        Self::from_file(DictionaryFile {
            treatments: Vec::new(),
            equipment: Vec::new(),
            joule_context: Vec::new(),
            line_context: Vec::new(),
            premium_treatment_categories: Vec::new(),
        })
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| EngineError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let file: DictionaryFile = serde_json::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: DictionaryFile) -> Self {
        let treatment_index = build_index(
            file.treatments
                .iter()
                .map(|t| (t.standard_name.as_str(), t.aliases.as_slice())),
        );
        let equipment_index = build_index(
            file.equipment
                .iter()
                .map(|e| (e.standard_name.as_str(), e.aliases.as_slice())),
        );
        debug!(
            treatments = file.treatments.len(),
            equipment = file.equipment.len(),
            "dictionary loaded"
        );
        Self {
            treatments: file.treatments,
            equipment: file.equipment,
            treatment_index,
            equipment_index,
            joule_context: file.joule_context,
            line_context: file.line_context,
            premium_treatment_categories: file
                .premium_treatment_categories
                .iter()
                .map(|c| compact_lower(c))
                .collect(),
        }
    }

    pub fn lookup_treatment(&self, name: &str) -> Option<&TreatmentEntry> {
        lookup(&self.treatment_index, name).map(|i| &self.treatments[i])
    }

    pub fn lookup_equipment(&self, name: &str) -> Option<&EquipmentEntry> {
        lookup(&self.equipment_index, name).map(|i| &self.equipment[i])
    }

    /// Standard name for either kind of item; treatments are tried first.
    pub fn standard_name(&self, name: &str) -> Option<String> {
        self.lookup_treatment(name)
            .map(|t| t.standard_name.clone())
            .or_else(|| self.lookup_equipment(name).map(|e| e.standard_name.clone()))
    }

    pub fn joule_context(&self) -> &[String] {
        &self.joule_context
    }

    pub fn line_context(&self) -> &[String] {
        &self.line_context
    }

    pub fn is_premium_treatment_category(&self, category: &str) -> bool {
        let c = compact_lower(category);
        self.premium_treatment_categories.iter().any(|p| *p == c)
    }

    /// Premium if the dictionary says so for the name, or the brand matches a
    /// premium entry's brand.
    pub fn is_premium_equipment(&self, name: &str, brand: Option<&str>) -> bool {
        if self.lookup_equipment(name).is_some_and(|e| e.premium) {
            return true;
        }
        let Some(brand) = brand.map(compact_lower).filter(|b| !b.is_empty()) else {
            return false;
        };
        self.equipment.iter().any(|e| {
            e.premium
                && e.brand
                    .as_deref()
                    .is_some_and(|b| compact_lower(b) == brand)
        })
    }
}

fn build_index<'a>(entries: impl Iterator<Item = (&'a str, &'a [String])>) -> Vec<(String, usize)> {
    let mut index: Vec<(String, usize)> = entries
        .enumerate()
        .flat_map(|(i, (standard, aliases))| {
            std::iter::once(standard)
                .chain(aliases.iter().map(String::as_str))
                .map(compact_lower)
                .filter(|a| !a.is_empty())
                .map(move |a| (a, i))
                .collect::<Vec<_>>()
        })
        .collect();
    index.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
    index
}

/// Exact alias match wins; otherwise the longest alias contained in the name.
fn lookup(index: &[(String, usize)], name: &str) -> Option<usize> {
    let key = compact_lower(name);
    if key.is_empty() {
        return None;
    }
    index
        .iter()
        .find(|(alias, _)| *alias == key)
        .or_else(|| index.iter().find(|(alias, _)| key.contains(alias.as_str())))
        .map(|(_, i)| *i)
}
