use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::model::compact_lower;
use crate::snapshot::{ChangeType, EquipmentChange, ItemType};
use crate::store::{EngineStore, LogAndContinue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    EquipmentAdded,
    EquipmentRemoved,
    TreatmentAdded,
    TreatmentRemoved,
}

impl Trigger {
    pub fn from_change(change_type: ChangeType, item_type: ItemType) -> Self {
        match (change_type, item_type) {
            (ChangeType::Added, ItemType::Equipment) => Self::EquipmentAdded,
            (ChangeType::Removed, ItemType::Equipment) => Self::EquipmentRemoved,
            (ChangeType::Added, ItemType::Treatment) => Self::TreatmentAdded,
            (ChangeType::Removed, ItemType::Treatment) => Self::TreatmentRemoved,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EquipmentAdded => "equipment_added",
            Self::EquipmentRemoved => "equipment_removed",
            Self::TreatmentAdded => "treatment_added",
            Self::TreatmentRemoved => "treatment_removed",
        }
    }

    /// Value stored in `SalesSignal::signal_type`, e.g. `EQUIPMENT_REMOVED`.
    pub fn signal_type(&self) -> String {
        self.as_str().to_uppercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalPriority {
    High,
    Medium,
    Low,
}

impl SignalPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    New,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesSignalRule {
    pub id: String,
    pub trigger: Trigger,
    pub match_keywords: Vec<String>,
    pub priority: SignalPriority,
    pub title_template: String,
    #[serde(default)]
    pub description_template: String,
    pub related_angle: Option<String>,
}

impl SalesSignalRule {
    pub fn validate(&self) -> EngineResult<()> {
        if self.match_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(EngineError::EmptyRuleKeywords(self.id.clone()));
        }
        Ok(())
    }

    /// Trigger matches and some keyword occurs in the item name or its
    /// standard name, ignoring case and whitespace.
    pub fn matches(&self, change: &EquipmentChange) -> bool {
        if Trigger::from_change(change.change_type, change.item_type) != self.trigger {
            return false;
        }
        let item = compact_lower(&change.item_name);
        let standard = change.standard_name.as_deref().map(compact_lower);
        self.match_keywords
            .iter()
            .map(|k| compact_lower(k))
            .filter(|k| !k.is_empty())
            .any(|k| item.contains(&k) || standard.as_ref().is_some_and(|s| s.contains(&k)))
    }
}

/// Parse and validate a rule table.
pub fn parse_rules(raw: &str, origin: &Path) -> EngineResult<Vec<SalesSignalRule>> {
    let rules: Vec<SalesSignalRule> =
        serde_json::from_str(raw).map_err(|source| EngineError::ConfigParse {
            path: origin.to_path_buf(),
            source,
        })?;
    for rule in &rules {
        rule.validate()?;
    }
    Ok(rules)
}

pub fn load_rules(path: &Path) -> EngineResult<Vec<SalesSignalRule>> {
    let raw = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = parse_rules(&raw, path)?;
    info!(path = %path.display(), count = rules.len(), "signal rules loaded");
    Ok(rules)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesSignal {
    pub hospital_id: i64,
    pub product_id: String,
    pub rule_id: String,
    pub signal_type: String,
    pub priority: SignalPriority,
    pub title: String,
    pub description: String,
    pub related_angle: Option<String>,
    pub status: SignalStatus,
    pub item_name: String,
    pub created_at: DateTime<Utc>,
}

fn render(template: &str, change: &EquipmentChange, product_id: &str) -> String {
    let standard = change.standard_name.as_deref().unwrap_or(&change.item_name);
    template
        .replace("{{item_name}}", &change.item_name)
        .replace("{{standard_name}}", standard)
        .replace("{{product_id}}", product_id)
}

/// One signal per (change, matching rule). Signals are stored best-effort;
/// the returned list does not depend on the write.
pub fn classify_signals(
    store: &dyn EngineStore,
    hospital_id: i64,
    changes: &[EquipmentChange],
    product_id: &str,
    rules: &[SalesSignalRule],
) -> Vec<SalesSignal> {
    let signals: Vec<SalesSignal> = changes
        .iter()
        .flat_map(|change| {
            rules
                .iter()
                .filter(move |rule| rule.matches(change))
                .map(move |rule| SalesSignal {
                    hospital_id,
                    product_id: product_id.to_string(),
                    rule_id: rule.id.clone(),
                    signal_type: rule.trigger.signal_type(),
                    priority: rule.priority,
                    title: render(&rule.title_template, change, product_id),
                    description: render(&rule.description_template, change, product_id),
                    related_angle: rule.related_angle.clone(),
                    status: SignalStatus::New,
                    item_name: change.item_name.clone(),
                    created_at: change.detected_at,
                })
        })
        .collect();

    debug!(
        hospital_id,
        product_id,
        changes = changes.len(),
        signals = signals.len(),
        "signals classified"
    );
    if !signals.is_empty() {
        store
            .insert_signals(&signals)
            .log_and_continue("saving sales signals");
    }
    signals
}
