use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitType {
    Shot,
    Joule,
    Line,
    Cc,
    Unit,
    Session,
    Area,
    Vial,
    Ampoule,
    Syringe,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shot => "SHOT",
            Self::Joule => "JOULE",
            Self::Line => "LINE",
            Self::Cc => "CC",
            Self::Unit => "UNIT",
            Self::Session => "SESSION",
            Self::Area => "AREA",
            Self::Vial => "VIAL",
            Self::Ampoule => "AMPOULE",
            Self::Syringe => "SYRINGE",
        }
    }
}

/// Alternation used inside the quantity-aware price pattern. Longer tokens
/// come first so `units` is not cut to `unit`.
pub const UNIT_PATTERN: &str =
    r"shots|shot|샷|줄|cc|CC|ml|mL|유닛|units|unit|U|회|번|부위|바이알|병|앰플|시린지|kJ|J";

/// The token "줄" can mean joules (energy devices) or threads.
pub const AMBIGUOUS_JUL: &str = "줄";

/// Fixed token table. `None` for "줄", which needs [`resolve_jul`].
pub fn map_unit_token(token: &str) -> Option<UnitType> {
    let unit = match token {
        "샷" | "shot" | "shots" => UnitType::Shot,
        "cc" | "CC" | "ml" | "mL" => UnitType::Cc,
        "유닛" | "unit" | "units" | "U" => UnitType::Unit,
        "회" | "번" => UnitType::Session,
        "부위" => UnitType::Area,
        "바이알" | "병" => UnitType::Vial,
        "앰플" => UnitType::Ampoule,
        "시린지" => UnitType::Syringe,
        "J" | "kJ" => UnitType::Joule,
        _ => return None,
    };
    Some(unit)
}

/// Decide JOULE vs LINE for "줄".
///
/// Order: energy-device keywords in the surrounding text, thread keywords in
/// the surrounding text, the treatment's dictionary base unit, then LINE.
/// The LINE fallback is a heuristic and may be wrong for unseen vocabulary.
pub fn resolve_jul(context: &str, treatment_name: &str, dict: &Dictionary) -> UnitType {
    if dict.joule_context().iter().any(|k| context.contains(k.as_str())) {
        return UnitType::Joule;
    }
    if dict.line_context().iter().any(|k| context.contains(k.as_str())) {
        return UnitType::Line;
    }
    match dict.lookup_treatment(treatment_name).and_then(|t| t.base_unit) {
        Some(u @ (UnitType::Joule | UnitType::Line)) => u,
        _ => UnitType::Line,
    }
}
