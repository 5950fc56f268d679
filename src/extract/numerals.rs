use std::sync::LazyLock;

use regex::Regex;

/// One numeric chunk with an optional Korean multiplier, e.g. `1.5만`, `5천`, `350000`.
static CHUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)([억만천]?)").unwrap());

/// Regex fragment for a number as it appears in page text: comma-grouped
/// digits with optional decimals, followed by any run of 억/만/천 chunks.
pub const NUMBER_PATTERN: &str =
    r"\d[\d,]*(?:\.\d+)?(?:[ \t]*[억만천](?:[ \t]*\d[\d,]*(?:\.\d+)?)?)*";

fn multiplier(unit: &str) -> f64 {
    match unit {
        "억" => 100_000_000.0,
        "만" => 10_000.0,
        "천" => 1_000.0,
        _ => 1.0,
    }
}

/// Parse `"5만"`, `"1만5천"`, `"1.5만"`, `"350,000"` and similar into an integer.
///
/// Returns `None` for anything that is not entirely made of those shapes, or
/// when multipliers are not in descending order (`"5천3만"`).
pub fn parse_korean_number(raw: &str) -> Option<u64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let mut total = 0.0;
    let mut consumed = 0;
    let mut last_multiplier = f64::INFINITY;
    for caps in CHUNK_RE.captures_iter(&cleaned) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let mult = multiplier(&caps[2]);
        if mult >= last_multiplier {
            return None;
        }
        last_multiplier = mult;
        total += value * mult;
    }

    if consumed != cleaned.len() || !total.is_finite() {
        return None;
    }
    Some(total.round() as u64)
}
