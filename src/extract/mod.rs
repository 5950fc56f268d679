pub mod events;
pub mod numerals;
pub mod units;

use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dictionary::Dictionary;
use crate::model::Treatment;
use events::{extract_event_context, has_event_keyword, EventContext};
use numerals::{parse_korean_number, NUMBER_PATTERN};
use units::{map_unit_token, resolve_jul, UnitType, AMBIGUOUS_JUL, UNIT_PATTERN};

const KEYWORD_WINDOW: usize = 50;
const CONTEXT_WINDOW: usize = 100;

const PREMIUM_THRESHOLD: f64 = 500_000.0;
const MID_THRESHOLD: f64 = 200_000.0;
const MIN_SANE_UNIT_PRICE: f64 = 100.0;
const MAX_SANE_UNIT_PRICE: f64 = 10_000_000.0;
const MAX_SANE_TOTAL_PRICE: u64 = 100_000_000;

const PACKAGE_KEYWORDS: &[&str] = &["패키지", "세트", "1+1", "PKG", "pkg"];

/// Words that precede a price but are not treatment names.
const NAME_STOPWORDS: &[&str] = &[
    "이벤트", "이벤트가", "할인", "할인가", "가격", "정가", "정상가", "특가", "원가", "판매가",
    "체험가", "단가", "부가세", "추가", "기본", "최대", "최소", "총", "합계", "VAT", "vat",
];

static QTY_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<name>[가-힣A-Za-z][가-힣A-Za-z0-9]{{0,19}}?)[ \t]*(?P<qty>{num})[ \t]*(?P<unit>{unit})[^\d\n]{{0,20}}?(?P<price>{num})[ \t]*원",
        num = NUMBER_PATTERN,
        unit = UNIT_PATTERN,
    ))
    .unwrap()
});

static BARE_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<name>[가-힣A-Za-z][가-힣A-Za-z0-9]{{1,14}})[ \t]*[:：]?[ \t]*(?P<price>{num})[ \t]*원",
        num = NUMBER_PATTERN,
    ))
    .unwrap()
});

static WON_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,.]*[ \t]*[억만천]?[ \t]*원").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceBand {
    Premium,
    Mid,
    Mass,
}

impl PriceBand {
    /// Uses the unit price when one exists, otherwise the total.
    pub fn classify(unit_price: Option<f64>, total_price: u64) -> Self {
        let basis = unit_price.unwrap_or(total_price as f64);
        if basis >= PREMIUM_THRESHOLD {
            Self::Premium
        } else if basis >= MID_THRESHOLD {
            Self::Mid
        } else {
            Self::Mass
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Premium => "PREMIUM",
            Self::Mid => "MID",
            Self::Mass => "MASS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    /// Quantity and price read directly from the text.
    Exact,
    /// Derived from a price range.
    Calculated,
    /// Price without quantity.
    Estimated,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "EXACT",
            Self::Calculated => "CALCULATED",
            Self::Estimated => "ESTIMATED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPrice {
    pub treatment_name: String,
    pub standard_name: Option<String>,
    pub raw_text: String,
    pub quantity: Option<u64>,
    pub unit_type: UnitType,
    pub total_price: u64,
    pub unit_price: Option<f64>,
    pub price_band: PriceBand,
    pub is_package: bool,
    pub is_event_price: bool,
    pub is_outlier: bool,
    pub confidence: Confidence,
    pub event_context: Option<EventContext>,
}

impl ParsedPrice {
    fn dedup_key(&self) -> (String, u64) {
        (
            self.standard_name
                .clone()
                .unwrap_or_else(|| self.treatment_name.clone()),
            self.total_price,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceParseResult {
    pub prices: Vec<ParsedPrice>,
    /// Lines that mention a won amount but yielded no price record.
    pub unparsed: Vec<String>,
}

pub fn is_outlier(unit_price: Option<f64>, total_price: u64) -> bool {
    let unit_out = unit_price.is_some_and(|u| u < MIN_SANE_UNIT_PRICE || u > MAX_SANE_UNIT_PRICE);
    unit_out || total_price > MAX_SANE_TOTAL_PRICE
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub struct PriceExtractor<'a> {
    dict: &'a Dictionary,
    reference_date: NaiveDate,
}

impl<'a> PriceExtractor<'a> {
    pub fn new(dict: &'a Dictionary) -> Self {
        Self {
            dict,
            reference_date: Utc::now().date_naive(),
        }
    }

    /// Date used to give month-only event durations a year.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = date;
        self
    }

    /// Extract every price record from `text`. Never fails; fragments that do
    /// not parse are skipped.
    pub fn parse_prices(&self, text: &str) -> PriceParseResult {
        let mut prices = Vec::new();
        let mut seen: HashSet<(String, u64)> = HashSet::new();
        let mut spans: Vec<Range<usize>> = Vec::new();

        for caps in QTY_PRICE_RE.captures_iter(text) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            spans.push(whole.clone());

            let name = caps["name"].trim();
            if is_stopword(name) {
                continue;
            }
            let (Some(quantity), Some(total)) = (
                parse_korean_number(&caps["qty"]),
                parse_korean_number(&caps["price"]),
            ) else {
                continue;
            };
            if quantity == 0 || total == 0 {
                continue;
            }

            let unit = match &caps["unit"] {
                AMBIGUOUS_JUL => resolve_jul(line_around(text, &whole), name, self.dict),
                token => map_unit_token(token).unwrap_or(UnitType::Session),
            };
            let unit_price = Some(round2(total as f64 / quantity as f64));
            let parsed = self.build(
                text,
                whole,
                name,
                Some(quantity),
                unit,
                total,
                unit_price,
                Confidence::Exact,
            );
            push_unique(&mut prices, &mut seen, parsed);
        }

        for caps in BARE_PRICE_RE.captures_iter(text) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            if spans.iter().any(|s| overlaps(s, &whole)) {
                continue;
            }
            spans.push(whole.clone());

            let name = caps["name"].trim();
            if is_stopword(name) {
                continue;
            }
            let Some(total) = parse_korean_number(&caps["price"]).filter(|p| *p > 0) else {
                continue;
            };
            let unit = self
                .dict
                .lookup_treatment(name)
                .and_then(|t| t.base_unit)
                .unwrap_or(UnitType::Session);
            let parsed = self.build(
                text,
                whole,
                name,
                None,
                unit,
                total,
                None,
                Confidence::Estimated,
            );
            push_unique(&mut prices, &mut seen, parsed);
        }

        let unparsed = unparsed_lines(text, &spans);
        debug!(prices = prices.len(), unparsed = unparsed.len(), "prices parsed");
        PriceParseResult { prices, unparsed }
    }

    /// Price records from structured treatment fields, for pages where the
    /// extractor already produced numbers instead of text.
    pub fn prices_from_treatments(&self, treatments: &[Treatment]) -> Vec<ParsedPrice> {
        let mut prices = Vec::new();
        let mut seen = HashSet::new();
        for t in treatments {
            let standard_name = self.dict.standard_name(&t.name);
            let unit_type = self
                .dict
                .lookup_treatment(&t.name)
                .and_then(|e| e.base_unit)
                .unwrap_or(UnitType::Session);

            let list = match (t.price, t.price_min, t.price_max) {
                (Some(p), _, _) => Some((p, Confidence::Exact)),
                (None, Some(lo), Some(hi)) => Some(((lo + hi) / 2, Confidence::Calculated)),
                (None, Some(v), None) | (None, None, Some(v)) => Some((v, Confidence::Estimated)),
                (None, None, None) => None,
            };
            let event = t.price_event.map(|p| (p, Confidence::Exact));

            for (total, confidence, is_event) in list
                .map(|(p, c)| (p, c, false))
                .into_iter()
                .chain(event.map(|(p, c)| (p, c, true)))
            {
                if total == 0 {
                    continue;
                }
                let parsed = ParsedPrice {
                    treatment_name: t.name.clone(),
                    standard_name: standard_name.clone(),
                    raw_text: t.name.clone(),
                    quantity: None,
                    unit_type,
                    total_price: total,
                    unit_price: None,
                    price_band: PriceBand::classify(None, total),
                    is_package: PACKAGE_KEYWORDS.iter().any(|k| t.name.contains(k)),
                    is_event_price: is_event || (t.is_promoted && t.price_event.is_none()),
                    is_outlier: is_outlier(None, total),
                    confidence,
                    event_context: None,
                };
                push_unique(&mut prices, &mut seen, parsed);
            }
        }
        prices
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        text: &str,
        span: Range<usize>,
        name: &str,
        quantity: Option<u64>,
        unit_type: UnitType,
        total_price: u64,
        unit_price: Option<f64>,
        confidence: Confidence,
    ) -> ParsedPrice {
        let raw_text = text[span.clone()].trim().to_string();
        let near = char_window(text, &span, KEYWORD_WINDOW);
        let wide = char_window(text, &span, CONTEXT_WINDOW);

        let event_context = extract_event_context(wide, self.reference_date);
        let is_event_price = has_event_keyword(near) || event_context.is_some();
        let is_package = PACKAGE_KEYWORDS
            .iter()
            .any(|k| raw_text.contains(k) || near.contains(k));

        ParsedPrice {
            treatment_name: name.to_string(),
            standard_name: self.dict.standard_name(name),
            raw_text,
            quantity,
            unit_type,
            total_price,
            unit_price,
            price_band: PriceBand::classify(unit_price, total_price),
            is_package,
            is_event_price,
            is_outlier: is_outlier(unit_price, total_price),
            confidence,
            event_context,
        }
    }
}

fn push_unique(prices: &mut Vec<ParsedPrice>, seen: &mut HashSet<(String, u64)>, p: ParsedPrice) {
    if seen.insert(p.dedup_key()) {
        prices.push(p);
    }
}

fn is_stopword(name: &str) -> bool {
    NAME_STOPWORDS.contains(&name)
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// `radius` characters on either side of `span`, clamped to the text.
fn char_window<'t>(text: &'t str, span: &Range<usize>, radius: usize) -> &'t str {
    let from = text[..span.start]
        .char_indices()
        .rev()
        .take(radius)
        .last()
        .map_or(span.start, |(i, _)| i);
    let to = text[span.end..]
        .char_indices()
        .nth(radius)
        .map_or(text.len(), |(i, _)| span.end + i);
    &text[from..to]
}

/// The full line(s) containing `span`.
fn line_around<'t>(text: &'t str, span: &Range<usize>) -> &'t str {
    let from = text[..span.start].rfind('\n').map_or(0, |i| i + 1);
    let to = text[span.end..].find('\n').map_or(text.len(), |i| span.end + i);
    &text[from..to]
}

fn unparsed_lines(text: &str, spans: &[Range<usize>]) -> Vec<String> {
    let mut out = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let range = offset..offset + line.len();
        offset += line.len();
        if WON_HINT_RE.is_match(line) && !spans.iter().any(|s| overlaps(s, &range)) {
            out.push(line.trim().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(dict: &Dictionary) -> PriceExtractor<'_> {
        PriceExtractor::new(dict).with_reference_date(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap())
    }

    #[test]
    fn quantity_price_with_manwon() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("울쎄라 300샷 150만원");
        assert_eq!(r.prices.len(), 1);
        let p = &r.prices[0];
        assert_eq!(p.treatment_name, "울쎄라");
        assert_eq!(p.quantity, Some(300));
        assert_eq!(p.total_price, 1_500_000);
        assert_eq!(p.unit_type, UnitType::Shot);
        assert_eq!(p.unit_price, Some(5000.0));
        assert_eq!(p.confidence, Confidence::Exact);
        assert_eq!(p.price_band, PriceBand::Mass);
        assert!(!p.is_event_price);
    }

    #[test]
    fn jul_with_energy_device_is_joule() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("온다 50000줄 350000원");
        let p = &r.prices[0];
        assert_eq!(p.unit_type, UnitType::Joule);
        assert_eq!(p.unit_price, Some(7.0));
        assert!(p.is_outlier);
    }

    #[test]
    fn jul_with_thread_is_line() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("실리프팅 10줄 500000원");
        let p = &r.prices[0];
        assert_eq!(p.unit_type, UnitType::Line);
        assert_eq!(p.unit_price, Some(50_000.0));
        assert_eq!(p.standard_name.as_deref(), Some("실리프팅"));
    }

    #[test]
    fn month_limited_event_is_flagged() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("3월 한정 울쎄라 300샷 120만원");
        let p = &r.prices[0];
        assert_eq!(p.total_price, 1_200_000);
        assert!(p.is_event_price);
        let ctx = p.event_context.as_ref().unwrap();
        assert!(ctx.conditions.duration.is_some());
        assert_eq!(ctx.end_date, NaiveDate::from_ymd_opt(2026, 3, 31));
    }

    #[test]
    fn structured_context_implies_event_without_keyword() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("개원 기념 리쥬란 2cc 30만원");
        let p = &r.prices[0];
        assert!(p.is_event_price);
        assert_eq!(
            p.event_context.as_ref().unwrap().conditions.occasion.as_deref(),
            Some("개원 기념")
        );
    }

    #[test]
    fn bare_price_fallback_is_estimated() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("보톡스 5만원\n필러: 25만원");
        assert_eq!(r.prices.len(), 2);
        let botox = &r.prices[0];
        assert_eq!(botox.treatment_name, "보톡스");
        assert_eq!(botox.total_price, 50_000);
        assert_eq!(botox.unit_price, None);
        assert_eq!(botox.unit_type, UnitType::Unit);
        assert_eq!(botox.confidence, Confidence::Estimated);
        assert_eq!(r.prices[1].unit_type, UnitType::Cc);
        assert_eq!(r.prices[1].price_band, PriceBand::Mid);
    }

    #[test]
    fn duplicates_are_dropped() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("울쎄라 300샷 150만원\nUlthera 300shot 1,500,000원");
        assert_eq!(r.prices.len(), 1);
    }

    #[test]
    fn stopword_names_are_skipped() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("정가 30만원");
        assert!(r.prices.is_empty());
        assert!(r.unparsed.is_empty());
    }

    #[test]
    fn malformed_fragments_end_up_unparsed() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("상담 후 결정\n1회 50,000원부터\n울쎄라 300샷 150만원");
        assert_eq!(r.prices.len(), 1);
        assert_eq!(r.unparsed, vec!["1회 50,000원부터".to_string()]);
    }

    #[test]
    fn package_and_premium_band() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("써마지패키지 900만원");
        let p = &r.prices[0];
        assert!(p.is_package);
        assert_eq!(p.standard_name.as_deref(), Some("써마지"));
        assert_eq!(p.price_band, PriceBand::Premium);
    }

    #[test]
    fn garbage_input_does_not_panic() {
        let dict = Dictionary::builtin();
        let r = extractor(&dict).parse_prices("원원원 ,,,원 만천억원 😀 300샷");
        assert!(r.prices.is_empty());
    }

    #[test]
    fn structured_treatment_prices() {
        let dict = Dictionary::builtin();
        let mut range = Treatment::named("리쥬란");
        range.price_min = Some(200_000);
        range.price_max = Some(400_000);
        let mut promo = Treatment::named("울쎄라");
        promo.price = Some(1_500_000);
        promo.price_event = Some(990_000);

        let prices = extractor(&dict).prices_from_treatments(&[range, promo]);
        assert_eq!(prices.len(), 3);
        assert_eq!(prices[0].total_price, 300_000);
        assert_eq!(prices[0].confidence, Confidence::Calculated);
        assert!(!prices[1].is_event_price);
        assert!(prices[2].is_event_price);
        assert_eq!(prices[2].total_price, 990_000);
    }
}
