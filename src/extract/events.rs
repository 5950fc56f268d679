use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

const EVENT_KEYWORDS: &[&str] = &[
    "이벤트", "한정", "할인", "선착순", "마감임박", "마감 임박", "특가", "프로모션",
    "오픈기념", "오픈 기념", "%할인", "% 할인", "체험가", "첫방문", "첫 방문", "세일",
    "event", "EVENT", "sale", "SALE",
];

static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"선착순\s*\d+\s*(?:명|분|인)|\d+\s*(?:명|분)\s*한정").unwrap()
});
static UNTIL_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\d{4})\s*년\s*)?(\d{1,2})\s*월\s*(\d{1,2})\s*일\s*까지").unwrap()
});
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2})[./](\d{1,2})\s*[~\-–]\s*(\d{1,2})[./](\d{1,2})").unwrap()
});
static MONTH_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\d{4})\s*년\s*)?(\d{1,2})\s*월\s*(?:한정|한달|말까지|까지)").unwrap()
});
static URGENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"마감\s*임박|오늘\s*만|오늘\s*하루|단\s*하루|곧\s*마감|품절\s*임박|조기\s*마감|마지막\s*기회")
        .unwrap()
});
static OCCASION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:오픈|개원|리뉴얼|확장\s*이전)\s*기념|\d+\s*주년(?:\s*기념)?|블랙\s*프라이데이|크리스마스|연말|신년|추석|설날|수능")
        .unwrap()
});
static DISCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2})\s*%\s*(?:할인|off|OFF|DC|dc|세일)|할인\s*(?:율\s*)?(\d{1,2})\s*%").unwrap()
});
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[가-힣A-Za-z0-9]{1,10}\s?(?:이벤트|프로모션|특가)").unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConditions {
    pub limit: Option<String>,
    pub duration: Option<String>,
    pub urgency: Option<String>,
    pub occasion: Option<String>,
    /// Discount in percent.
    pub discount: Option<u8>,
}

impl EventConditions {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.duration.is_none()
            && self.urgency.is_none()
            && self.occasion.is_none()
            && self.discount.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub label: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub conditions: EventConditions,
}

impl EventContext {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && self.conditions.is_empty()
    }
}

/// A `M/D~M/D` (or `M.D~M.D`) span with its four parts. Decimal price
/// ranges such as `1.5~2.5만원` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub span: (usize, usize),
    pub start: (u32, u32),
    pub end: (u32, u32),
}

pub fn date_ranges(text: &str) -> impl Iterator<Item = DateRange> + '_ {
    RANGE_RE.captures_iter(text).filter_map(move |caps| {
        let whole = caps.get(0)?;
        let before = text[..whole.start()].chars().next_back();
        let after = text[whole.end()..].chars().next();
        if before.is_some_and(|c| c.is_ascii_digit() || c == '.' || c == '/') {
            return None;
        }
        if after.is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '%' | '만' | '천' | '억' | '원')) {
            return None;
        }
        let part = |i: usize| caps[i].parse::<u32>().ok();
        let (m1, d1, m2, d2) = (part(1)?, part(2)?, part(3)?, part(4)?);
        let valid = |m: u32, d: u32| (1..=12).contains(&m) && (1..=31).contains(&d);
        if !valid(m1, d1) || !valid(m2, d2) {
            return None;
        }
        Some(DateRange {
            span: (whole.start(), whole.end()),
            start: (m1, d1),
            end: (m2, d2),
        })
    })
}

pub fn has_event_keyword(window: &str) -> bool {
    EVENT_KEYWORDS.iter().any(|k| window.contains(k))
}

/// Pull structured event details out of the text around a price.
///
/// `reference` supplies the year for dates written without one.
pub fn extract_event_context(window: &str, reference: NaiveDate) -> Option<EventContext> {
    let mut ctx = EventContext {
        label: LABEL_RE.find(window).map(|m| m.as_str().trim().to_string()),
        ..Default::default()
    };

    ctx.conditions.limit = LIMIT_RE.find(window).map(|m| m.as_str().to_string());
    ctx.conditions.urgency = URGENCY_RE.find(window).map(|m| m.as_str().to_string());
    ctx.conditions.occasion = OCCASION_RE.find(window).map(|m| m.as_str().to_string());
    ctx.conditions.discount = DISCOUNT_RE.captures(window).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .and_then(|m| m.as_str().parse::<u8>().ok())
    });

    if let Some(caps) = UNTIL_DATE_RE.captures(window) {
        let year = year_or(caps.get(1).map(|m| m.as_str()), reference);
        let month = caps[2].parse().unwrap_or(0);
        let day = caps[3].parse().unwrap_or(0);
        ctx.end_date = NaiveDate::from_ymd_opt(year, month, day);
        ctx.conditions.duration = Some(caps[0].to_string());
    } else if let Some(range) = date_ranges(window).next() {
        let year = reference.year();
        ctx.start_date = NaiveDate::from_ymd_opt(year, range.start.0, range.start.1);
        ctx.end_date = NaiveDate::from_ymd_opt(year, range.end.0, range.end.1);
        ctx.conditions.duration = Some(window[range.span.0..range.span.1].to_string());
    } else if let Some(caps) = MONTH_ONLY_RE.captures(window) {
        let year = year_or(caps.get(1).map(|m| m.as_str()), reference);
        let month = caps[2].parse().unwrap_or(0);
        ctx.start_date = NaiveDate::from_ymd_opt(year, month, 1);
        ctx.end_date = end_of_month(year, month);
        ctx.conditions.duration = Some(caps[0].to_string());
    }

    if ctx.is_empty() {
        None
    } else {
        Some(ctx)
    }
}

fn year_or(raw: Option<&str>, reference: NaiveDate) -> i32 {
    raw.and_then(|y| y.parse().ok()).unwrap_or(reference.year())
}

fn end_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 10).unwrap()
    }

    #[test]
    fn month_only_duration_resolves_to_end_of_month() {
        let ctx = extract_event_context("3월 한정 울쎄라 300샷", reference()).unwrap();
        assert_eq!(ctx.conditions.duration.as_deref(), Some("3월 한정"));
        assert_eq!(ctx.start_date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(ctx.end_date, NaiveDate::from_ymd_opt(2026, 3, 31));
    }

    #[test]
    fn february_end_of_month_and_explicit_year() {
        let ctx = extract_event_context("2028년 2월 한정", reference()).unwrap();
        assert_eq!(ctx.end_date, NaiveDate::from_ymd_opt(2028, 2, 29));
    }

    #[test]
    fn literal_until_date() {
        let ctx = extract_event_context("4월 15일까지 특가", reference()).unwrap();
        assert_eq!(ctx.end_date, NaiveDate::from_ymd_opt(2026, 4, 15));
        assert_eq!(ctx.conditions.duration.as_deref(), Some("4월 15일까지"));
    }

    #[test]
    fn label_keeps_the_promotion_name() {
        let ctx = extract_event_context("3월 이벤트 리쥬란 2cc", reference()).unwrap();
        assert_eq!(ctx.label.as_deref(), Some("3월 이벤트"));
    }

    #[test]
    fn limit_urgency_occasion_discount() {
        let ctx = extract_event_context(
            "오픈 기념 선착순 30명 마감 임박 20% 할인",
            reference(),
        )
        .unwrap();
        assert_eq!(ctx.conditions.limit.as_deref(), Some("선착순 30명"));
        assert_eq!(ctx.conditions.urgency.as_deref(), Some("마감 임박"));
        assert_eq!(ctx.conditions.occasion.as_deref(), Some("오픈 기념"));
        assert_eq!(ctx.conditions.discount, Some(20));
    }

    #[test]
    fn anniversary_and_date_range() {
        let ctx = extract_event_context("5주년 3/1~3/15", reference()).unwrap();
        assert_eq!(ctx.conditions.occasion.as_deref(), Some("5주년"));
        assert_eq!(ctx.start_date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(ctx.end_date, NaiveDate::from_ymd_opt(2026, 3, 15));
    }

    #[test]
    fn decimal_price_range_is_not_a_date() {
        assert!(extract_event_context("리쥬란 가격대 1.5~2.5만", reference()).is_none());
        assert_eq!(date_ranges("1.5~2.5만원").count(), 0);
        assert_eq!(date_ranges("13/1~13/5").count(), 0);
        assert_eq!(date_ranges("3.1~3.15 리쥬란").count(), 1);
    }

    #[test]
    fn plain_text_has_no_context() {
        assert!(extract_event_context("울쎄라 300샷 150만원", reference()).is_none());
        assert!(!has_event_keyword("울쎄라 300샷 150만원"));
    }
}
