//! EDTF level 1 conversion.
//!
//! Stored values such as `1892`, `1892-03`, `18uu` or `..` become document
//! objects with ISO `lower`/`upper` bounds and an integer `year_range`. The
//! pre-revision `X` placeholder is treated as `u`; the literal `..` marks an
//! open bound and substitutes [`DATE_MIN`] or [`DATE_MAX`] depending on its
//! interval position.

use chrono::{Datelike, NaiveDate};
use serde_json::{json, Value};

use tessella_config::EdtfPosition;

/// Sentinel for an open start bound.
pub const DATE_MIN: &str = "-999999999";
/// Sentinel for an open end bound.
pub const DATE_MAX: &str = "999999999";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub gte: i32,
    pub lte: i32,
}

/// Converted EDTF value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdtfValue {
    pub text: String,
    pub lower: String,
    pub upper: String,
    pub year_range: Option<YearRange>,
}

impl EdtfValue {
    /// An open bound (`..`); both bounds are sentinels and no year range is
    /// defined.
    pub fn is_open(&self) -> bool {
        self.lower == DATE_MIN || self.lower == DATE_MAX
    }

    pub fn to_json(&self) -> Value {
        let mut object = json!({
            "text": self.text,
            "lower": self.lower,
            "upper": self.upper,
        });
        if let (Some(range), Some(map)) = (&self.year_range, object.as_object_mut()) {
            map.insert(
                "year_range".to_string(),
                json!({ "gte": range.gte, "lte": range.lte }),
            );
        }
        object
    }
}

/// Parses one EDTF expression. `position` decides which sentinel an open
/// `..` maps to.
pub fn parse(text: &str, position: EdtfPosition) -> Result<EdtfValue, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty EDTF expression".to_string());
    }
    if trimmed == ".." {
        let sentinel = match position {
            EdtfPosition::Start => DATE_MIN,
            EdtfPosition::End => DATE_MAX,
        };
        return Ok(EdtfValue {
            text: trimmed.to_string(),
            lower: sentinel.to_string(),
            upper: sentinel.to_string(),
            year_range: None,
        });
    }

    // X placeholders predate the current revision of the format.
    let normalized: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '?' | '~' | '%'))
        .map(|c| if c == 'X' { 'u' } else { c })
        .collect();

    if let Some((left, right)) = normalized.split_once('/') {
        let start = parse(left, EdtfPosition::Start)?;
        let end = parse(right, EdtfPosition::End)?;
        let year_range = match (&start.year_range, &end.year_range) {
            (Some(lower), Some(upper)) => Some(YearRange {
                gte: lower.gte,
                lte: upper.lte,
            }),
            _ => None,
        };
        return Ok(EdtfValue {
            text: trimmed.to_string(),
            lower: start.lower,
            upper: end.upper,
            year_range,
        });
    }

    parse_date(trimmed, &normalized)
}

fn parse_date(text: &str, normalized: &str) -> Result<EdtfValue, String> {
    let mut parts = normalized.splitn(3, '-');
    let year = parts.next().unwrap_or_default();
    let month = parts.next();
    let day = parts.next();

    if year.is_empty() || year.chars().all(|c| c == 'u') {
        return Err(format!("`{text}` has no usable year"));
    }
    let year_lower: i32 = year
        .replace('u', "0")
        .parse()
        .map_err(|_| format!("`{text}` has an invalid year"))?;
    let year_upper: i32 = year
        .replace('u', "9")
        .parse()
        .map_err(|_| format!("`{text}` has an invalid year"))?;

    let (month_lower, month_upper) = match month {
        None => (1, 12),
        Some(raw) if raw.contains('u') => (1, 12),
        Some(raw) => {
            let value: u32 = raw
                .parse()
                .map_err(|_| format!("`{text}` has an invalid month"))?;
            if !(1..=12).contains(&value) {
                return Err(format!("`{text}` has an invalid month"));
            }
            (value, value)
        }
    };

    let last_day = days_in_month(year_upper, month_upper)?;
    let (day_lower, day_upper) = match day {
        None => (1, last_day),
        Some(raw) if raw.contains('u') => (1, last_day),
        Some(raw) => {
            let value: u32 = raw
                .parse()
                .map_err(|_| format!("`{text}` has an invalid day"))?;
            if value < 1 || value > days_in_month(year_lower, month_lower)? {
                return Err(format!("`{text}` has an invalid day"));
            }
            (value, value)
        }
    };

    let lower = NaiveDate::from_ymd_opt(year_lower, month_lower, day_lower)
        .ok_or_else(|| format!("`{text}` is not a valid date"))?;
    let upper = NaiveDate::from_ymd_opt(year_upper, month_upper, day_upper)
        .ok_or_else(|| format!("`{text}` is not a valid date"))?;

    Ok(EdtfValue {
        text: text.to_string(),
        lower: lower.format("%Y-%m-%d").to_string(),
        upper: upper.format("%Y-%m-%d").to_string(),
        year_range: Some(YearRange {
            gte: year_lower,
            lte: year_upper,
        }),
    })
}

fn days_in_month(year: i32, month: u32) -> Result<u32, String> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| format!("invalid month {month}"))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| format!("invalid month {month}"))?;
    Ok(next.signed_duration_since(first).num_days() as u32)
}

/// Combines start and end values into an interval document.
///
/// A missing or open start borrows the end's lower bound; a missing end
/// borrows the start's upper bound; an open end means "still ongoing" and
/// maps to today. The top-level `year_range` is synthesised from the final
/// bounds.
pub fn interval(
    start: Option<&EdtfValue>,
    end: Option<&EdtfValue>,
    today: NaiveDate,
) -> Option<Value> {
    if start.is_none() && end.is_none() {
        return None;
    }

    let lower = match start {
        Some(value) if !value.is_open() => Some(value.lower.clone()),
        _ => end.map(|value| value.lower.clone()),
    };
    let upper = match end {
        None => start.map(|value| value.upper.clone()),
        Some(value) if value.is_open() => Some(today.format("%Y-%m-%d").to_string()),
        Some(value) => Some(value.upper.clone()),
    };

    let mut object = serde_json::Map::new();
    if let Some(value) = start {
        object.insert("start".to_string(), value.to_json());
    }
    if let Some(value) = end {
        object.insert("end".to_string(), value.to_json());
    }
    if let Some(lower) = &lower {
        object.insert("lower".to_string(), json!(lower));
    }
    if let Some(upper) = &upper {
        object.insert("upper".to_string(), json!(upper));
    }
    if let (Some(gte), Some(lte)) = (
        lower.as_deref().and_then(year_of),
        upper.as_deref().and_then(year_of),
    ) {
        object.insert("year_range".to_string(), json!({ "gte": gte, "lte": lte }));
    }
    Some(Value::Object(object))
}

fn year_of(date: &str) -> Option<i32> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok().map(|d| d.year())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_year_expands_to_the_full_year() {
        let value = parse("1892", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1892-01-01");
        assert_eq!(value.upper, "1892-12-31");
        assert_eq!(value.year_range, Some(YearRange { gte: 1892, lte: 1892 }));
    }

    #[test]
    fn year_month_expands_to_the_month() {
        let value = parse("1892-02", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1892-02-01");
        assert_eq!(value.upper, "1892-02-29");
    }

    #[test]
    fn full_date_maps_both_bounds() {
        let value = parse("1892-03-01", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1892-03-01");
        assert_eq!(value.upper, "1892-03-01");
    }

    #[test]
    fn unspecified_digits_widen_the_range() {
        let value = parse("18uu", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1800-01-01");
        assert_eq!(value.upper, "1899-12-31");
        assert_eq!(value.year_range, Some(YearRange { gte: 1800, lte: 1899 }));
    }

    #[test]
    fn x_placeholder_behaves_like_u() {
        let value = parse("18XX", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1800-01-01");
        assert_eq!(value.upper, "1899-12-31");
    }

    #[test]
    fn open_bound_uses_positional_sentinel() {
        let start = parse("..", EdtfPosition::Start).unwrap();
        assert_eq!(start.lower, DATE_MIN);
        assert_eq!(start.upper, DATE_MIN);
        assert!(start.year_range.is_none());

        let end = parse("..", EdtfPosition::End).unwrap();
        assert_eq!(end.lower, DATE_MAX);
        assert_eq!(end.upper, DATE_MAX);
        assert!(end.is_open());
    }

    #[test]
    fn slash_interval_takes_outer_bounds() {
        let value = parse("1890/1895", EdtfPosition::Start).unwrap();
        assert_eq!(value.lower, "1890-01-01");
        assert_eq!(value.upper, "1895-12-31");
        assert_eq!(value.year_range, Some(YearRange { gte: 1890, lte: 1895 }));
    }

    #[test]
    fn uncertainty_qualifiers_are_stripped() {
        let value = parse("1892?", EdtfPosition::Start).unwrap();
        assert_eq!(value.text, "1892?");
        assert_eq!(value.lower, "1892-01-01");
    }

    #[test]
    fn open_end_interval_runs_until_today() {
        let start = parse("1892-03-01", EdtfPosition::Start).unwrap();
        let end = parse("..", EdtfPosition::End).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let doc = interval(Some(&start), Some(&end), today).unwrap();
        assert_eq!(doc["lower"], "1892-03-01");
        assert_eq!(doc["upper"], "2026-08-30");
        assert_eq!(doc["year_range"], json!({ "gte": 1892, "lte": 2026 }));
        assert_eq!(doc["end"]["lower"], DATE_MAX);
        assert_eq!(doc["end"]["text"], "..");
    }

    #[test]
    fn missing_end_borrows_the_start_upper_bound() {
        let start = parse("1892", EdtfPosition::Start).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let doc = interval(Some(&start), None, today).unwrap();
        assert_eq!(doc["lower"], "1892-01-01");
        assert_eq!(doc["upper"], "1892-12-31");
    }

    #[test]
    fn missing_start_borrows_the_end_lower_bound() {
        let end = parse("1900", EdtfPosition::End).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let doc = interval(None, Some(&end), today).unwrap();
        assert_eq!(doc["lower"], "1900-01-01");
        assert_eq!(doc["upper"], "1900-12-31");
        assert_eq!(doc["year_range"], json!({ "gte": 1900, "lte": 1900 }));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!(parse("uuuu", EdtfPosition::Start).is_err());
        assert!(parse("1892-13", EdtfPosition::Start).is_err());
        assert!(parse("1892-02-30", EdtfPosition::Start).is_err());
    }
}
