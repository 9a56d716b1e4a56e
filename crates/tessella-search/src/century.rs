//! Uncertain-century conversion.
//!
//! Centuries are stored as Roman numerals, optionally suffixed with `?` to
//! mark uncertainty. The numeric rank is preserved so sort and filter can
//! work chronologically.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static CENTURY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([IVXLCDM]+)(\?)?$").expect("hard-coded regex compiles"));

/// One converted century token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Century {
    pub display: String,
    pub without_uncertain: String,
    pub numeric: u32,
}

impl Century {
    pub fn to_json(&self) -> Value {
        json!({
            "display": self.display,
            "withoutUncertain": self.without_uncertain,
            "numeric": self.numeric,
        })
    }
}

/// Parses a single token such as `XVII` or `XVII?`.
pub fn parse(token: &str) -> Result<Century, String> {
    let trimmed = token.trim();
    let captures = CENTURY
        .captures(trimmed)
        .ok_or_else(|| format!("`{trimmed}` is not a century"))?;
    let numeral = captures
        .get(1)
        .map(|m| m.as_str())
        .ok_or_else(|| format!("`{trimmed}` is not a century"))?;
    let numeric = roman_to_u32(numeral).ok_or_else(|| format!("`{numeral}` is not a numeral"))?;
    Ok(Century {
        display: trimmed.to_string(),
        without_uncertain: numeral.to_string(),
        numeric,
    })
}

fn roman_to_u32(numeral: &str) -> Option<u32> {
    fn digit(c: char) -> Option<u32> {
        Some(match c {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            'C' => 100,
            'D' => 500,
            'M' => 1000,
            _ => return None,
        })
    }

    let mut total: u32 = 0;
    let mut previous: u32 = 0;
    for c in numeral.chars().rev() {
        let value = digit(c)?;
        if value < previous {
            total = total.checked_sub(value)?;
        } else {
            total = total.checked_add(value)?;
            previous = value;
        }
    }
    (total > 0).then_some(total)
}
