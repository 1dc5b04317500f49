//! Turning displayed prices and counts into numbers.
//!
//! Anything that does not clearly read as a number becomes `None`.
//! "Contact Agent" is not a price of zero.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AMOUNT: Regex =
        Regex::new(r"(?i)(\$)?\s*(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d+))?\s*(million|mil|m|k)?\b")
            .expect("amount pattern is valid");
    static ref COUNT: Regex = Regex::new(r"\d+").expect("count pattern is valid");
}

/// Parse a displayed price into whole dollars.
///
/// Takes the first amount that looks like money: it has a `$`, a `k`/`m`
/// suffix, or thousands separators. Ranges resolve to their lower bound.
/// Bare digit runs (phone numbers, dates) and areas such as `650m²` are
/// not prices.
pub fn normalize_price(text: &str) -> Option<u64> {
    AMOUNT.captures_iter(text).find_map(|caps| {
        let dollar = caps.get(1).is_some();
        let whole = caps.get(2)?.as_str();
        let fraction = caps.get(3).map(|m| m.as_str());
        let end = caps.get(0)?.end();
        let suffix = caps
            .get(4)
            .map(|m| m.as_str().to_lowercase())
            .filter(|_| !text[end..].starts_with(|c: char| c == '²' || c == '³'));

        let grouped = whole.contains(',');
        let digits = whole.replace(',', "");
        if !(dollar || suffix.is_some() || grouped) {
            return None;
        }
        if digits.starts_with('0') && digits.len() >= 8 {
            return None;
        }

        let mut value: f64 = digits.parse().ok()?;
        if let Some(fraction) = fraction {
            value += format!("0.{fraction}").parse::<f64>().ok()?;
        }
        let multiplier = match suffix.as_deref() {
            Some("k") => 1_000.0,
            Some("m") | Some("mil") | Some("million") => 1_000_000.0,
            _ => 1.0,
        };
        let amount = (value * multiplier).round();
        (amount.is_finite() && amount >= 0.0 && amount <= u64::MAX as f64).then_some(amount as u64)
    })
}

/// Parse a feature count such as "2 Beds" or "1".
pub fn normalize_count(text: &str) -> Option<u32> {
    COUNT.find(text)?.as_str().parse().ok()
}
