//! Canonicalization of raw statement field values.
//!
//! Japanese bank and card exports mix full-width and half-width digits,
//! currency symbols and thousands separators freely; everything here folds
//! those variants down to one canonical form before any numeric or date
//! conversion happens.

use chrono::NaiveDate;

/// Fold full-width ASCII (U+FF01..U+FF5E), the ideographic space and the
/// full-width yen sign to their half-width equivalents. Other characters
/// pass through unchanged.
pub fn fold_width(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            '￥' => '¥',
            _ => c,
        })
        .collect()
}

/// Normalize an amount string to the strict integer grammar `-?[0-9]+`.
///
/// Handles full-width digits, `¥`/`円` symbols, thousands separators and an
/// accounting-style parenthesized negative. Returns `None` when the result
/// does not match the grammar.
pub fn normalize_amount(raw: &str) -> Option<String> {
    let folded = fold_width(raw);
    let trimmed = folded.trim();

    let (negative, inner) = if trimmed.starts_with('(') && trimmed.ends_with(')') && trimmed.len() >= 2 {
        (true, &trimmed[1..trimmed.len() - 1])
    } else {
        (false, trimmed)
    };

    let mut cleaned: String = inner
        .chars()
        .filter(|c| !matches!(c, '¥' | '円' | ',' | ' ' | '\t'))
        .collect();

    if negative {
        if cleaned.starts_with('-') {
            return None; // "(-100)" is malformed, not doubly negative
        }
        cleaned.insert(0, '-');
    }

    let digits = cleaned.strip_prefix('-').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(cleaned)
}

/// Parse a raw amount string to signed integer yen.
pub fn parse_amount(raw: &str) -> Option<i64> {
    normalize_amount(raw)?.parse().ok()
}

/// Accepts exactly `YYYY/MM/DD` and `YYYY-MM-DD` (full-width tolerated).
/// Lexically valid but impossible calendar dates are rejected.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = fold_width(raw);
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Width-fold, trim and collapse internal whitespace runs to a single space.
pub fn normalize_description(raw: &str) -> String {
    fold_width(raw).split_whitespace().collect::<Vec<_>>().join(" ")
}
