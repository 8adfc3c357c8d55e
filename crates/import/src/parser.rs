//! Statement parser: raw export bytes + a format mapping → canonical rows.
//!
//! Individual malformed rows are skipped; a structurally broken stream
//! (an unterminated quoted field) is a fatal error.

use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

use crate::mapping::{FieldSpec, FormatMapping, StatementEncoding};
use crate::value;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed statement data: {0}")]
    Csv(#[from] csv::Error),
}

/// One parsed transaction, after institution-specific normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRow {
    pub date: NaiveDate,
    pub description: String,
    /// Signed integer yen.
    pub amount: i64,
    pub payment_method: Option<String>,
    pub installments: Option<u32>,
    pub memo: Option<String>,
}

fn decode(bytes: &[u8], encoding: StatementEncoding) -> String {
    match encoding {
        StatementEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        StatementEncoding::ShiftJis => encoding_rs::SHIFT_JIS.decode(bytes).0.into_owned(),
    }
}

fn skip_lines(text: &str, n: usize) -> &str {
    let mut rest = text;
    for _ in 0..n {
        match rest.find('\n') {
            Some(i) => rest = &rest[i + 1..],
            None => return "",
        }
    }
    rest
}

fn header_index(headers: &[String], name: &str) -> Option<usize> {
    let wanted = value::fold_width(name);
    headers.iter().position(|h| *h == wanted)
}

/// Resolve a field per the mapping's declared sources: exact column name,
/// then alternates in order, then pattern extraction (first capture group).
fn extract(
    spec: &FieldSpec,
    headers: &[String],
    record: &csv::StringRecord,
    regexes: &HashMap<&'static str, Regex>,
) -> Option<String> {
    for col in spec.columns {
        if let Some(idx) = header_index(headers, col) {
            if let Some(raw) = record.get(idx) {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    if let Some((source, pattern)) = spec.pattern {
        let idx = header_index(headers, source)?;
        let text = record.get(idx)?;
        let re = regexes.get(pattern)?;
        return re
            .captures(&value::fold_width(text))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
    }
    None
}

fn compile_patterns(mapping: &FormatMapping) -> HashMap<&'static str, Regex> {
    let specs = [
        Some(&mapping.date),
        Some(&mapping.description),
        Some(&mapping.amount),
        mapping.payment_method.as_ref(),
        mapping.installments.as_ref(),
        mapping.memo.as_ref(),
    ];
    let mut regexes = HashMap::new();
    for spec in specs.into_iter().flatten() {
        if let Some((_, pattern)) = spec.pattern {
            if let Ok(re) = Regex::new(pattern) {
                regexes.insert(pattern, re);
            }
        }
    }
    regexes
}

/// Parse a whole statement export. Order-preserving; no state survives
/// between calls.
pub fn parse_statement(bytes: &[u8], mapping: &FormatMapping) -> Result<Vec<CanonicalRow>, ParseError> {
    let text = decode(bytes, mapping.encoding);
    let body = skip_lines(&text, mapping.skip_rows);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(mapping.delimiter)
        .has_headers(true)
        .from_reader(body.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| value::fold_width(h.trim()))
        .collect();

    let regexes = compile_patterns(mapping);
    let mut rows = Vec::new();

    for result in reader.records() {
        let record = result?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        let Some(date) = extract(&mapping.date, &headers, &record, &regexes)
            .and_then(|s| value::parse_date(&s))
        else {
            continue;
        };
        let description = match extract(&mapping.description, &headers, &record, &regexes) {
            Some(s) => value::normalize_description(&s),
            None => continue,
        };
        if description.is_empty() {
            continue;
        }
        let Some(amount) = extract(&mapping.amount, &headers, &record, &regexes)
            .and_then(|s| value::parse_amount(&s))
        else {
            continue;
        };

        let payment_method = mapping
            .payment_method
            .as_ref()
            .and_then(|spec| extract(spec, &headers, &record, &regexes));
        let installments = mapping
            .installments
            .as_ref()
            .and_then(|spec| extract(spec, &headers, &record, &regexes))
            .and_then(|s| value::fold_width(&s).trim().parse().ok());
        let memo = mapping
            .memo
            .as_ref()
            .and_then(|spec| extract(spec, &headers, &record, &regexes));

        rows.push(CanonicalRow {
            date,
            description,
            amount,
            payment_method,
            installments,
            memo,
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FormatMapping;

    fn mapping(id: &str) -> &'static FormatMapping {
        FormatMapping::find(id).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_rakuten_card_with_installment_pattern() {
        let data = "利用日,利用店名・商品名,支払方法,利用金額\n\
                    2024/03/01,スーパーマルエツ,1回払い,2480\n\
                    2024/03/02,ヨドバシカメラ,分割12回,120000\n";
        let rows = parse_statement(data.as_bytes(), mapping("rakuten-card")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, date(2024, 3, 1));
        assert_eq!(rows[0].amount, 2480);
        assert_eq!(rows[0].installments, None);
        assert_eq!(rows[1].installments, Some(12));
        assert_eq!(rows[1].payment_method.as_deref(), Some("分割12回"));
    }

    #[test]
    fn decodes_shift_jis_and_skips_title_row() {
        let text = "みずほ銀行　入出金明細\n\
                    日付,お取引内容,お引出し\n\
                    2024/03/05,コンビニ　セブン,１，２００\n";
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(text);
        let rows = parse_statement(&encoded, mapping("mizuho-bank")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "コンビニ セブン");
        assert_eq!(rows[0].amount, 1200);
    }

    #[test]
    fn alternate_column_names_are_honored() {
        // "取引日" and "金額" are declared alternates for mizuho.
        let text = "タイトル行\n取引日,摘要,金額\n2024-03-05,家賃,85000\n";
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(text);
        let rows = parse_statement(&encoded, mapping("mizuho-bank")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 85000);
    }

    #[test]
    fn parenthesized_amount_is_negative() {
        let data = "ご利用日,ご利用先など,ご利用金額,備考\n\
                    2024/03/10,返品処理,(3200),返金\n";
        let rows = parse_statement(data.as_bytes(), mapping("jcb-card")).unwrap();
        assert_eq!(rows[0].amount, -3200);
        assert_eq!(rows[0].memo.as_deref(), Some("返金"));
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let data = "利用日,利用店名・商品名,利用金額\n\
                    2024/02/30,impossible date,100\n\
                    2024/03/01,,200\n\
                    2024/03/02,ok row,not-a-number\n\
                    2024/03/03,valid,500\n";
        let rows = parse_statement(data.as_bytes(), mapping("rakuten-card")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "valid");
    }

    #[test]
    fn unterminated_quote_is_fatal() {
        let data = "利用日,利用店名・商品名,利用金額\n2024/03/01,\"broken,100\n2024/03/02,ok,200\n";
        assert!(parse_statement(data.as_bytes(), mapping("rakuten-card")).is_err());
    }

    #[test]
    fn output_preserves_input_order() {
        let data = "利用日,利用店名・商品名,利用金額\n\
                    2024/03/03,c,3\n2024/03/01,a,1\n2024/03/02,b,2\n";
        let rows = parse_statement(data.as_bytes(), mapping("rakuten-card")).unwrap();
        let descs: Vec<_> = rows.iter().map(|r| r.description.as_str()).collect();
        assert_eq!(descs, vec!["c", "a", "b"]);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let data = "利用日,利用店名・商品名,利用金額\n\n2024/03/01,a,1\n\n";
        let rows = parse_statement(data.as_bytes(), mapping("rakuten-card")).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
