//! Static per-institution statement format definitions.
//!
//! Supporting a new institution means adding one `FormatMapping` entry here;
//! the parser itself never changes.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementEncoding {
    Utf8,
    ShiftJis,
}

/// Where one canonical field comes from in a source record.
///
/// `columns` is searched in order (primary header name first, then declared
/// alternates). When `pattern` is set the value is instead extracted from
/// another column's text, taking the first capture group.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub columns: &'static [&'static str],
    pub pattern: Option<(&'static str, &'static str)>,
}

impl FieldSpec {
    pub const fn columns(columns: &'static [&'static str]) -> Self {
        FieldSpec { columns, pattern: None }
    }

    pub const fn pattern(column: &'static str, pattern: &'static str) -> Self {
        FieldSpec { columns: &[], pattern: Some((column, pattern)) }
    }
}

#[derive(Debug, Clone)]
pub struct FormatMapping {
    pub id: &'static str,
    pub name: &'static str,
    pub encoding: StatementEncoding,
    pub delimiter: u8,
    /// Prefix rows before the header row (title lines, download notes).
    pub skip_rows: usize,
    pub date: FieldSpec,
    pub description: FieldSpec,
    pub amount: FieldSpec,
    pub payment_method: Option<FieldSpec>,
    pub installments: Option<FieldSpec>,
    pub memo: Option<FieldSpec>,
}

impl FormatMapping {
    pub fn find(id: &str) -> Option<&'static FormatMapping> {
        MAPPINGS.iter().find(|m| m.id == id)
    }
}

pub static MAPPINGS: &[FormatMapping] = &[
    // Mizuho-style bank download: Shift_JIS, one title line before the header.
    FormatMapping {
        id: "mizuho-bank",
        name: "みずほ銀行 入出金明細",
        encoding: StatementEncoding::ShiftJis,
        delimiter: b',',
        skip_rows: 1,
        date: FieldSpec::columns(&["日付", "取引日"]),
        description: FieldSpec::columns(&["お取引内容", "摘要"]),
        amount: FieldSpec::columns(&["お引出し", "金額"]),
        payment_method: None,
        installments: None,
        memo: Some(FieldSpec::columns(&["メモ"])),
    },
    // Rakuten card CSV: UTF-8, installment count embedded in the payment
    // method text ("分割12回").
    FormatMapping {
        id: "rakuten-card",
        name: "楽天カード 利用明細",
        encoding: StatementEncoding::Utf8,
        delimiter: b',',
        skip_rows: 0,
        date: FieldSpec::columns(&["利用日"]),
        description: FieldSpec::columns(&["利用店名・商品名", "利用店名"]),
        amount: FieldSpec::columns(&["利用金額", "支払総額"]),
        payment_method: Some(FieldSpec::columns(&["支払方法"])),
        installments: Some(FieldSpec::pattern("支払方法", r"分割(\d+)回")),
        memo: None,
    },
    // JCB card CSV: UTF-8, refunds rendered as parenthesized amounts.
    FormatMapping {
        id: "jcb-card",
        name: "JCBカード ご利用代金明細",
        encoding: StatementEncoding::Utf8,
        delimiter: b',',
        skip_rows: 0,
        date: FieldSpec::columns(&["ご利用日", "利用日"]),
        description: FieldSpec::columns(&["ご利用先など", "ご利用先"]),
        amount: FieldSpec::columns(&["ご利用金額"]),
        payment_method: Some(FieldSpec::columns(&["支払区分"])),
        installments: None,
        memo: Some(FieldSpec::columns(&["備考"])),
    },
];
