use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::visibility::Visibility;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseId(pub i64);

/// Whether a record was keyed in by hand or produced by statement ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Manual,
    Imported,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Provenance::Manual,
            _ => Provenance::Imported,
        }
    }
}

/// A persisted household expense.
///
/// Amounts are signed integer yen. `actual_amount` is the portion the owner
/// actually paid out of pocket when the record is a substitute payment; it is
/// never larger than `amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: Option<ExpenseId>,
    pub owner_id: UserId,
    pub date: NaiveDate,
    pub amount: i64,
    pub description: String,
    pub category_id: Option<CategoryId>,
    pub visibility: Visibility,
    pub memo: Option<String>,
    pub is_substitute: bool,
    pub actual_amount: Option<i64>,
    pub confirmed: bool,
    pub provenance: Provenance,
    pub batch_id: Option<i64>,
    /// Content-address used for count-based duplicate detection.
    /// Present on imported rows, absent on manual entries.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<CategoryId>,
    pub name: String,
    pub default_visibility: Visibility,
    pub is_fixed_cost: bool,
    pub sort_order: i64,
}

/// Per-user override of a category's default visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityOverride {
    pub user_id: UserId,
    pub category_id: CategoryId,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Outcome of classifying one expense. Transient: written into the expense
/// record and then discarded.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub category_id: Option<CategoryId>,
    pub category_name: Option<String>,
    pub confidence: Confidence,
    pub visibility: Visibility,
    pub confirmed: bool,
}

impl ClassificationResult {
    pub fn fallback(category_id: Option<CategoryId>, category_name: Option<String>, visibility: Visibility) -> Self {
        ClassificationResult {
            category_id,
            category_name,
            confidence: Confidence::Low,
            visibility,
            confirmed: false,
        }
    }
}
