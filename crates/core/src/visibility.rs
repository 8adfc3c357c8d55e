use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::expense::{CategoryId, Expense, ExpenseId, UserId};

/// Description shown in place of the real one on a masked record.
pub const PRIVATE_LABEL: &str = "プライベート";

/// Per-record access policy for the other household member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    AmountOnly,
    CategoryTotal,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::AmountOnly => "AMOUNT_ONLY",
            Visibility::CategoryTotal => "CATEGORY_TOTAL",
        }
    }

    /// Unknown stored values decode to the most restrictive level.
    pub fn parse(s: &str) -> Self {
        match s {
            "PUBLIC" => Visibility::Public,
            "AMOUNT_ONLY" => Visibility::AmountOnly,
            _ => Visibility::CategoryTotal,
        }
    }
}

/// What a given viewer may see of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDecision {
    Full,
    Masked,
    Hidden,
}

/// The per-record decision table. Owners always see everything; non-owners
/// see what the record's visibility level grants.
pub fn decide(is_owner: bool, visibility: Visibility) -> ViewDecision {
    if is_owner {
        return ViewDecision::Full;
    }
    match visibility {
        Visibility::Public => ViewDecision::Full,
        Visibility::AmountOnly => ViewDecision::Masked,
        Visibility::CategoryTotal => ViewDecision::Hidden,
    }
}

/// A record as surfaced to a viewer. `masked` marks that sensitive fields
/// were replaced or cleared.
#[derive(Debug, Clone, Serialize)]
pub struct VisibleExpense {
    pub id: Option<ExpenseId>,
    pub owner_id: UserId,
    pub date: NaiveDate,
    pub amount: i64,
    pub description: String,
    pub category_id: Option<CategoryId>,
    pub memo: Option<String>,
    pub is_substitute: bool,
    pub actual_amount: Option<i64>,
    pub confirmed: bool,
    pub masked: bool,
}

/// Sum/count rollup for records hidden at `CategoryTotal` level.
/// `category_id` is `None` for the single uncategorized bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryAggregate {
    pub category_id: Option<CategoryId>,
    pub total_amount: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilteredExpenses {
    pub visible: Vec<VisibleExpense>,
    pub aggregates: Vec<CategoryAggregate>,
}

fn full_view(e: &Expense) -> VisibleExpense {
    VisibleExpense {
        id: e.id,
        owner_id: e.owner_id,
        date: e.date,
        amount: e.amount,
        description: e.description.clone(),
        category_id: e.category_id,
        memo: e.memo.clone(),
        is_substitute: e.is_substitute,
        actual_amount: e.actual_amount,
        confirmed: e.confirmed,
        masked: false,
    }
}

fn masked_view(e: &Expense) -> VisibleExpense {
    VisibleExpense {
        id: e.id,
        owner_id: e.owner_id,
        date: e.date,
        amount: e.amount,
        description: PRIVATE_LABEL.to_string(),
        category_id: e.category_id,
        memo: None,
        is_substitute: false,
        actual_amount: None,
        confirmed: e.confirmed,
        masked: true,
    }
}

/// Run every record through the per-record decision and fold hidden records
/// into category aggregates. Aggregate order follows first appearance in the
/// input, so the result is deterministic for a given input order.
pub fn filter_expenses(viewer: UserId, expenses: &[Expense]) -> FilteredExpenses {
    let mut visible = Vec::new();
    let mut aggregates: Vec<CategoryAggregate> = Vec::new();

    for e in expenses {
        match decide(e.owner_id == viewer, e.visibility) {
            ViewDecision::Full => visible.push(full_view(e)),
            ViewDecision::Masked => visible.push(masked_view(e)),
            ViewDecision::Hidden => {
                match aggregates.iter_mut().find(|a| a.category_id == e.category_id) {
                    Some(a) => {
                        a.total_amount += e.amount;
                        a.count += 1;
                    }
                    None => aggregates.push(CategoryAggregate {
                        category_id: e.category_id,
                        total_amount: e.amount,
                        count: 1,
                    }),
                }
            }
        }
    }

    FilteredExpenses { visible, aggregates }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expense::Provenance;

    fn expense(owner: i64, visibility: Visibility, amount: i64, category: Option<i64>) -> Expense {
        Expense {
            id: Some(ExpenseId(1)),
            owner_id: UserId(owner),
            date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            amount,
            description: "スーパーマルエツ".to_string(),
            category_id: category.map(CategoryId),
            visibility,
            memo: Some("secret".to_string()),
            is_substitute: true,
            actual_amount: Some(amount / 2),
            confirmed: true,
            provenance: Provenance::Manual,
            batch_id: None,
            fingerprint: None,
        }
    }

    #[test]
    fn visibility_parse_fails_closed() {
        assert_eq!(Visibility::parse("PUBLIC"), Visibility::Public);
        assert_eq!(Visibility::parse("AMOUNT_ONLY"), Visibility::AmountOnly);
        assert_eq!(Visibility::parse("CATEGORY_TOTAL"), Visibility::CategoryTotal);
        assert_eq!(Visibility::parse("SOMETHING_NEW"), Visibility::CategoryTotal);
    }

    #[test]
    fn owner_always_sees_full_detail() {
        for v in [Visibility::Public, Visibility::AmountOnly, Visibility::CategoryTotal] {
            assert_eq!(decide(true, v), ViewDecision::Full);
        }
    }

    #[test]
    fn non_owner_decision_table() {
        assert_eq!(decide(false, Visibility::Public), ViewDecision::Full);
        assert_eq!(decide(false, Visibility::AmountOnly), ViewDecision::Masked);
        assert_eq!(decide(false, Visibility::CategoryTotal), ViewDecision::Hidden);
    }

    #[test]
    fn masked_record_clears_sensitive_fields() {
        let e = expense(1, Visibility::AmountOnly, 3000, Some(7));
        let out = filter_expenses(UserId(2), std::slice::from_ref(&e));
        assert_eq!(out.visible.len(), 1);
        let m = &out.visible[0];
        assert!(m.masked);
        assert_eq!(m.description, PRIVATE_LABEL);
        assert_eq!(m.memo, None);
        assert!(!m.is_substitute);
        assert_eq!(m.actual_amount, None);
        // amount, date and category survive masking
        assert_eq!(m.amount, 3000);
        assert_eq!(m.date, e.date);
        assert_eq!(m.category_id, Some(CategoryId(7)));
    }

    #[test]
    fn category_total_records_fold_into_aggregates() {
        let rows = vec![
            expense(1, Visibility::CategoryTotal, 1000, Some(3)),
            expense(1, Visibility::CategoryTotal, 2500, Some(3)),
            expense(1, Visibility::CategoryTotal, 400, None),
        ];
        let out = filter_expenses(UserId(2), &rows);
        assert!(out.visible.is_empty());
        assert_eq!(
            out.aggregates,
            vec![
                CategoryAggregate { category_id: Some(CategoryId(3)), total_amount: 3500, count: 2 },
                CategoryAggregate { category_id: None, total_amount: 400, count: 1 },
            ]
        );
    }

    #[test]
    fn owner_sees_own_category_total_record() {
        let rows = vec![expense(1, Visibility::CategoryTotal, 1000, Some(3))];
        let out = filter_expenses(UserId(1), &rows);
        assert_eq!(out.visible.len(), 1);
        assert!(!out.visible[0].masked);
        assert_eq!(out.visible[0].memo.as_deref(), Some("secret"));
        assert!(out.aggregates.is_empty());
    }

    #[test]
    fn mixed_batch_is_order_preserving_and_deterministic() {
        let rows = vec![
            expense(1, Visibility::Public, 100, Some(1)),
            expense(1, Visibility::CategoryTotal, 200, Some(2)),
            expense(2, Visibility::CategoryTotal, 300, Some(2)),
            expense(1, Visibility::AmountOnly, 400, Some(1)),
        ];
        let out = filter_expenses(UserId(2), &rows);
        // Row 3 is the viewer's own, so it stays fully visible.
        assert_eq!(out.visible.len(), 3);
        assert_eq!(out.visible[0].amount, 100);
        assert_eq!(out.visible[1].amount, 300);
        assert_eq!(out.visible[2].amount, 400);
        assert_eq!(
            out.aggregates,
            vec![CategoryAggregate { category_id: Some(CategoryId(2)), total_amount: 200, count: 1 }]
        );
    }
}
