pub mod expense;
pub mod period;
pub mod visibility;

pub use expense::{
    Category, CategoryId, ClassificationResult, Confidence, Expense, ExpenseId, Provenance,
    UserId, VisibilityOverride,
};
pub use period::Period;
pub use visibility::{
    filter_expenses, CategoryAggregate, FilteredExpenses, ViewDecision, Visibility,
    VisibleExpense, PRIVATE_LABEL,
};
