use std::collections::HashMap;

use chrono::NaiveDate;
use kakeibo_core::{
    CategoryId, ClassificationResult, Expense, ExpenseId, Provenance, UserId, Visibility,
};
use sqlx::Sqlite;

use crate::batches::refresh_pending_count;
use crate::db::DbPool;

type ExpenseRow = (
    i64,            // id
    i64,            // owner_id
    NaiveDate,      // date
    i64,            // amount
    String,         // description
    Option<i64>,    // category_id
    String,         // visibility
    Option<String>, // memo
    i64,            // is_substitute
    Option<i64>,    // actual_amount
    i64,            // confirmed
    String,         // provenance
    Option<i64>,    // batch_id
    Option<String>, // fingerprint
);

const COLUMNS: &str = "id, owner_id, date, amount, description, category_id, visibility, memo, \
                       is_substitute, actual_amount, confirmed, provenance, batch_id, fingerprint";

fn from_row(r: ExpenseRow) -> Expense {
    Expense {
        id: Some(ExpenseId(r.0)),
        owner_id: UserId(r.1),
        date: r.2,
        amount: r.3,
        description: r.4,
        category_id: r.5.map(CategoryId),
        visibility: Visibility::parse(&r.6),
        memo: r.7,
        is_substitute: r.8 != 0,
        actual_amount: r.9,
        confirmed: r.10 != 0,
        provenance: Provenance::parse(&r.11),
        batch_id: r.12,
        fingerprint: r.13,
    }
}

/// How many rows the owner already holds per dedupe fingerprint. Drives
/// count-based duplicate detection during ingestion.
pub async fn fingerprint_counts(
    pool: &DbPool,
    owner: UserId,
) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT fingerprint, COUNT(*) FROM expenses \
         WHERE owner_id = ? AND fingerprint IS NOT NULL GROUP BY fingerprint",
    )
    .bind(owner.0)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Insert one expense inside the caller's transaction.
pub async fn insert_in_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    e: &Expense,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO expenses (owner_id, date, amount, description, category_id, visibility,
                              memo, is_substitute, actual_amount, confirmed, provenance,
                              batch_id, fingerprint)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(e.owner_id.0)
    .bind(e.date)
    .bind(e.amount)
    .bind(&e.description)
    .bind(e.category_id.map(|c| c.0))
    .bind(e.visibility.as_str())
    .bind(&e.memo)
    .bind(e.is_substitute as i64)
    .bind(e.actual_amount)
    .bind(e.confirmed as i64)
    .bind(e.provenance.as_str())
    .bind(e.batch_id)
    .bind(&e.fingerprint)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_manual(pool: &DbPool, e: &Expense) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let id = insert_in_tx(&mut tx, e).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn list_for_batch(pool: &DbPool, batch_id: i64) -> Result<Vec<Expense>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ExpenseRow>(&format!(
        "SELECT {COLUMNS} FROM expenses WHERE batch_id = ? ORDER BY id"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}

/// All household expenses in a month, every owner; the caller runs the
/// result through the visibility filter before it reaches anyone.
pub async fn list_for_month(
    pool: &DbPool,
    year: i32,
    month: u32,
) -> Result<Vec<Expense>, sqlx::Error> {
    let prefix = format!("{year:04}-{month:02}-%");
    let rows = sqlx::query_as::<_, ExpenseRow>(&format!(
        "SELECT {COLUMNS} FROM expenses WHERE date LIKE ? ORDER BY date, id"
    ))
    .bind(prefix)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}

/// Owner-only delete. Returns whether a row was actually removed.
pub async fn delete_expense(
    pool: &DbPool,
    id: ExpenseId,
    owner: UserId,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM expenses WHERE id = ? AND owner_id = ?")
        .bind(id.0)
        .bind(owner.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Write classification outcomes in one atomic transaction, separate from
/// ingestion, and recompute the batch's pending-confirmation count.
pub async fn apply_classification(
    pool: &DbPool,
    batch_id: i64,
    results: &[(ExpenseId, ClassificationResult)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (id, r) in results {
        sqlx::query(
            "UPDATE expenses SET category_id = ?, visibility = ?, confirmed = ? WHERE id = ?",
        )
        .bind(r.category_id.map(|c| c.0))
        .bind(r.visibility.as_str())
        .bind(r.confirmed as i64)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
    }
    refresh_pending_count(&mut tx, batch_id).await?;
    tx.commit().await?;
    Ok(())
}
