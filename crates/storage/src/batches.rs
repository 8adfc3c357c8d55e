use kakeibo_core::{Period, UserId};
use sqlx::Sqlite;

use crate::db::DbPool;

/// Persisted record of one successful statement ingestion.
#[derive(Debug, Clone)]
pub struct StatementBatch {
    pub id: i64,
    pub owner_id: UserId,
    pub institution: String,
    pub period: String,
    pub file_digest: String,
    pub total_rows: i64,
    pub pending_rows: i64,
}

fn from_row(row: (i64, i64, String, String, String, i64, i64)) -> StatementBatch {
    StatementBatch {
        id: row.0,
        owner_id: UserId(row.1),
        institution: row.2,
        period: row.3,
        file_digest: row.4,
        total_rows: row.5,
        pending_rows: row.6,
    }
}

const COLUMNS: &str = "id, owner_id, institution, period, file_digest, total_rows, pending_rows";

pub async fn find_by_digest(
    pool: &DbPool,
    owner: UserId,
    digest: &str,
) -> Result<Option<StatementBatch>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, i64, String, String, String, i64, i64)>(&format!(
        "SELECT {COLUMNS} FROM statement_batches WHERE owner_id = ? AND file_digest = ?"
    ))
    .bind(owner.0)
    .bind(digest)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(from_row))
}

pub async fn get_batch(pool: &DbPool, id: i64) -> Result<Option<StatementBatch>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, i64, String, String, String, i64, i64)>(&format!(
        "SELECT {COLUMNS} FROM statement_batches WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(from_row))
}

/// Insert a batch inside the caller's transaction, so the batch and its rows
/// appear together or not at all.
pub async fn insert_batch(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    owner: UserId,
    institution: &str,
    period: Period,
    file_digest: &str,
    total_rows: i64,
    pending_rows: i64,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO statement_batches (owner_id, institution, period, file_digest, total_rows, pending_rows)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(owner.0)
    .bind(institution)
    .bind(period.to_string())
    .bind(file_digest)
    .bind(total_rows)
    .bind(pending_rows)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Recompute the batch's rows-pending-confirmation count from its rows.
pub async fn refresh_pending_count(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    batch_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE statement_batches
        SET pending_rows = (SELECT COUNT(*) FROM expenses WHERE batch_id = ? AND confirmed = 0)
        WHERE id = ?
        "#,
    )
    .bind(batch_id)
    .bind(batch_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_db, is_unique_violation};

    #[tokio::test]
    async fn insert_and_find_by_digest() {
        let pool = create_memory_db().await.unwrap();
        let period = Period::parse("2024-03").unwrap();

        let mut tx = pool.begin().await.unwrap();
        let id = insert_batch(&mut tx, UserId(1), "rakuten-card", period, "abc123", 5, 5)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let batch = find_by_digest(&pool, UserId(1), "abc123").await.unwrap().unwrap();
        assert_eq!(batch.id, id);
        assert_eq!(batch.total_rows, 5);
        assert_eq!(batch.period, "2024-03");

        assert!(find_by_digest(&pool, UserId(2), "abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_owner_digest_pair_is_unique_violation() {
        let pool = create_memory_db().await.unwrap();
        let period = Period::parse("2024-03").unwrap();

        let mut tx = pool.begin().await.unwrap();
        insert_batch(&mut tx, UserId(1), "rakuten-card", period, "abc123", 5, 5)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let err = insert_batch(&mut tx, UserId(1), "rakuten-card", period, "abc123", 5, 5)
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn rollback_leaves_no_batch_behind() {
        let pool = create_memory_db().await.unwrap();
        let period = Period::parse("2024-03").unwrap();

        let mut tx = pool.begin().await.unwrap();
        insert_batch(&mut tx, UserId(1), "jcb-card", period, "xyz", 1, 1)
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(find_by_digest(&pool, UserId(1), "xyz").await.unwrap().is_none());
    }
}
