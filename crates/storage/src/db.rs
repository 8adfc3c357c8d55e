use kakeibo_core::Visibility;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// In-memory database for tests. Single connection, since each SQLite
/// in-memory connection is its own database.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            default_visibility TEXT NOT NULL DEFAULT 'PUBLIC',
            is_fixed_cost INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statement_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL,
            institution TEXT NOT NULL,
            period TEXT NOT NULL,
            file_digest TEXT NOT NULL,
            total_rows INTEGER NOT NULL,
            pending_rows INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (owner_id, file_digest)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            category_id INTEGER REFERENCES categories(id),
            visibility TEXT NOT NULL DEFAULT 'PUBLIC',
            memo TEXT,
            is_substitute INTEGER NOT NULL DEFAULT 0,
            actual_amount INTEGER,
            confirmed INTEGER NOT NULL DEFAULT 0,
            provenance TEXT NOT NULL,
            batch_id INTEGER REFERENCES statement_batches(id),
            fingerprint TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_expenses_owner_fingerprint ON expenses(owner_id, fingerprint)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS visibility_overrides (
            user_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL REFERENCES categories(id),
            visibility TEXT NOT NULL,
            UNIQUE (user_id, category_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Default household category set. The catch-all "その他" must exist for
/// classification fallback to resolve.
const DEFAULT_CATEGORIES: &[(&str, Visibility, bool)] = &[
    ("食費", Visibility::Public, false),
    ("日用品", Visibility::Public, false),
    ("交通費", Visibility::Public, false),
    ("住居費", Visibility::Public, true),
    ("水道光熱費", Visibility::Public, true),
    ("通信費", Visibility::Public, true),
    ("医療費", Visibility::AmountOnly, false),
    ("娯楽", Visibility::AmountOnly, false),
    ("被服費", Visibility::Public, false),
    ("その他", Visibility::Public, false),
];

pub async fn seed_default_categories(pool: &DbPool) -> Result<(), sqlx::Error> {
    for (order, (name, visibility, fixed)) in DEFAULT_CATEGORIES.iter().enumerate() {
        sqlx::query(
            "INSERT OR IGNORE INTO categories (name, default_visibility, is_fixed_cost, sort_order) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(visibility.as_str())
        .bind(*fixed as i64)
        .bind(order as i64)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// True when the error is a UNIQUE constraint violation, e.g. two
/// concurrent submissions of the same statement file.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
