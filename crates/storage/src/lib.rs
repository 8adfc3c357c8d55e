pub mod batches;
pub mod categories;
pub mod db;
pub mod expenses;

pub use batches::StatementBatch;
pub use db::{create_db, create_memory_db, is_unique_violation, seed_default_categories, DbPool};
