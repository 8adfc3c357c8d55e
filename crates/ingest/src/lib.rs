//! Statement ingestion orchestration.
//!
//! Turns an uploaded statement file plus metadata into persisted expenses
//! exactly once: validation, parsing, count-based duplicate analysis, one
//! atomic write for the batch and its new rows, then a decoupled
//! classification pass whose failure never rolls ingestion back.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use kakeibo_classify::{BatchClassifier, ClassifyInput};
use kakeibo_core::period::day_label;
use kakeibo_core::{Expense, ExpenseId, Period, Provenance, UserId, Visibility};
use kakeibo_core::period::PeriodParseError;
use kakeibo_governor::PeriodQuota;
use kakeibo_import::{
    file_digest, parse_statement, row_fingerprint, CanonicalRow, FormatMapping, ParseError,
};
use kakeibo_storage::{batches, categories, expenses, DbPool};

/// Upload size ceiling.
pub const MAX_FILE_BYTES: usize = 2 * 1024 * 1024;
/// Parsed row ceiling per upload.
pub const MAX_ROWS: usize = 5000;
/// Preview returns at most this many sampled rows.
pub const PREVIEW_SAMPLE_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitterRole {
    Member,
    Admin,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub bytes: Vec<u8>,
    pub institution: String,
    /// Target period, `YYYY-MM`.
    pub period: String,
    pub owner: UserId,
    pub submitter: UserId,
    pub submitter_role: SubmitterRole,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown institution: {0}")]
    UnknownInstitution(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: usize, limit: usize },
    #[error("too many rows: {count} (limit {limit})")]
    TooManyRows { count: usize, limit: usize },
    #[error(transparent)]
    InvalidPeriod(#[from] PeriodParseError),
    #[error("row dated {date} falls outside target period {period}")]
    RowOutsidePeriod { date: NaiveDate, period: Period },
    #[error("submitter is not the owner and holds no elevated role")]
    NotPermitted,
    #[error("this file was already ingested as batch {batch_id}")]
    AlreadyImported { batch_id: i64 },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Serialize)]
pub struct IngestSummary {
    pub batch_id: i64,
    pub total_rows: usize,
    pub new_rows: usize,
    pub duplicate_rows: usize,
    /// Whether the classification pass ran and was persisted. Ingestion is
    /// already committed either way.
    pub classification_applied: bool,
}

#[derive(Debug, Serialize)]
pub struct PreviewRow {
    pub date: NaiveDate,
    pub description: String,
    pub amount: i64,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct PreviewSummary {
    pub total_rows: usize,
    pub new_rows: usize,
    pub duplicate_rows: usize,
    pub sample: Vec<PreviewRow>,
}

struct AnalyzedRow {
    row: CanonicalRow,
    fingerprint: String,
    duplicate: bool,
}

struct Analysis {
    period: Period,
    digest: String,
    rows: Vec<AnalyzedRow>,
}

pub struct IngestService {
    pool: DbPool,
    classifier: BatchClassifier,
    ai_quota: PeriodQuota,
}

impl IngestService {
    pub fn new(pool: DbPool, classifier: BatchClassifier, ai_quota: PeriodQuota) -> Self {
        IngestService { pool, classifier, ai_quota }
    }

    /// Shared validation + duplicate analysis for ingest and preview.
    /// Performs no writes.
    async fn analyze(&self, request: &IngestRequest) -> Result<Analysis, IngestError> {
        if request.submitter != request.owner && request.submitter_role != SubmitterRole::Admin {
            return Err(IngestError::NotPermitted);
        }
        if request.bytes.len() > MAX_FILE_BYTES {
            return Err(IngestError::FileTooLarge {
                size: request.bytes.len(),
                limit: MAX_FILE_BYTES,
            });
        }
        let mapping = FormatMapping::find(&request.institution)
            .ok_or_else(|| IngestError::UnknownInstitution(request.institution.clone()))?;
        let period = Period::parse(&request.period)?;

        let rows = parse_statement(&request.bytes, mapping)?;
        if rows.len() > MAX_ROWS {
            return Err(IngestError::TooManyRows { count: rows.len(), limit: MAX_ROWS });
        }
        if let Some(bad) = rows.iter().find(|r| !period.contains(r.date)) {
            return Err(IngestError::RowOutsidePeriod { date: bad.date, period });
        }

        let digest = file_digest(&request.bytes);
        if let Some(existing) = batches::find_by_digest(&self.pool, request.owner, &digest).await? {
            return Err(IngestError::AlreadyImported { batch_id: existing.id });
        }

        // Count-based duplicate analysis: the first `stored` occurrences of
        // a fingerprint in this file are duplicates of rows we already hold;
        // only the excess occurrences are new.
        let stored = expenses::fingerprint_counts(&self.pool, request.owner).await?;
        let mut seen: HashMap<String, i64> = HashMap::new();
        let rows = rows
            .into_iter()
            .map(|row| {
                let fingerprint = row_fingerprint(
                    request.owner.0,
                    &request.institution,
                    row.date,
                    &row.description,
                    row.amount,
                );
                let seen_so_far = seen.entry(fingerprint.clone()).or_insert(0);
                let duplicate = *seen_so_far < stored.get(&fingerprint).copied().unwrap_or(0);
                *seen_so_far += 1;
                AnalyzedRow { row, fingerprint, duplicate }
            })
            .collect();

        Ok(Analysis { period, digest, rows })
    }

    /// Ingest a statement file: persist the batch and its new rows in one
    /// atomic transaction, then classify. Classification failure is logged
    /// and never changes the ingestion outcome.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let analysis = self.analyze(&request).await?;
        let total_rows = analysis.rows.len();
        let new: Vec<&AnalyzedRow> = analysis.rows.iter().filter(|r| !r.duplicate).collect();
        let duplicate_rows = total_rows - new.len();

        let mut tx = self.pool.begin().await?;
        let batch_id = match batches::insert_batch(
            &mut tx,
            request.owner,
            &request.institution,
            analysis.period,
            &analysis.digest,
            total_rows as i64,
            new.len() as i64,
        )
        .await
        {
            Ok(id) => id,
            // Two concurrent submissions of the same file: the loser of the
            // race sees a unique violation, which is a conflict, not an
            // internal error.
            Err(e) if kakeibo_storage::is_unique_violation(&e) => {
                drop(tx);
                let existing =
                    batches::find_by_digest(&self.pool, request.owner, &analysis.digest).await?;
                return Err(IngestError::AlreadyImported {
                    batch_id: existing.map(|b| b.id).unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut inserted_ids = Vec::with_capacity(new.len());
        for analyzed in &new {
            let expense = to_expense(&analyzed.row, &analyzed.fingerprint, request.owner, batch_id);
            let id = expenses::insert_in_tx(&mut tx, &expense).await?;
            inserted_ids.push(ExpenseId(id));
        }
        tx.commit().await?;

        tracing::info!(
            batch_id,
            total_rows,
            new_rows = inserted_ids.len(),
            duplicate_rows,
            institution = %request.institution,
            "statement ingested"
        );

        let classification_applied = self
            .classify_batch(batch_id, request.owner, &inserted_ids, &new)
            .await;

        Ok(IngestSummary {
            batch_id,
            total_rows,
            new_rows: inserted_ids.len(),
            duplicate_rows,
            classification_applied,
        })
    }

    /// Same analysis as `ingest` with no persistence; returns counts plus a
    /// capped sample of rows flagged duplicate/new.
    pub async fn preview(&self, request: IngestRequest) -> Result<PreviewSummary, IngestError> {
        let analysis = self.analyze(&request).await?;
        let total_rows = analysis.rows.len();
        let duplicate_rows = analysis.rows.iter().filter(|r| r.duplicate).count();

        let sample = analysis
            .rows
            .into_iter()
            .take(PREVIEW_SAMPLE_CAP)
            .map(|r| PreviewRow {
                date: r.row.date,
                description: r.row.description,
                amount: r.row.amount,
                duplicate: r.duplicate,
            })
            .collect();

        Ok(PreviewSummary {
            total_rows,
            new_rows: total_rows - duplicate_rows,
            duplicate_rows,
            sample,
        })
    }

    /// The decoupled classification pass. Returns whether results were
    /// persisted; every failure path is absorbed here.
    async fn classify_batch(
        &self,
        batch_id: i64,
        owner: UserId,
        ids: &[ExpenseId],
        rows: &[&AnalyzedRow],
    ) -> bool {
        if ids.is_empty() {
            return false;
        }

        let (category_list, overrides) = match self.load_category_context(owner).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, batch_id, "skipping classification, category load failed");
                return false;
            }
        };

        let inputs: Vec<ClassifyInput> = rows
            .iter()
            .map(|r| ClassifyInput {
                description: r.row.description.clone(),
                amount: r.row.amount,
                date: r.row.date,
            })
            .collect();

        let today = day_label(chrono::Utc::now().date_naive());
        let results = match self.ai_quota.consume(&owner.0.to_string(), &today) {
            Ok(_) => {
                self.classifier
                    .classify(ids, &inputs, &category_list, &overrides)
                    .await
            }
            Err(e) => {
                tracing::info!(owner = owner.0, error = %e, "AI quota exhausted, using fallback classification");
                BatchClassifier::fallback(ids, &category_list, &overrides)
            }
        };

        match expenses::apply_classification(&self.pool, batch_id, &results).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, batch_id, "classification write failed, ingestion unaffected");
                false
            }
        }
    }

    async fn load_category_context(
        &self,
        owner: UserId,
    ) -> Result<
        (Vec<kakeibo_core::Category>, HashMap<kakeibo_core::CategoryId, Visibility>),
        sqlx::Error,
    > {
        let list = categories::list_categories(&self.pool).await?;
        let overrides = categories::overrides_for_user(&self.pool, owner)
            .await?
            .into_iter()
            .map(|o| (o.category_id, o.visibility))
            .collect();
        Ok((list, overrides))
    }
}

fn to_expense(row: &CanonicalRow, fingerprint: &str, owner: UserId, batch_id: i64) -> Expense {
    Expense {
        id: None,
        owner_id: owner,
        date: row.date,
        amount: row.amount,
        description: row.description.clone(),
        category_id: None,
        visibility: Visibility::Public,
        memo: row.memo.clone(),
        is_substitute: false,
        actual_amount: None,
        confirmed: false,
        provenance: Provenance::Imported,
        batch_id: Some(batch_id),
        fingerprint: Some(fingerprint.to_string()),
    }
}
