use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use kakeibo_classify::{BatchClassifier, HttpTextGenerator};
use kakeibo_core::{filter_expenses, Period, UserId};
use kakeibo_governor::{MemoryStore, PeriodQuota};
use kakeibo_ingest::{IngestRequest, IngestService, SubmitterRole};

/// Daily ceiling on AI classification calls per user.
const AI_DAILY_CEILING: u32 = 50;

const USAGE: &str = "\
usage:
  kakeibo ingest  <institution> <period YYYY-MM> <file>
  kakeibo preview <institution> <period YYYY-MM> <file>
  kakeibo summary <period YYYY-MM>

environment:
  KAKEIBO_DB       database path      (default: kakeibo.db)
  KAKEIBO_USER     acting user id     (default: 1)
  AI_BASE_URL      chat-completions endpoint base (default: http://localhost:11434)
  AI_MODEL         model name         (default: qwen2.5:14b)
  AI_API_KEY       bearer token, optional";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!("{USAGE}");
    };

    let db_path = PathBuf::from(env_or("KAKEIBO_DB", "kakeibo.db"));
    let user = UserId(
        env_or("KAKEIBO_USER", "1")
            .parse()
            .context("KAKEIBO_USER must be an integer")?,
    );

    let pool = kakeibo_storage::create_db(&db_path)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    kakeibo_storage::seed_default_categories(&pool)
        .await
        .context("failed to seed categories")?;

    match command.as_str() {
        "ingest" | "preview" => {
            let [_, institution, period, file] = args.as_slice() else {
                bail!("{USAGE}");
            };
            let bytes = std::fs::read(file)
                .with_context(|| format!("failed to read {file}"))?;

            let generator = HttpTextGenerator::new(
                &env_or("AI_BASE_URL", "http://localhost:11434"),
                &env_or("AI_MODEL", "qwen2.5:14b"),
                std::env::var("AI_API_KEY").ok(),
            )
            .context("failed to build AI client")?;
            let quota = PeriodQuota::new(
                Arc::new(MemoryStore::new()),
                "ai-classify",
                AI_DAILY_CEILING,
            );
            let service = IngestService::new(
                pool,
                BatchClassifier::new(Arc::new(generator)),
                quota,
            );

            let request = IngestRequest {
                bytes,
                institution: institution.clone(),
                period: period.clone(),
                owner: user,
                submitter: user,
                submitter_role: SubmitterRole::Member,
            };

            if command == "preview" {
                let preview = service.preview(request).await?;
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                let summary = service.ingest(request).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        "summary" => {
            let [_, period] = args.as_slice() else {
                bail!("{USAGE}");
            };
            let period = Period::parse(period).context("period must be YYYY-MM")?;
            let expenses =
                kakeibo_storage::expenses::list_for_month(&pool, period.year, period.month)
                    .await?;
            let filtered = filter_expenses(user, &expenses);

            for e in &filtered.visible {
                println!("{}  {:>10}  {}", e.date, e.amount, e.description);
            }
            if !filtered.aggregates.is_empty() {
                println!("--- category totals (details withheld) ---");
                for agg in &filtered.aggregates {
                    let label = agg
                        .category_id
                        .map(|c| c.0.to_string())
                        .unwrap_or_else(|| "uncategorized".to_string());
                    println!("category {label}: {} yen over {} items", agg.total_amount, agg.count);
                }
            }
        }
        other => bail!("unknown command `{other}`\n{USAGE}"),
    }

    Ok(())
}
