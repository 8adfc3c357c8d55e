//! Chunked AI classification of expenses.
//!
//! The provider's reply is untrusted: it must parse as a JSON array, every
//! element must pass shape validation, and the element count must equal the
//! chunk's input count. Any failure downgrades the whole chunk to the
//! deterministic fallback; nothing from this module ever propagates a
//! provider error to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;

use kakeibo_core::{
    Category, CategoryId, ClassificationResult, Confidence, ExpenseId, Visibility,
};

use crate::provider::{strip_code_fence, TextGenerator};
use crate::resolver::{CategoryIndex, ResolvedCategory};

/// Maximum transactions per provider call.
pub const CHUNK_SIZE: usize = 20;

const SYSTEM_TEMPLATE: &str = "あなたは家計簿の仕訳アシスタントです。\
各取引を次のカテゴリのいずれかに分類してください: {categories}。\
confidence は high / medium / low のいずれかです。\
入力と同じ順序・同じ件数の JSON 配列だけを返してください。\
各要素は {\"category\": string, \"confidence\": string, \"reasoning\": string(optional)} です。";

#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub description: String,
    pub amount: i64,
    pub date: NaiveDate,
}

/// One element of the provider's reply, shape-validated via serde.
#[derive(Debug, Deserialize)]
struct ProviderItem {
    category: String,
    confidence: Confidence,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: Option<String>,
}

pub struct BatchClassifier {
    provider: Arc<dyn TextGenerator>,
}

impl BatchClassifier {
    pub fn new(provider: Arc<dyn TextGenerator>) -> Self {
        BatchClassifier { provider }
    }

    /// Classify `inputs` (aligned 1:1 with `ids`), returning results in the
    /// same order. A failing chunk falls back without aborting later chunks.
    pub async fn classify(
        &self,
        ids: &[ExpenseId],
        inputs: &[ClassifyInput],
        categories: &[Category],
        overrides: &HashMap<CategoryId, Visibility>,
    ) -> Vec<(ExpenseId, ClassificationResult)> {
        debug_assert_eq!(
            ids.len(),
            inputs.len(),
            "every input needs exactly one expense id"
        );
        let index = CategoryIndex::build(categories);
        let system = system_prompt(categories);
        let mut results = Vec::with_capacity(inputs.len());

        for (chunk_ids, chunk) in ids.chunks(CHUNK_SIZE).zip(inputs.chunks(CHUNK_SIZE)) {
            let chunk_results = match self.classify_chunk(&system, chunk, &index, overrides).await {
                Some(r) => r,
                None => fallback_chunk(chunk.len(), &index, overrides),
            };
            results.extend(chunk_ids.iter().copied().zip(chunk_results));
        }

        results
    }

    /// Deterministic outcome used when the provider is unavailable or its
    /// reply is unusable: fallback category, low confidence, unconfirmed.
    pub fn fallback(
        ids: &[ExpenseId],
        categories: &[Category],
        overrides: &HashMap<CategoryId, Visibility>,
    ) -> Vec<(ExpenseId, ClassificationResult)> {
        let index = CategoryIndex::build(categories);
        ids.iter()
            .copied()
            .zip(fallback_chunk(ids.len(), &index, overrides))
            .collect()
    }

    async fn classify_chunk(
        &self,
        system: &str,
        chunk: &[ClassifyInput],
        index: &CategoryIndex,
        overrides: &HashMap<CategoryId, Visibility>,
    ) -> Option<Vec<ClassificationResult>> {
        let user = chunk_payload(chunk);
        let reply = match self.provider.generate(system, &user).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, rows = chunk.len(), "provider call failed, falling back");
                return None;
            }
        };

        let items: Vec<ProviderItem> = match serde_json::from_str(strip_code_fence(&reply)) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "provider reply failed validation, falling back");
                return None;
            }
        };
        if items.len() != chunk.len() {
            tracing::warn!(
                expected = chunk.len(),
                got = items.len(),
                "provider reply count mismatch, falling back"
            );
            return None;
        }

        Some(
            items
                .into_iter()
                .map(|item| {
                    let resolved = index.resolve(&item.category);
                    ClassificationResult {
                        category_id: resolved.as_ref().and_then(|r| r.id),
                        category_name: resolved.as_ref().map(|r| r.name.clone()),
                        confidence: item.confidence,
                        visibility: suggested_visibility(resolved.as_ref(), overrides),
                        confirmed: item.confidence != Confidence::Low,
                    }
                })
                .collect(),
        )
    }
}

fn system_prompt(categories: &[Category]) -> String {
    let names: Vec<&str> = categories.iter().map(|c| c.name.as_str()).collect();
    SYSTEM_TEMPLATE.replace("{categories}", &names.join("、"))
}

fn chunk_payload(chunk: &[ClassifyInput]) -> String {
    let items: Vec<serde_json::Value> = chunk
        .iter()
        .map(|i| {
            serde_json::json!({
                "description": i.description,
                "amount": i.amount,
                "date": i.date.format("%Y-%m-%d").to_string(),
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

/// Per-user override for the resolved category, else the category default,
/// else the universal default.
fn suggested_visibility(
    resolved: Option<&ResolvedCategory>,
    overrides: &HashMap<CategoryId, Visibility>,
) -> Visibility {
    match resolved {
        Some(r) => r
            .id
            .and_then(|id| overrides.get(&id).copied())
            .unwrap_or(r.visibility),
        None => Visibility::Public,
    }
}

fn fallback_chunk(
    len: usize,
    index: &CategoryIndex,
    overrides: &HashMap<CategoryId, Visibility>,
) -> Vec<ClassificationResult> {
    let resolved = index.fallback();
    let visibility = suggested_visibility(resolved.as_ref(), overrides);
    (0..len)
        .map(|_| {
            ClassificationResult::fallback(
                resolved.as_ref().and_then(|r| r.id),
                resolved.as_ref().map(|r| r.name.clone()),
                visibility,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted provider: pops one canned reply per call.
    struct MockGenerator {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockGenerator {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            MockGenerator {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for MockGenerator {
        async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(ProviderError::Empty)
            } else {
                replies.remove(0)
            }
        }
    }

    fn cat(id: i64, name: &str, visibility: Visibility) -> Category {
        Category {
            id: Some(CategoryId(id)),
            name: name.to_string(),
            default_visibility: visibility,
            is_fixed_cost: false,
            sort_order: id,
        }
    }

    fn categories() -> Vec<Category> {
        vec![
            cat(1, "食費", Visibility::Public),
            cat(2, "娯楽", Visibility::AmountOnly),
            cat(9, "その他", Visibility::Public),
        ]
    }

    fn inputs(n: usize) -> (Vec<ExpenseId>, Vec<ClassifyInput>) {
        let ids = (0..n as i64).map(ExpenseId).collect();
        let rows = (0..n)
            .map(|i| ClassifyInput {
                description: format!("店舗{i}"),
                amount: 100 * (i as i64 + 1),
                date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            })
            .collect();
        (ids, rows)
    }

    #[tokio::test]
    async fn successful_reply_resolves_and_confirms() {
        let reply = r#"[
            {"category":"食費","confidence":"high","reasoning":"supermarket"},
            {"category":"娯楽","confidence":"low"}
        ]"#;
        let provider = Arc::new(MockGenerator::new(vec![Ok(reply.to_string())]));
        let classifier = BatchClassifier::new(provider.clone());
        let (ids, rows) = inputs(2);
        let out = classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1.category_id, Some(CategoryId(1)));
        assert_eq!(out[0].1.confidence, Confidence::High);
        assert!(out[0].1.confirmed);
        assert_eq!(out[0].1.visibility, Visibility::Public);
        // Low confidence is never auto-confirmed.
        assert_eq!(out[1].1.category_id, Some(CategoryId(2)));
        assert!(!out[1].1.confirmed);
        assert_eq!(out[1].1.visibility, Visibility::AmountOnly);
    }

    #[tokio::test]
    async fn code_fenced_reply_is_accepted() {
        let reply = "```json\n[{\"category\":\"食費\",\"confidence\":\"medium\"}]\n```";
        let provider = Arc::new(MockGenerator::new(vec![Ok(reply.to_string())]));
        let classifier = BatchClassifier::new(provider);
        let (ids, rows) = inputs(1);
        let out = classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;
        assert_eq!(out[0].1.category_id, Some(CategoryId(1)));
        assert_eq!(out[0].1.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn count_mismatch_downgrades_whole_chunk() {
        let reply = r#"[{"category":"食費","confidence":"high"}]"#;
        let provider = Arc::new(MockGenerator::new(vec![Ok(reply.to_string())]));
        let classifier = BatchClassifier::new(provider);
        let (ids, rows) = inputs(3);
        let out = classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;

        assert_eq!(out.len(), 3);
        for (_, r) in &out {
            assert_eq!(r.category_name.as_deref(), Some("その他"));
            assert_eq!(r.confidence, Confidence::Low);
            assert!(!r.confirmed);
        }
    }

    #[tokio::test]
    async fn unparsable_reply_falls_back() {
        let provider = Arc::new(MockGenerator::new(vec![Ok("not json at all".to_string())]));
        let classifier = BatchClassifier::new(provider);
        let (ids, rows) = inputs(2);
        let out = classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;
        assert!(out.iter().all(|(_, r)| r.confidence == Confidence::Low));
        assert!(out.iter().all(|(_, r)| r.category_id == Some(CategoryId(9))));
    }

    #[tokio::test]
    async fn failed_chunk_does_not_abort_later_chunks() {
        // 25 inputs → two chunks (20 + 5). First chunk errors, second succeeds.
        let ok_reply = serde_json::to_string(
            &(0..5)
                .map(|_| serde_json::json!({"category":"食費","confidence":"high"}))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let provider = Arc::new(MockGenerator::new(vec![
            Err(ProviderError::Empty),
            Ok(ok_reply),
        ]));
        let classifier = BatchClassifier::new(provider);
        let (ids, rows) = inputs(25);
        let out = classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;

        assert_eq!(out.len(), 25);
        assert!(out[..20].iter().all(|(_, r)| r.confidence == Confidence::Low));
        assert!(out[20..].iter().all(|(_, r)| r.confidence == Confidence::High));
        // Ordering stays aligned with the caller-supplied ids.
        assert_eq!(out[24].0, ExpenseId(24));
    }

    #[tokio::test]
    async fn override_beats_category_default() {
        let reply = r#"[{"category":"食費","confidence":"high"}]"#;
        let provider = Arc::new(MockGenerator::new(vec![Ok(reply.to_string())]));
        let classifier = BatchClassifier::new(provider);
        let (ids, rows) = inputs(1);
        let overrides = HashMap::from([(CategoryId(1), Visibility::CategoryTotal)]);
        let out = classifier.classify(&ids, &rows, &categories(), &overrides).await;
        assert_eq!(out[0].1.visibility, Visibility::CategoryTotal);
    }

    #[tokio::test]
    async fn prompt_enumerates_known_category_names() {
        let reply = r#"[{"category":"食費","confidence":"high"}]"#;
        let provider = Arc::new(MockGenerator::new(vec![Ok(reply.to_string())]));
        let classifier = BatchClassifier::new(provider.clone());
        let (ids, rows) = inputs(1);
        classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;

        let calls = provider.calls.lock().unwrap();
        let (system, user) = &calls[0];
        assert!(system.contains("食費") && system.contains("娯楽") && system.contains("その他"));
        assert!(user.contains("店舗0") && user.contains("\"amount\":100"));
    }

    #[tokio::test]
    #[should_panic(expected = "exactly one expense id")]
    async fn misaligned_ids_and_inputs_are_rejected() {
        let provider = Arc::new(MockGenerator::new(vec![]));
        let classifier = BatchClassifier::new(provider);
        let (ids, _) = inputs(3);
        let (_, rows) = inputs(2);
        classifier
            .classify(&ids, &rows, &categories(), &HashMap::new())
            .await;
    }

    #[tokio::test]
    async fn explicit_fallback_matches_failure_outcome() {
        let (ids, _) = inputs(2);
        let out = BatchClassifier::fallback(&ids, &categories(), &HashMap::new());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(_, r)| {
            r.category_id == Some(CategoryId(9)) && r.confidence == Confidence::Low && !r.confirmed
        }));
    }
}
