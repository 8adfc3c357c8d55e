//! Free-text category name → canonical category resolution.
//!
//! Resolution chain: exact match on the normalized name, then the synonym
//! table (re-resolved through exact match), then the designated fallback
//! category, then nothing.

use std::collections::HashMap;

use kakeibo_core::{Category, CategoryId, Visibility};
use kakeibo_import::value::fold_width;

/// Catch-all category used whenever classification cannot confidently
/// resolve a name.
pub const FALLBACK_CATEGORY: &str = "その他";

/// Common alternate phrasings mapped to canonical category names.
static SYNONYMS: &[(&str, &str)] = &[
    ("食料品", "食費"),
    ("飲食費", "食費"),
    ("外食", "食費"),
    ("日用雑貨", "日用品"),
    ("生活用品", "日用品"),
    ("交通", "交通費"),
    ("電車・バス", "交通費"),
    ("家賃", "住居費"),
    ("光熱費", "水道光熱費"),
    ("電気・ガス・水道", "水道光熱費"),
    ("携帯電話", "通信費"),
    ("医療", "医療費"),
    ("病院", "医療費"),
    ("レジャー", "娯楽"),
    ("趣味・娯楽", "娯楽"),
    ("衣服", "被服費"),
    ("ファッション", "被服費"),
    ("雑費", "その他"),
    ("不明", "その他"),
];

/// Width-fold, strip whitespace, collapse separator punctuation variants to
/// `・`, and case fold. Two names with the same key are the same category.
pub fn normalize_key(name: &str) -> String {
    fold_width(name)
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '/' | '･' | '·' => '・',
            _ => c,
        })
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCategory {
    pub id: Option<CategoryId>,
    pub visibility: Visibility,
    pub name: String,
}

/// Known-category lookup built once per batch.
pub struct CategoryIndex {
    by_key: HashMap<String, ResolvedCategory>,
}

impl CategoryIndex {
    /// On a normalization collision between two known categories the
    /// first-registered one wins; the collision is logged, never fatal.
    pub fn build(categories: &[Category]) -> Self {
        let mut by_key: HashMap<String, ResolvedCategory> = HashMap::new();
        for c in categories {
            let key = normalize_key(&c.name);
            let entry = ResolvedCategory {
                id: c.id,
                visibility: c.default_visibility,
                name: c.name.clone(),
            };
            if let Some(existing) = by_key.get(&key) {
                tracing::warn!(
                    kept = %existing.name,
                    dropped = %c.name,
                    "category names collide after normalization"
                );
                continue;
            }
            by_key.insert(key, entry);
        }
        CategoryIndex { by_key }
    }

    fn exact(&self, name: &str) -> Option<&ResolvedCategory> {
        self.by_key.get(&normalize_key(name))
    }

    /// Resolve a free-text name. `None` only when even the fallback
    /// category is absent from the known list.
    pub fn resolve(&self, raw: &str) -> Option<ResolvedCategory> {
        if let Some(hit) = self.exact(raw) {
            return Some(hit.clone());
        }
        let key = normalize_key(raw);
        if let Some((_, canonical)) = SYNONYMS.iter().find(|(alt, _)| normalize_key(alt) == key) {
            if let Some(hit) = self.exact(canonical) {
                return Some(hit.clone());
            }
        }
        self.fallback()
    }

    pub fn fallback(&self) -> Option<ResolvedCategory> {
        self.exact(FALLBACK_CATEGORY).cloned()
    }
}
