use kakeibo_core::{Category, CategoryId, UserId, Visibility, VisibilityOverride};

use crate::db::DbPool;

pub async fn list_categories(pool: &DbPool) -> Result<Vec<Category>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String, String, i64, i64)>(
        "SELECT id, name, default_visibility, is_fixed_cost, sort_order FROM categories ORDER BY sort_order, id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, name, visibility, fixed, order)| Category {
            id: Some(CategoryId(id)),
            name,
            default_visibility: Visibility::parse(&visibility),
            is_fixed_cost: fixed != 0,
            sort_order: order,
        })
        .collect())
}

pub async fn upsert_override(
    pool: &DbPool,
    user: UserId,
    category: CategoryId,
    visibility: Visibility,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO visibility_overrides (user_id, category_id, visibility)
        VALUES (?, ?, ?)
        ON CONFLICT (user_id, category_id) DO UPDATE SET visibility = excluded.visibility
        "#,
    )
    .bind(user.0)
    .bind(category.0)
    .bind(visibility.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn overrides_for_user(
    pool: &DbPool,
    user: UserId,
) -> Result<Vec<VisibilityOverride>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String)>(
        "SELECT category_id, visibility FROM visibility_overrides WHERE user_id = ?",
    )
    .bind(user.0)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, v)| VisibilityOverride {
            user_id: user,
            category_id: CategoryId(id),
            visibility: Visibility::parse(&v),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_db, seed_default_categories};

    #[tokio::test]
    async fn list_is_ordered_by_sort_order() {
        let pool = create_memory_db().await.unwrap();
        seed_default_categories(&pool).await.unwrap();
        let cats = list_categories(&pool).await.unwrap();
        assert_eq!(cats[0].name, "食費");
        assert_eq!(cats.last().unwrap().name, "その他");
        assert!(cats.iter().any(|c| c.is_fixed_cost));
    }

    #[tokio::test]
    async fn override_upsert_and_lookup() {
        let pool = create_memory_db().await.unwrap();
        seed_default_categories(&pool).await.unwrap();
        let cats = list_categories(&pool).await.unwrap();
        let food = cats[0].id.unwrap();

        upsert_override(&pool, UserId(1), food, Visibility::CategoryTotal)
            .await
            .unwrap();
        upsert_override(&pool, UserId(1), food, Visibility::AmountOnly)
            .await
            .unwrap();

        let overrides = overrides_for_user(&pool, UserId(1)).await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].user_id, UserId(1));
        assert_eq!(overrides[0].category_id, food);
        assert_eq!(overrides[0].visibility, Visibility::AmountOnly);
        assert!(overrides_for_user(&pool, UserId(2)).await.unwrap().is_empty());
    }
}
