//! Catalog tables: sync upserts and the read paths used by search and carts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, QueryBuilder, Transaction};
use tracing::warn;

use super::{PgStore, StoreError, StoreResult};
use crate::domain::{Category, Feature, Product, ProductWithFeatures, TgCategory, TgCategoryMode, Unit};
use crate::sync::records::ProductRow;
use crate::sync::{BatchReport, CatalogSink};

const PRODUCT_COLUMNS: &str = "p.id, p.onec_id, p.name, p.code, p.description, p.usage, p.expiration, p.category_onec_id";
const FEATURE_COLUMNS: &str = "onec_id, product_onec_id, name, code, file_id, price, balance";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Name,
    Price,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn sql(&self) -> &'static str {
        match self { Self::Asc => "ASC", Self::Desc => "DESC" }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductSearch {
    pub q: Option<String>,
    pub page: u32,
    pub limit: u32,
    pub tg_category_ids: Vec<i32>,
    pub tg_category_mode: TgCategoryMode,
    pub sort_by: SortBy,
    pub sort_dir: SortDir,
}

enum RowOutcome { Written, Unchanged, Failed }

/// Runs one upsert inside a savepoint. Constraint violations roll back the
/// savepoint and are reported as `Failed`; anything else aborts the batch.
async fn write_row(tx: &mut Transaction<'_, Postgres>, key: &str, query: Query<'_, Postgres, PgArguments>) -> StoreResult<RowOutcome> {
    let mut savepoint = Connection::begin(&mut **tx).await?;
    match query.execute(&mut *savepoint).await {
        Ok(done) => {
            savepoint.commit().await?;
            Ok(if done.rows_affected() > 0 { RowOutcome::Written } else { RowOutcome::Unchanged })
        }
        Err(e) => {
            let err = StoreError::from(e);
            if !err.is_row_conflict() {
                return Err(err);
            }
            savepoint.rollback().await?;
            warn!(onec_id = key, error = %err, "catalog row rejected");
            Ok(RowOutcome::Failed)
        }
    }
}

fn tally(report: &mut BatchReport, outcome: RowOutcome) {
    match outcome {
        RowOutcome::Written => report.written += 1,
        RowOutcome::Unchanged => report.unchanged += 1,
        RowOutcome::Failed => report.failed += 1,
    }
}

fn like_pattern(q: &str) -> String {
    let escaped = q.trim().to_lowercase().replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{}%", escaped)
}

fn dedup_ids(ids: &[i32]) -> Vec<i32> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn push_tg_filter(qb: &mut QueryBuilder<'_, Postgres>, ids: Vec<i32>, mode: TgCategoryMode) {
    let wanted = ids.len() as i64;
    qb.push("p.id IN (SELECT product_id FROM product_tg_categories WHERE tg_category_id = ANY(");
    qb.push_bind(ids);
    qb.push(")");
    if mode == TgCategoryMode::All {
        qb.push(" GROUP BY product_id HAVING COUNT(DISTINCT tg_category_id) = ");
        qb.push_bind(wanted);
    }
    qb.push(")");
}

fn push_search_filter(qb: &mut QueryBuilder<'_, Postgres>, search: &ProductSearch) {
    qb.push(" WHERE TRUE");
    if let Some(q) = search.q.as_deref().filter(|q| !q.trim().is_empty()) {
        let pattern = like_pattern(q);
        qb.push(" AND (lower(p.name) LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR lower(p.code) LIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
    let ids = dedup_ids(&search.tg_category_ids);
    if !ids.is_empty() {
        qb.push(" AND ");
        push_tg_filter(qb, ids, search.tg_category_mode);
    }
}

impl PgStore {
    pub async fn product_with_features(&self, onec_id: &str) -> StoreResult<Option<ProductWithFeatures>> {
        let product = sqlx::query_as::<_, Product>(&format!("SELECT {} FROM products p WHERE p.onec_id = $1", PRODUCT_COLUMNS))
            .bind(onec_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(product) = product else { return Ok(None) };
        let mut attached = self.attach_features(vec![product]).await?;
        Ok(attached.pop())
    }

    pub async fn products_with_features(&self, onec_ids: &[String]) -> StoreResult<Vec<ProductWithFeatures>> {
        if onec_ids.is_empty() {
            return Ok(vec![]);
        }
        let products = sqlx::query_as::<_, Product>(&format!("SELECT {} FROM products p WHERE p.onec_id = ANY($1)", PRODUCT_COLUMNS))
            .bind(onec_ids)
            .fetch_all(&self.pool)
            .await?;
        self.attach_features(products).await
    }

    pub async fn feature(&self, onec_id: &str) -> StoreResult<Option<Feature>> {
        let feature = sqlx::query_as::<_, Feature>(&format!("SELECT {} FROM features WHERE onec_id = $1", FEATURE_COLUMNS))
            .bind(onec_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feature)
    }

    /// Product ids in any (at least one) or all of the given tg categories.
    pub async fn product_ids_in_tg_categories(&self, ids: &[i32], mode: TgCategoryMode) -> StoreResult<Vec<i64>> {
        let ids = dedup_ids(ids);
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut qb = QueryBuilder::<Postgres>::new("SELECT p.id FROM products p WHERE ");
        push_tg_filter(&mut qb, ids, mode);
        qb.push(" ORDER BY p.id");
        let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// One page of products, in-stock first, plus the unpaged total.
    pub async fn search_products(&self, search: &ProductSearch) -> StoreResult<(Vec<ProductWithFeatures>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM products p");
        push_search_filter(&mut count, search);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM products p", PRODUCT_COLUMNS));
        push_search_filter(&mut qb, search);
        qb.push(" ORDER BY EXISTS (SELECT 1 FROM features f WHERE f.product_onec_id = p.onec_id AND f.balance > 0) DESC, ");
        match search.sort_by {
            SortBy::Name => qb.push(format!("lower(p.name) {}", search.sort_dir.sql())),
            SortBy::Price => qb.push(format!(
                "(SELECT MIN(f.price) FROM features f WHERE f.product_onec_id = p.onec_id) {} NULLS LAST",
                search.sort_dir.sql()
            )),
        };
        let limit = search.limit.clamp(1, 100);
        let offset = search.page.saturating_sub(1) as i64 * limit as i64;
        qb.push(", p.id LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let products: Vec<Product> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok((self.attach_features(products).await?, total))
    }

    pub async fn tg_categories(&self) -> StoreResult<Vec<TgCategory>> {
        let rows = sqlx::query_as::<_, TgCategory>("SELECT id, name, description FROM tg_categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Loads features for `products` in one query, keeping product order.
    async fn attach_features(&self, products: Vec<Product>) -> StoreResult<Vec<ProductWithFeatures>> {
        if products.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<String> = products.iter().map(|p| p.onec_id.clone()).collect();
        let features = sqlx::query_as::<_, Feature>(&format!(
            "SELECT {} FROM features WHERE product_onec_id = ANY($1) ORDER BY price, name",
            FEATURE_COLUMNS
        ))
        .bind(&keys)
        .fetch_all(&self.pool)
        .await?;

        let mut by_product: HashMap<String, Vec<Feature>> = HashMap::new();
        for f in features {
            by_product.entry(f.product_onec_id.clone()).or_default().push(f);
        }
        Ok(products
            .into_iter()
            .map(|product| {
                let features = by_product.remove(&product.onec_id).unwrap_or_default();
                ProductWithFeatures { product, features }
            })
            .collect())
    }
}

#[async_trait]
impl CatalogSink for PgStore {
    async fn upsert_units(&self, batch: &[Unit]) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for u in batch {
            let query = sqlx::query(
                "INSERT INTO units (onec_id, name, description) VALUES ($1, $2, $3)
                 ON CONFLICT (onec_id) DO UPDATE SET name = EXCLUDED.name, description = EXCLUDED.description
                 WHERE (units.name, units.description) IS DISTINCT FROM (EXCLUDED.name, EXCLUDED.description)",
            )
            .bind(&u.onec_id)
            .bind(&u.name)
            .bind(&u.description);
            tally(&mut report, write_row(&mut tx, &u.onec_id, query).await?);
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn upsert_categories(&self, batch: &[Category]) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for c in batch {
            let query = sqlx::query(
                "INSERT INTO categories (onec_id, name, unit_onec_id) VALUES ($1, $2, $3)
                 ON CONFLICT (onec_id) DO UPDATE SET name = EXCLUDED.name, unit_onec_id = EXCLUDED.unit_onec_id
                 WHERE (categories.name, categories.unit_onec_id) IS DISTINCT FROM (EXCLUDED.name, EXCLUDED.unit_onec_id)",
            )
            .bind(&c.onec_id)
            .bind(&c.name)
            .bind(&c.unit_onec_id);
            tally(&mut report, write_row(&mut tx, &c.onec_id, query).await?);
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn upsert_products(&self, batch: &[ProductRow]) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for p in batch {
            let query = sqlx::query(
                "INSERT INTO products (onec_id, name, code, description, usage, expiration, category_onec_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (onec_id) DO UPDATE SET
                    name = EXCLUDED.name, code = EXCLUDED.code, description = EXCLUDED.description,
                    usage = EXCLUDED.usage, expiration = EXCLUDED.expiration,
                    category_onec_id = EXCLUDED.category_onec_id, updated_at = NOW()
                 WHERE (products.name, products.code, products.description, products.usage, products.expiration, products.category_onec_id)
                    IS DISTINCT FROM
                    (EXCLUDED.name, EXCLUDED.code, EXCLUDED.description, EXCLUDED.usage, EXCLUDED.expiration, EXCLUDED.category_onec_id)",
            )
            .bind(&p.onec_id)
            .bind(&p.name)
            .bind(&p.code)
            .bind(&p.description)
            .bind(&p.usage)
            .bind(&p.expiration)
            .bind(&p.category_onec_id);
            tally(&mut report, write_row(&mut tx, &p.onec_id, query).await?);
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn upsert_features(&self, batch: &[Feature]) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;

        let owners: Vec<String> = batch.iter().map(|f| f.product_onec_id.clone()).collect();
        let existing: HashSet<String> = sqlx::query_scalar::<_, String>("SELECT onec_id FROM products WHERE onec_id = ANY($1)")
            .bind(&owners)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        for f in batch {
            if !existing.contains(&f.product_onec_id) {
                report.skipped += 1;
                continue;
            }
            let query = sqlx::query(
                "INSERT INTO features (onec_id, product_onec_id, name, code, file_id, price, balance)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (onec_id) DO UPDATE SET
                    product_onec_id = EXCLUDED.product_onec_id, name = EXCLUDED.name, code = EXCLUDED.code,
                    file_id = EXCLUDED.file_id, price = EXCLUDED.price, balance = EXCLUDED.balance
                 WHERE (features.product_onec_id, features.name, features.code, features.file_id, features.price, features.balance)
                    IS DISTINCT FROM
                    (EXCLUDED.product_onec_id, EXCLUDED.name, EXCLUDED.code, EXCLUDED.file_id, EXCLUDED.price, EXCLUDED.balance)",
            )
            .bind(&f.onec_id)
            .bind(&f.product_onec_id)
            .bind(&f.name)
            .bind(&f.code)
            .bind(&f.file_id)
            .bind(f.price)
            .bind(f.balance);
            tally(&mut report, write_row(&mut tx, &f.onec_id, query).await?);
        }
        tx.commit().await?;
        Ok(report)
    }
}
