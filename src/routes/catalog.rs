use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::catalog::{ProductSearch, SortBy, SortDir};
use crate::domain::{Money, ProductWithFeatures, TgCategory, TgCategoryMode};
use crate::error::{ApiError, Result};
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// Comma-separated ids.
    pub tg_category_ids: Option<String>,
    #[serde(default)]
    pub tg_category_mode: TgCategoryMode,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_dir: SortDir,
}

#[derive(Debug, Serialize)]
pub struct FeatureHit { pub id: String, pub name: String, pub price: Money, pub balance: i32 }

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub onec_id: String,
    pub url: String,
    pub image: Option<String>,
    pub features: Vec<FeatureHit>,
}

#[derive(Debug, Serialize)]
pub struct SearchResults { pub results: Vec<SearchHit>, pub total: i64 }

fn parse_ids(raw: Option<&str>) -> Result<Vec<i32>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| ApiError::validation("tg_category_ids", format!("'{}' is not an id", s))))
        .collect()
}

fn hit(base_url: &str, found: ProductWithFeatures) -> SearchHit {
    let base = base_url.trim_end_matches('/');
    let image = found.features.iter().find_map(|f| f.file_id.as_deref()).map(|id| format!("{}/images/{}", base, id));
    SearchHit {
        url: format!("{}/product/{}", base, found.product.onec_id),
        name: found.product.name,
        onec_id: found.product.onec_id,
        image,
        features: found
            .features
            .into_iter()
            .map(|f| FeatureHit { id: f.onec_id, name: f.name, price: f.price, balance: f.balance })
            .collect(),
    }
}

pub async fn search_products(State(s): State<AppState>, Query(p): Query<SearchParams>) -> Result<Json<SearchResults>> {
    let search = ProductSearch {
        q: p.q.filter(|q| !q.trim().is_empty()),
        page: p.page.unwrap_or(1).max(1),
        limit: p.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        tg_category_ids: parse_ids(p.tg_category_ids.as_deref())?,
        tg_category_mode: p.tg_category_mode,
        sort_by: p.sort_by,
        sort_dir: p.sort_dir,
    };
    let (found, total) = s.store.search_products(&search).await?;
    let base = &s.config.storefront_base_url;
    Ok(Json(SearchResults { results: found.into_iter().map(|f| hit(base, f)).collect(), total }))
}

pub async fn product_json(State(s): State<AppState>, Path(onec_id): Path<String>) -> Result<Json<ProductWithFeatures>> {
    s.store.product_with_features(&onec_id).await?.map(Json).ok_or_else(|| ApiError::not_found("product", &onec_id))
}

pub async fn tg_categories(State(s): State<AppState>) -> Result<Json<Vec<TgCategory>>> {
    Ok(Json(s.store.tg_categories().await?))
}
