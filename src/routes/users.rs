use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::db::users::UserColumn;
use crate::domain::User;
use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserLookup { pub column_name: String, pub value: String }

#[derive(Debug, Deserialize, Validate)]
pub struct FavouriteBody {
    pub user_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub product_onec_id: String,
}

#[derive(Debug, Serialize)]
pub struct FavouriteChange { pub ok: bool, pub changed: bool }

pub async fn users(State(s): State<AppState>, Query(p): Query<UserLookup>) -> Result<Json<Vec<User>>> {
    let column: UserColumn = p.column_name.parse()?;
    Ok(Json(s.store.users_by(column, &p.value).await?))
}

pub async fn add_favourite(State(s): State<AppState>, Json(b): Json<FavouriteBody>) -> Result<Json<FavouriteChange>> {
    b.validate()?;
    let changed = s.store.add_favourite(b.user_id, &b.product_onec_id).await?;
    Ok(Json(FavouriteChange { ok: true, changed }))
}

pub async fn remove_favourite(State(s): State<AppState>, Json(b): Json<FavouriteBody>) -> Result<Json<FavouriteChange>> {
    b.validate()?;
    let changed = s.store.remove_favourite(b.user_id, &b.product_onec_id).await?;
    Ok(Json(FavouriteChange { ok: true, changed }))
}
