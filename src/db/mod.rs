//! Postgres persistence.
//!
//! `PgStore` wraps the pool; its methods are split by area across
//! `catalog`, `orders` and `users`. Each method owns one transaction that
//! commits on success and rolls back when dropped on an error path, and
//! none of them performs outbound HTTP.

pub mod catalog;
pub mod orders;
pub mod users;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::domain::{CartError, PromoError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error(transparent)]
    Cart(#[from] CartError),

    #[error(transparent)]
    Promo(#[from] PromoError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self { Self::NotFound { entity, id: id.to_string() } }

    /// Unique, foreign-key or check violation on a single row.
    pub fn is_row_conflict(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("23505" | "23503" | "23514" | "23502"))
            }
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct PgStore { pool: PgPool }

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }
    pub fn pool(&self) -> &PgPool { &self.pool }
}

/// Pool sized per config: `size + overflow` connections, pre-ping on
/// acquire and recycling after `max_lifetime`.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    pool_options(config).connect(&config.url).await
}

/// Same pool settings without opening a connection up front.
pub fn connect_lazy(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    pool_options(config).connect_lazy(&config.url)
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.pool_size + config.pool_overflow)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
