//! Peptide shop backend
//!
//! Storefront API, 1C catalog sync, order lifecycle and the internal RPC
//! plane used by the Telegram bots.
//!
//! ## Components
//! - Catalog sync from the 1C OData feed
//! - Carts, checkout, YooKassa payments and CDEK/Yandex delivery
//! - amoCRM mirroring of orders and their statuses
//! - Promo codes with referral accrual, imported from a WebDAV sheet
//! - Assistant gating and token metering for the bots
//! - HMAC-signed RPC for bot processes

pub mod assistant;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod integrations;
pub mod orders;
pub mod promo;
pub mod routes;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod sync;

pub use config::Config;
pub use error::{ApiError, Result};
pub use routes::router;
pub use state::AppState;
