//! Process configuration read from the environment.
//!
//! `dotenvy` loads `.env` first (see `main`). Only the database URL is
//! required; an integration whose credentials are missing is built
//! disabled and its calls fail with a configuration error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::domain::BotKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {message}")]
    Invalid { key: &'static str, message: String },
}

/// A credential whose value never reaches logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }
    pub fn expose(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() { f.write_str("\"\"") } else { f.write_str("[REDACTED]") }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String { var(key).unwrap_or_else(|| default.to_string()) }

fn secret(key: &str) -> Secret { Secret(var(key).unwrap_or_default()) }

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid { key, message: e.to_string() }),
    }
}

fn parse_opt<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    var(key).map(|raw| raw.parse().map_err(|e: T::Err| ConfigError::Invalid { key, message: e.to_string() })).transpose()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub api_prefix: String,
    pub storefront_base_url: String,
    pub database: DatabaseConfig,
    pub enterprise: EnterpriseConfig,
    pub cdek: CdekConfig,
    pub yandex: YandexConfig,
    pub yookassa: YooKassaConfig,
    pub amocrm: AmoCrmConfig,
    pub bots: BotsConfig,
    pub promo_sheet: PromoSheetConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub migrations_url: Option<String>,
    pub pool_size: u32,
    pub pool_overflow: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct EnterpriseConfig { pub url: String, pub login: String, pub password: Secret }

#[derive(Debug, Clone)]
pub struct CdekSender {
    pub city_code: Option<i64>,
    pub shipment_point: Option<String>,
    pub address: String,
    pub name: String,
    pub company: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct CdekConfig { pub api_url: String, pub account: String, pub secure_password: Secret, pub sender: CdekSender }

#[derive(Debug, Clone)]
pub struct YandexConfig {
    pub map_token: Secret,
    pub geocoder_token: Secret,
    pub delivery_token: Secret,
    pub geocoder_url: String,
    pub delivery_url: String,
}

#[derive(Debug, Clone)]
pub struct YooKassaConfig { pub api_url: String, pub shop_id: String, pub secret_key: Secret, pub return_url: String }

/// Ids of the custom lead fields the order is mirrored into.
#[derive(Debug, Clone, Copy)]
pub struct AmoFieldIds {
    pub address: i64,
    pub delivery_service: i64,
    pub tracking_number: i64,
    pub promo_code: i64,
    pub delivery_sum: i64,
    pub payment_method: i64,
}

#[derive(Debug, Clone)]
pub struct AmoCrmConfig {
    pub base_domain: String,
    pub client_id: String,
    pub client_secret: Secret,
    pub redirect_uri: String,
    pub long_token: Secret,
    pub auth_code: Secret,
    pub access_token: Secret,
    pub refresh_token: Secret,
    pub token_file: String,
    pub pipeline_id: i64,
    pub fields: AmoFieldIds,
}

#[derive(Debug, Clone)]
pub struct AssistantCredentials { pub bot_token: Secret, pub assistant_id: String, pub openai_api_key: Secret }

#[derive(Debug, Clone)]
pub struct BotsConfig {
    pub admin_tg_ids: Vec<i64>,
    /// Shared secret of the internal RPC plane.
    pub rpc_token: Secret,
    pub rpc_base_url: String,
    pub antispam_bot_token: Secret,
    pub assistants: HashMap<BotKind, AssistantCredentials>,
    pub premium_days_per_order: i64,
}

#[derive(Debug, Clone)]
pub struct PromoSheetConfig { pub url: Option<String>, pub login: String, pub password: Secret }

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub catalog_sync: Duration,
    pub promo_import: Duration,
    pub delivery_retry: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = var("ASYNC_DATABASE_URL").or_else(|| var("DATABASE_URL")).ok_or(ConfigError::Missing("ASYNC_DATABASE_URL"))?;
        let database = DatabaseConfig {
            url,
            migrations_url: var("SYNC_DATABASE_URL"),
            pool_size: parse_or("DB_POOL_SIZE", 10)?,
            pool_overflow: parse_or("DB_POOL_OVERFLOW", 20)?,
            acquire_timeout: Duration::from_secs(parse_or("DB_POOL_TIMEOUT_SECS", 60)?),
            max_lifetime: Duration::from_secs(parse_or("DB_POOL_RECYCLE_SECS", 1800)?),
        };

        let enterprise = EnterpriseConfig { url: var_or("ENTERPRISE_URL", ""), login: var_or("ENTERPRISE_LOGIN", ""), password: secret("ENTERPRISE_PASSWORD") };

        let cdek = CdekConfig {
            api_url: var_or("CDEK_API_URL", "https://api.cdek.ru/v2"),
            account: var_or("CDEK_ACCOUNT", ""),
            secure_password: secret("CDEK_SECURE_PASSWORD"),
            sender: CdekSender {
                city_code: parse_opt("CDEK_SENDER_CITY_CODE")?,
                shipment_point: var("CDEK_SENDER_POINT"),
                address: var_or("CDEK_SENDER_ADDRESS", ""),
                name: var_or("CDEK_SENDER_NAME", ""),
                company: var_or("CDEK_SENDER_COMPANY", ""),
                phone: var_or("CDEK_SENDER_PHONE", ""),
            },
        };

        let yandex = YandexConfig {
            map_token: secret("YANDEX_MAP_TOKEN"),
            geocoder_token: secret("YANDEX_GEOCODER_TOKEN"),
            delivery_token: secret("YANDEX_DELIVERY_TOKEN"),
            geocoder_url: var_or("YANDEX_GEOCODER_URL", "https://geocode-maps.yandex.ru/1.x/"),
            delivery_url: var_or("YANDEX_DELIVERY_URL", "https://b2b-authproxy.taxi.yandex.net/api/b2b/platform"),
        };

        let yookassa = YooKassaConfig {
            api_url: var_or("YOOKASSA_API_URL", "https://api.yookassa.ru/v3"),
            shop_id: var_or("YOOKASSA_SHOP_ID", ""),
            secret_key: secret("YOOKASSA_SECRET_KEY"),
            return_url: var_or("PAYMENT_RETURN_URL", "https://t.me"),
        };

        let amocrm = AmoCrmConfig {
            base_domain: var_or("AMOCRM_BASE_DOMAIN", ""),
            client_id: var_or("AMOCRM_CLIENT_ID", ""),
            client_secret: secret("AMOCRM_CLIENT_SECRET"),
            redirect_uri: var_or("AMOCRM_REDIRECT_URI", ""),
            long_token: secret("AMOCRM_LONG_TOKEN"),
            auth_code: secret("AMOCRM_AUTH_CODE"),
            access_token: secret("AMOCRM_ACCESS_TOKEN"),
            refresh_token: secret("AMOCRM_REFRESH_TOKEN"),
            token_file: var_or("AMOCRM_TOKEN_FILE", "amocrm_tokens.json"),
            pipeline_id: parse_or("AMOCRM_PIPELINE_ID", 9_154_478)?,
            fields: AmoFieldIds {
                address: parse_or("AMOCRM_FIELD_ADDRESS", 1_267_095)?,
                delivery_service: parse_or("AMOCRM_FIELD_DELIVERY_SERVICE", 1_267_097)?,
                tracking_number: parse_or("AMOCRM_FIELD_TRACKING", 1_267_099)?,
                promo_code: parse_or("AMOCRM_FIELD_PROMO", 1_267_101)?,
                delivery_sum: parse_or("AMOCRM_FIELD_DELIVERY_SUM", 1_267_103)?,
                payment_method: parse_or("AMOCRM_FIELD_PAYMENT_METHOD", 1_267_105)?,
            },
        };

        let admin_tg_ids = match var("ADMIN_TG_IDS") {
            None => vec![],
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<i64>().map_err(|e| ConfigError::Invalid { key: "ADMIN_TG_IDS", message: e.to_string() }))
                .collect::<Result<_, _>>()?,
        };

        let mut assistants = HashMap::new();
        for bot in BotKind::ALL {
            let prefix = bot.as_str().to_uppercase();
            let assistant_id = var(&format!("{}_ASSISTANT_ID", prefix));
            if let Some(assistant_id) = assistant_id {
                let key = var(&format!("OPENAI_API_KEY_{}", prefix)).or_else(|| var("OPENAI_API_KEY")).unwrap_or_default();
                assistants.insert(bot, AssistantCredentials {
                    bot_token: secret(&format!("{}_BOT_TOKEN", prefix)),
                    assistant_id,
                    openai_api_key: Secret::new(key),
                });
            }
        }

        let bots = BotsConfig {
            admin_tg_ids,
            rpc_token: secret("NEW_BOT_TOKEN"),
            rpc_base_url: var_or("INTERNAL_RPC_URL", "http://127.0.0.1:8083"),
            antispam_bot_token: secret("ANTISPAM_BOT_TOKEN"),
            assistants,
            premium_days_per_order: parse_or("PREMIUM_DAYS_PER_ORDER", 30)?,
        };

        let promo_sheet = PromoSheetConfig { url: var("PROMO_SHEET_URL"), login: var_or("PROMO_SHEET_LOGIN", ""), password: secret("PROMO_SHEET_PASSWORD") };

        let schedule = ScheduleConfig {
            catalog_sync: Duration::from_secs(parse_or("CATALOG_SYNC_INTERVAL_SECS", 900)?),
            promo_import: Duration::from_secs(parse_or("PROMO_IMPORT_INTERVAL_SECS", 86_400)?),
            delivery_retry: Duration::from_secs(parse_or("DELIVERY_RETRY_INTERVAL_SECS", 600)?),
        };

        let mut api_prefix = var_or("API_PREFIX", "/api");
        if !api_prefix.starts_with('/') { api_prefix.insert(0, '/'); }

        Ok(Self {
            port: parse_or("PORT", 8083)?,
            api_prefix: api_prefix.trim_end_matches('/').to_string(),
            storefront_base_url: var_or("STOREFRONT_BASE_URL", ""),
            database, enterprise, cdek, yandex, yookassa, amocrm, bots, promo_sheet, schedule,
        })
    }

    pub fn is_admin(&self, tg_id: i64) -> bool { self.bots.admin_tg_ids.contains(&tg_id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{:?}", s), "[REDACTED]");
        assert_eq!(format!("{:?}", Secret::default()), "\"\"");
        assert_eq!(s.expose(), "hunter2");
    }
}
