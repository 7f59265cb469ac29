//! amoCRM adapter.
//!
//! One long-lived `AmoCrm` owns the OAuth token pair. Every call goes
//! through `send`, which takes the token lock, refreshes an expired token
//! (falling back to the authorization-code flow when the refresh fails)
//! and retries once after a 401/403. Refreshed tokens are persisted
//! through `TokenStore`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::collaborators::{AuthCodeProvider, VerificationMailer};
use super::{http_client, UpstreamError, REQUEST_TIMEOUT};
use crate::config::{AmoCrmConfig, AmoFieldIds, Secret};
use crate::orders::gateways::{CrmGateway, LeadDraft, LeadSnapshot};
use crate::orders::status::{map_status, PAID_SET};

const SERVICE: &str = "amocrm";
const PAGE_LIMIT: usize = 50;
const STATUS_PAGES: usize = 10;
const PREMIUM_PAGES: usize = 20;
const PREMIUM_WINDOW_DAYS: i64 = 62;
const PREMIUM_MIN_PRICE: i64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Unknown for tokens seeded from the environment; those are used
    /// until the first 401.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    fn is_expired(&self, now: DateTime<Utc>) -> bool { self.expires_at.is_some_and(|at| now >= at) }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenSet>, UpstreamError>;
    async fn save(&self, tokens: &TokenSet) -> Result<(), UpstreamError>;
}

/// Tokens as a JSON file next to the service.
pub struct FileTokenStore { path: PathBuf }

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<TokenSet>, UpstreamError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "token_store", message: e.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UpstreamError::Auth { service: SERVICE, message: format!("cannot read token file: {}", e) }),
        }
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), UpstreamError> {
        let bytes = serde_json::to_vec_pretty(tokens)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "token_store", message: e.to_string() })?;
        let tmp = self.path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| UpstreamError::Auth { service: SERVICE, message: format!("cannot write token file: {}", e) })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthResponse { access_token: String, refresh_token: String, expires_in: i64 }

#[derive(Debug, Clone, Deserialize)]
struct Lead {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    price: Option<i64>,
    status_id: i64,
    #[serde(default)]
    created_at: i64,
    #[serde(rename = "_embedded", default)]
    embedded: Option<LeadEmbedded>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LeadEmbedded {
    #[serde(default)]
    contacts: Vec<ContactRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContactRef {
    id: i64,
    #[serde(default)]
    is_main: bool,
}

impl Lead {
    fn snapshot(&self) -> LeadSnapshot {
        LeadSnapshot {
            id: self.id,
            name: self.name.clone(),
            status_id: self.status_id,
            price: self.price.unwrap_or_default(),
            created_at: Utc.timestamp_opt(self.created_at, 0).single().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LeadPage {
    #[serde(rename = "_embedded")]
    embedded: LeadList,
}

#[derive(Debug, Deserialize)]
struct LeadList {
    #[serde(default)]
    leads: Vec<Lead>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumResult { Eligible, NotFound, Old, Low, Used }

/// Outcome of checking an external order code for premium redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PremiumLookup {
    pub result: PremiumResult,
    pub price: Option<i64>,
    pub email: Option<String>,
    pub code: Option<String>,
}

impl PremiumLookup {
    pub fn rejected(result: PremiumResult) -> Self { Self { result, price: None, email: None, code: None } }
}

/// Status of the lead for an order code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderStatus { pub lead_id: i64, pub status: String, pub is_complete: bool }

/// Pattern a lead name must match to belong to order `code`.
fn order_name_pattern(code: &str) -> Option<Regex> { Regex::new(&format!(r"^.*№{}\s", regex::escape(code.trim()))).ok() }

pub fn verification_code() -> String { format!("{:06}", rand::thread_rng().gen_range(0..1_000_000)) }

/// Picks the lead that decides a premium redemption among those named for
/// the order.
fn judge_premium(leads: &[LeadSnapshot], now: DateTime<Utc>) -> Result<LeadSnapshot, PremiumResult> {
    let paid: Vec<&LeadSnapshot> = leads.iter().filter(|l| PAID_SET.contains(&l.status_id)).collect();
    let Some(latest) = paid.iter().max_by_key(|l| l.created_at) else { return Err(PremiumResult::NotFound) };
    if latest.created_at < now - Duration::days(PREMIUM_WINDOW_DAYS) {
        return Err(PremiumResult::Old);
    }
    if latest.price <= PREMIUM_MIN_PRICE {
        return Err(PremiumResult::Low);
    }
    Ok((*latest).clone())
}

fn custom_field(field_id: i64, value: impl Serialize) -> Value { json!({ "field_id": field_id, "values": [{ "value": value }] }) }

fn lead_fields(fields: &AmoFieldIds, draft: &LeadDraft) -> Vec<Value> {
    let mut out = vec![
        custom_field(fields.address, &draft.address),
        custom_field(fields.delivery_service, &draft.delivery_service),
        custom_field(fields.delivery_sum, draft.delivery_sum.whole_rubles()),
        custom_field(fields.payment_method, &draft.payment_method),
    ];
    if let Some(code) = &draft.promo_code {
        out.push(custom_field(fields.promo_code, code));
    }
    if let Some(tracking) = &draft.tracking_number {
        out.push(custom_field(fields.tracking_number, tracking));
    }
    out
}

fn contact_body(draft: &LeadDraft) -> Value {
    let mut values = vec![json!({ "field_code": "PHONE", "values": [{ "value": draft.contact.phone, "enum_code": "WORK" }] })];
    if let Some(email) = draft.contact.email.as_deref().filter(|e| !e.trim().is_empty()) {
        values.push(json!({ "field_code": "EMAIL", "values": [{ "value": email, "enum_code": "WORK" }] }));
    }
    json!([{ "name": draft.contact.name, "custom_fields_values": values }])
}

fn first_embedded_id(body: &Value, entity: &str) -> Option<i64> { body["_embedded"][entity][0]["id"].as_i64() }

fn contact_email(contact: &Value) -> Option<String> {
    contact["custom_fields_values"]
        .as_array()?
        .iter()
        .find(|f| f["field_code"] == "EMAIL")?["values"]
        .as_array()?
        .iter()
        .filter_map(|v| v["value"].as_str())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

struct TokenState { tokens: Option<TokenSet>, loaded: bool, auth_code_used: bool }

pub struct AmoCrm {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: Secret,
    redirect_uri: String,
    long_token: Secret,
    auth_code: Secret,
    seed: Option<TokenSet>,
    pipeline_id: i64,
    fields: AmoFieldIds,
    state: Mutex<TokenState>,
    store: Arc<dyn TokenStore>,
    auth_provider: Arc<dyn AuthCodeProvider>,
    mailer: Arc<dyn VerificationMailer>,
}

impl AmoCrm {
    pub fn new(
        config: &AmoCrmConfig,
        store: Arc<dyn TokenStore>,
        auth_provider: Arc<dyn AuthCodeProvider>,
        mailer: Arc<dyn VerificationMailer>,
    ) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        let base_url = match config.base_domain.trim() {
            "" => String::new(),
            d if d.starts_with("http") => d.trim_end_matches('/').to_string(),
            d => format!("https://{}", d.trim_end_matches('/')),
        };
        let seed = (!config.access_token.is_empty()).then(|| TokenSet {
            access_token: config.access_token.expose().to_string(),
            refresh_token: config.refresh_token.expose().to_string(),
            expires_at: None,
        });
        Ok(Self {
            client,
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            long_token: config.long_token.clone(),
            auth_code: config.auth_code.clone(),
            seed,
            pipeline_id: config.pipeline_id,
            fields: config.fields,
            state: Mutex::new(TokenState { tokens: None, loaded: false, auth_code_used: false }),
            store,
            auth_provider,
            mailer,
        })
    }

    async fn exchange(&self, grant: &[(&str, &str)]) -> Result<TokenSet, UpstreamError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        form.extend_from_slice(grant);
        let response = self
            .client
            .post(format!("{}/oauth2/access_token", self.base_url))
            .json(&form.into_iter().collect::<HashMap<_, _>>())
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, "oauth"))?;
        let body: OAuthResponse = super::read_json(SERVICE, "oauth", response).await?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Some(Utc::now() + Duration::seconds(body.expires_in)),
        })
    }

    /// Refresh, then the authorization-code flow. Must be called with the
    /// token lock held.
    async fn renew(&self, state: &mut TokenState) -> Result<String, UpstreamError> {
        let refreshed = match state.tokens.as_ref().filter(|t| !t.refresh_token.is_empty()) {
            Some(t) => {
                let refresh_token = t.refresh_token.clone();
                self.exchange(&[("grant_type", "refresh_token"), ("refresh_token", &refresh_token)]).await
            }
            None => Err(UpstreamError::Auth { service: SERVICE, message: "no refresh token".into() }),
        };
        let tokens = match refreshed {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "amocrm refresh failed, re-authorizing");
                let code = if !self.auth_code.is_empty() && !state.auth_code_used {
                    state.auth_code_used = true;
                    self.auth_code.expose().to_string()
                } else {
                    self.auth_provider.authorization_code().await?
                };
                self.exchange(&[("grant_type", "authorization_code"), ("code", &code)]).await?
            }
        };
        if let Err(e) = self.store.save(&tokens).await {
            warn!(error = %e, "amocrm tokens not persisted");
        }
        info!(expires_at = ?tokens.expires_at, "amocrm tokens renewed");
        let access = tokens.access_token.clone();
        state.tokens = Some(tokens);
        Ok(access)
    }

    async fn access_token(&self, force_renew: bool) -> Result<String, UpstreamError> {
        if !self.long_token.is_empty() {
            return Ok(self.long_token.expose().to_string());
        }
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.loaded = true;
            state.tokens = match self.store.load().await {
                Ok(Some(tokens)) => Some(tokens),
                Ok(None) => self.seed.clone(),
                Err(e) => {
                    warn!(error = %e, "amocrm token file unreadable");
                    self.seed.clone()
                }
            };
        }
        match &state.tokens {
            Some(t) if !force_renew && !t.is_expired(Utc::now()) => Ok(t.access_token.clone()),
            _ => self.renew(&mut state).await,
        }
    }

    /// Sends one API request, renewing the token and retrying once on
    /// 401/403. `Ok(None)` stands for 204 and 404.
    async fn send(&self, method: Method, path: &str, query: &[(&str, String)], body: Option<&Value>, stage: &'static str) -> Result<Option<Value>, UpstreamError> {
        if self.base_url.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let url = format!("{}/api/v4/{}", self.base_url, path.trim_start_matches('/'));
        let mut renewed = false;
        loop {
            let token = self.access_token(renewed).await?;
            let mut request = self.client.request(method.clone(), &url).bearer_auth(token).query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(UpstreamError::transport(SERVICE, stage))?;
            let status = response.status();
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) && !renewed {
                debug!(stage, status = status.as_u16(), "amocrm rejected token, renewing");
                renewed = true;
                continue;
            }
            if matches!(status, StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) {
                return Ok(None);
            }
            let response = super::check_status(SERVICE, stage, response).await?;
            let bytes = response.bytes().await.map_err(UpstreamError::transport(SERVICE, stage))?;
            if bytes.is_empty() {
                return Ok(None);
            }
            return serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| UpstreamError::Decode { service: SERVICE, stage, message: e.to_string() });
        }
    }

    async fn leads_page(&self, query: &str, page: usize) -> Result<Vec<Lead>, UpstreamError> {
        let params = [("query", query.to_string()), ("limit", PAGE_LIMIT.to_string()), ("page", page.to_string())];
        let Some(body) = self.send(Method::GET, "leads", &params, None, "leads").await? else { return Ok(vec![]) };
        let page: LeadPage = serde_json::from_value(body)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "leads", message: e.to_string() })?;
        Ok(page.embedded.leads)
    }

    /// Leads named for order `code`, scanning at most `pages` pages.
    async fn leads_for_code(&self, code: &str, pages: usize) -> Result<Vec<Lead>, UpstreamError> {
        let pattern = order_name_pattern(code)
            .ok_or_else(|| UpstreamError::Decode { service: SERVICE, stage: "leads", message: "bad order code".into() })?;
        let query = format!("№{}", code.trim());
        let mut found = Vec::new();
        for page in 1..=pages {
            let leads = self.leads_page(&query, page).await?;
            let count = leads.len();
            found.extend(leads.into_iter().filter(|l| pattern.is_match(&l.name)));
            if count < PAGE_LIMIT {
                break;
            }
        }
        Ok(found)
    }

    /// First lead named for order `code` and its mapped status.
    pub async fn order_status(&self, code: &str) -> Result<Option<OrderStatus>, UpstreamError> {
        let lead = self.leads_for_code(code, STATUS_PAGES).await?.into_iter().next();
        Ok(lead.map(|l| {
            let mapped = map_status(l.status_id);
            if !mapped.known {
                warn!(lead_id = l.id, status_id = l.status_id, "unknown amocrm status");
            }
            OrderStatus { lead_id: l.id, status: mapped.label, is_complete: !mapped.is_active && mapped.known }
        }))
    }

    async fn main_contact_email(&self, lead_id: i64) -> Result<Option<String>, UpstreamError> {
        let params = [("with", "contacts".to_string())];
        let Some(body) = self.send(Method::GET, &format!("leads/{}", lead_id), &params, None, "lead_contacts").await? else {
            return Ok(None);
        };
        let lead: Lead = serde_json::from_value(body)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "lead_contacts", message: e.to_string() })?;
        let contacts = lead.embedded.unwrap_or_default().contacts;
        let Some(contact) = contacts.iter().find(|c| c.is_main).or(contacts.first()) else { return Ok(None) };
        let contact = self.send(Method::GET, &format!("contacts/{}", contact.id), &[], None, "contact").await?;
        Ok(contact.as_ref().and_then(contact_email))
    }

    /// Checks an order code for premium redemption and, when it qualifies,
    /// mails a 6-digit code to the buyer.
    pub async fn premium_lookup(&self, order_code: &str) -> Result<PremiumLookup, UpstreamError> {
        let now = Utc::now();
        let leads = self.leads_for_code(order_code, PREMIUM_PAGES).await?;
        let snapshots: Vec<LeadSnapshot> = leads.iter().map(Lead::snapshot).collect();
        let lead = match judge_premium(&snapshots, now) {
            Ok(lead) => lead,
            Err(result) => {
                info!(order_code, ?result, "premium lookup rejected");
                return Ok(PremiumLookup::rejected(result));
            }
        };
        let Some(email) = self.main_contact_email(lead.id).await? else {
            return Ok(PremiumLookup::rejected(PremiumResult::NotFound));
        };
        let code = verification_code();
        self.mailer.send_code(&email, &code).await?;
        info!(order_code, lead_id = lead.id, price = lead.price, "premium verification code sent");
        Ok(PremiumLookup { result: PremiumResult::Eligible, price: Some(lead.price), email: Some(email), code: Some(code) })
    }
}

#[async_trait]
impl CrmGateway for AmoCrm {
    /// Contact, lead with the contact linked, then the breakdown note.
    async fn create_order_lead(&self, draft: &LeadDraft) -> Result<i64, UpstreamError> {
        let contacts = self.send(Method::POST, "contacts", &[], Some(&contact_body(draft)), "contact").await?;
        let contact_id = contacts.as_ref().and_then(|b| first_embedded_id(b, "contacts"));

        let mut lead = json!({
            "name": draft.name,
            "price": draft.price,
            "pipeline_id": self.pipeline_id,
            "status_id": draft.status_id,
            "custom_fields_values": lead_fields(&self.fields, draft),
        });
        if let Some(id) = contact_id {
            lead["_embedded"] = json!({ "contacts": [{ "id": id, "is_main": true }] });
        }
        let created = self.send(Method::POST, "leads", &[], Some(&json!([lead])), "lead").await?;
        let lead_id = created
            .as_ref()
            .and_then(|b| first_embedded_id(b, "leads"))
            .ok_or_else(|| UpstreamError::Decode { service: SERVICE, stage: "lead", message: "no lead id in response".into() })?;

        let note = json!([{ "note_type": "common", "params": { "text": draft.note } }]);
        if let Err(e) = self.send(Method::POST, &format!("leads/{}/notes", lead_id), &[], Some(&note), "note").await {
            warn!(lead_id, error = %e, "lead note not attached");
        }
        info!(cart_id = draft.cart_id, lead_id, "amocrm lead created");
        Ok(lead_id)
    }

    async fn lead(&self, lead_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError> {
        let Some(body) = self.send(Method::GET, &format!("leads/{}", lead_id), &[], None, "lead").await? else {
            return Ok(None);
        };
        let lead: Lead = serde_json::from_value(body)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "lead", message: e.to_string() })?;
        Ok(Some(lead.snapshot()))
    }

    async fn find_order_lead(&self, cart_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError> {
        let leads = self.leads_for_code(&cart_id.to_string(), STATUS_PAGES).await?;
        Ok(leads.first().map(Lead::snapshot))
    }

    async fn set_tracking(&self, lead_id: i64, tracking: &str) -> Result<(), UpstreamError> {
        let body = json!({ "custom_fields_values": [custom_field(self.fields.tracking_number, tracking)] });
        self.send(Method::PATCH, &format!("leads/{}", lead_id), &[], Some(&body), "tracking").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status_id: i64, price: i64, age_days: i64, now: DateTime<Utc>) -> LeadSnapshot {
        LeadSnapshot { id: 1, name: "Заказ №555 ".into(), status_id, price, created_at: now - Duration::days(age_days) }
    }

    #[test]
    fn test_order_name_pattern() {
        let p = order_name_pattern("1234567").unwrap();
        assert!(p.is_match("Заказ №1234567 с Приложения ТГ"));
        assert!(!p.is_match("Заказ №12345678 с Приложения ТГ"));
        assert!(!p.is_match("Заказ №1234567"));
    }

    #[test]
    fn test_premium_rules() {
        let now = Utc::now();
        let paid = crate::orders::status::PAID;
        assert_eq!(judge_premium(&[], now), Err(PremiumResult::NotFound));
        assert_eq!(judge_premium(&[snapshot(crate::orders::status::CREATED, 9000, 1, now)], now), Err(PremiumResult::NotFound));
        assert_eq!(judge_premium(&[snapshot(paid, 9000, 70, now)], now), Err(PremiumResult::Old));
        assert_eq!(judge_premium(&[snapshot(paid, 5000, 3, now)], now), Err(PremiumResult::Low));
        assert_eq!(judge_premium(&[snapshot(paid, 5001, 3, now)], now).unwrap().price, 5001);
    }

    #[test]
    fn test_contact_email_and_ids() {
        let contact = json!({ "custom_fields_values": [
            { "field_code": "PHONE", "values": [{ "value": "+7999" }] },
            { "field_code": "EMAIL", "values": [{ "value": " " }, { "value": "buyer@example.com" }] }
        ]});
        assert_eq!(contact_email(&contact).as_deref(), Some("buyer@example.com"));
        assert_eq!(first_embedded_id(&json!({ "_embedded": { "leads": [{ "id": 42 }] } }), "leads"), Some(42));
        assert_eq!(verification_code().len(), 6);
    }

    #[test]
    fn test_lead_parse() {
        let raw = json!({ "id": 7, "name": "Заказ №1 с Приложения ТГ", "price": 1195, "status_id": 142, "created_at": 1_700_000_000 });
        let lead: Lead = serde_json::from_value(raw).unwrap();
        let s = lead.snapshot();
        assert_eq!((s.id, s.price, s.status_id), (7, 1195, 142));
        assert_eq!(s.created_at.timestamp(), 1_700_000_000);
    }
}
