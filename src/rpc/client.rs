//! Bot-side client of the RPC plane.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::auth::{new_nonce, sign};
use super::{Action, RpcRequest, RpcResponse};
use crate::assistant::{MeteringError, MeteringStore, UserPatch};
use crate::config::Secret;
use crate::domain::{BotKind, User};
use crate::integrations::{http_client, UpstreamError, REQUEST_TIMEOUT};

const SERVICE: &str = "rpc";
pub const RPC_PATH: &str = "/internal/bot/rpc";

#[derive(Deserialize)]
struct ErrorBody { message: String }

#[derive(Deserialize)]
struct Total { total: i64 }

pub struct RpcClient {
    client: Client,
    url: String,
    token: Secret,
}

impl RpcClient {
    pub fn new(base_url: &str, token: Secret) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self { client, url: format!("{}{}", base_url.trim_end_matches('/'), RPC_PATH), token })
    }

    /// Calls `action` and decodes its result.
    pub async fn call<T: DeserializeOwned>(&self, action: Action, payload: Value) -> Result<T, MeteringError> {
        if self.token.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE }.into());
        }
        let signed = sign(&self.token, Utc::now().timestamp(), &new_nonce());
        let mut request = self.client.post(&self.url).json(&RpcRequest { action: action.as_str().to_string(), payload });
        for (name, value) in signed.pairs() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(UpstreamError::transport(SERVICE, action.as_str()))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(UpstreamError::transport(SERVICE, action.as_str()))?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|b| b.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).chars().take(512).collect());
            return Err(MeteringError::Rpc { action: action.as_str().to_string(), message: format!("HTTP {}: {}", status.as_u16(), message) });
        }
        let body: RpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: action.as_str(), message: e.to_string() })?;
        debug!(action = %action, "rpc answered");
        serde_json::from_value(body.result)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: action.as_str(), message: e.to_string() }.into())
    }
}

fn patch_payload(tg_id: i64, patch: &UserPatch) -> Value {
    let mut payload = serde_json::to_value(patch).unwrap_or_else(|_| json!({}));
    payload["tg_id"] = json!(tg_id);
    payload
}

#[async_trait]
impl MeteringStore for RpcClient {
    async fn ensure_user(&self, tg_id: i64) -> Result<User, MeteringError> {
        self.call(Action::UpsertUser, json!({ "tg_id": tg_id })).await
    }

    async fn update_user(&self, tg_id: i64, patch: &UserPatch) -> Result<User, MeteringError> {
        self.call(Action::UpdateUser, patch_payload(tg_id, patch)).await
    }

    async fn total_requests(&self, tg_id: i64) -> Result<i64, MeteringError> {
        let total: Total = self.call(Action::GetUserTotalRequests, json!({ "tg_id": tg_id })).await?;
        Ok(total.total)
    }

    /// Not atomic across bot processes; turns within a user are serialized
    /// by the bot dispatcher.
    async fn consume_premium_request(&self, user: &User) -> Result<bool, MeteringError> {
        if user.premium_requests <= 0 {
            return Ok(false);
        }
        let patch = UserPatch { premium_requests: Some(user.premium_requests - 1), ..Default::default() };
        self.update_user(user.tg_id, &patch).await?;
        Ok(true)
    }

    async fn refund_premium_request(&self, tg_id: i64) -> Result<(), MeteringError> {
        let user = self.ensure_user(tg_id).await?;
        let patch = UserPatch { premium_requests: Some(user.premium_requests + 1), ..Default::default() };
        self.update_user(tg_id, &patch).await?;
        Ok(())
    }

    async fn record_turn(&self, tg_id: i64, bot: BotKind, input_tokens: i64, output_tokens: i64) -> Result<(), MeteringError> {
        let payload = json!({ "tg_id": tg_id, "input_tokens": input_tokens, "output_tokens": output_tokens, "bot": bot });
        let _: User = self.call(Action::IncrementTokens, payload).await?;
        Ok(())
    }
}
