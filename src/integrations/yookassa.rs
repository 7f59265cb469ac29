//! YooKassa payments: payment creation and webhook verification.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::{http_client, read_json, UpstreamError, REQUEST_TIMEOUT};
use crate::config::{Secret, YooKassaConfig};
use crate::orders::gateways::{CreatedPayment, PaymentGateway, PaymentRequest};
use crate::orders::receipt::{Amount, Receipt};

const SERVICE: &str = "yookassa";

pub const SIGNATURE_HEADER: &str = "X-Yookassa-Signature";

#[derive(Serialize)]
struct Confirmation<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: &'a str,
}

#[derive(Serialize)]
struct Metadata { cart_id: String }

#[derive(Serialize)]
struct CreatePayment<'a> {
    amount: Amount,
    capture: bool,
    confirmation: Confirmation<'a>,
    description: &'a str,
    metadata: Metadata,
    receipt: &'a Receipt,
}

#[derive(Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    #[serde(default)]
    confirmation: Option<ConfirmationResponse>,
}

#[derive(Deserialize)]
struct ConfirmationResponse {
    #[serde(default)]
    confirmation_url: Option<String>,
}

pub struct YooKassa {
    client: Client,
    api_url: String,
    shop_id: String,
    secret_key: Secret,
}

impl YooKassa {
    pub fn new(config: &YooKassaConfig) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            shop_id: config.shop_id.clone(),
            secret_key: config.secret_key.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for YooKassa {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, UpstreamError> {
        if self.shop_id.is_empty() || self.secret_key.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let body = CreatePayment {
            amount: Amount::rub(request.amount),
            capture: true,
            confirmation: Confirmation { kind: "redirect", return_url: &request.return_url },
            description: &request.description,
            metadata: Metadata { cart_id: request.cart_id.to_string() },
            receipt: &request.receipt,
        };
        let response = self
            .client
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(self.secret_key.expose()))
            .header("Idempotence-Key", request.idempotence_key.to_string())
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, "create_payment"))?;
        let payment: PaymentResponse = read_json(SERVICE, "create_payment", response).await?;
        debug!(cart_id = request.cart_id, payment_id = %payment.id, status = %payment.status, "payment created");

        let confirmation_url = payment.confirmation.and_then(|c| c.confirmation_url).ok_or_else(|| UpstreamError::Decode {
            service: SERVICE,
            stage: "create_payment",
            message: "payment has no confirmation_url".into(),
        })?;
        Ok(CreatedPayment { id: payment.id, status: payment.status, confirmation_url })
    }
}

/// Hex HMAC-SHA-256 of the raw body keyed by the shop secret, compared in
/// constant time.
pub fn verify_signature(secret: &Secret, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature.trim()) else { return false };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes()) else { return false };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Notification body; only the fields the order engine acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub event: String,
    pub object: NotificationObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl Notification {
    pub fn is_payment_succeeded(&self) -> bool {
        self.event == "payment.succeeded" && self.object.status == "succeeded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature() {
        let secret = Secret::new("live_secret");
        let body = br#"{"event":"payment.succeeded"}"#;
        assert!(verify_signature(&secret, body, &sign("live_secret", body)));
        assert!(!verify_signature(&secret, body, &sign("other", body)));
        assert!(!verify_signature(&secret, body, "not-hex"));
        assert!(!verify_signature(&Secret::default(), body, &sign("", body)));
    }

    #[test]
    fn test_notification_parse() {
        let raw = r#"{"type":"notification","event":"payment.succeeded",
            "object":{"id":"2c5d-000f","status":"succeeded","paid":true,"metadata":{"cart_id":"1234567"}}}"#;
        let n: Notification = serde_json::from_str(raw).unwrap();
        assert!(n.is_payment_succeeded());
        assert_eq!(n.object.metadata["cart_id"], "1234567");
    }
}
