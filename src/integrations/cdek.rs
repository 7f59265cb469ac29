//! CDEK API v2: OAuth client-credentials token, office lookup, tariff
//! calculation and order registration.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{http_client, read_json, UpstreamError, REQUEST_TIMEOUT};
use crate::config::{CdekConfig, CdekSender, Secret};
use crate::domain::Money;
use crate::orders::delivery::{DeliveryMode, DeliverySelection, Package, Shipment, TariffRequest};
use crate::orders::gateways::CarrierGateway;

const SERVICE: &str = "cdek";

/// Tokens are renewed this long before they expire.
pub const TOKEN_MARGIN: Duration = Duration::from_secs(30);

/// Tariff names the storefront offers.
const OFFERED_TARIFFS: [&str; 2] = ["склад-склад", "склад-дверь"];

#[derive(Debug, Deserialize)]
struct TokenResponse { access_token: String, expires_in: u64 }

#[derive(Debug, Clone)]
struct CachedToken { value: String, expires_at: Instant }

#[derive(Debug, Deserialize)]
struct TariffResponse { total_sum: Decimal }

#[derive(Debug, Deserialize)]
struct OrderResponse {
    entity: Option<Entity>,
    #[serde(default)]
    requests: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Entity { uuid: String }

#[derive(Serialize)]
struct PackageBody {
    number: String,
    weight: u32,
    length: u32,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    items: Vec<Value>,
}

impl PackageBody {
    fn new(package: &Package) -> Self {
        Self {
            number: "1".into(),
            weight: package.weight,
            length: package.length,
            width: package.width,
            height: package.height,
            items: vec![],
        }
    }
}

pub struct Cdek {
    client: Client,
    api_url: String,
    account: String,
    secure_password: Secret,
    sender: CdekSender,
    token: RwLock<Option<CachedToken>>,
}

impl Cdek {
    pub fn new(config: &CdekConfig) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            account: config.account.clone(),
            secure_password: config.secure_password.clone(),
            sender: config.sender.clone(),
            token: RwLock::new(None),
        })
    }

    pub fn is_configured(&self) -> bool { !self.account.is_empty() && !self.secure_password.is_empty() }

    /// Fetches a fresh token and returns how long to wait before the next
    /// refresh.
    pub async fn refresh_token(&self) -> Result<Duration, UpstreamError> {
        if !self.is_configured() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let response = self
            .client
            .post(format!("{}/oauth/token", self.api_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.account.as_str()),
                ("client_secret", self.secure_password.expose()),
            ])
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, "token"))?;
        let token: TokenResponse = read_json(SERVICE, "token", response).await?;
        let lifetime = Duration::from_secs(token.expires_in);
        *self.token.write().await = Some(CachedToken { value: token.access_token, expires_at: Instant::now() + lifetime });
        info!(expires_in = token.expires_in, "cdek token refreshed");
        Ok(lifetime.saturating_sub(TOKEN_MARGIN).max(Duration::from_secs(1)))
    }

    async fn bearer(&self) -> Result<String, UpstreamError> {
        if let Some(token) = self.token.read().await.as_ref().filter(|t| Instant::now() + TOKEN_MARGIN < t.expires_at) {
            return Ok(token.value.clone());
        }
        self.refresh_token().await?;
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or(UpstreamError::Auth { service: SERVICE, message: "no token after refresh".into() })
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, stage: &'static str, request: RequestBuilder) -> Result<T, UpstreamError> {
        let token = self.bearer().await?;
        let response = request.bearer_auth(token).send().await.map_err(UpstreamError::transport(SERVICE, stage))?;
        read_json(SERVICE, stage, response).await
    }

    /// Pickup points matching the storefront's filter (city code, postal
    /// code, type and so on), passed through as query parameters.
    pub async fn offices(&self, params: &Value) -> Result<Value, UpstreamError> {
        let query: Vec<(String, String)> = params
            .as_object()
            .map(|m| {
                m.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        self.send("offices", self.client.get(format!("{}/deliverypoints", self.api_url)).query(&query)).await
    }

    /// All tariffs for the route, narrowed to the ones the shop sells.
    pub async fn calculate(&self, params: &Value) -> Result<Value, UpstreamError> {
        let mut body = if params.is_object() { params.clone() } else { json!({}) };
        if body.get("from_location").is_none() {
            body["from_location"] = self.from_location();
        }
        let mut response: Value =
            self.send("calculate", self.client.post(format!("{}/calculator/tarifflist", self.api_url)).json(&body)).await?;
        if let Some(tariffs) = response.get_mut("tariff_codes").and_then(Value::as_array_mut) {
            filter_offered(tariffs);
        }
        Ok(response)
    }

    fn from_location(&self) -> Value {
        match self.sender.city_code {
            Some(code) => json!({ "code": code }),
            None => json!({ "address": self.sender.address }),
        }
    }

    fn to_location(selection: &DeliverySelection) -> Value {
        let mut location = json!({ "address": selection.address });
        if let Some(code) = selection.city_code {
            location["code"] = json!(code);
        }
        if let Some(postal) = &selection.postal_code {
            location["postal_code"] = json!(postal);
        }
        location
    }

    fn order_body(&self, shipment: &Shipment) -> Value {
        let mut package = PackageBody::new(&shipment.package);
        package.items = shipment
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "ware_key": item.ware_key,
                    "payment": { "value": 0 },
                    "cost": item.cost,
                    "amount": item.amount,
                    "weight": item.weight,
                })
            })
            .collect();

        let mut body = json!({
            "type": 1,
            "number": shipment.cart_id.to_string(),
            "tariff_code": shipment.tariff_code,
            "comment": shipment.order_name,
            "recipient": {
                "name": shipment.recipient.name,
                "phones": [{ "number": shipment.recipient.phone }],
            },
            "sender": {
                "name": self.sender.name,
                "company": self.sender.company,
                "phones": [{ "number": self.sender.phone }],
            },
            "packages": [package],
        });
        if let Some(email) = &shipment.recipient.email {
            body["recipient"]["email"] = json!(email);
        }
        match &self.sender.shipment_point {
            Some(point) => body["shipment_point"] = json!(point),
            None => body["from_location"] = self.from_location(),
        }
        match (shipment.selection.mode, &shipment.selection.office_code) {
            (DeliveryMode::Office, Some(code)) => body["delivery_point"] = json!(code),
            _ => body["to_location"] = Self::to_location(&shipment.selection),
        }
        body
    }
}

fn filter_offered(tariffs: &mut Vec<Value>) {
    tariffs.retain(|t| {
        let name = t.get("tariff_name").and_then(Value::as_str).unwrap_or_default().to_lowercase();
        OFFERED_TARIFFS.iter().any(|offered| name.contains(offered))
    });
}

#[async_trait]
impl CarrierGateway for Cdek {
    async fn quote(&self, request: &TariffRequest) -> Result<Money, UpstreamError> {
        let body = json!({
            "tariff_code": request.tariff_code,
            "from_location": self.from_location(),
            "to_location": Self::to_location(&request.selection),
            "packages": [PackageBody::new(&request.package)],
        });
        let tariff: TariffResponse =
            self.send("tariff", self.client.post(format!("{}/calculator/tariff", self.api_url)).json(&body)).await?;
        debug!(tariff_code = request.tariff_code, total = %tariff.total_sum, "cdek tariff quoted");
        Ok(Money::new(tariff.total_sum))
    }

    async fn book(&self, shipment: &Shipment) -> Result<String, UpstreamError> {
        let body = self.order_body(shipment);
        let order: OrderResponse = self.send("order", self.client.post(format!("{}/orders", self.api_url)).json(&body)).await?;
        match order.entity {
            Some(entity) => Ok(entity.uuid),
            None => Err(UpstreamError::Decode {
                service: SERVICE,
                stage: "order",
                message: format!("order was not accepted: {}", Value::Array(order.requests)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::delivery::{Recipient, ShipmentItem};
    use rust_decimal_macros::dec;

    fn cdek() -> Cdek {
        let config = CdekConfig {
            api_url: "https://api.example/v2/".into(),
            account: "acc".into(),
            secure_password: Secret::new("pw"),
            sender: CdekSender {
                city_code: Some(44),
                shipment_point: None,
                address: "Москва".into(),
                name: "Склад".into(),
                company: "Магазин".into(),
                phone: "+70000000000".into(),
            },
        };
        Cdek::new(&config).unwrap()
    }

    fn shipment(mode: DeliveryMode) -> Shipment {
        Shipment {
            cart_id: 1234567,
            order_name: "Заказ #1234567".into(),
            tariff_code: 136,
            selection: DeliverySelection {
                mode,
                tariff_code: Some(136),
                price: None,
                office_code: Some("MSK123".into()),
                address: "ул. Ленина, 1".into(),
                city: Some("Москва".into()),
                city_code: Some(44),
                postal_code: None,
            },
            recipient: Recipient { name: "Иван".into(), phone: "+79990001122".into(), email: None },
            package: Package::for_items(1),
            items: vec![ShipmentItem { name: "P1 F1".into(), ware_key: "F1".into(), cost: Money::new(dec!(900)), amount: 1, weight: 179 }],
        }
    }

    #[test]
    fn test_offered_tariffs_only() {
        let mut tariffs = vec![
            json!({ "tariff_code": 136, "tariff_name": "Посылка склад-склад" }),
            json!({ "tariff_code": 137, "tariff_name": "Посылка склад-дверь" }),
            json!({ "tariff_code": 138, "tariff_name": "Посылка дверь-склад" }),
            json!({ "tariff_code": 1 }),
        ];
        filter_offered(&mut tariffs);
        let codes: Vec<i64> = tariffs.iter().filter_map(|t| t["tariff_code"].as_i64()).collect();
        assert_eq!(codes, vec![136, 137]);
    }

    #[test]
    fn test_order_body_targets() {
        let c = cdek();
        let office = c.order_body(&shipment(DeliveryMode::Office));
        assert_eq!(office["delivery_point"], "MSK123");
        assert!(office.get("to_location").is_none());
        assert_eq!(office["from_location"]["code"], 44);
        assert_eq!(office["packages"][0]["weight"], 357);
        assert_eq!(office["packages"][0]["items"][0]["payment"]["value"], 0);

        let door = c.order_body(&shipment(DeliveryMode::Door));
        assert!(door.get("delivery_point").is_none());
        assert_eq!(door["to_location"]["code"], 44);
        assert_eq!(door["to_location"]["address"], "ул. Ленина, 1");
    }
}
