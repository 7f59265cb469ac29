//! Ports the order engine drives: payment, CRM and carrier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::delivery::{Shipment, TariffRequest};
use super::receipt::Receipt;
use super::ContactInfo;
use crate::domain::Money;
use crate::integrations::UpstreamError;

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub idempotence_key: Uuid,
    pub cart_id: i64,
    pub amount: Money,
    pub description: String,
    pub return_url: String,
    pub receipt: Receipt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPayment { pub id: String, pub status: String, pub confirmation_url: String }

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, UpstreamError>;
}

/// Everything the CRM lead carries for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadDraft {
    pub cart_id: i64,
    pub name: String,
    pub price: i64,
    pub status_id: i64,
    pub contact: ContactInfo,
    pub address: String,
    pub delivery_service: String,
    pub tracking_number: Option<String>,
    pub promo_code: Option<String>,
    pub delivery_sum: Money,
    pub payment_method: String,
    pub note: String,
}

impl LeadDraft {
    pub fn lead_name(cart_id: i64) -> String { format!("Заказ №{} с Приложения ТГ", cart_id) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadSnapshot {
    pub id: i64,
    pub name: String,
    pub status_id: i64,
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CrmGateway: Send + Sync {
    /// Lead, contact, link and note. Returns the lead id.
    async fn create_order_lead(&self, draft: &LeadDraft) -> Result<i64, UpstreamError>;
    async fn lead(&self, lead_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError>;
    /// The lead whose name carries `№<cart_id>`.
    async fn find_order_lead(&self, cart_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError>;
    async fn set_tracking(&self, lead_id: i64, tracking: &str) -> Result<(), UpstreamError>;
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    async fn quote(&self, request: &TariffRequest) -> Result<Money, UpstreamError>;
    /// Registers the shipment and returns the carrier's order uuid.
    async fn book(&self, shipment: &Shipment) -> Result<String, UpstreamError>;
}
