//! Delivery choice captured at checkout and the shipment built from it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Basket, Money};

pub const ITEM_WEIGHT_G: u32 = 179;
pub const MIN_WEIGHT_G: u32 = 357;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryService { Cdek, Yandex }

impl DeliveryService {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Cdek => "cdek", Self::Yandex => "yandex" }
    }

    pub fn label(&self) -> &'static str {
        match self { Self::Cdek => "СДЭК", Self::Yandex => "Яндекс Доставка" }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cdek" | "сдэк" => Some(Self::Cdek),
            "yandex" | "яндекс" => Some(Self::Yandex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Pickup at a carrier office / pickup point.
    Office,
    Door,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySelection {
    pub mode: DeliveryMode,
    #[serde(default)]
    pub tariff_code: Option<i32>,
    /// Quoted fee; authoritative only for Yandex, CDEK is re-quoted.
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub office_code: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub city_code: Option<i64>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl DeliverySelection {
    /// Checks the fields the chosen service needs. Returns the offending
    /// field and a message.
    pub fn check(&self, service: DeliveryService) -> Result<(), (&'static str, &'static str)> {
        match self.mode {
            DeliveryMode::Office if self.office_code.as_deref().map_or(true, |c| c.trim().is_empty()) => {
                return Err(("office_code", "pickup point is required"));
            }
            DeliveryMode::Door if self.address.trim().is_empty() => return Err(("address", "address is required")),
            _ => {}
        }
        match service {
            DeliveryService::Cdek if self.tariff_code.is_none() => Err(("tariff_code", "CDEK tariff is required")),
            DeliveryService::Cdek if self.mode == DeliveryMode::Door && self.city_code.is_none() => {
                Err(("city_code", "CDEK city code is required for door delivery"))
            }
            DeliveryService::Yandex if self.price.map_or(true, |p| p < Decimal::ZERO) => Err(("price", "delivery price is required")),
            _ => Ok(()),
        }
    }

    /// Human-readable line stored on the cart and sent to the CRM.
    pub fn describe(&self, service: DeliveryService) -> String {
        let target = match self.mode {
            DeliveryMode::Office => format!("ПВЗ {}", self.office_code.as_deref().unwrap_or_default()),
            DeliveryMode::Door => "до двери".to_string(),
        };
        let address = [self.city.as_deref().unwrap_or_default(), self.address.as_str()]
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if address.is_empty() {
            format!("{}, {}", service.label(), target)
        } else {
            format!("{}, {}: {}", service.label(), target, address)
        }
    }
}

/// The single envelope every order ships in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Package { pub weight: u32, pub length: u32, pub width: u32, pub height: u32 }

impl Package {
    pub fn for_items(count: u32) -> Self {
        Self { weight: MIN_WEIGHT_G.max(ITEM_WEIGHT_G.saturating_mul(count)), length: 24, width: 18, height: 7 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient { pub name: String, pub phone: String, pub email: Option<String> }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShipmentItem { pub name: String, pub ware_key: String, pub cost: Money, pub amount: u32, pub weight: u32 }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shipment {
    pub cart_id: i64,
    pub order_name: String,
    pub tariff_code: i32,
    pub selection: DeliverySelection,
    pub recipient: Recipient,
    pub package: Package,
    pub items: Vec<ShipmentItem>,
}

impl Shipment {
    pub fn items_from(basket: &Basket) -> Vec<ShipmentItem> {
        basket
            .lines()
            .iter()
            .map(|l| ShipmentItem {
                name: format!("{} {}", l.product_name, l.feature_name).trim().to_string(),
                ware_key: l.feature_onec_id.clone(),
                cost: l.unit_price,
                amount: l.quantity.value(),
                weight: ITEM_WEIGHT_G,
            })
            .collect()
    }
}

/// Request for a single CDEK tariff price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TariffRequest {
    pub tariff_code: i32,
    pub selection: DeliverySelection,
    pub package: Package,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn selection(mode: DeliveryMode) -> DeliverySelection {
        DeliverySelection {
            mode, tariff_code: Some(136), price: None, office_code: Some("MSK123".into()), address: "ул. Ленина, 1".into(),
            city: Some("Москва".into()), city_code: Some(44), postal_code: None,
        }
    }

    #[test]
    fn test_package_weight() {
        assert_eq!(Package::for_items(1).weight, 357);
        assert_eq!(Package::for_items(2).weight, 358);
        assert_eq!(Package::for_items(5).weight, 895);
        assert_eq!((Package::for_items(1).width, Package::for_items(1).height, Package::for_items(1).length), (18, 7, 24));
    }

    #[test]
    fn test_check_requirements() {
        assert!(selection(DeliveryMode::Office).check(DeliveryService::Cdek).is_ok());
        let mut s = selection(DeliveryMode::Office);
        s.office_code = None;
        assert_eq!(s.check(DeliveryService::Cdek).unwrap_err().0, "office_code");
        let mut s = selection(DeliveryMode::Door);
        assert_eq!(s.check(DeliveryService::Yandex).unwrap_err().0, "price");
        s.price = Some(dec!(350));
        assert!(s.check(DeliveryService::Yandex).is_ok());
    }

    #[test]
    fn test_describe() {
        let s = selection(DeliveryMode::Office);
        assert_eq!(s.describe(DeliveryService::Cdek), "СДЭК, ПВЗ MSK123: Москва, ул. Ленина, 1");
        assert_eq!(DeliveryService::parse("CDEK"), Some(DeliveryService::Cdek));
    }
}
