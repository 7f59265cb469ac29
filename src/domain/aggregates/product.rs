//! Catalog aggregates: units, categories, products and their features
//!
//! Everything here is keyed by `onec_id`, the identifier the 1C ERP hands
//! out. Only the catalog synchronizer creates or updates these rows; the
//! cart and search paths read them.

use serde::{Deserialize, Serialize};
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unit { pub onec_id: String, pub name: String, pub description: String }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Category { pub onec_id: String, pub name: String, pub unit_onec_id: Option<String> }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub onec_id: String,
    pub name: String,
    pub code: String,
    pub description: String,
    pub usage: String,
    pub expiration: String,
    pub category_onec_id: String,
}

/// A purchasable variant of a product (dosage, volume).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feature {
    pub onec_id: String,
    pub product_onec_id: String,
    pub name: String,
    pub code: String,
    pub file_id: Option<String>,
    pub price: Money,
    pub balance: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TgCategory { pub id: i32, pub name: String, pub description: String }

/// How a set of tg_category ids filters products.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TgCategoryMode {
    /// At least one of the ids.
    #[default]
    Any,
    /// Every one of the ids.
    All,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductWithFeatures {
    #[serde(flatten)]
    pub product: Product,
    pub features: Vec<Feature>,
}

impl ProductWithFeatures {
    pub fn in_stock(&self) -> bool { self.features.iter().any(Feature::in_stock) }
    pub fn min_price(&self) -> Option<Money> { self.features.iter().map(|f| f.price).min() }
    pub fn feature(&self, onec_id: &str) -> Option<&Feature> { self.features.iter().find(|f| f.onec_id == onec_id) }
}

impl Product {
    pub fn validate(&self) -> Result<(), ProductError> {
        if self.name.trim().is_empty() { return Err(ProductError::MissingName); }
        if self.code.trim().is_empty() { return Err(ProductError::MissingCode); }
        Ok(())
    }
}

impl Feature {
    pub fn in_stock(&self) -> bool { self.balance > 0 }

    pub fn validate(&self) -> Result<(), ProductError> {
        if self.balance < 0 { return Err(ProductError::NegativeBalance(self.balance)); }
        if self.price.is_negative() { return Err(ProductError::NegativePrice); }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)] pub enum ProductError { MissingName, MissingCode, NegativeBalance(i32), NegativePrice }
impl std::error::Error for ProductError {}
impl std::fmt::Display for ProductError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingName => write!(f, "Missing name"),
            Self::MissingCode => write!(f, "Missing code"),
            Self::NegativeBalance(b) => write!(f, "Negative balance {}", b),
            Self::NegativePrice => write!(f, "Negative price"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_validate() {
        let mut p = product("P1");
        assert!(p.validate().is_ok());
        p.code = "  ".into();
        assert_eq!(p.validate(), Err(ProductError::MissingCode));
    }

    #[test]
    fn test_stock_and_min_price() {
        let p = ProductWithFeatures {
            product: product("P1"),
            features: vec![feature("P1", "F1", dec!(1000), 0), feature("P1", "F2", dec!(750), 3)],
        };
        assert!(p.in_stock());
        assert_eq!(p.min_price(), Some(Money::new(dec!(750))));
        assert!(p.feature("F1").is_some());
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let m: TgCategoryMode = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(m, TgCategoryMode::All);
    }
}
