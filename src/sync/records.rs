//! 1C OData records and their resolution into catalog rows.
//!
//! The feed is read as flat JSON records (`$format=json`); field names are
//! the ERP's own. Each record type only captures the columns the catalog
//! owns.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::domain::{Category, Feature, Money, Unit};

/// 1C's empty reference.
pub const EMPTY_REF: &str = "00000000-0000-0000-0000-000000000000";

fn reference<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty() && s != EMPTY_REF))
}

fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.map(|s| s.trim().to_string()).unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitRecord {
    #[serde(rename = "Ref_Key")]
    pub ref_key: String,
    #[serde(rename = "Description", default, deserialize_with = "text")]
    pub description: String,
    #[serde(rename = "НаименованиеПолное", default, deserialize_with = "text")]
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRecord {
    #[serde(rename = "Ref_Key")]
    pub ref_key: String,
    #[serde(rename = "Description", default, deserialize_with = "text")]
    pub description: String,
    #[serde(rename = "ЕдиницаИзмерения_Key", default, deserialize_with = "reference")]
    pub unit_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "Ref_Key")]
    pub ref_key: String,
    #[serde(rename = "Description", default, deserialize_with = "text")]
    pub description: String,
    #[serde(rename = "Code", default, deserialize_with = "text")]
    pub code: String,
    #[serde(rename = "Описание", default, deserialize_with = "text")]
    pub text: String,
    #[serde(rename = "Применение", default, deserialize_with = "text")]
    pub usage: String,
    #[serde(rename = "СрокГодности", default, deserialize_with = "text")]
    pub expiration: String,
    #[serde(rename = "ВидНоменклатуры_Key", default, deserialize_with = "reference")]
    pub category_key: Option<String>,
    #[serde(rename = "Недействителен", default)]
    pub retired: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRecord {
    #[serde(rename = "Ref_Key")]
    pub ref_key: String,
    #[serde(rename = "Owner", default, deserialize_with = "reference")]
    pub owner_key: Option<String>,
    #[serde(rename = "Description", default, deserialize_with = "text")]
    pub description: String,
    #[serde(rename = "Code", default, deserialize_with = "text")]
    pub code: String,
    #[serde(rename = "ФайлКартинки_Key", default, deserialize_with = "reference")]
    pub file_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRecord {
    #[serde(rename = "Period")]
    pub period: NaiveDateTime,
    #[serde(rename = "Номенклатура_Key", default, deserialize_with = "reference")]
    pub product_key: Option<String>,
    #[serde(rename = "Характеристика_Key", default, deserialize_with = "reference")]
    pub feature_key: Option<String>,
    #[serde(rename = "Цена")]
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceRecord {
    #[serde(rename = "Номенклатура_Key", default, deserialize_with = "reference")]
    pub product_key: Option<String>,
    #[serde(rename = "Характеристика_Key", default, deserialize_with = "reference")]
    pub feature_key: Option<String>,
    #[serde(rename = "ВНаличииBalance", default)]
    pub quantity: Decimal,
}

/// Product row as the synchronizer writes it (no surrogate id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRow {
    pub onec_id: String,
    pub name: String,
    pub code: String,
    pub description: String,
    pub usage: String,
    pub expiration: String,
    pub category_onec_id: String,
}

type VariantKey = (String, String);

/// Latest price per (product, feature): the entry with the greatest period wins.
pub fn latest_prices(records: &[PriceRecord]) -> HashMap<VariantKey, Money> {
    let mut latest: HashMap<VariantKey, (NaiveDateTime, Decimal)> = HashMap::new();
    for r in records {
        let (Some(product), Some(feature)) = (&r.product_key, &r.feature_key) else { continue };
        let key = (product.clone(), feature.clone());
        match latest.get(&key) {
            Some((period, _)) if *period >= r.period => {}
            _ => {
                latest.insert(key, (r.period, r.price));
            }
        }
    }
    latest.into_iter().map(|(k, (_, price))| (k, Money::new(price))).collect()
}

/// Current stock per (product, feature), summed over warehouses and
/// clamped at zero.
pub fn balances(records: &[BalanceRecord]) -> HashMap<VariantKey, i32> {
    use rust_decimal::prelude::ToPrimitive;
    let mut totals: HashMap<VariantKey, Decimal> = HashMap::new();
    for r in records {
        let (Some(product), Some(feature)) = (&r.product_key, &r.feature_key) else { continue };
        *totals.entry((product.clone(), feature.clone())).or_default() += r.quantity;
    }
    totals
        .into_iter()
        .map(|(k, qty)| (k, qty.floor().to_i32().unwrap_or(i32::MAX).max(0)))
        .collect()
}

pub fn units(records: Vec<UnitRecord>) -> Vec<Unit> {
    records.into_iter().map(|r| Unit { onec_id: r.ref_key, name: r.description, description: r.full_name }).collect()
}

pub fn categories(records: Vec<CategoryRecord>) -> Vec<Category> {
    records.into_iter().map(|r| Category { onec_id: r.ref_key, name: r.description, unit_onec_id: r.unit_key }).collect()
}

/// Drops retired products and products whose category is missing from
/// the synced category set.
pub fn products(records: Vec<ProductRecord>, known_categories: &HashSet<String>) -> Vec<ProductRow> {
    records
        .into_iter()
        .filter(|r| !r.retired)
        .filter_map(|r| {
            let category = r.category_key.filter(|c| known_categories.contains(c))?;
            Some(ProductRow {
                onec_id: r.ref_key,
                name: r.description,
                code: r.code,
                description: r.text,
                usage: r.usage,
                expiration: r.expiration,
                category_onec_id: category,
            })
        })
        .collect()
}

/// Joins features with their latest price and current balance on
/// `(product_onec_id, feature_onec_id)`; missing entries become zero.
pub fn features(records: Vec<FeatureRecord>, prices: &HashMap<VariantKey, Money>, stock: &HashMap<VariantKey, i32>) -> Vec<Feature> {
    records
        .into_iter()
        .filter_map(|r| {
            let owner = r.owner_key?;
            let key = (owner.clone(), r.ref_key.clone());
            Some(Feature {
                price: prices.get(&key).copied().unwrap_or(Money::ZERO),
                balance: stock.get(&key).copied().unwrap_or(0),
                onec_id: r.ref_key,
                product_onec_id: owner,
                name: r.description,
                code: r.code,
                file_id: r.file_key,
            })
        })
        .collect()
}
