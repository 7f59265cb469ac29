//! 1C OData feed client.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Endpoint, FeedSource};
use crate::config::{EnterpriseConfig, Secret};
use crate::integrations::{http_client, read_json, UpstreamError, HEAVY_REQUEST_TIMEOUT};

const SERVICE: &str = "1c";
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct ODataPage {
    #[serde(default)]
    value: Vec<Value>,
}

/// Reads the ERP's standard OData interface with basic auth, paging with
/// `$top`/`$skip` until a short page comes back.
pub struct ODataFeed {
    client: Client,
    base_url: String,
    login: String,
    password: Secret,
    page_size: usize,
}

impl ODataFeed {
    pub fn new(config: &EnterpriseConfig) -> Result<Self, UpstreamError> {
        let client = http_client(HEAVY_REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            login: config.login.clone(),
            password: config.password.clone(),
            page_size: PAGE_SIZE,
        })
    }

    /// 3 attempts, 3 s apart, on any transport or status failure.
    fn backoff() -> ConstantBuilder {
        ConstantBuilder::default().with_delay(Duration::from_secs(3)).with_max_times(3)
    }

    async fn fetch_page(&self, endpoint: Endpoint, skip: usize) -> Result<Vec<Value>, UpstreamError> {
        let url = format!("{}/{}", self.base_url, endpoint.path());
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.login, Some(self.password.expose()))
            .query(&[("$format", "json".to_string()), ("$top", self.page_size.to_string()), ("$skip", skip.to_string())])
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, endpoint.stage()))?;
        let page: ODataPage = read_json(SERVICE, endpoint.stage(), response).await?;
        debug!(endpoint = %endpoint, skip, rows = page.value.len(), "feed page fetched");
        Ok(page.value)
    }
}

#[async_trait]
impl FeedSource for ODataFeed {
    async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<Value>, UpstreamError> {
        if self.base_url.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }

        let mut rows = Vec::new();
        let mut skip = 0;
        loop {
            let page = (|| async { self.fetch_page(endpoint, skip).await })
                .retry(Self::backoff())
                .when(|e| !matches!(e, UpstreamError::NotConfigured { .. }))
                .notify(|err, delay| warn!(endpoint = %endpoint, error = %err, ?delay, "feed request failed, retrying"))
                .await?;
            let count = page.len();
            rows.extend(page);
            if count < self.page_size {
                break;
            }
            skip += count;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::records::{BalanceRecord, FeatureRecord, PriceRecord, ProductRecord};
    use rust_decimal_macros::dec;

    // Pages as 1C:Enterprise's standard OData interface returns them,
    // annotations included.
    const PRODUCTS_PAGE: &str = r#"{
        "odata.metadata": "http://erp.local/base/odata/standard.odata/$metadata#Catalog_Номенклатура",
        "value": [
            {
                "Ref_Key": "6f0c3a2e-5d1b-11ee-8c99-0242ac120002",
                "DataVersion": "AAAAAgAAAAA=",
                "DeletionMark": false,
                "Parent_Key": "00000000-0000-0000-0000-000000000000",
                "IsFolder": false,
                "Code": "00-00000123",
                "Description": "BPC-157 ",
                "Описание": "Пептид для восстановления тканей",
                "Применение": null,
                "СрокГодности": "24 мес.",
                "ВидНоменклатуры_Key": "a1b2c3d4-0000-11ee-8c99-0242ac120002",
                "ВидНоменклатуры@navigationLinkUrl": "Catalog_Номенклатура(guid'6f0c3a2e-5d1b-11ee-8c99-0242ac120002')/ВидНоменклатуры",
                "Недействителен": false
            }
        ]
    }"#;

    const FEATURES_PAGE: &str = r#"{
        "odata.metadata": "http://erp.local/base/odata/standard.odata/$metadata#Catalog_ХарактеристикиНоменклатуры",
        "value": [
            {
                "Ref_Key": "9e8d7c6b-5d1b-11ee-8c99-0242ac120002",
                "Owner": "6f0c3a2e-5d1b-11ee-8c99-0242ac120002",
                "Owner_Type": "StandardODATA.Catalog_Номенклатура",
                "Code": "000000045",
                "Description": "5 мг",
                "ФайлКартинки_Key": "00000000-0000-0000-0000-000000000000"
            }
        ]
    }"#;

    const PRICES_PAGE: &str = r#"{
        "odata.metadata": "http://erp.local/base/odata/standard.odata/$metadata#InformationRegister_ЦеныНоменклатуры",
        "value": [
            {
                "Period": "2024-03-01T00:00:00",
                "Recorder": "c0ffee00-5d1b-11ee-8c99-0242ac120002",
                "Recorder_Type": "StandardODATA.Document_УстановкаЦенНоменклатуры",
                "LineNumber": "1",
                "Active": true,
                "Номенклатура_Key": "6f0c3a2e-5d1b-11ee-8c99-0242ac120002",
                "Характеристика_Key": "9e8d7c6b-5d1b-11ee-8c99-0242ac120002",
                "Цена": 2450.5
            }
        ]
    }"#;

    const BALANCES_PAGE: &str = r#"{
        "odata.metadata": "http://erp.local/base/odata/standard.odata/$metadata#AccumulationRegister_ТоварыНаСкладах",
        "value": [
            {
                "Номенклатура_Key": "6f0c3a2e-5d1b-11ee-8c99-0242ac120002",
                "Характеристика_Key": "9e8d7c6b-5d1b-11ee-8c99-0242ac120002",
                "Склад_Key": "5a5a5a5a-5d1b-11ee-8c99-0242ac120002",
                "ВНаличииBalance": 12
            }
        ]
    }"#;

    fn rows<T: serde::de::DeserializeOwned>(page: &str) -> Vec<T> {
        let page: ODataPage = serde_json::from_str(page).unwrap();
        page.value.into_iter().map(|v| serde_json::from_value(v).unwrap()).collect()
    }

    #[test]
    fn test_erp_pages_decode_into_records() {
        let products: Vec<ProductRecord> = rows(PRODUCTS_PAGE);
        assert_eq!(products.len(), 1);
        let product = &products[0];
        assert_eq!(product.ref_key, "6f0c3a2e-5d1b-11ee-8c99-0242ac120002");
        assert_eq!(product.description, "BPC-157");
        assert_eq!(product.code, "00-00000123");
        assert_eq!(product.usage, "");
        assert_eq!(product.category_key.as_deref(), Some("a1b2c3d4-0000-11ee-8c99-0242ac120002"));
        assert!(!product.retired);

        let features: Vec<FeatureRecord> = rows(FEATURES_PAGE);
        assert_eq!(features[0].owner_key.as_deref(), Some(product.ref_key.as_str()));
        assert_eq!(features[0].file_key, None);
        assert_eq!(features[0].description, "5 мг");

        let prices: Vec<PriceRecord> = rows(PRICES_PAGE);
        assert_eq!(prices[0].price, dec!(2450.5));
        assert_eq!(prices[0].feature_key.as_deref(), Some("9e8d7c6b-5d1b-11ee-8c99-0242ac120002"));

        let balances: Vec<BalanceRecord> = rows(BALANCES_PAGE);
        assert_eq!(balances[0].quantity, dec!(12));
    }

    #[test]
    fn test_page_without_rows() {
        let page: ODataPage = serde_json::from_str(r#"{"odata.metadata": "x"}"#).unwrap();
        assert!(page.value.is_empty());
    }
}
