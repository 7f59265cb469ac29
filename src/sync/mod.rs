//! Catalog synchronizer
//!
//! Replicates the 1C feed into the catalog tables. A run fetches every
//! endpoint first (no transaction is open during network I/O), resolves
//! prices and balances in memory, then writes units, categories, products
//! and features in batches of [`BATCH_SIZE`]. A failed row is skipped, a
//! failed batch is rolled back and the run moves on to the next one.

pub mod feed;
pub mod records;

use std::collections::HashSet;
use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::db::StoreResult;
use crate::domain::{Category, Feature, Unit};
use crate::integrations::UpstreamError;
use records::{BalanceRecord, CategoryRecord, FeatureRecord, PriceRecord, ProductRecord, ProductRow, UnitRecord};

pub use feed::ODataFeed;

pub const BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint { Units, Categories, Products, Features, Prices, Balances }

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Units => "Catalog_УпаковкиЕдиницыИзмерения",
            Self::Categories => "Catalog_ВидыНоменклатуры",
            Self::Products => "Catalog_Номенклатура",
            Self::Features => "Catalog_ХарактеристикиНоменклатуры",
            Self::Prices => "InformationRegister_ЦеныНоменклатуры",
            Self::Balances => "AccumulationRegister_ТоварыНаСкладах/Balance()",
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Units => "units",
            Self::Categories => "categories",
            Self::Products => "products",
            Self::Features => "features",
            Self::Prices => "prices",
            Self::Balances => "balances",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.stage()) }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a catalog sync is already running")]
    AlreadyRunning,

    #[error("fetching {endpoint} failed: {source}")]
    Fetch {
        endpoint: Endpoint,
        #[source]
        source: UpstreamError,
    },
}

/// Where the feed comes from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Every record of one endpoint, all pages concatenated.
    async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<Value>, UpstreamError>;
}

/// Where the catalog is written.
///
/// Each call writes one batch atomically. Row-level conflicts are absorbed
/// and reported in the returned counts; an `Err` means the whole batch was
/// rolled back.
#[async_trait]
pub trait CatalogSink: Send + Sync {
    async fn upsert_units(&self, batch: &[Unit]) -> StoreResult<BatchReport>;
    async fn upsert_categories(&self, batch: &[Category]) -> StoreResult<BatchReport>;
    async fn upsert_products(&self, batch: &[ProductRow]) -> StoreResult<BatchReport>;
    /// Features whose product does not exist are counted as skipped.
    async fn upsert_features(&self, batch: &[Feature]) -> StoreResult<BatchReport>;
}

/// Row counts for one batch or one entity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Inserted or changed.
    pub written: u64,
    /// Already identical in the store.
    pub unchanged: u64,
    /// Dropped on purpose (missing parent).
    pub skipped: u64,
    /// Rejected by a constraint.
    pub failed: u64,
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.unchanged += rhs.unchanged;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub units: BatchReport,
    pub categories: BatchReport,
    pub products: BatchReport,
    pub features: BatchReport,
    pub failed_batches: u32,
    pub undecodable: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn written(&self) -> u64 {
        self.units.written + self.categories.written + self.products.written + self.features.written
    }
}

/// Dispatches a batch to the matching sink method.
#[async_trait]
trait CatalogRow: Sized + Send + Sync {
    async fn upsert(sink: &dyn CatalogSink, batch: &[Self]) -> StoreResult<BatchReport>;
}

#[async_trait]
impl CatalogRow for Unit {
    async fn upsert(sink: &dyn CatalogSink, batch: &[Self]) -> StoreResult<BatchReport> { sink.upsert_units(batch).await }
}

#[async_trait]
impl CatalogRow for Category {
    async fn upsert(sink: &dyn CatalogSink, batch: &[Self]) -> StoreResult<BatchReport> { sink.upsert_categories(batch).await }
}

#[async_trait]
impl CatalogRow for ProductRow {
    async fn upsert(sink: &dyn CatalogSink, batch: &[Self]) -> StoreResult<BatchReport> { sink.upsert_products(batch).await }
}

#[async_trait]
impl CatalogRow for Feature {
    async fn upsert(sink: &dyn CatalogSink, batch: &[Self]) -> StoreResult<BatchReport> { sink.upsert_features(batch).await }
}

pub struct CatalogSync {
    feed: Arc<dyn FeedSource>,
    sink: Arc<dyn CatalogSink>,
    batch_size: usize,
    running: Mutex<()>,
}

impl CatalogSync {
    pub fn new(feed: Arc<dyn FeedSource>, sink: Arc<dyn CatalogSink>) -> Self {
        Self { feed, sink, batch_size: BATCH_SIZE, running: Mutex::new(()) }
    }

    /// One full replication pass. Refuses to start while another pass holds
    /// the lock.
    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        let started = Instant::now();
        let mut report = SyncReport::default();

        let units: Vec<UnitRecord> = self.load(Endpoint::Units, &mut report).await?;
        let categories: Vec<CategoryRecord> = self.load(Endpoint::Categories, &mut report).await?;
        let products: Vec<ProductRecord> = self.load(Endpoint::Products, &mut report).await?;
        let features: Vec<FeatureRecord> = self.load(Endpoint::Features, &mut report).await?;
        let prices: Vec<PriceRecord> = self.load(Endpoint::Prices, &mut report).await?;
        let balances: Vec<BalanceRecord> = self.load(Endpoint::Balances, &mut report).await?;

        let units = records::units(units);
        let categories = records::categories(categories);
        let known: HashSet<String> = categories.iter().map(|c| c.onec_id.clone()).collect();
        let products = records::products(products, &known);
        let features = records::features(features, &records::latest_prices(&prices), &records::balances(&balances));

        report.units = self.write(Endpoint::Units, &units, &mut report.failed_batches).await;
        report.categories = self.write(Endpoint::Categories, &categories, &mut report.failed_batches).await;
        report.products = self.write(Endpoint::Products, &products, &mut report.failed_batches).await;
        report.features = self.write(Endpoint::Features, &features, &mut report.failed_batches).await;
        report.elapsed = started.elapsed();

        info!(
            written = report.written(),
            products = report.products.written,
            features = report.features.written,
            failed_rows = report.products.failed + report.features.failed,
            failed_batches = report.failed_batches,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "catalog sync finished"
        );
        Ok(report)
    }

    async fn load<T: DeserializeOwned>(&self, endpoint: Endpoint, report: &mut SyncReport) -> Result<Vec<T>, SyncError> {
        let raw = self.feed.fetch(endpoint).await.map_err(|source| {
            error!(endpoint = %endpoint, error = %source, "catalog sync aborted");
            SyncError::Fetch { endpoint, source }
        })?;
        let mut rows = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value(value) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    report.undecodable += 1;
                    warn!(endpoint = %endpoint, error = %e, "skipping undecodable record");
                }
            }
        }
        Ok(rows)
    }

    async fn write<T: CatalogRow>(&self, endpoint: Endpoint, rows: &[T], failed_batches: &mut u32) -> BatchReport {
        let mut total = BatchReport::default();
        for (index, batch) in rows.chunks(self.batch_size).enumerate() {
            match T::upsert(self.sink.as_ref(), batch).await {
                Ok(report) => total += report,
                Err(e) => {
                    *failed_batches += 1;
                    total.failed += batch.len() as u64;
                    warn!(endpoint = %endpoint, batch = index, rows = batch.len(), error = %e, "catalog batch rolled back");
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreError;
    use crate::domain::Money;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct StaticFeed { data: HashMap<Endpoint, Vec<Value>>, broken: Option<Endpoint> }

    #[async_trait]
    impl FeedSource for StaticFeed {
        async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<Value>, UpstreamError> {
            if self.broken == Some(endpoint) {
                return Err(UpstreamError::Status { service: "1c", stage: endpoint.stage(), status: 503, body: String::new() });
            }
            Ok(self.data.get(&endpoint).cloned().unwrap_or_default())
        }
    }

    /// Mirrors the table constraints that matter here: non-empty product
    /// name, existing product for a feature.
    #[derive(Default)]
    struct MemorySink {
        units: StdMutex<HashMap<String, Unit>>,
        categories: StdMutex<HashMap<String, Category>>,
        products: StdMutex<HashMap<String, ProductRow>>,
        features: StdMutex<HashMap<String, Feature>>,
    }

    fn put<T: PartialEq + Clone>(map: &mut HashMap<String, T>, key: &str, row: &T, report: &mut BatchReport) {
        if map.get(key) == Some(row) {
            report.unchanged += 1;
        } else {
            map.insert(key.to_string(), row.clone());
            report.written += 1;
        }
    }

    #[async_trait]
    impl CatalogSink for MemorySink {
        async fn upsert_units(&self, batch: &[Unit]) -> StoreResult<BatchReport> {
            let mut report = BatchReport::default();
            let mut map = self.units.lock().unwrap();
            batch.iter().for_each(|u| put(&mut map, &u.onec_id, u, &mut report));
            Ok(report)
        }

        async fn upsert_categories(&self, batch: &[Category]) -> StoreResult<BatchReport> {
            let mut report = BatchReport::default();
            let mut map = self.categories.lock().unwrap();
            batch.iter().for_each(|c| put(&mut map, &c.onec_id, c, &mut report));
            Ok(report)
        }

        async fn upsert_products(&self, batch: &[ProductRow]) -> StoreResult<BatchReport> {
            let mut report = BatchReport::default();
            let mut map = self.products.lock().unwrap();
            for p in batch {
                if p.name.is_empty() {
                    report.failed += 1;
                    continue;
                }
                put(&mut map, &p.onec_id, p, &mut report);
            }
            Ok(report)
        }

        async fn upsert_features(&self, batch: &[Feature]) -> StoreResult<BatchReport> {
            if batch.iter().any(|f| f.name == "poison") {
                return Err(StoreError::Conflict("batch rejected".into()));
            }
            let products = self.products.lock().unwrap();
            let mut report = BatchReport::default();
            let mut map = self.features.lock().unwrap();
            for f in batch {
                if !products.contains_key(&f.product_onec_id) {
                    report.skipped += 1;
                    continue;
                }
                put(&mut map, &f.onec_id, f, &mut report);
            }
            Ok(report)
        }
    }

    fn feed(product_count: usize, broken_names: &[usize]) -> HashMap<Endpoint, Vec<Value>> {
        let products = (0..product_count)
            .map(|i| {
                let name = if broken_names.contains(&i) { String::new() } else { format!("Peptide {}", i) };
                json!({"Ref_Key": format!("P{}", i), "Description": name, "Code": format!("{:05}", i), "ВидНоменклатуры_Key": "C1"})
            })
            .collect();
        HashMap::from([
            (Endpoint::Units, vec![json!({"Ref_Key": "U1", "Description": "шт", "НаименованиеПолное": "штука"})]),
            (Endpoint::Categories, vec![json!({"Ref_Key": "C1", "Description": "Пептиды", "ЕдиницаИзмерения_Key": "U1"})]),
            (Endpoint::Products, products),
            (Endpoint::Features, vec![
                json!({"Ref_Key": "F1", "Owner": "P1", "Description": "5 mg"}),
                json!({"Ref_Key": "F2", "Owner": "P-missing", "Description": "10 mg"}),
            ]),
            (Endpoint::Prices, vec![
                json!({"Period": "2024-01-01T00:00:00", "Номенклатура_Key": "P1", "Характеристика_Key": "F1", "Цена": 900}),
                json!({"Period": "2024-02-01T00:00:00", "Номенклатура_Key": "P1", "Характеристика_Key": "F1", "Цена": 1000}),
            ]),
            (Endpoint::Balances, vec![json!({"Номенклатура_Key": "P1", "Характеристика_Key": "F1", "ВНаличииBalance": 7})]),
        ])
    }

    fn engine(data: HashMap<Endpoint, Vec<Value>>, broken: Option<Endpoint>) -> (CatalogSync, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let sync = CatalogSync::new(Arc::new(StaticFeed { data, broken }), sink.clone());
        (sync, sink)
    }

    #[tokio::test]
    async fn test_failed_rows_are_isolated() {
        let (sync, sink) = engine(feed(1000, &[417, 812]), None);
        let report = sync.run_once().await.unwrap();

        assert_eq!(report.products.written, 998);
        assert_eq!(report.products.failed, 2);
        assert_eq!(report.failed_batches, 0);
        let products = sink.products.lock().unwrap();
        assert_eq!(products.len(), 998);
        assert!(!products.contains_key("P417"));
        assert!(!products.contains_key("P812"));
    }

    #[tokio::test]
    async fn test_features_joined_and_orphans_skipped() {
        let (sync, sink) = engine(feed(3, &[]), None);
        let report = sync.run_once().await.unwrap();
        assert_eq!(report.features.written, 1);
        assert_eq!(report.features.skipped, 1);
        let features = sink.features.lock().unwrap();
        assert_eq!(features["F1"].price, Money::from_rubles(1000));
        assert_eq!(features["F1"].balance, 7);
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let (sync, _sink) = engine(feed(120, &[]), None);
        let first = sync.run_once().await.unwrap();
        assert!(first.written() > 0);
        let second = sync.run_once().await.unwrap();
        assert_eq!(second.written(), 0);
        assert_eq!(second.products.unchanged, 120);
    }

    #[tokio::test]
    async fn test_endpoint_failure_aborts_before_writes() {
        let (sync, sink) = engine(feed(10, &[]), Some(Endpoint::Prices));
        let err = sync.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { endpoint: Endpoint::Prices, .. }));
        assert!(sink.products.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_run() {
        let mut data = feed(3, &[]);
        data.insert(Endpoint::Features, vec![json!({"Ref_Key": "F9", "Owner": "P1", "Description": "poison"})]);
        let (sync, sink) = engine(data, None);
        let report = sync.run_once().await.unwrap();
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.features.failed, 1);
        assert_eq!(sink.products.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_overlapping_runs() {
        let (sync, _sink) = engine(feed(1, &[]), None);
        let _held = sync.running.try_lock().unwrap();
        assert!(matches!(sync.run_once().await, Err(SyncError::AlreadyRunning)));
    }
}
