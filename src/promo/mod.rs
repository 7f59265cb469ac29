//! Promo engine: price calculation outcome and the spreadsheet import.
//!
//! The referral sheet lives on a WebDAV drive. Each row describes one code
//! (possibly with aliases) and its three payout tiers. An import upserts
//! descriptor columns for every code in the sheet and deletes codes that
//! are no longer listed; accrual counters are never written here.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PromoSheetConfig;
use crate::db::{StoreError, StoreResult};
use crate::domain::{expand_codes, Accrual, Money, Percent, PromoDescriptor};
use crate::integrations::{check_status, http_client, UpstreamError, HEAVY_REQUEST_TIMEOUT};

const SERVICE: &str = "promo_sheet";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceCalculation {
    pub code: String,
    pub init_price: Money,
    pub discount_pct: Percent,
    pub result_price: Money,
    pub accrual: Accrual,
    pub times_used: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport { pub rows: usize, pub skipped_rows: usize, pub upserted: u64, pub deleted: u64 }

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Download(#[from] UpstreamError),

    #[error("promo sheet is unreadable: {0}")]
    Workbook(String),

    /// Refuses to wipe the table from an empty or unparsable sheet.
    #[error("promo sheet has no usable rows")]
    Empty,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn download(&self) -> Result<Vec<u8>, UpstreamError>;
}

#[async_trait]
pub trait PromoSink: Send + Sync {
    /// Upserts descriptors and deletes every code not among them, in one
    /// transaction. Returns `(upserted, deleted)`.
    async fn replace_promos(&self, descriptors: &[PromoDescriptor]) -> StoreResult<(u64, u64)>;
}

/// Basic-auth GET of the sheet file from a WebDAV share.
pub struct WebDavSheet { client: Client, url: Option<String>, login: String, password: crate::config::Secret }

impl WebDavSheet {
    pub fn new(config: &PromoSheetConfig) -> Result<Self, UpstreamError> {
        let client = http_client(HEAVY_REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self { client, url: config.url.clone(), login: config.login.clone(), password: config.password.clone() })
    }
}

#[async_trait]
impl SheetSource for WebDavSheet {
    async fn download(&self) -> Result<Vec<u8>, UpstreamError> {
        let url = self.url.as_deref().ok_or(UpstreamError::NotConfigured { service: SERVICE })?;
        let mut request = self.client.get(url);
        if !self.login.is_empty() {
            request = request.basic_auth(&self.login, Some(self.password.expose()));
        }
        let response = request.send().await.map_err(UpstreamError::transport(SERVICE, "download"))?;
        let response = check_status(SERVICE, "download", response).await?;
        let bytes = response.bytes().await.map_err(UpstreamError::transport(SERVICE, "download"))?;
        Ok(bytes.to_vec())
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        other => other.to_string().trim().to_string(),
    }
}

/// First worksheet as trimmed text rows.
pub fn workbook_rows(bytes: Vec<u8>) -> Result<Vec<Vec<String>>, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|e| ImportError::Workbook(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::Workbook("workbook has no sheets".into()))?
        .map_err(|e| ImportError::Workbook(e.to_string()))?;
    Ok(range.rows().map(|row| row.iter().map(cell_text).collect()).collect())
}

/// `"10"`, `"10,5"`, `"10 %"` and a fraction like `0.1` (from a percent
/// formatted cell) all read as percentages.
pub fn parse_percent(raw: &str) -> Option<Percent> {
    let cleaned: String = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    if cleaned.is_empty() {
        return Some(Percent::ZERO);
    }
    let mut value: Decimal = cleaned.parse().ok()?;
    if value > Decimal::ZERO && value < Decimal::ONE && !raw.contains('%') {
        value *= Decimal::ONE_HUNDRED;
    }
    Percent::new(value).ok()
}

fn cell(row: &[String], i: usize) -> String { row.get(i).cloned().unwrap_or_default() }

/// Turns sheet rows (header first) into descriptors, expanding aliases.
/// The first occurrence of a code wins. Returns the descriptors and the
/// number of rows skipped as invalid.
pub fn descriptors_from_rows(rows: &[Vec<String>]) -> (Vec<PromoDescriptor>, usize) {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut skipped = 0;

    for (index, row) in rows.iter().enumerate().skip(1) {
        let raw_code = cell(row, 0);
        if raw_code.trim().is_empty() {
            continue;
        }
        let percents = [1, 3, 5, 7].map(|i| parse_percent(&cell(row, i)));
        let [Some(discount), Some(owner), Some(lvl1), Some(lvl2)] = percents else {
            warn!(row = index + 1, code = %raw_code, "promo row has an invalid percentage");
            skipped += 1;
            continue;
        };
        for code in expand_codes(&raw_code) {
            if !seen.insert(code.clone()) {
                continue;
            }
            out.push(PromoDescriptor {
                code,
                discount_pct: discount,
                owner_name: cell(row, 2),
                owner_pct: owner,
                lvl1_name: cell(row, 4),
                lvl1_pct: lvl1,
                lvl2_name: cell(row, 6),
                lvl2_pct: lvl2,
            });
        }
    }
    (out, skipped)
}

pub struct PromoImporter { source: Arc<dyn SheetSource>, sink: Arc<dyn PromoSink> }

impl PromoImporter {
    pub fn new(source: Arc<dyn SheetSource>, sink: Arc<dyn PromoSink>) -> Self { Self { source, sink } }

    pub async fn run_once(&self) -> Result<ImportReport, ImportError> {
        let started = Instant::now();
        let bytes = self.source.download().await?;
        let rows = workbook_rows(bytes)?;
        self.import_rows(&rows, started).await
    }

    async fn import_rows(&self, rows: &[Vec<String>], started: Instant) -> Result<ImportReport, ImportError> {
        let (descriptors, skipped_rows) = descriptors_from_rows(rows);
        if descriptors.is_empty() {
            return Err(ImportError::Empty);
        }
        let (upserted, deleted) = self.sink.replace_promos(&descriptors).await?;
        let report = ImportReport { rows: rows.len().saturating_sub(1), skipped_rows, upserted, deleted };
        info!(
            codes = descriptors.len(),
            upserted,
            deleted,
            skipped_rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "promo import finished"
        );
        Ok(report)
    }
}
