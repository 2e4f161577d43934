//! Product export from the local store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::store::PoolProvider;

/// Default query selecting every product carrying a classification code.
pub const DEFAULT_EXPORT_QUERY: &str = "SELECT sku, ean, taric, name, quantity, unit_price_cents \
     FROM products \
     WHERE taric IS NOT NULL AND TRIM(taric) != '' \
     ORDER BY sku";

/// A product record as read from the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    /// Article number
    pub sku: String,
    /// Barcode, if recorded
    pub ean: Option<String>,
    /// Customs tariff classification code
    pub taric: String,
    pub name: Option<String>,
    pub quantity: Option<i64>,
    /// Net unit price in minor currency units
    pub unit_price_cents: Option<i64>,
}

/// The products exported by one run. Never empty.
#[derive(Debug, Clone, Serialize)]
pub struct ExportBatch {
    products: Vec<Product>,
    captured_at: DateTime<Utc>,
}

/// Wire body for product submission.
#[derive(Debug, Serialize)]
struct SubmitPayload<'a> {
    products: &'a [Product],
    count: usize,
    timestamp: String,
}

impl ExportBatch {
    pub fn new(products: Vec<Product>, captured_at: DateTime<Utc>) -> Result<Self> {
        if products.is_empty() {
            return Err(ReconcileError::DataUnavailable(
                "no eligible products to export".to_string(),
            ));
        }
        Ok(Self {
            products,
            captured_at,
        })
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn count(&self) -> usize {
        self.products.len()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Serialize as `{"products": [...], "count": n, "timestamp": "..."}`.
    pub fn to_payload(&self) -> Result<String> {
        let payload = SubmitPayload {
            products: &self.products,
            count: self.products.len(),
            timestamp: self
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        Ok(serde_json::to_string(&payload)?)
    }
}

/// Reads the products eligible for export.
#[async_trait]
pub trait ProductExporter: Send + Sync {
    /// Fails with `DataUnavailable` on read errors or when nothing is eligible.
    async fn export(&self) -> Result<ExportBatch>;
}

/// Exporter running a configurable query over the read pool.
pub struct SqliteProductExporter<P: PoolProvider> {
    pools: P,
    query: String,
}

impl<P: PoolProvider> SqliteProductExporter<P> {
    pub fn new(pools: P) -> Self {
        Self {
            pools,
            query: DEFAULT_EXPORT_QUERY.to_string(),
        }
    }

    /// Replace the export query. It must yield the columns of [`Product`].
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }
}

#[async_trait]
impl<P: PoolProvider> ProductExporter for SqliteProductExporter<P> {
    #[tracing::instrument(skip(self))]
    async fn export(&self) -> Result<ExportBatch> {
        let rows: Vec<Product> = sqlx::query_as(&self.query)
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Product export query failed");
                ReconcileError::DataUnavailable(e.to_string())
            })?;

        let total = rows.len();
        let products: Vec<Product> = rows
            .into_iter()
            .filter(|p| !p.taric.trim().is_empty())
            .collect();

        tracing::info!(
            rows = total,
            eligible = products.len(),
            "Exported products"
        );

        ExportBatch::new(products, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DbPools;
    use chrono::TimeZone;
    use sqlx::sqlite::SqliteConnectOptions;

    fn product(sku: &str, taric: &str) -> Product {
        Product {
            sku: sku.to_string(),
            ean: None,
            taric: taric.to_string(),
            name: Some(format!("Product {}", sku)),
            quantity: Some(1),
            unit_price_cents: Some(999),
        }
    }

    async fn pools_with_products(dir: &tempfile::TempDir, rows: &[(&str, &str)]) -> DbPools {
        let options = SqliteConnectOptions::new().filename(dir.path().join("p.db"));
        let pools = DbPools::connect(options, 2).await.unwrap();
        sqlx::query(
            "CREATE TABLE products (sku TEXT PRIMARY KEY, ean TEXT, taric TEXT, name TEXT, \
             quantity INTEGER, unit_price_cents INTEGER)",
        )
        .execute(pools.write())
        .await
        .unwrap();
        for (sku, taric) in rows {
            sqlx::query("INSERT INTO products (sku, taric, name, quantity) VALUES (?, ?, ?, 1)")
                .bind(sku)
                .bind(taric)
                .bind(format!("Product {}", sku))
                .execute(pools.write())
                .await
                .unwrap();
        }
        pools
    }

    #[test]
    fn test_empty_batch_is_data_unavailable() {
        let err = ExportBatch::new(vec![], Utc::now()).unwrap_err();
        assert!(matches!(err, ReconcileError::DataUnavailable(_)));
    }

    #[test]
    fn test_payload_shape() {
        let captured = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let batch = ExportBatch::new(
            vec![product("A-1", "8471300000"), product("A-2", "6403999300")],
            captured,
        )
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&batch.to_payload().unwrap()).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["timestamp"], "2026-01-02T03:04:05Z");
        assert_eq!(json["products"][0]["sku"], "A-1");
        assert_eq!(json["products"][1]["taric"], "6403999300");
    }

    #[tokio::test]
    async fn test_export_skips_unclassified_products() {
        let dir = tempfile::tempdir().unwrap();
        let pools = pools_with_products(
            &dir,
            &[("A-1", "8471300000"), ("A-2", ""), ("A-3", "6403999300"), ("A-4", "  ")],
        )
        .await;

        let batch = SqliteProductExporter::new(pools).export().await.unwrap();
        let skus: Vec<&str> = batch.products().iter().map(|p| p.sku.as_str()).collect();
        assert_eq!(skus, vec!["A-1", "A-3"]);
        assert_eq!(batch.count(), 2);
    }

    #[tokio::test]
    async fn test_export_with_no_eligible_rows_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pools = pools_with_products(&dir, &[("A-1", "")]).await;

        let err = SqliteProductExporter::new(pools).export().await.unwrap_err();
        assert!(matches!(err, ReconcileError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_export_missing_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new().filename(dir.path().join("empty.db"));
        let pools = DbPools::connect(options, 1).await.unwrap();

        let err = SqliteProductExporter::new(pools).export().await.unwrap_err();
        assert!(matches!(err, ReconcileError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_custom_query() {
        let dir = tempfile::tempdir().unwrap();
        let pools =
            pools_with_products(&dir, &[("A-1", "8471300000"), ("B-1", "6403999300")]).await;

        let exporter = SqliteProductExporter::new(pools).with_query(
            "SELECT sku, ean, taric, name, quantity, unit_price_cents FROM products WHERE sku LIKE 'B-%'",
        );
        let batch = exporter.export().await.unwrap();
        assert_eq!(batch.count(), 1);
        assert_eq!(batch.products()[0].sku, "B-1");
    }
}
