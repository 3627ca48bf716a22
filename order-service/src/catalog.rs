//! Read-only view of the product catalog.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::{attributes_from_json, bounded, Attributes, StorageError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::models::{DbProduct, DbVariant};
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub price: BigDecimal,
    pub is_active: bool,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
}

impl From<DbVariant> for Variant {
    fn from(row: DbVariant) -> Self {
        let (attributes, dropped) = attributes_from_json(&row.attributes);
        if !dropped.is_empty() {
            warn!(variant_id = %row.id, ?dropped, "Ignoring non-scalar variant attributes");
        }
        Self {
            id: row.id,
            product_id: row.product_id,
            sku: row.sku,
            price: row.price,
            is_active: row.is_active,
            attributes,
        }
    }
}

impl From<DbProduct> for Product {
    fn from(row: DbProduct) -> Self {
        Self {
            id: row.id,
            name: row.name,
        }
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_variant(&self, id: Uuid) -> Result<Option<Variant>, StorageError>;

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StorageError>;
}

pub struct PgCatalog {
    pool: DbPool,
    timeout: Duration,
}

impl PgCatalog {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn get_variant(&self, id: Uuid) -> Result<Option<Variant>, StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let row = product_variants::table
                .filter(product_variants::id.eq(id))
                .first::<DbVariant>(&mut conn)
                .await
                .optional()?;
            Ok::<_, StorageError>(row.map(Variant::from))
        })
        .await
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let row = products::table
                .filter(products::id.eq(id))
                .first::<DbProduct>(&mut conn)
                .await
                .optional()?;
            Ok::<_, StorageError>(row.map(Product::from))
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    variants: RwLock<HashMap<Uuid, Variant>>,
    products: RwLock<HashMap<Uuid, Product>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_product(&self, product: Product) {
        self.products.write().await.insert(product.id, product);
    }

    pub async fn add_variant(&self, variant: Variant) {
        self.variants.write().await.insert(variant.id, variant);
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_variant(&self, id: Uuid) -> Result<Option<Variant>, StorageError> {
        Ok(self.variants.read().await.get(&id).cloned())
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StorageError> {
        Ok(self.products.read().await.get(&id).cloned())
    }
}
