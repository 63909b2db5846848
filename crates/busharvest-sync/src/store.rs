//! Identity-keyed reconciliation of assembled records against the relational store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use busharvest_core::{
    AssembledBus, Bus, BusImage, BusOverview, ImageRow, OverviewRow, StoredBus,
};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions};
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Bounded columns shared by the SQL schema and the in-memory store.
pub const TITLE_MAX_CHARS: usize = 256;
pub const PRICE_MAX_CHARS: usize = 30;
pub const SOURCE_URL_MAX_CHARS: usize = 1000;
pub const IMAGE_NAME_MAX_CHARS: usize = 64;
pub const IMAGE_URL_MAX_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column `{column}` rejects value: {message}")]
    Constraint {
        column: &'static str,
        message: String,
    },
    #[error("bus {0} does not exist")]
    MissingParent(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub inserted: bool,
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Insert the record, or overwrite every non-identity field of the one sharing its `source_url`.
    async fn upsert(&self, bus: &Bus) -> Result<UpsertOutcome, PersistenceError>;

    /// Appends; existing overview rows for the parent are left in place.
    async fn attach_overview(
        &self,
        bus_id: i64,
        overview: &BusOverview,
    ) -> Result<(), PersistenceError>;

    /// Appends; existing image rows for the parent are left in place.
    async fn attach_images(&self, bus_id: i64, images: &[BusImage])
        -> Result<(), PersistenceError>;

    /// Upsert the parent, then append its children.
    ///
    /// The default issues three separate writes, so a child failure leaves the parent in place.
    /// Stores that can commit the record as one unit of work override this.
    async fn reconcile(&self, record: &AssembledBus) -> Result<UpsertOutcome, PersistenceError> {
        let outcome = self.upsert(&record.bus).await?;
        self.attach_overview(outcome.id, &record.overview).await?;
        self.attach_images(outcome.id, &record.images).await?;
        Ok(outcome)
    }
}

fn check_len(column: &'static str, value: &str, max: usize) -> Result<(), PersistenceError> {
    let len = value.chars().count();
    if len > max {
        return Err(PersistenceError::Constraint {
            column,
            message: format!("{len} characters exceeds limit of {max}"),
        });
    }
    Ok(())
}

fn check_bus(bus: &Bus) -> Result<(), PersistenceError> {
    check_len("title", &bus.title, TITLE_MAX_CHARS)?;
    check_len("price", &bus.price, PRICE_MAX_CHARS)?;
    check_len("source_url", &bus.source_url, SOURCE_URL_MAX_CHARS)
}

fn check_images(images: &[BusImage]) -> Result<(), PersistenceError> {
    for image in images {
        check_len("name", &image.name, IMAGE_NAME_MAX_CHARS)?;
        check_len("url", &image.url, IMAGE_URL_MAX_CHARS)?;
    }
    Ok(())
}

pub struct PgReconciliationStore {
    pool: PgPool,
}

impl PgReconciliationStore {
    /// Opens a single-connection pool; every write of a run goes through it sequentially.
    pub async fn connect(options: PgConnectOptions) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn upsert_bus(conn: &mut PgConnection, bus: &Bus) -> Result<UpsertOutcome, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO buses (
            title, year, make, model, body, chassis, engine, transmission, mileage,
            passengers, wheelchair, color, interior_color, exterior_color,
            published, featured, sold, scraped, draft, source, source_url, price,
            vin, gvwr, dimensions, luggage, state_bus_standard, airconditioning,
            location, brake, contact_email, contact_phone, us_region, description,
            score, category_id
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9,
            $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20, $21, $22,
            $23, $24, $25, $26, $27, $28,
            $29, $30, $31, $32, $33, $34,
            $35, $36
        )
        ON CONFLICT (source_url) DO UPDATE SET
            title = EXCLUDED.title,
            year = EXCLUDED.year,
            make = EXCLUDED.make,
            model = EXCLUDED.model,
            body = EXCLUDED.body,
            chassis = EXCLUDED.chassis,
            engine = EXCLUDED.engine,
            transmission = EXCLUDED.transmission,
            mileage = EXCLUDED.mileage,
            passengers = EXCLUDED.passengers,
            wheelchair = EXCLUDED.wheelchair,
            color = EXCLUDED.color,
            interior_color = EXCLUDED.interior_color,
            exterior_color = EXCLUDED.exterior_color,
            published = EXCLUDED.published,
            featured = EXCLUDED.featured,
            sold = EXCLUDED.sold,
            scraped = EXCLUDED.scraped,
            draft = EXCLUDED.draft,
            source = EXCLUDED.source,
            price = EXCLUDED.price,
            vin = EXCLUDED.vin,
            gvwr = EXCLUDED.gvwr,
            dimensions = EXCLUDED.dimensions,
            luggage = EXCLUDED.luggage,
            state_bus_standard = EXCLUDED.state_bus_standard,
            airconditioning = EXCLUDED.airconditioning,
            location = EXCLUDED.location,
            brake = EXCLUDED.brake,
            contact_email = EXCLUDED.contact_email,
            contact_phone = EXCLUDED.contact_phone,
            us_region = EXCLUDED.us_region,
            description = EXCLUDED.description,
            score = EXCLUDED.score,
            category_id = EXCLUDED.category_id,
            updated_at = NOW()
        RETURNING id, (xmax = 0) AS inserted
        "#,
    )
    .bind(&bus.title)
    .bind(&bus.year)
    .bind(&bus.make)
    .bind(&bus.model)
    .bind(&bus.body)
    .bind(&bus.chassis)
    .bind(&bus.engine)
    .bind(&bus.transmission)
    .bind(&bus.mileage)
    .bind(&bus.passengers)
    .bind(&bus.wheelchair)
    .bind(&bus.color)
    .bind(&bus.interior_color)
    .bind(&bus.exterior_color)
    .bind(bus.published)
    .bind(bus.featured)
    .bind(bus.sold)
    .bind(bus.scraped)
    .bind(bus.draft)
    .bind(&bus.source)
    .bind(&bus.source_url)
    .bind(&bus.price)
    .bind(&bus.vin)
    .bind(&bus.gvwr)
    .bind(&bus.dimensions)
    .bind(bus.luggage)
    .bind(&bus.state_bus_standard)
    .bind(bus.airconditioning.as_str())
    .bind(&bus.location)
    .bind(&bus.brake)
    .bind(&bus.contact_email)
    .bind(&bus.contact_phone)
    .bind(bus.us_region.as_str())
    .bind(&bus.description)
    .bind(bus.score)
    .bind(bus.category_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(UpsertOutcome {
        id: row.try_get("id")?,
        inserted: row.try_get("inserted")?,
    })
}

async fn insert_overview(
    conn: &mut PgConnection,
    bus_id: i64,
    overview: &BusOverview,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO buses_overview (bus_id, mdesc, intdesc, extdesc, features, specs)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(bus_id)
    .bind(&overview.mdesc)
    .bind(&overview.intdesc)
    .bind(&overview.extdesc)
    .bind(&overview.features)
    .bind(&overview.specs)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_images(
    conn: &mut PgConnection,
    bus_id: i64,
    images: &[BusImage],
) -> Result<(), sqlx::Error> {
    for image in images {
        sqlx::query(
            r#"
            INSERT INTO buses_images (bus_id, name, url, description, image_index)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(bus_id)
        .bind(&image.name)
        .bind(&image.url)
        .bind(&image.description)
        .bind(image.image_index)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ReconciliationStore for PgReconciliationStore {
    async fn upsert(&self, bus: &Bus) -> Result<UpsertOutcome, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_bus(&mut tx, bus).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn attach_overview(
        &self,
        bus_id: i64,
        overview: &BusOverview,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        insert_overview(&mut tx, bus_id, overview).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn attach_images(
        &self,
        bus_id: i64,
        images: &[BusImage],
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        insert_images(&mut tx, bus_id, images).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reconcile(&self, record: &AssembledBus) -> Result<UpsertOutcome, PersistenceError> {
        // Dropping `tx` on any early return rolls the whole record back.
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_bus(&mut tx, &record.bus).await?;
        insert_overview(&mut tx, outcome.id, &record.overview).await?;
        insert_images(&mut tx, outcome.id, &record.images).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    buses: Vec<StoredBus>,
    by_url: HashMap<String, usize>,
    overview: Vec<OverviewRow>,
    images: Vec<ImageRow>,
}

impl MemoryState {
    fn has_parent(&self, bus_id: i64) -> bool {
        self.buses.iter().any(|b| b.id == bus_id)
    }

    fn upsert(&mut self, bus: &Bus) -> UpsertOutcome {
        if let Some(&idx) = self.by_url.get(&bus.source_url) {
            let stored = &mut self.buses[idx];
            stored.bus = bus.clone();
            UpsertOutcome {
                id: stored.id,
                inserted: false,
            }
        } else {
            self.next_id += 1;
            let id = self.next_id;
            self.by_url.insert(bus.source_url.clone(), self.buses.len());
            self.buses.push(StoredBus {
                id,
                bus: bus.clone(),
            });
            UpsertOutcome { id, inserted: true }
        }
    }

    fn push_children(&mut self, bus_id: i64, overview: Option<&BusOverview>, images: &[BusImage]) {
        if let Some(overview) = overview {
            self.overview.push(OverviewRow {
                bus_id,
                overview: overview.clone(),
            });
        }
        self.images.extend(images.iter().map(|image| ImageRow {
            bus_id,
            image: image.clone(),
        }));
    }
}

/// Process-local store with the same identity and child-append rules as the SQL schema.
#[derive(Debug, Default)]
pub struct MemoryReconciliationStore {
    state: Mutex<MemoryState>,
}

impl MemoryReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn buses(&self) -> Vec<StoredBus> {
        self.with_state(|s| s.buses.clone())
    }

    pub fn overview_rows(&self) -> Vec<OverviewRow> {
        self.with_state(|s| s.overview.clone())
    }

    pub fn image_rows(&self) -> Vec<ImageRow> {
        self.with_state(|s| s.images.clone())
    }
}

#[async_trait]
impl ReconciliationStore for MemoryReconciliationStore {
    async fn upsert(&self, bus: &Bus) -> Result<UpsertOutcome, PersistenceError> {
        check_bus(bus)?;
        Ok(self.with_state(|s| s.upsert(bus)))
    }

    async fn attach_overview(
        &self,
        bus_id: i64,
        overview: &BusOverview,
    ) -> Result<(), PersistenceError> {
        self.with_state(|s| {
            if !s.has_parent(bus_id) {
                return Err(PersistenceError::MissingParent(bus_id));
            }
            s.push_children(bus_id, Some(overview), &[]);
            Ok(())
        })
    }

    async fn attach_images(
        &self,
        bus_id: i64,
        images: &[BusImage],
    ) -> Result<(), PersistenceError> {
        check_images(images)?;
        self.with_state(|s| {
            if !s.has_parent(bus_id) {
                return Err(PersistenceError::MissingParent(bus_id));
            }
            s.push_children(bus_id, None, images);
            Ok(())
        })
    }

    async fn reconcile(&self, record: &AssembledBus) -> Result<UpsertOutcome, PersistenceError> {
        // Every check runs before the lock is taken; nothing is written unless all pass.
        check_bus(&record.bus)?;
        check_images(&record.images)?;
        Ok(self.with_state(|s| {
            let outcome = s.upsert(&record.bus);
            s.push_children(outcome.id, Some(&record.overview), &record.images);
            outcome
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(url: &str, price: &str) -> Bus {
        Bus::new("2019 Ford Transit", price, url)
    }

    #[tokio::test]
    async fn upsert_by_source_url_updates_in_place() {
        let store = MemoryReconciliationStore::new();
        let first = store.upsert(&bus("https://x.test/a", "1000")).await.unwrap();
        let second = store.upsert(&bus("https://x.test/a", "1500")).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.id, second.id);

        let buses = store.buses();
        assert_eq!(buses.len(), 1);
        assert_eq!(buses[0].bus.price, "1500");
    }

    #[tokio::test]
    async fn distinct_urls_get_fresh_ids() {
        let store = MemoryReconciliationStore::new();
        let a = store.upsert(&bus("https://x.test/a", "1")).await.unwrap();
        let b = store.upsert(&bus("https://x.test/b", "2")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.buses().len(), 2);
    }

    #[tokio::test]
    async fn children_append_and_require_parent() {
        let store = MemoryReconciliationStore::new();
        let id = store.upsert(&bus("https://x.test/a", "1")).await.unwrap().id;
        let overview = BusOverview {
            mdesc: Some("clean".into()),
            ..BusOverview::default()
        };
        store.attach_overview(id, &overview).await.unwrap();
        store.attach_overview(id, &overview).await.unwrap();
        assert_eq!(store.overview_rows().len(), 2);

        assert!(matches!(
            store.attach_overview(id + 100, &overview).await,
            Err(PersistenceError::MissingParent(_))
        ));
    }

    #[tokio::test]
    async fn oversized_price_is_rejected_without_side_effects() {
        let store = MemoryReconciliationStore::new();
        let long_price = "9".repeat(PRICE_MAX_CHARS + 1);
        let err = store
            .upsert(&bus("https://x.test/a", &long_price))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Constraint { column: "price", .. }));
        assert!(store.buses().is_empty());
    }

    fn record(url: &str, image: BusImage) -> AssembledBus {
        AssembledBus {
            bus: bus(url, "1000"),
            overview: BusOverview {
                mdesc: Some("clean".into()),
                ..BusOverview::default()
            },
            images: vec![image],
        }
    }

    fn image(name: &str, url: &str) -> BusImage {
        BusImage {
            name: name.to_string(),
            url: url.to_string(),
            description: String::new(),
            image_index: 0,
        }
    }

    #[tokio::test]
    async fn reconcile_rolls_back_parent_when_a_child_is_rejected() {
        let store = MemoryReconciliationStore::new();
        let long_name = "n".repeat(IMAGE_NAME_MAX_CHARS + 1);
        let err = store
            .reconcile(&record("https://x.test/a", image(&long_name, "https://x.test/1.jpg")))
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Constraint { column: "name", .. }));
        assert!(store.buses().is_empty());
        assert!(store.overview_rows().is_empty());
        assert!(store.image_rows().is_empty());
    }

    #[tokio::test]
    async fn reconcile_commits_parent_and_children_together() {
        let store = MemoryReconciliationStore::new();
        let outcome = store
            .reconcile(&record("https://x.test/a", image("front", "https://x.test/1.jpg")))
            .await
            .unwrap();

        assert!(outcome.inserted);
        assert_eq!(store.buses().len(), 1);
        assert_eq!(store.overview_rows()[0].bus_id, outcome.id);
        assert_eq!(store.image_rows()[0].bus_id, outcome.id);
    }

    #[tokio::test]
    async fn oversized_image_url_is_rejected() {
        let store = MemoryReconciliationStore::new();
        let id = store.upsert(&bus("https://x.test/a", "1")).await.unwrap().id;
        let long_url = format!("https://x.test/{}", "p".repeat(IMAGE_URL_MAX_CHARS));
        let err = store
            .attach_images(id, &[image("front", &long_url)])
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Constraint { column: "url", .. }));
        assert!(store.image_rows().is_empty());
    }
}
