use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::domain::{
    AdminId, CourierId, CourierProfile, Delivery, DeliveryId, DeliveryStatus, EstablishmentId,
    EstablishmentProfile, NewDelivery,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use store_api::{
    ClaimOutcome, DeliveryChange, DeliveryFilter, DeliveryStore, DeliverySubscription, StatusWrite,
};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 256;

const DELIVERY_COLUMNS: &str = "id, establishment_id, establishment_name, courier_id, \
     courier_name, pickup_address, delivery_address, observation, value, pickup_code, \
     status, created_at";

/// Sqlite-backed document store for the dispatch collections. Every
/// delivery mutation is published on an internal change feed that backs the
/// live-query subscriptions.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<DeliveryChange>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_establishment(
        &self,
        id: &EstablishmentId,
        profile: &EstablishmentProfile,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO establishments (id, name, kind, address, phone, hours, email, photo_url, delivery_fee, is_blocked)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name=excluded.name, kind=excluded.kind, address=excluded.address,
               phone=excluded.phone, hours=excluded.hours, email=excluded.email,
               photo_url=excluded.photo_url, delivery_fee=excluded.delivery_fee,
               is_blocked=excluded.is_blocked",
        )
        .bind(&id.0)
        .bind(&profile.name)
        .bind(&profile.kind)
        .bind(&profile.address)
        .bind(&profile.phone)
        .bind(&profile.hours)
        .bind(&profile.email)
        .bind(profile.photo_url.as_deref())
        .bind(profile.delivery_fee.map(|fee| fee.to_string()))
        .bind(profile.is_blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_courier(&self, id: &CourierId, profile: &CourierProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO couriers (id, name, email, phone, vehicle, area, photo_url, is_online, is_blocked, push_token)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name=excluded.name, email=excluded.email, phone=excluded.phone,
               vehicle=excluded.vehicle, area=excluded.area, photo_url=excluded.photo_url,
               is_online=excluded.is_online, is_blocked=excluded.is_blocked,
               push_token=excluded.push_token",
        )
        .bind(&id.0)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.phone)
        .bind(&profile.vehicle)
        .bind(&profile.area)
        .bind(profile.photo_url.as_deref())
        .bind(profile.is_online)
        .bind(profile.is_blocked)
        .bind(profile.push_token.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant_admin(&self, id: &AdminId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO admins (id, created_at) VALUES (?, ?)")
            .bind(&id.0)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn publish(&self, change: DeliveryChange) {
        // No receivers is fine; nobody is watching.
        let _ = self.changes.send(change);
    }

    fn filter_query(filter: &DeliveryFilter) -> (String, Vec<String>) {
        match filter {
            DeliveryFilter::Pending => (
                format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE status = 'pending' ORDER BY created_at ASC"
                ),
                Vec::new(),
            ),
            DeliveryFilter::ActiveForCourier(courier_id) => (
                format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE courier_id = ? AND status IN ('accepted', 'arrived_pickup', 'in_progress')
                     ORDER BY created_at ASC"
                ),
                vec![courier_id.0.clone()],
            ),
            DeliveryFilter::ForEstablishment(establishment_id) => (
                format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE establishment_id = ? ORDER BY created_at DESC"
                ),
                vec![establishment_id.0.clone()],
            ),
        }
    }

    async fn finished_deliveries(
        &self,
        owner_column: &str,
        owner_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>> {
        let mut sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries
             WHERE {owner_column} = ? AND status IN ('delivered', 'canceled')"
        );
        if from.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if to.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql).bind(owner_id);
        if let Some(from) = from {
            query = query.bind(from);
        }
        if let Some(to) = to {
            query = query.bind(to);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(delivery_from_row).collect()
    }
}

#[async_trait]
impl DeliveryStore for Storage {
    async fn insert_delivery(&self, new: NewDelivery) -> Result<Delivery> {
        let id = DeliveryId(Uuid::new_v4().to_string());
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO deliveries (id, establishment_id, establishment_name, pickup_address,
                 delivery_address, observation, value, pickup_code, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id.0)
        .bind(&new.establishment_id.0)
        .bind(&new.establishment_name)
        .bind(&new.pickup_address)
        .bind(&new.delivery_address)
        .bind(new.observation.as_deref())
        .bind(new.value.to_string())
        .bind(new.pickup_code.as_deref())
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let delivery = Delivery {
            id,
            establishment_id: new.establishment_id,
            establishment_name: new.establishment_name,
            courier_id: None,
            courier_name: None,
            pickup_address: new.pickup_address,
            delivery_address: new.delivery_address,
            observation: new.observation,
            value: new.value,
            pickup_code: new.pickup_code,
            status: DeliveryStatus::Pending,
            created_at,
        };
        self.publish(DeliveryChange::Created(delivery.clone()));
        Ok(delivery)
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(delivery_from_row).transpose()
    }

    async fn active_delivery_for_courier(
        &self,
        courier_id: &CourierId,
    ) -> Result<Option<Delivery>> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries
             WHERE courier_id = ? AND status IN ('accepted', 'arrived_pickup', 'in_progress')
             LIMIT 1"
        ))
        .bind(&courier_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(delivery_from_row).transpose()
    }

    async fn claim_delivery(
        &self,
        id: &DeliveryId,
        courier_id: &CourierId,
        courier_name: &str,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // Guarded single-statement claim: only mutates while the record is
        // still pending and the courier holds no active delivery.
        let claimed = sqlx::query(&format!(
            "UPDATE deliveries SET status = 'accepted', courier_id = ?, courier_name = ?
             WHERE id = ? AND status = 'pending'
               AND NOT EXISTS (
                 SELECT 1 FROM deliveries
                 WHERE courier_id = ? AND status IN ('accepted', 'arrived_pickup', 'in_progress')
               )
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(&courier_id.0)
        .bind(courier_name)
        .bind(&id.0)
        .bind(&courier_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = claimed {
            let delivery = delivery_from_row(row)?;
            tx.commit().await?;
            self.publish(DeliveryChange::Updated(delivery.clone()));
            return Ok(ClaimOutcome::Claimed(delivery));
        }

        // Classify the miss with reads in the same transaction, then discard
        // it without writing anything.
        let active = sqlx::query(
            "SELECT id FROM deliveries
             WHERE courier_id = ? AND status IN ('accepted', 'arrived_pickup', 'in_progress')
             LIMIT 1",
        )
        .bind(&courier_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = active {
            return Ok(ClaimOutcome::CourierBusy(DeliveryId(
                row.get::<String, _>(0),
            )));
        }

        let current = sqlx::query("SELECT status FROM deliveries WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        match current {
            None => Ok(ClaimOutcome::Missing),
            Some(row) => {
                let status = parse_status(&row.get::<String, _>(0))?;
                if status == DeliveryStatus::Pending {
                    return Err(anyhow!(
                        "claim of delivery {id} missed without a visible precondition conflict"
                    ));
                }
                Ok(ClaimOutcome::NotPending(status))
            }
        }
    }

    async fn update_status_checked(
        &self,
        id: &DeliveryId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
    ) -> Result<StatusWrite> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE deliveries SET status = ? WHERE id = ? AND status = ?
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(next.as_str())
        .bind(&id.0)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = updated {
            let delivery = delivery_from_row(row)?;
            tx.commit().await?;
            self.publish(DeliveryChange::Updated(delivery.clone()));
            return Ok(StatusWrite::Updated(delivery));
        }

        let current = sqlx::query("SELECT status FROM deliveries WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        match current {
            None => Ok(StatusWrite::Missing),
            Some(row) => Ok(StatusWrite::Conflict(parse_status(
                &row.get::<String, _>(0),
            )?)),
        }
    }

    async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        let (sql, binds) = Self::filter_query(filter);
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(delivery_from_row).collect()
    }

    async fn finished_deliveries_for_establishment(
        &self,
        establishment_id: &EstablishmentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>> {
        self.finished_deliveries("establishment_id", &establishment_id.0, from, to)
            .await
    }

    async fn finished_deliveries_for_courier(
        &self,
        courier_id: &CourierId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>> {
        self.finished_deliveries("courier_id", &courier_id.0, from, to)
            .await
    }

    async fn subscribe(&self, filter: DeliveryFilter) -> Result<DeliverySubscription> {
        let receiver = self.changes.subscribe();
        let store = self.clone();
        let snapshot_filter = filter.clone();
        Ok(DeliverySubscription::new(
            filter,
            receiver,
            Box::new(move || {
                let store = store.clone();
                let filter = snapshot_filter.clone();
                Box::pin(async move { store.list_deliveries(&filter).await })
            }),
        ))
    }

    async fn get_establishment(
        &self,
        id: &EstablishmentId,
    ) -> Result<Option<EstablishmentProfile>> {
        let row = sqlx::query(
            "SELECT name, kind, address, phone, hours, email, photo_url, delivery_fee, is_blocked
             FROM establishments WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(EstablishmentProfile {
                name: r.get::<String, _>(0),
                kind: r.get::<String, _>(1),
                address: r.get::<String, _>(2),
                phone: r.get::<String, _>(3),
                hours: r.get::<String, _>(4),
                email: r.get::<String, _>(5),
                photo_url: r.get::<Option<String>, _>(6),
                delivery_fee: r
                    .get::<Option<String>, _>(7)
                    .map(|raw| parse_value(&raw))
                    .transpose()?,
                is_blocked: r.get::<bool, _>(8),
            })
        })
        .transpose()
    }

    async fn get_courier(&self, id: &CourierId) -> Result<Option<CourierProfile>> {
        let row = sqlx::query(
            "SELECT name, email, phone, vehicle, area, photo_url, is_online, is_blocked, push_token
             FROM couriers WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CourierProfile {
            name: r.get::<String, _>(0),
            email: r.get::<String, _>(1),
            phone: r.get::<String, _>(2),
            vehicle: r.get::<String, _>(3),
            area: r.get::<String, _>(4),
            photo_url: r.get::<Option<String>, _>(5),
            is_online: r.get::<bool, _>(6),
            is_blocked: r.get::<bool, _>(7),
            push_token: r.get::<Option<String>, _>(8),
        }))
    }

    async fn is_admin(&self, id: &AdminId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM admins WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn set_courier_online(&self, id: &CourierId, is_online: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO couriers (id, is_online) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET is_online=excluded.is_online",
        )
        .bind(&id.0)
        .bind(is_online)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_courier_push_token(&self, id: &CourierId, token: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO couriers (id, push_token) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET push_token=excluded.push_token",
        )
        .bind(&id.0)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn delivery_from_row(row: SqliteRow) -> Result<Delivery> {
    Ok(Delivery {
        id: DeliveryId(row.get::<String, _>(0)),
        establishment_id: EstablishmentId(row.get::<String, _>(1)),
        establishment_name: row.get::<String, _>(2),
        courier_id: row.get::<Option<String>, _>(3).map(CourierId),
        courier_name: row.get::<Option<String>, _>(4),
        pickup_address: row.get::<String, _>(5),
        delivery_address: row.get::<String, _>(6),
        observation: row.get::<Option<String>, _>(7),
        value: parse_value(&row.get::<String, _>(8))?,
        pickup_code: row.get::<Option<String>, _>(9),
        status: parse_status(&row.get::<String, _>(10))?,
        created_at: row.get::<DateTime<Utc>, _>(11),
    })
}

fn parse_status(raw: &str) -> Result<DeliveryStatus> {
    DeliveryStatus::parse(raw).ok_or_else(|| anyhow!("unknown delivery status '{raw}' in store"))
}

fn parse_value(raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .with_context(|| format!("invalid decimal amount '{raw}' in store"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(PathBuf::from(path))
}
