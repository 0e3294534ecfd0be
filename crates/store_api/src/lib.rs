use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use shared::{
    domain::{
        AdminId, CourierId, Delivery, DeliveryId, DeliveryStatus, EstablishmentId, NewDelivery,
    },
    events::DeliveryEvent,
};
use shared::domain::{CourierProfile, EstablishmentProfile};
use tokio::sync::broadcast;
use tracing::warn;

/// Outcome of the atomic claim executed at acceptance time. Exactly one of
/// these is produced per attempt; only `Claimed` mutates the record.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Delivery),
    /// The target delivery no longer exists.
    Missing,
    /// The target delivery was no longer `pending` when the claim ran.
    NotPending(DeliveryStatus),
    /// The courier already holds an active delivery.
    CourierBusy(DeliveryId),
}

/// Outcome of a status write guarded on the expected current status.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    Updated(Delivery),
    Missing,
    /// The record's actual status did not match the expected one.
    Conflict(DeliveryStatus),
}

/// Which slice of the `deliveries` collection a query or subscription sees.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryFilter {
    /// Deliveries waiting for a courier.
    Pending,
    /// The courier's current active delivery, if any.
    ActiveForCourier(CourierId),
    /// Everything belonging to an establishment, any status.
    ForEstablishment(EstablishmentId),
}

impl DeliveryFilter {
    pub fn matches(&self, delivery: &Delivery) -> bool {
        match self {
            DeliveryFilter::Pending => delivery.status == DeliveryStatus::Pending,
            DeliveryFilter::ActiveForCourier(courier_id) => {
                delivery.status.is_active() && delivery.courier_id.as_ref() == Some(courier_id)
            }
            DeliveryFilter::ForEstablishment(establishment_id) => {
                &delivery.establishment_id == establishment_id
            }
        }
    }
}

/// A single mutation observed on the `deliveries` collection. Deliveries are
/// never physically deleted, so the feed carries only creations and updates.
#[derive(Debug, Clone)]
pub enum DeliveryChange {
    Created(Delivery),
    Updated(Delivery),
}

impl DeliveryChange {
    pub fn delivery(&self) -> &Delivery {
        match self {
            DeliveryChange::Created(delivery) | DeliveryChange::Updated(delivery) => delivery,
        }
    }
}

pub type SnapshotFn = Box<dyn Fn() -> BoxFuture<'static, Result<Vec<Delivery>>> + Send + Sync>;

/// A cancellable handle over a live query: a lazy, unbounded, restartable
/// sequence of snapshot-or-delta events.
///
/// The first `next_event` call queries the store and yields a `Snapshot`;
/// subsequent calls yield `Added`/`Modified`/`Removed` deltas relative to
/// the filter. If the change feed lags past the channel capacity the handle
/// re-queries the store and yields a fresh `Snapshot` instead of losing
/// changes. Teardown is explicit via [`DeliverySubscription::unsubscribe`];
/// the caller owns it.
pub struct DeliverySubscription {
    filter: DeliveryFilter,
    changes: broadcast::Receiver<DeliveryChange>,
    snapshot: SnapshotFn,
    in_view: Option<HashSet<DeliveryId>>,
}

impl DeliverySubscription {
    pub fn new(
        filter: DeliveryFilter,
        changes: broadcast::Receiver<DeliveryChange>,
        snapshot: SnapshotFn,
    ) -> Self {
        Self {
            filter,
            changes,
            snapshot,
            in_view: None,
        }
    }

    pub fn filter(&self) -> &DeliveryFilter {
        &self.filter
    }

    /// Waits for the next event. Returns an error if the store's change feed
    /// has closed or the snapshot query fails; both leave the subscription
    /// unusable and the caller should tear it down.
    pub async fn next_event(&mut self) -> Result<DeliveryEvent> {
        if self.in_view.is_none() {
            return self.resync().await;
        }

        loop {
            match self.changes.recv().await {
                Ok(change) => {
                    if let Some(event) = self.classify(change) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "delivery change feed lagged; resynchronizing");
                    return self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("delivery change feed closed"));
                }
            }
        }
    }

    /// Tears the subscription down. Dropping has the same effect; this form
    /// exists so call sites state the teardown explicitly.
    pub fn unsubscribe(self) {}

    async fn resync(&mut self) -> Result<DeliveryEvent> {
        let deliveries = (self.snapshot)().await?;
        self.in_view = Some(deliveries.iter().map(|d| d.id.clone()).collect());
        Ok(DeliveryEvent::Snapshot(deliveries))
    }

    fn classify(&mut self, change: DeliveryChange) -> Option<DeliveryEvent> {
        let in_view = self.in_view.as_mut()?;
        let delivery = change.delivery();
        let matches = self.filter.matches(delivery);
        let was_in_view = in_view.contains(&delivery.id);

        match (was_in_view, matches) {
            (false, true) => {
                in_view.insert(delivery.id.clone());
                Some(DeliveryEvent::Added(delivery.clone()))
            }
            (true, true) => Some(DeliveryEvent::Modified(delivery.clone())),
            (true, false) => {
                in_view.remove(&delivery.id);
                Some(DeliveryEvent::Removed(delivery.id.clone()))
            }
            (false, false) => None,
        }
    }
}

/// The document store the lifecycle controller runs against.
///
/// Implementations must make [`claim_delivery`](DeliveryStore::claim_delivery)
/// atomic with respect to concurrent claims on the same delivery or by the
/// same courier, and [`update_status_checked`](DeliveryStore::update_status_checked)
/// a compare-and-swap on the current status. Every error is a transport or
/// store failure; precondition misses are reported through the outcome enums.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, new: NewDelivery) -> Result<Delivery>;

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>>;

    async fn active_delivery_for_courier(
        &self,
        courier_id: &CourierId,
    ) -> Result<Option<Delivery>>;

    /// Atomically verifies the delivery is still `pending` and the courier
    /// holds no active delivery, then assigns the courier and moves the
    /// record to `accepted`. On any precondition miss nothing is written.
    async fn claim_delivery(
        &self,
        id: &DeliveryId,
        courier_id: &CourierId,
        courier_name: &str,
    ) -> Result<ClaimOutcome>;

    /// Writes `next` only if the record's status still equals `expected`.
    async fn update_status_checked(
        &self,
        id: &DeliveryId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
    ) -> Result<StatusWrite>;

    async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>>;

    /// Finished (`delivered`/`canceled`) deliveries for history and report
    /// views, newest first, optionally bounded by `created_at`.
    async fn finished_deliveries_for_establishment(
        &self,
        establishment_id: &EstablishmentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>>;

    async fn finished_deliveries_for_courier(
        &self,
        courier_id: &CourierId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>>;

    async fn subscribe(&self, filter: DeliveryFilter) -> Result<DeliverySubscription>;

    async fn get_establishment(
        &self,
        id: &EstablishmentId,
    ) -> Result<Option<EstablishmentProfile>>;

    async fn get_courier(&self, id: &CourierId) -> Result<Option<CourierProfile>>;

    /// Admin access is granted by existence of the keyed record alone.
    async fn is_admin(&self, id: &AdminId) -> Result<bool>;

    async fn set_courier_online(&self, id: &CourierId, is_online: bool) -> Result<()>;

    async fn set_courier_push_token(&self, id: &CourierId, token: &str) -> Result<()>;
}
