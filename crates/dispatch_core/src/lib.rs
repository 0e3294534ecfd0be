use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::domain::{
    Actor, CourierId, CourierProfile, Delivery, DeliveryId, DeliveryStatus, DeliveryTally,
    EstablishmentId, EstablishmentProfile, NewDelivery,
};
use store_api::{ClaimOutcome, DeliveryFilter, DeliveryStore, DeliverySubscription, StatusWrite};
use tracing::{info, warn};

pub mod error;
pub use error::DispatchError;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Fields an establishment submits when publishing a delivery.
#[derive(Debug, Clone)]
pub struct CreateDelivery {
    pub pickup_address: String,
    pub delivery_address: String,
    pub observation: Option<String>,
    pub value: Decimal,
    pub pickup_code: Option<String>,
}

/// Owns every state transition of a delivery record.
///
/// The controller validates preconditions, snapshots profile names onto the
/// record, and delegates the actual writes to the store: an atomic claim for
/// acceptance, compare-and-swap status writes for everything after. A failed
/// operation never mutates the record.
pub struct LifecycleController {
    store: Arc<dyn DeliveryStore>,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    /// Publishes a new delivery for the establishment. The record starts
    /// `pending` and unassigned; `establishment_name` is snapshotted from
    /// the profile at this moment.
    pub async fn create_delivery(
        &self,
        establishment_id: &EstablishmentId,
        request: CreateDelivery,
    ) -> DispatchResult<Delivery> {
        if request.pickup_address.trim().is_empty() {
            return Err(DispatchError::Validation(
                "pickup address must not be empty".into(),
            ));
        }
        if request.delivery_address.trim().is_empty() {
            return Err(DispatchError::Validation(
                "delivery address must not be empty".into(),
            ));
        }
        if request.value.is_sign_negative() {
            return Err(DispatchError::Validation(
                "delivery value must not be negative".into(),
            ));
        }

        let profile = self.require_establishment(establishment_id).await?;

        let delivery = self
            .store
            .insert_delivery(NewDelivery {
                establishment_id: establishment_id.clone(),
                establishment_name: profile.name,
                pickup_address: request.pickup_address,
                delivery_address: request.delivery_address,
                observation: request.observation,
                value: request.value,
                pickup_code: request.pickup_code,
            })
            .await?;

        info!(
            delivery_id = %delivery.id,
            establishment_id = %establishment_id,
            "delivery published"
        );
        Ok(delivery)
    }

    /// Claims a pending delivery for the courier. The claim is atomic: it
    /// verifies the courier holds no active delivery and the target is still
    /// pending, then assigns in the same store transaction. Losing claims
    /// mutate nothing.
    pub async fn accept_delivery(
        &self,
        courier_id: &CourierId,
        delivery_id: &DeliveryId,
    ) -> DispatchResult<Delivery> {
        let profile = self.require_courier(courier_id).await?;

        let outcome = self
            .store
            .claim_delivery(delivery_id, courier_id, &profile.name)
            .await?;

        match outcome {
            ClaimOutcome::Claimed(delivery) => {
                info!(
                    delivery_id = %delivery.id,
                    courier_id = %courier_id,
                    "delivery accepted"
                );
                Ok(delivery)
            }
            ClaimOutcome::Missing => Err(DispatchError::NotFound(delivery_id.clone())),
            ClaimOutcome::NotPending(status) => {
                warn!(
                    delivery_id = %delivery_id,
                    courier_id = %courier_id,
                    status = %status,
                    "claim rejected: delivery no longer pending"
                );
                Err(DispatchError::AlreadyClaimed { status })
            }
            ClaimOutcome::CourierBusy(active_id) => {
                warn!(
                    delivery_id = %delivery_id,
                    courier_id = %courier_id,
                    active_delivery_id = %active_id,
                    "claim rejected: courier already active"
                );
                Err(DispatchError::AlreadyHasActiveDelivery {
                    delivery_id: active_id,
                })
            }
        }
    }

    /// The assigned courier signals arrival at the establishment. No code
    /// validation happens here.
    pub async fn mark_arrived(
        &self,
        courier_id: &CourierId,
        delivery_id: &DeliveryId,
    ) -> DispatchResult<Delivery> {
        let delivery = self.require_delivery(delivery_id).await?;
        assigned_courier_guard(courier_id, &delivery)?;
        self.advance(
            delivery_id,
            DeliveryStatus::Accepted,
            DeliveryStatus::ArrivedPickup,
            "arrive at",
        )
        .await
    }

    /// Checks the submitted pickup code and, on a match, moves the delivery
    /// into transit. A mismatch mutates nothing and may be retried without
    /// limit; when the delivery carries no stored code, confirmation is not
    /// enforced and the transition proceeds.
    pub async fn validate_pickup_code(
        &self,
        courier_id: &CourierId,
        delivery_id: &DeliveryId,
        submitted_code: &str,
    ) -> DispatchResult<Delivery> {
        let delivery = self.require_delivery(delivery_id).await?;
        assigned_courier_guard(courier_id, &delivery)?;

        if delivery.status != DeliveryStatus::ArrivedPickup {
            return Err(DispatchError::InvalidTransition {
                from: delivery.status,
                action: "start",
            });
        }

        if let Some(expected) = &delivery.pickup_code {
            if submitted_code != expected {
                warn!(
                    delivery_id = %delivery_id,
                    courier_id = %courier_id,
                    "pickup code mismatch"
                );
                return Err(DispatchError::InvalidPickupCode);
            }
        }

        self.advance(
            delivery_id,
            DeliveryStatus::ArrivedPickup,
            DeliveryStatus::InProgress,
            "start",
        )
        .await
    }

    /// Marks the delivery as handed over. Terminal; frees the courier's
    /// active-delivery slot.
    pub async fn complete_delivery(
        &self,
        courier_id: &CourierId,
        delivery_id: &DeliveryId,
    ) -> DispatchResult<Delivery> {
        let delivery = self.require_delivery(delivery_id).await?;
        assigned_courier_guard(courier_id, &delivery)?;
        let delivered = self
            .advance(
                delivery_id,
                DeliveryStatus::InProgress,
                DeliveryStatus::Delivered,
                "complete",
            )
            .await?;
        info!(
            delivery_id = %delivery_id,
            courier_id = %courier_id,
            "delivery completed"
        );
        Ok(delivered)
    }

    /// Cancels a non-terminal delivery. Allowed for the owning establishment
    /// and for admins; couriers may not cancel. Terminal; frees the
    /// courier's slot if one was assigned.
    pub async fn cancel_delivery(
        &self,
        actor: &Actor,
        delivery_id: &DeliveryId,
    ) -> DispatchResult<Delivery> {
        let mut delivery = self.require_delivery(delivery_id).await?;

        match actor {
            Actor::Establishment(establishment_id) => {
                if &delivery.establishment_id != establishment_id {
                    return Err(DispatchError::Forbidden(
                        "only the owning establishment may cancel this delivery".into(),
                    ));
                }
                self.require_establishment(establishment_id).await?;
            }
            Actor::Admin(admin_id) => {
                if !self.store.is_admin(admin_id).await? {
                    return Err(DispatchError::Forbidden("not an administrator".into()));
                }
            }
            Actor::Courier(_) => {
                return Err(DispatchError::Forbidden(
                    "couriers may not cancel deliveries".into(),
                ));
            }
        }

        // Status only moves forward, so a conflicting concurrent transition
        // can preempt the cancel at most a handful of times before the
        // record is terminal.
        for _ in 0..4 {
            if delivery.status.is_terminal() {
                return Err(DispatchError::InvalidTransition {
                    from: delivery.status,
                    action: "cancel",
                });
            }
            match self
                .store
                .update_status_checked(delivery_id, delivery.status, DeliveryStatus::Canceled)
                .await?
            {
                StatusWrite::Updated(canceled) => {
                    info!(delivery_id = %delivery_id, "delivery canceled");
                    return Ok(canceled);
                }
                StatusWrite::Missing => {
                    return Err(DispatchError::NotFound(delivery_id.clone()))
                }
                StatusWrite::Conflict(actual) => delivery.status = actual,
            }
        }
        Err(DispatchError::Store(anyhow::anyhow!(
            "cancel of delivery {delivery_id} kept losing to concurrent transitions"
        )))
    }

    pub async fn set_courier_availability(
        &self,
        courier_id: &CourierId,
        is_online: bool,
    ) -> DispatchResult<()> {
        self.store.set_courier_online(courier_id, is_online).await?;
        info!(courier_id = %courier_id, is_online, "courier availability updated");
        Ok(())
    }

    pub async fn register_push_token(
        &self,
        courier_id: &CourierId,
        token: &str,
    ) -> DispatchResult<()> {
        if token.trim().is_empty() {
            return Err(DispatchError::Validation(
                "push token must not be empty".into(),
            ));
        }
        self.store.set_courier_push_token(courier_id, token).await?;
        Ok(())
    }

    /// Finished deliveries for the establishment, newest first, with the
    /// aggregate shown on history and report views.
    pub async fn establishment_history(
        &self,
        establishment_id: &EstablishmentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> DispatchResult<(Vec<Delivery>, DeliveryTally)> {
        let deliveries = self
            .store
            .finished_deliveries_for_establishment(establishment_id, from, to)
            .await?;
        let tally = DeliveryTally::from_deliveries(&deliveries);
        Ok((deliveries, tally))
    }

    pub async fn courier_history(
        &self,
        courier_id: &CourierId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> DispatchResult<(Vec<Delivery>, DeliveryTally)> {
        let deliveries = self
            .store
            .finished_deliveries_for_courier(courier_id, from, to)
            .await?;
        let tally = DeliveryTally::from_deliveries(&deliveries);
        Ok((deliveries, tally))
    }

    /// Live view of deliveries waiting for a courier.
    pub async fn watch_pending(&self) -> DispatchResult<DeliverySubscription> {
        Ok(self.store.subscribe(DeliveryFilter::Pending).await?)
    }

    /// Live view of the courier's current active delivery.
    pub async fn watch_courier_active(
        &self,
        courier_id: &CourierId,
    ) -> DispatchResult<DeliverySubscription> {
        Ok(self
            .store
            .subscribe(DeliveryFilter::ActiveForCourier(courier_id.clone()))
            .await?)
    }

    /// Live view of everything belonging to an establishment.
    pub async fn watch_establishment(
        &self,
        establishment_id: &EstablishmentId,
    ) -> DispatchResult<DeliverySubscription> {
        Ok(self
            .store
            .subscribe(DeliveryFilter::ForEstablishment(establishment_id.clone()))
            .await?)
    }

    async fn advance(
        &self,
        delivery_id: &DeliveryId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
        action: &'static str,
    ) -> DispatchResult<Delivery> {
        match self
            .store
            .update_status_checked(delivery_id, expected, next)
            .await?
        {
            StatusWrite::Updated(delivery) => {
                info!(
                    delivery_id = %delivery_id,
                    from = %expected,
                    to = %next,
                    "delivery transitioned"
                );
                Ok(delivery)
            }
            StatusWrite::Missing => Err(DispatchError::NotFound(delivery_id.clone())),
            StatusWrite::Conflict(actual) => Err(DispatchError::InvalidTransition {
                from: actual,
                action,
            }),
        }
    }

    async fn require_delivery(&self, delivery_id: &DeliveryId) -> DispatchResult<Delivery> {
        self.store
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(delivery_id.clone()))
    }

    async fn require_establishment(
        &self,
        establishment_id: &EstablishmentId,
    ) -> DispatchResult<EstablishmentProfile> {
        let profile = self
            .store
            .get_establishment(establishment_id)
            .await?
            .ok_or_else(|| {
                DispatchError::Forbidden(format!(
                    "no establishment profile for {establishment_id}"
                ))
            })?;
        if profile.is_blocked {
            return Err(DispatchError::Forbidden(format!(
                "establishment {establishment_id} is blocked"
            )));
        }
        Ok(profile)
    }

    async fn require_courier(&self, courier_id: &CourierId) -> DispatchResult<CourierProfile> {
        let profile = self
            .store
            .get_courier(courier_id)
            .await?
            .ok_or_else(|| {
                DispatchError::Forbidden(format!("no courier profile for {courier_id}"))
            })?;
        if profile.is_blocked {
            return Err(DispatchError::Forbidden(format!(
                "courier {courier_id} is blocked"
            )));
        }
        Ok(profile)
    }
}

fn assigned_courier_guard(courier_id: &CourierId, delivery: &Delivery) -> DispatchResult<()> {
    if delivery.courier_id.as_ref() == Some(courier_id) {
        Ok(())
    } else {
        Err(DispatchError::Forbidden(format!(
            "delivery {} is not assigned to courier {courier_id}",
            delivery.id
        )))
    }
}

#[cfg(test)]
mod tests;
