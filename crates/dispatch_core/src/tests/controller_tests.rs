use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{
    domain::{
        Actor, AdminId, CourierId, CourierProfile, Delivery, DeliveryId, DeliveryStatus,
        EstablishmentId, EstablishmentProfile, NewDelivery,
    },
    error::{ErrorCode, ErrorDisposition},
};
use storage::Storage;
use store_api::{
    ClaimOutcome, DeliveryFilter, DeliveryStore, DeliverySubscription, StatusWrite,
};

use crate::{CreateDelivery, DispatchError, LifecycleController};

fn establishment(name: &str) -> EstablishmentProfile {
    EstablishmentProfile {
        name: name.into(),
        kind: "restaurant".into(),
        address: "Rua das Flores 10".into(),
        phone: "11 5555-0000".into(),
        hours: "18:00-23:00".into(),
        email: "contato@example.com".into(),
        photo_url: None,
        delivery_fee: Some(Decimal::new(800, 2)),
        is_blocked: false,
    }
}

fn courier(name: &str) -> CourierProfile {
    CourierProfile {
        name: name.into(),
        email: "courier@example.com".into(),
        phone: "11 5555-1111".into(),
        vehicle: "motorcycle".into(),
        area: "centro".into(),
        photo_url: None,
        is_online: true,
        is_blocked: false,
        push_token: None,
    }
}

fn request(pickup_code: Option<&str>) -> CreateDelivery {
    CreateDelivery {
        pickup_address: "Rua Augusta 1200".into(),
        delivery_address: "Av. Paulista 900, apto 52".into(),
        observation: Some("ring the bell twice".into()),
        value: Decimal::new(2550, 2),
        pickup_code: pickup_code.map(str::to_string),
    }
}

async fn seeded() -> (LifecycleController, Storage) {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .upsert_establishment(&EstablishmentId::from("est-1"), &establishment("Pizzaria Bella"))
        .await
        .unwrap();
    storage
        .upsert_establishment(&EstablishmentId::from("est-2"), &establishment("Padaria Sol"))
        .await
        .unwrap();
    storage
        .upsert_courier(&CourierId::from("courier-1"), &courier("Marcos"))
        .await
        .unwrap();
    storage
        .upsert_courier(&CourierId::from("courier-2"), &courier("Lia"))
        .await
        .unwrap();
    let controller = LifecycleController::new(Arc::new(storage.clone()));
    (controller, storage)
}

async fn delivered_delivery(
    controller: &LifecycleController,
    courier_id: &CourierId,
) -> Delivery {
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();
    controller
        .accept_delivery(courier_id, &delivery.id)
        .await
        .unwrap();
    controller.mark_arrived(courier_id, &delivery.id).await.unwrap();
    controller
        .validate_pickup_code(courier_id, &delivery.id, "4321")
        .await
        .unwrap();
    controller
        .complete_delivery(courier_id, &delivery.id)
        .await
        .unwrap()
}

#[tokio::test]
async fn created_delivery_is_pending_with_snapshotted_name() {
    let (controller, _storage) = seeded().await;

    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();

    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.establishment_name, "Pizzaria Bella");
    assert!(delivery.courier_id.is_none());
    assert!(delivery.courier_name.is_none());
    assert_eq!(delivery.value, Decimal::new(2550, 2));
}

#[tokio::test]
async fn create_rejects_blank_addresses_and_negative_value() {
    let (controller, _storage) = seeded().await;
    let establishment_id = EstablishmentId::from("est-1");

    let mut blank_pickup = request(None);
    blank_pickup.pickup_address = "   ".into();
    let err = controller
        .create_delivery(&establishment_id, blank_pickup)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
    assert_eq!(err.disposition(), ErrorDisposition::RetryInline);

    let mut blank_dropoff = request(None);
    blank_dropoff.delivery_address = String::new();
    assert!(matches!(
        controller
            .create_delivery(&establishment_id, blank_dropoff)
            .await,
        Err(DispatchError::Validation(_))
    ));

    let mut negative = request(None);
    negative.value = Decimal::new(-100, 2);
    assert!(matches!(
        controller.create_delivery(&establishment_id, negative).await,
        Err(DispatchError::Validation(_))
    ));
}

#[tokio::test]
async fn create_requires_a_live_establishment_profile() {
    let (controller, storage) = seeded().await;

    assert!(matches!(
        controller
            .create_delivery(&EstablishmentId::from("est-unknown"), request(None))
            .await,
        Err(DispatchError::Forbidden(_))
    ));

    let mut blocked = establishment("Pizzaria Bella");
    blocked.is_blocked = true;
    storage
        .upsert_establishment(&EstablishmentId::from("est-1"), &blocked)
        .await
        .unwrap();
    assert!(matches!(
        controller
            .create_delivery(&EstablishmentId::from("est-1"), request(None))
            .await,
        Err(DispatchError::Forbidden(_))
    ));
}

#[tokio::test]
async fn accept_assigns_the_courier_and_snapshots_their_name() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");

    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();
    let accepted = controller
        .accept_delivery(&courier_id, &delivery.id)
        .await
        .unwrap();

    assert_eq!(accepted.status, DeliveryStatus::Accepted);
    assert_eq!(accepted.courier_id, Some(courier_id));
    assert_eq!(accepted.courier_name.as_deref(), Some("Marcos"));
}

#[tokio::test]
async fn accept_rejects_unknown_and_blocked_couriers() {
    let (controller, storage) = seeded().await;
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();

    assert!(matches!(
        controller
            .accept_delivery(&CourierId::from("courier-ghost"), &delivery.id)
            .await,
        Err(DispatchError::Forbidden(_))
    ));

    let mut blocked = courier("Marcos");
    blocked.is_blocked = true;
    storage
        .upsert_courier(&CourierId::from("courier-1"), &blocked)
        .await
        .unwrap();
    assert!(matches!(
        controller
            .accept_delivery(&CourierId::from("courier-1"), &delivery.id)
            .await,
        Err(DispatchError::Forbidden(_))
    ));

    // The record never changed hands.
    let current = storage.get_delivery(&delivery.id).await.unwrap().unwrap();
    assert_eq!(current.status, DeliveryStatus::Pending);
    assert!(current.courier_id.is_none());
}

#[tokio::test]
async fn second_claim_on_the_same_delivery_loses() {
    let (controller, storage) = seeded().await;
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();

    controller
        .accept_delivery(&CourierId::from("courier-1"), &delivery.id)
        .await
        .unwrap();
    let err = controller
        .accept_delivery(&CourierId::from("courier-2"), &delivery.id)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::AlreadyClaimed {
            status: DeliveryStatus::Accepted
        }
    ));
    assert_eq!(err.code(), ErrorCode::AlreadyClaimed);
    assert_eq!(err.disposition(), ErrorDisposition::RedirectToSafeView);

    let current = storage.get_delivery(&delivery.id).await.unwrap().unwrap();
    assert_eq!(current.courier_name.as_deref(), Some("Marcos"));
}

#[tokio::test]
async fn courier_with_an_active_delivery_cannot_claim_another() {
    let (controller, storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let establishment_id = EstablishmentId::from("est-1");

    let first = controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();
    let second = controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &first.id).await.unwrap();

    let err = controller
        .accept_delivery(&courier_id, &second.id)
        .await
        .unwrap_err();
    match err {
        DispatchError::AlreadyHasActiveDelivery { delivery_id } => {
            assert_eq!(delivery_id, first.id)
        }
        other => panic!("expected AlreadyHasActiveDelivery, got {other:?}"),
    }

    let untouched = storage.get_delivery(&second.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn accept_of_an_unknown_delivery_is_not_found() {
    let (controller, _storage) = seeded().await;
    assert!(matches!(
        controller
            .accept_delivery(&CourierId::from("courier-1"), &DeliveryId::from("missing"))
            .await,
        Err(DispatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn only_the_assigned_courier_may_move_the_delivery() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &delivery.id).await.unwrap();

    let intruder = CourierId::from("courier-2");
    assert!(matches!(
        controller.mark_arrived(&intruder, &delivery.id).await,
        Err(DispatchError::Forbidden(_))
    ));
    controller.mark_arrived(&courier_id, &delivery.id).await.unwrap();
    assert!(matches!(
        controller
            .validate_pickup_code(&intruder, &delivery.id, "4321")
            .await,
        Err(DispatchError::Forbidden(_))
    ));
}

#[tokio::test]
async fn arriving_twice_is_an_invalid_transition() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &delivery.id).await.unwrap();
    controller.mark_arrived(&courier_id, &delivery.id).await.unwrap();

    assert!(matches!(
        controller.mark_arrived(&courier_id, &delivery.id).await,
        Err(DispatchError::InvalidTransition {
            from: DeliveryStatus::ArrivedPickup,
            ..
        })
    ));
}

#[tokio::test]
async fn wrong_pickup_code_blocks_transit_until_corrected() {
    let (controller, storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &delivery.id).await.unwrap();
    controller.mark_arrived(&courier_id, &delivery.id).await.unwrap();

    for _ in 0..3 {
        let err = controller
            .validate_pickup_code(&courier_id, &delivery.id, "9999")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPickupCode));
        assert_eq!(err.disposition(), ErrorDisposition::RetryInline);
    }
    let current = storage.get_delivery(&delivery.id).await.unwrap().unwrap();
    assert_eq!(current.status, DeliveryStatus::ArrivedPickup);

    let in_transit = controller
        .validate_pickup_code(&courier_id, &delivery.id, "4321")
        .await
        .unwrap();
    assert_eq!(in_transit.status, DeliveryStatus::InProgress);
}

#[tokio::test]
async fn pickup_code_is_checked_only_after_arrival() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(Some("4321")))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &delivery.id).await.unwrap();

    assert!(matches!(
        controller
            .validate_pickup_code(&courier_id, &delivery.id, "4321")
            .await,
        Err(DispatchError::InvalidTransition {
            from: DeliveryStatus::Accepted,
            ..
        })
    ));
}

#[tokio::test]
async fn delivery_without_a_stored_code_starts_without_confirmation() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &delivery.id).await.unwrap();
    controller.mark_arrived(&courier_id, &delivery.id).await.unwrap();

    let in_transit = controller
        .validate_pickup_code(&courier_id, &delivery.id, "anything")
        .await
        .unwrap();
    assert_eq!(in_transit.status, DeliveryStatus::InProgress);
}

#[tokio::test]
async fn completing_frees_the_courier_for_the_next_claim() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");

    let done = delivered_delivery(&controller, &courier_id).await;
    assert_eq!(done.status, DeliveryStatus::Delivered);

    let next = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();
    let accepted = controller
        .accept_delivery(&courier_id, &next.id)
        .await
        .unwrap();
    assert_eq!(accepted.status, DeliveryStatus::Accepted);
}

#[tokio::test]
async fn stale_action_after_completion_is_rejected() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let done = delivered_delivery(&controller, &courier_id).await;

    assert!(matches!(
        controller.complete_delivery(&courier_id, &done.id).await,
        Err(DispatchError::InvalidTransition {
            from: DeliveryStatus::Delivered,
            ..
        })
    ));
}

#[tokio::test]
async fn cancel_is_limited_to_the_owner_and_admins() {
    let (controller, storage) = seeded().await;
    let delivery = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();

    assert!(matches!(
        controller
            .cancel_delivery(
                &Actor::Establishment(EstablishmentId::from("est-2")),
                &delivery.id
            )
            .await,
        Err(DispatchError::Forbidden(_))
    ));
    assert!(matches!(
        controller
            .cancel_delivery(&Actor::Courier(CourierId::from("courier-1")), &delivery.id)
            .await,
        Err(DispatchError::Forbidden(_))
    ));
    assert!(matches!(
        controller
            .cancel_delivery(&Actor::Admin(AdminId::from("nobody")), &delivery.id)
            .await,
        Err(DispatchError::Forbidden(_))
    ));

    let canceled = controller
        .cancel_delivery(
            &Actor::Establishment(EstablishmentId::from("est-1")),
            &delivery.id,
        )
        .await
        .unwrap();
    assert_eq!(canceled.status, DeliveryStatus::Canceled);
    assert!(canceled.courier_id.is_none());

    let second = controller
        .create_delivery(&EstablishmentId::from("est-1"), request(None))
        .await
        .unwrap();
    storage.grant_admin(&AdminId::from("root")).await.unwrap();
    let canceled = controller
        .cancel_delivery(&Actor::Admin(AdminId::from("root")), &second.id)
        .await
        .unwrap();
    assert_eq!(canceled.status, DeliveryStatus::Canceled);
}

#[tokio::test]
async fn canceling_an_active_delivery_frees_the_courier() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let establishment_id = EstablishmentId::from("est-1");

    let first = controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();
    controller.accept_delivery(&courier_id, &first.id).await.unwrap();
    controller
        .cancel_delivery(&Actor::Establishment(establishment_id.clone()), &first.id)
        .await
        .unwrap();

    let second = controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();
    let accepted = controller
        .accept_delivery(&courier_id, &second.id)
        .await
        .unwrap();
    assert_eq!(accepted.status, DeliveryStatus::Accepted);
}

#[tokio::test]
async fn cancel_of_a_terminal_delivery_is_rejected() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let done = delivered_delivery(&controller, &courier_id).await;

    assert!(matches!(
        controller
            .cancel_delivery(
                &Actor::Establishment(EstablishmentId::from("est-1")),
                &done.id
            )
            .await,
        Err(DispatchError::InvalidTransition {
            from: DeliveryStatus::Delivered,
            ..
        })
    ));
}

#[tokio::test]
async fn availability_and_push_token_updates_land_on_the_profile() {
    let (controller, storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");

    controller
        .set_courier_availability(&courier_id, false)
        .await
        .unwrap();
    controller
        .register_push_token(&courier_id, "fcm-token-abc")
        .await
        .unwrap();

    let profile = storage.get_courier(&courier_id).await.unwrap().unwrap();
    assert!(!profile.is_online);
    assert_eq!(profile.push_token.as_deref(), Some("fcm-token-abc"));
    assert_eq!(profile.name, "Marcos");

    assert!(matches!(
        controller.register_push_token(&courier_id, "  ").await,
        Err(DispatchError::Validation(_))
    ));
}

#[tokio::test]
async fn history_returns_finished_deliveries_with_a_tally() {
    let (controller, _storage) = seeded().await;
    let courier_id = CourierId::from("courier-1");
    let establishment_id = EstablishmentId::from("est-1");

    let delivered = delivered_delivery(&controller, &courier_id).await;
    let canceled = controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();
    controller
        .cancel_delivery(&Actor::Establishment(establishment_id.clone()), &canceled.id)
        .await
        .unwrap();
    // Still pending, must not appear in history.
    controller
        .create_delivery(&establishment_id, request(None))
        .await
        .unwrap();

    let (deliveries, tally) = controller
        .establishment_history(&establishment_id, None, None)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(tally.delivered, 1);
    assert_eq!(tally.canceled, 1);
    assert_eq!(tally.delivered_value, delivered.value);

    let (courier_view, courier_tally) = controller
        .courier_history(&courier_id, None, None)
        .await
        .unwrap();
    assert_eq!(courier_view.len(), 1);
    assert_eq!(courier_view[0].id, delivered.id);
    assert_eq!(courier_tally.delivered, 1);
    assert_eq!(courier_tally.canceled, 0);
}

struct FailingStore;

#[async_trait]
impl DeliveryStore for FailingStore {
    async fn insert_delivery(&self, _new: NewDelivery) -> Result<Delivery> {
        Err(anyhow!("store offline"))
    }
    async fn get_delivery(&self, _id: &DeliveryId) -> Result<Option<Delivery>> {
        Err(anyhow!("store offline"))
    }
    async fn active_delivery_for_courier(
        &self,
        _courier_id: &CourierId,
    ) -> Result<Option<Delivery>> {
        Err(anyhow!("store offline"))
    }
    async fn claim_delivery(
        &self,
        _id: &DeliveryId,
        _courier_id: &CourierId,
        _courier_name: &str,
    ) -> Result<ClaimOutcome> {
        Err(anyhow!("store offline"))
    }
    async fn update_status_checked(
        &self,
        _id: &DeliveryId,
        _expected: DeliveryStatus,
        _next: DeliveryStatus,
    ) -> Result<StatusWrite> {
        Err(anyhow!("store offline"))
    }
    async fn list_deliveries(&self, _filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        Err(anyhow!("store offline"))
    }
    async fn finished_deliveries_for_establishment(
        &self,
        _establishment_id: &EstablishmentId,
        _from: Option<DateTime<Utc>>,
        _to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>> {
        Err(anyhow!("store offline"))
    }
    async fn finished_deliveries_for_courier(
        &self,
        _courier_id: &CourierId,
        _from: Option<DateTime<Utc>>,
        _to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Delivery>> {
        Err(anyhow!("store offline"))
    }
    async fn subscribe(&self, _filter: DeliveryFilter) -> Result<DeliverySubscription> {
        Err(anyhow!("store offline"))
    }
    async fn get_establishment(
        &self,
        _id: &EstablishmentId,
    ) -> Result<Option<EstablishmentProfile>> {
        Err(anyhow!("store offline"))
    }
    async fn get_courier(&self, _id: &CourierId) -> Result<Option<CourierProfile>> {
        Err(anyhow!("store offline"))
    }
    async fn is_admin(&self, _id: &AdminId) -> Result<bool> {
        Err(anyhow!("store offline"))
    }
    async fn set_courier_online(&self, _id: &CourierId, _is_online: bool) -> Result<()> {
        Err(anyhow!("store offline"))
    }
    async fn set_courier_push_token(&self, _id: &CourierId, _token: &str) -> Result<()> {
        Err(anyhow!("store offline"))
    }
}

#[tokio::test]
async fn store_failures_surface_as_store_errors() {
    let controller = LifecycleController::new(Arc::new(FailingStore));

    let err = controller
        .accept_delivery(&CourierId::from("courier-1"), &DeliveryId::from("d-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Store(_)));
    assert_eq!(err.code(), ErrorCode::StoreUnavailable);
    assert_eq!(err.disposition(), ErrorDisposition::KeepView);
}
