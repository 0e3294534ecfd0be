use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(DeliveryId);
id_newtype!(EstablishmentId);
id_newtype!(CourierId);
id_newtype!(AdminId);

/// Lifecycle status of a delivery. Transitions only move forward along the
/// chain or sideways to `Canceled`; `Delivered` and `Canceled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Accepted,
    ArrivedPickup,
    InProgress,
    Delivered,
    Canceled,
}

impl DeliveryStatus {
    /// Statuses that occupy a courier's single active-delivery slot.
    pub const ACTIVE: [DeliveryStatus; 3] = [
        DeliveryStatus::Accepted,
        DeliveryStatus::ArrivedPickup,
        DeliveryStatus::InProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Accepted => "accepted",
            DeliveryStatus::ArrivedPickup => "arrived_pickup",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<DeliveryStatus> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "accepted" => Some(DeliveryStatus::Accepted),
            "arrived_pickup" => Some(DeliveryStatus::ArrivedPickup),
            "in_progress" => Some(DeliveryStatus::InProgress),
            "delivered" => Some(DeliveryStatus::Delivered),
            "canceled" => Some(DeliveryStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Canceled)
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery record as held by the store.
///
/// `establishment_name` and `courier_name` are denormalized snapshots taken
/// at creation and acceptance time respectively; they are refreshed only by
/// an explicit profile lookup, never automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub establishment_id: EstablishmentId,
    pub establishment_name: String,
    pub courier_id: Option<CourierId>,
    pub courier_name: Option<String>,
    pub pickup_address: String,
    pub delivery_address: String,
    pub observation: Option<String>,
    pub value: Decimal,
    pub pickup_code: Option<String>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields the establishment supplies when publishing a delivery. The store
/// assigns `id` and `created_at`; status always starts at `Pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub establishment_id: EstablishmentId,
    pub establishment_name: String,
    pub pickup_address: String,
    pub delivery_address: String,
    pub observation: Option<String>,
    pub value: Decimal,
    pub pickup_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstablishmentProfile {
    pub name: String,
    pub kind: String,
    pub address: String,
    pub phone: String,
    pub hours: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub delivery_fee: Option<Decimal>,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierProfile {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub vehicle: String,
    pub area: String,
    pub photo_url: Option<String>,
    pub is_online: bool,
    pub is_blocked: bool,
    pub push_token: Option<String>,
}

/// The acting principal for an operation, as issued by the identity
/// provider. Identities are trusted; role membership is established only by
/// the presence of the matching profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Establishment(EstablishmentId),
    Courier(CourierId),
    Admin(AdminId),
}

/// Aggregate of finished deliveries, as shown on history and report views.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeliveryTally {
    pub delivered: u64,
    pub canceled: u64,
    pub delivered_value: Decimal,
}

impl DeliveryTally {
    pub fn from_deliveries(deliveries: &[Delivery]) -> DeliveryTally {
        let mut tally = DeliveryTally::default();
        for delivery in deliveries {
            match delivery.status {
                DeliveryStatus::Delivered => {
                    tally.delivered += 1;
                    tally.delivered_value += delivery.value;
                }
                DeliveryStatus::Canceled => tally.canceled += 1,
                _ => {}
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_store_representation() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Accepted,
            DeliveryStatus::ArrivedPickup,
            DeliveryStatus::InProgress,
            DeliveryStatus::Delivered,
            DeliveryStatus::Canceled,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("unknown"), None);
    }

    #[test]
    fn active_statuses_exclude_terminals_and_pending() {
        assert!(!DeliveryStatus::Pending.is_active());
        assert!(DeliveryStatus::Accepted.is_active());
        assert!(DeliveryStatus::ArrivedPickup.is_active());
        assert!(DeliveryStatus::InProgress.is_active());
        assert!(!DeliveryStatus::Delivered.is_active());
        assert!(!DeliveryStatus::Canceled.is_active());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Canceled.is_terminal());
    }

    #[test]
    fn tally_counts_only_finished_deliveries() {
        let base = Delivery {
            id: DeliveryId::from("d1"),
            establishment_id: EstablishmentId::from("e1"),
            establishment_name: "Padaria Central".into(),
            courier_id: None,
            courier_name: None,
            pickup_address: "Rua A, 10".into(),
            delivery_address: "Rua B, 20".into(),
            observation: None,
            value: Decimal::new(1250, 2),
            pickup_code: None,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
        };

        let delivered = Delivery {
            id: DeliveryId::from("d2"),
            status: DeliveryStatus::Delivered,
            ..base.clone()
        };
        let canceled = Delivery {
            id: DeliveryId::from("d3"),
            status: DeliveryStatus::Canceled,
            ..base.clone()
        };

        let tally = DeliveryTally::from_deliveries(&[base, delivered, canceled]);
        assert_eq!(tally.delivered, 1);
        assert_eq!(tally.canceled, 1);
        assert_eq!(tally.delivered_value, Decimal::new(1250, 2));
    }
}
