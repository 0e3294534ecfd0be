use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dispatch_core::{CreateDelivery, LifecycleController};
use rust_decimal::Decimal;
use shared::domain::{
    Actor, AdminId, CourierId, CourierProfile, DeliveryId, EstablishmentId, EstablishmentProfile,
};
use storage::Storage;
use store_api::DeliveryStore;
use tracing_subscriber::EnvFilter;

mod settings;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the database url from entregalocal.toml / the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    RegisterEstablishment {
        id: String,
        name: String,
        #[arg(long, default_value = "")]
        kind: String,
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        hours: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long)]
        delivery_fee: Option<Decimal>,
    },
    RegisterCourier {
        id: String,
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        vehicle: String,
        #[arg(long, default_value = "")]
        area: String,
    },
    GrantAdmin {
        id: String,
    },
    CreateDelivery {
        establishment_id: String,
        pickup_address: String,
        delivery_address: String,
        value: Decimal,
        #[arg(long)]
        observation: Option<String>,
        #[arg(long)]
        pickup_code: Option<String>,
    },
    Accept {
        courier_id: String,
        delivery_id: String,
    },
    Arrive {
        courier_id: String,
        delivery_id: String,
    },
    Start {
        courier_id: String,
        delivery_id: String,
        pickup_code: String,
    },
    Complete {
        courier_id: String,
        delivery_id: String,
    },
    Cancel {
        delivery_id: String,
        #[arg(long)]
        establishment_id: Option<String>,
        #[arg(long)]
        admin_id: Option<String>,
    },
    SetOnline {
        courier_id: String,
        online: bool,
    },
    RegisterToken {
        courier_id: String,
        token: String,
    },
    WatchPending,
    History {
        #[arg(long)]
        establishment_id: Option<String>,
        #[arg(long)]
        courier_id: Option<String>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => url,
        None => settings::load_settings().database_url,
    };
    let database_url = settings::prepare_database_url(&database_url)?;
    let storage = Storage::new(&database_url).await?;
    let store: Arc<dyn DeliveryStore> = Arc::new(storage.clone());
    let controller = LifecycleController::new(store);

    match cli.command {
        Command::RegisterEstablishment {
            id,
            name,
            kind,
            address,
            phone,
            hours,
            email,
            delivery_fee,
        } => {
            let id = EstablishmentId(id);
            storage
                .upsert_establishment(
                    &id,
                    &EstablishmentProfile {
                        name,
                        kind,
                        address,
                        phone,
                        hours,
                        email,
                        photo_url: None,
                        delivery_fee,
                        is_blocked: false,
                    },
                )
                .await?;
            println!("registered establishment {id}");
        }
        Command::RegisterCourier {
            id,
            name,
            email,
            phone,
            vehicle,
            area,
        } => {
            let id = CourierId(id);
            storage
                .upsert_courier(
                    &id,
                    &CourierProfile {
                        name,
                        email,
                        phone,
                        vehicle,
                        area,
                        photo_url: None,
                        is_online: false,
                        is_blocked: false,
                        push_token: None,
                    },
                )
                .await?;
            println!("registered courier {id}");
        }
        Command::GrantAdmin { id } => {
            let id = AdminId(id);
            storage.grant_admin(&id).await?;
            println!("granted admin to {id}");
        }
        Command::CreateDelivery {
            establishment_id,
            pickup_address,
            delivery_address,
            value,
            observation,
            pickup_code,
        } => {
            let delivery = controller
                .create_delivery(
                    &EstablishmentId(establishment_id),
                    CreateDelivery {
                        pickup_address,
                        delivery_address,
                        observation,
                        value,
                        pickup_code,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::Accept {
            courier_id,
            delivery_id,
        } => {
            let delivery = controller
                .accept_delivery(&CourierId(courier_id), &DeliveryId(delivery_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::Arrive {
            courier_id,
            delivery_id,
        } => {
            let delivery = controller
                .mark_arrived(&CourierId(courier_id), &DeliveryId(delivery_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::Start {
            courier_id,
            delivery_id,
            pickup_code,
        } => {
            let delivery = controller
                .validate_pickup_code(&CourierId(courier_id), &DeliveryId(delivery_id), &pickup_code)
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::Complete {
            courier_id,
            delivery_id,
        } => {
            let delivery = controller
                .complete_delivery(&CourierId(courier_id), &DeliveryId(delivery_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::Cancel {
            delivery_id,
            establishment_id,
            admin_id,
        } => {
            let actor = match (establishment_id, admin_id) {
                (Some(id), None) => Actor::Establishment(EstablishmentId(id)),
                (None, Some(id)) => Actor::Admin(AdminId(id)),
                _ => bail!("cancel needs exactly one of --establishment-id or --admin-id"),
            };
            let delivery = controller
                .cancel_delivery(&actor, &DeliveryId(delivery_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&delivery)?);
        }
        Command::SetOnline { courier_id, online } => {
            controller
                .set_courier_availability(&CourierId(courier_id), online)
                .await?;
            println!("availability updated");
        }
        Command::RegisterToken { courier_id, token } => {
            controller
                .register_push_token(&CourierId(courier_id), &token)
                .await?;
            println!("push token registered");
        }
        Command::WatchPending => {
            let mut feed = controller.watch_pending().await?;
            loop {
                let event = feed.next_event().await?;
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::History {
            establishment_id,
            courier_id,
            from,
            to,
        } => {
            let (deliveries, tally) = match (establishment_id, courier_id) {
                (Some(id), None) => {
                    controller
                        .establishment_history(&EstablishmentId(id), from, to)
                        .await?
                }
                (None, Some(id)) => {
                    controller.courier_history(&CourierId(id), from, to).await?
                }
                _ => bail!("history needs exactly one of --establishment-id or --courier-id"),
            };
            for delivery in &deliveries {
                println!("{}", serde_json::to_string(delivery)?);
            }
            println!(
                "delivered={} canceled={} delivered_value={}",
                tally.delivered, tally.canceled, tally.delivered_value
            );
        }
    }

    Ok(())
}
