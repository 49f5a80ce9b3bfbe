//! Booking Worker - event bus example service
//!
//! A small consumer in the shape every HomeTrip service takes:
//!
//! - loads its bus settings from the environment (`.env` is honoured)
//! - connects to RabbitMQ and exits 1 if it cannot
//! - reacts to `booking.*` by queueing a guest notification
//! - reacts to `user.deleted` by dropping that user's bookings
//! - exposes Prometheus metrics on `:9000/metrics`
//! - shuts down on SIGTERM / Ctrl+C within `SHUTDOWN_TIMEOUT_SECS`
//!
//! # Running the Example
//!
//! ```bash
//! docker run -d -p 5672:5672 rabbitmq:3
//! SERVICE_NAME=booking-worker cargo run -p booking-worker
//! ```

#![allow(missing_docs)]

use hometrip_events_amqp::AmqpBroker;
use hometrip_events_core::{HandlerOutcome, ReceivedMessage, typed};
use hometrip_events_runtime::shutdown::wait_for_signal;
use hometrip_events_runtime::{BusConfig, EventBus, ExitStatus, ServiceLifecycle};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingEvent {
    booking_id: String,
    #[serde(default)]
    guest_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDeleted {
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], 9000))
        .install()?;

    let config = BusConfig::from_env()?;
    let broker = AmqpBroker::builder()
        .connection_name(config.service_name.clone())
        .build();
    let bus = EventBus::new(config, Arc::new(broker))?;
    let lifecycle = ServiceLifecycle::new(bus.clone());

    if let Err(e) = lifecycle.start().await {
        error!(error = %e, "Could not reach the event bus, exiting");
        std::process::exit(ExitStatus::StartupFailed.code());
    }

    subscribe_handlers(&bus).await?;
    info!(subscriptions = bus.subscription_count(), "Booking worker ready");

    let status = lifecycle.run_until(wait_for_signal()).await;
    std::process::exit(status.code());
}

async fn subscribe_handlers(bus: &EventBus) -> anyhow::Result<()> {
    let publisher = bus.clone();
    bus.subscribe(
        "booking.*",
        typed(move |event: BookingEvent, message: ReceivedMessage| {
            let publisher = publisher.clone();
            async move {
                info!(
                    booking_id = %event.booking_id,
                    event_type = %message.envelope.event_type,
                    "Booking event received"
                );
                let Some(guest_id) = event.guest_id else {
                    return HandlerOutcome::Ack;
                };
                let notification = json!({
                    "userId": guest_id,
                    "template": message.envelope.event_type,
                    "bookingId": event.booking_id,
                });
                match publisher
                    .emit("notification.send", "notification.send", &notification)
                    .await
                {
                    Ok(()) => HandlerOutcome::Ack,
                    Err(e) => {
                        warn!(error = %e, "Could not queue notification");
                        HandlerOutcome::Requeue
                    },
                }
            }
        }),
    )
    .await?;

    bus.subscribe(
        "user.deleted",
        typed(|event: UserDeleted, _message: ReceivedMessage| async move {
            info!(user_id = %event.user_id, "Dropping bookings of deleted user");
            HandlerOutcome::Ack
        }),
    )
    .await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booking_worker=info,hometrip_events_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
