//! realtime-sync demo
//!
//! Drives a client over the in-process loopback transport: connects an
//! entity, publishes a few documents, simulates a dropped link and shuts down.
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use realtime_sync::{
    ClientConfig, ClientEvent, ConnectionManager, EntityCallbacks, EntityId, LoopbackTransport,
    StandardChannel, SyncResult, TracingActivityLogger,
};

fn parse_entity() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--entity" | "-e" => {
                if let Some(value) = args.next() {
                    return value;
                }
                eprintln!("error: --entity requires a value");
                std::process::exit(1);
            }
            "--help" | "-h" => {
                println!("usage: realtime-sync-demo [--entity <id>]");
                std::process::exit(0);
            }
            other => {
                eprintln!("error: unknown argument: {other}");
                std::process::exit(1);
            }
        }
    }
    "user-42".to_string()
}

#[tokio::main]
async fn main() -> SyncResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let entity = parse_entity();
    let transport = Arc::new(LoopbackTransport::new());
    let config = ClientConfig::default().with_platform("demo");
    let client =
        ConnectionManager::new(config, transport.clone(), Arc::new(TracingActivityLogger))?;

    client.on_any(|event| {
        if let ClientEvent::Reconnecting { attempt, delay, reason } = event {
            println!("reconnecting: attempt {attempt} in {delay:?} ({reason:?})");
        }
    });

    client.connect(&entity).await?;
    let teardown = client.subscribe_to_entity(
        &entity,
        EntityCallbacks::new()
            .on_portfolio_update(|p| {
                println!("portfolio update: {p}");
                Ok(())
            })
            .on_transaction_update(|t| {
                println!("transaction update: {t}");
                Ok(())
            })
            .on_user_update(|u| {
                println!("profile update: {u}");
                Ok(())
            })
            .on_connect(|id| println!("connected as {id}"))
            .on_disconnect(|reason| println!("disconnected: {reason}"))
            .on_error(|err| eprintln!("error: {err}")),
    )?;

    let id = EntityId::new(&entity)?;
    let layout = &client.config().channels;
    transport.publish(
        &layout.channel_path(StandardChannel::Portfolio, &id),
        json!({"ownerId": entity, "totalValue": 12_500.75}),
    );
    transport.publish(
        &layout.channel_path(StandardChannel::Transaction, &id),
        json!({"userId": entity, "type": "buy", "amount": 5, "symbol": "ETH", "status": "pending"}),
    );
    transport.publish(
        &layout.channel_path(StandardChannel::UserProfile, &id),
        json!({"$id": entity, "currency": "EUR"}),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    transport.drop_connection("demo: simulated network loss");
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    println!("state after recovery: {}", client.state());

    teardown.teardown();
    client.disconnect().await;
    Ok(())
}
