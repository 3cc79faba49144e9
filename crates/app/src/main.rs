//! Console host for the entitlement reconciler, backed by the simulated store.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use entitle_billing::{
    BillingConfig, BillingEvent, BillingResult, EntitlementReconciler, Product, ReconcilerHandle,
    ResponseCode, SimulatedProvider,
};
use entitle_events::{EventBus, EventEnvelope, InMemoryEventBus};
use entitle_observability::LogFormat;

const HELP: &str = "commands: buy | cancel | refresh | catalog | resume | connect | disconnect | status | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let format = std::env::var("ENTITLE_LOG_JSON")
        .map(|value| LogFormat::from_flag(&value))
        .unwrap_or_default();
    entitle_observability::init_with(format);

    let config = BillingConfig::from_env().context("invalid billing configuration")?;
    let catalog = config
        .catalog_product_ids
        .iter()
        .map(|id| Product::new(id.clone(), "$4.99"))
        .collect();
    let provider = Arc::new(SimulatedProvider::new(catalog).completing_purchases());

    let bus = Arc::new(InMemoryEventBus::<EventEnvelope<BillingEvent>>::new());
    let events = bus.subscribe();
    // Ends once the reconciler drops the bus.
    std::thread::spawn(move || {
        while let Ok(envelope) = events.recv() {
            tracing::debug!(
                sequence = envelope.sequence_number(),
                event_type = envelope.event_type(),
                "billing event"
            );
        }
    });

    let handle = EntitlementReconciler::spawn(provider.clone(), bus, config);
    spawn_banner(&handle);
    handle.connect().await?;

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "buy" => handle.buy().await?,
            "cancel" => {
                let canceled = BillingResult::new(ResponseCode::UserCanceled, "canceled from console");
                if !provider.notify(canceled, Vec::new()).await {
                    println!("no live connection");
                }
            }
            "refresh" => handle.refresh_purchases().await?,
            "catalog" => {
                let ids = handle.config().catalog_product_ids.clone();
                handle.refresh_catalog(ids).await?;
            }
            "resume" => handle.on_resume().await?,
            "connect" => handle.connect().await?,
            "disconnect" => {
                if !provider.disconnect().await {
                    println!("no live connection");
                }
            }
            "status" => print_status(&handle).await?,
            "quit" | "exit" => break,
            "help" => println!("{HELP}"),
            other => println!("unknown command `{other}`; {HELP}"),
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Print the premium banner now and on every entitlement change.
fn spawn_banner(handle: &ReconcilerHandle) {
    let mut signal = handle.subscribe();
    tokio::spawn(async move {
        println!("{}", banner(signal.is_entitled()));
        while let Ok(entitled) = signal.changed().await {
            println!("{}", banner(entitled));
        }
    });
}

fn banner(entitled: bool) -> &'static str {
    if entitled { "PREMIUM" } else { "NOT PREMIUM" }
}

async fn print_status(handle: &ReconcilerHandle) -> anyhow::Result<()> {
    let snapshot = handle.snapshot().await?;
    println!("connection: {}", snapshot.connection);
    println!("entitled:   {}", snapshot.entitlements.is_entitled());
    for product in &snapshot.catalog {
        println!("product     {} ({})", product.id, product.price_info);
    }
    for purchase in &snapshot.purchases {
        println!(
            "purchase    {} {} {:?} acknowledged={}",
            purchase.token, purchase.product_id, purchase.state, purchase.acknowledged
        );
    }
    Ok(())
}
