//! End-to-end reconciliation scenarios against the simulated provider.

use std::sync::Arc;
use std::sync::mpsc::TryRecvError;
use std::time::Duration;

use entitle_billing::{
    BillingConfig, BillingError, BillingEvent, BillingEventKind, BillingProvider, BillingResult,
    ConnectionState, EntitlementReconciler, Product, ProductId, ProviderCall, ProviderError,
    Purchase, PurchaseState, PurchaseToken, QueryKind, ReconcilerHandle, ReconnectPolicy,
    ResponseCode, SimulatedProvider,
};
use entitle_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};

const TIMEOUT: Duration = Duration::from_secs(2);

fn premium() -> ProductId {
    ProductId::from_static("premium_upgrade")
}

fn catalog() -> Vec<Product> {
    vec![Product::new(premium(), "$4.99")]
}

fn owned(token: &'static str, acknowledged: bool) -> Purchase {
    let purchase = Purchase::new(PurchaseToken::from_static(token), premium(), PurchaseState::Purchased);
    if acknowledged { purchase.acknowledged() } else { purchase }
}

/// Collects published events and waits for specific ones.
struct EventLog {
    subscription: Subscription<EventEnvelope<BillingEvent>>,
    seen: Vec<BillingEventKind>,
}

impl EventLog {
    async fn wait_for(&mut self, predicate: impl Fn(&BillingEventKind) -> bool) -> BillingEventKind {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            self.seen.extend(
                self.subscription
                    .drain()
                    .into_iter()
                    .map(|env| env.into_payload().kind),
            );
            if let Some(index) = self.seen.iter().position(|k| predicate(k)) {
                // Later waits only see events published after this one.
                return self.seen.drain(..=index).last().unwrap();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected event not published; saw {:?}",
                self.seen
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct Harness {
    provider: Arc<SimulatedProvider>,
    handle: ReconcilerHandle,
    events: EventLog,
}

fn start(provider: SimulatedProvider) -> Harness {
    start_with(provider, BillingConfig::for_product(premium()))
}

fn start_with(provider: SimulatedProvider, config: BillingConfig) -> Harness {
    let provider = Arc::new(provider);
    let bus = Arc::new(InMemoryEventBus::<EventEnvelope<BillingEvent>>::new());
    let events = EventLog {
        subscription: bus.subscribe(),
        seen: Vec::new(),
    };
    let handle = EntitlementReconciler::spawn(
        Arc::clone(&provider) as Arc<dyn BillingProvider>,
        bus,
        config,
    );
    Harness {
        provider,
        handle,
        events,
    }
}

impl Harness {
    /// Connect and wait for the initial catalog and purchase queries to land.
    async fn connect_and_settle(&mut self) {
        self.handle.connect().await.unwrap();
        self.events
            .wait_for(|k| matches!(k, BillingEventKind::CatalogRefreshed { .. }))
            .await;
        self.events
            .wait_for(|k| matches!(k, BillingEventKind::PurchasesRefreshed { .. }))
            .await;
    }

    async fn wait_entitled(&self) {
        let mut signal = self.handle.subscribe();
        tokio::time::timeout(TIMEOUT, signal.wait_for(|e| e.is_entitled()))
            .await
            .expect("entitlement not granted in time")
            .unwrap();
    }
}

#[tokio::test]
async fn purchase_flow_grants_entitlement_after_acknowledgment() {
    let mut h = start(SimulatedProvider::new(catalog()).completing_purchases());
    assert!(!h.handle.is_entitled());

    h.connect_and_settle().await;
    h.handle.buy().await.unwrap();

    let acked = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::AcknowledgeSucceeded { .. }))
        .await;
    h.wait_entitled().await;

    let BillingEventKind::AcknowledgeSucceeded { token } = acked else {
        unreachable!()
    };
    assert_eq!(h.provider.acknowledge_count(&token), 1);
    assert!(h.provider.owned().iter().all(|p| p.acknowledged));
    assert!(h.handle.subscribe().is_entitled_to(&premium()));
}

#[tokio::test]
async fn restored_acknowledged_purchase_entitles_without_acknowledging() {
    let mut h = start(SimulatedProvider::new(catalog()).with_owned(owned("T1", true)));

    h.connect_and_settle().await;
    h.wait_entitled().await;

    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::Acknowledge(_))),
        0
    );
}

#[tokio::test]
async fn failed_acknowledgment_is_retried_after_reconnect() {
    let provider = SimulatedProvider::new(catalog()).with_owned(owned("T1", false));
    provider.fail_next_acknowledge(ProviderError::new(ResponseCode::ServiceUnavailable, "try later"));
    let mut h = start(provider);

    h.handle.connect().await.unwrap();
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::OperationFailed {
                    error: BillingError::Acknowledgment { .. }
                }
            )
        })
        .await;
    assert!(!h.handle.is_entitled());

    assert!(h.provider.disconnect().await);
    h.wait_entitled().await;

    let token = PurchaseToken::from_static("T1");
    assert_eq!(h.provider.acknowledge_count(&token), 2);
}

#[tokio::test]
async fn unexpected_disconnect_reconnects_without_caller() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;
    assert_eq!(h.handle.connection_state(), ConnectionState::Connected);

    assert!(h.provider.disconnect().await);

    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::ConnectionStateChanged {
                    to: ConnectionState::Disconnected,
                    ..
                }
            )
        })
        .await;
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::ConnectionStateChanged {
                    to: ConnectionState::Connecting,
                    ..
                }
            )
        })
        .await;
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::ConnectionStateChanged {
                    to: ConnectionState::Connected,
                    ..
                }
            )
        })
        .await;

    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::StartConnection)),
        2
    );
}

#[tokio::test]
async fn failed_setup_is_not_retried_automatically() {
    let provider = SimulatedProvider::new(catalog());
    provider.fail_next_connect(ProviderError::new(ResponseCode::BillingUnavailable, "no store"));
    let mut h = start(provider);

    h.handle.connect().await.unwrap();
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::OperationFailed {
                    error: BillingError::Connection(_)
                }
            )
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.handle.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::StartConnection)),
        1
    );

    // The caller decides to try again.
    h.connect_and_settle().await;
    assert_eq!(h.handle.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unknown_product_is_rejected_without_launching() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;

    h.handle
        .initiate_purchase(ProductId::from_static("gold_tier"))
        .await
        .unwrap();

    let rejected = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::PurchaseRejected { .. }))
        .await;
    assert!(matches!(
        rejected,
        BillingEventKind::PurchaseRejected {
            reason: BillingError::UnknownProduct(_),
            ..
        }
    ));
    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::LaunchPurchaseFlow(_))),
        0
    );
}

#[tokio::test]
async fn ambiguous_catalog_is_rejected_without_launching() {
    let duplicated = vec![Product::new(premium(), "$4.99"), Product::new(premium(), "$3.99")];
    let mut h = start(SimulatedProvider::new(duplicated));
    h.connect_and_settle().await;

    h.handle.buy().await.unwrap();

    let rejected = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::PurchaseRejected { .. }))
        .await;
    assert!(matches!(
        rejected,
        BillingEventKind::PurchaseRejected {
            reason: BillingError::AmbiguousProduct { matches: 2, .. },
            ..
        }
    ));
    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::LaunchPurchaseFlow(_))),
        0
    );
}

#[tokio::test]
async fn repeated_acknowledge_is_a_no_op() {
    let mut h = start(SimulatedProvider::new(catalog()).with_owned(owned("T1", false)));
    h.connect_and_settle().await;
    h.wait_entitled().await;

    let token = PurchaseToken::from_static("T1");
    h.handle.acknowledge(token.clone()).await.unwrap();
    h.handle.acknowledge(token.clone()).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();

    assert_eq!(h.provider.acknowledge_count(&token), 1);
    assert!(snapshot.entitlements.is_entitled());
    assert!(snapshot.purchases.iter().all(|p| p.acknowledged));
}

#[tokio::test]
async fn already_owned_rederives_purchases() {
    let mut h = start(SimulatedProvider::new(catalog()).with_owned(owned("T1", true)));
    h.connect_and_settle().await;
    h.wait_entitled().await;

    h.handle.buy().await.unwrap();
    h.events
        .wait_for(|k| matches!(k, BillingEventKind::PurchasesRefreshed { .. }))
        .await;

    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::QueryPurchases)),
        2
    );
    assert!(h.handle.is_entitled());
}

#[tokio::test]
async fn canceled_purchase_changes_nothing() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;

    assert!(
        h.provider
            .notify(
                BillingResult::new(ResponseCode::UserCanceled, "user backed out"),
                Vec::new()
            )
            .await
    );
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::OperationFailed {
                    error: BillingError::PurchaseUpdate(_)
                }
            )
        })
        .await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert!(snapshot.purchases.is_empty());
    assert!(!snapshot.entitlements.is_entitled());
}

#[tokio::test]
async fn failed_purchase_query_keeps_cache_and_resume_retries() {
    let provider = SimulatedProvider::new(catalog()).with_owned(owned("T1", true));
    provider.fail_next_purchase_query(ProviderError::new(ResponseCode::ServiceTimeout, "slow"));
    let mut h = start(provider);

    h.handle.connect().await.unwrap();
    h.events
        .wait_for(|k| {
            matches!(
                k,
                BillingEventKind::OperationFailed {
                    error: BillingError::Query {
                        kind: QueryKind::Purchases,
                        ..
                    }
                }
            )
        })
        .await;
    assert!(!h.handle.is_entitled());

    h.handle.on_resume().await.unwrap();
    h.wait_entitled().await;
}

#[tokio::test]
async fn shutdown_closes_the_handle() {
    let h = start(SimulatedProvider::new(catalog()));
    h.handle.shutdown().await;

    assert_eq!(h.handle.connect().await, Err(BillingError::ReconcilerClosed));
    assert_eq!(h.handle.snapshot().await.err(), Some(BillingError::ReconcilerClosed));
}

#[tokio::test]
async fn connect_queries_catalog_and_purchases() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;

    let calls = h.provider.calls();
    assert_eq!(calls.first(), Some(&ProviderCall::StartConnection));
    assert!(calls.contains(&ProviderCall::QueryProducts(vec![premium()])));
    assert!(calls.contains(&ProviderCall::QueryPurchases));

    // A second connect while connected starts nothing new.
    h.handle.connect().await.unwrap();
    h.handle.snapshot().await.unwrap();
    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::StartConnection)),
        1
    );
}

#[tokio::test]
async fn launch_failure_is_reported_and_not_entitled() {
    let provider = SimulatedProvider::new(catalog());
    provider.fail_next_launch(ProviderError::new(ResponseCode::DeveloperError, "bad sku"));
    let mut h = start(provider);
    h.connect_and_settle().await;

    h.handle.buy().await.unwrap();
    let failed = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::OperationFailed { .. }))
        .await;

    assert!(matches!(
        failed,
        BillingEventKind::OperationFailed {
            error: BillingError::PurchaseFlow { .. }
        }
    ));
    assert!(!h.handle.is_entitled());
}

#[tokio::test]
async fn out_of_band_purchase_update_is_acknowledged() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;

    // A purchase completed elsewhere, reported straight through the listener.
    let purchase = h.provider.record_purchase(premium());
    h.handle
        .listener()
        .purchases_updated(BillingResult::ok(), vec![purchase.clone()])
        .await
        .unwrap();

    h.wait_entitled().await;
    assert_eq!(h.provider.acknowledge_count(&purchase.token), 1);
}

#[tokio::test]
async fn entitlement_is_tracked_per_product() {
    let gold = ProductId::from_static("gold_tier");
    let provider = SimulatedProvider::new(vec![
        Product::new(premium(), "$4.99"),
        Product::new(gold.clone(), "$9.99"),
    ])
    .with_owned(Purchase::new(PurchaseToken::from_static("G1"), gold.clone(), PurchaseState::Purchased).acknowledged());
    let config = BillingConfig::for_product(premium())
        .with_catalog(vec![premium(), gold.clone()])
        .with_channel_capacity(4);
    let mut h = start_with(provider, config);

    h.connect_and_settle().await;
    h.wait_entitled().await;

    let signal = h.handle.subscribe();
    assert!(signal.is_entitled_to(&gold));
    assert!(!signal.is_entitled_to(&premium()));
    assert_eq!(h.handle.snapshot().await.unwrap().catalog.len(), 2);
}

#[tokio::test]
async fn repeated_disconnects_back_off() {
    let config = BillingConfig::for_product(premium()).with_reconnect(ReconnectPolicy::new(
        Duration::from_millis(20),
        Duration::from_millis(100),
    ));
    let mut h = start_with(SimulatedProvider::new(catalog()), config);
    h.connect_and_settle().await;

    // The first reconnect is immediate, but its queries fail, so the
    // connection never proves healthy before it drops again.
    h.provider
        .fail_next_catalog_query(ProviderError::new(ResponseCode::ServiceUnavailable, "down"));
    h.provider
        .fail_next_purchase_query(ProviderError::new(ResponseCode::ServiceUnavailable, "down"));
    assert!(h.provider.disconnect().await);
    let first = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::ReconnectScheduled { .. }))
        .await;
    assert_eq!(
        first,
        BillingEventKind::ReconnectScheduled {
            attempt: 1,
            delay: Duration::ZERO
        }
    );
    // Catalog and purchase failures may land in either order.
    for _ in 0..2 {
        h.events
            .wait_for(|k| {
                matches!(
                    k,
                    BillingEventKind::OperationFailed {
                        error: BillingError::Query { .. }
                    }
                )
            })
            .await;
    }

    assert!(h.provider.disconnect().await);
    let second = h
        .events
        .wait_for(|k| matches!(k, BillingEventKind::ReconnectScheduled { .. }))
        .await;
    assert_eq!(
        second,
        BillingEventKind::ReconnectScheduled {
            attempt: 2,
            delay: Duration::from_millis(20)
        }
    );

    let mut connection = h.handle.watch_connection();
    tokio::time::timeout(TIMEOUT, connection.wait_for(|state| state.is_connected()))
        .await
        .expect("reconnect did not complete in time")
        .unwrap();
    assert_eq!(
        h.provider
            .count_calls(|c| matches!(c, ProviderCall::StartConnection)),
        3
    );
}

#[tokio::test]
async fn dropping_every_handle_stops_the_reconciler() {
    let mut h = start(SimulatedProvider::new(catalog()));
    h.connect_and_settle().await;

    let Harness {
        provider,
        handle,
        events,
    } = h;
    drop(handle);

    // The bus goes away with the actor, which disconnects the subscription.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match events.subscription.try_recv() {
            Err(TryRecvError::Disconnected) => break,
            Ok(_) => continue,
            Err(TryRecvError::Empty) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "reconciler kept running after its last handle was dropped"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    // The provider still holds the listener from its connection.
    assert!(!provider.disconnect().await);
}
