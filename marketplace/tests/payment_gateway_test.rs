//! Card payments, gateway callbacks and the pending-transaction sweep.
//!
//! Run with: `cargo test --test payment_gateway_test`

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::Harness;
use marketplace::config::{PaymentConfig, ReconciliationConfig};
use marketplace::payment_gateway::{IntentStatus, MockPaymentGateway, PaymentGatewayError};
use marketplace::types::{Money, PaymentMethod, Ticket, TicketStatus, TransactionStatus, User};
use marketplace::{GatewayEvent, GatewayOutcome, MarketplaceError, PurchaseIntent, Reconciler};

async fn card_purchase(h: &Harness, ticket: &Ticket, buyer: &User) -> PurchaseIntent {
    h.market
        .transactions
        .initiate_primary_purchase(ticket.id(), buyer.id, PaymentMethod::Card)
        .await
        .unwrap()
}

fn intent_ref(intent: &PurchaseIntent) -> String {
    intent.transaction.payment_intent_ref().unwrap().to_string()
}

#[tokio::test]
async fn test_card_intent_is_opened_for_the_ticket_price() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 75, 1).await;

    let intent = card_purchase(&h, &tickets[0], &buyer).await;

    assert!(intent.client_secret.is_some());
    let at_gateway = h.gateway.intent(&intent_ref(&intent)).unwrap();
    assert_eq!(at_gateway.amount, Money::from_dollars(75));
    assert_eq!(at_gateway.currency, "usd");
    assert_eq!(at_gateway.status, IntentStatus::Pending);
    assert_eq!(intent.transaction.status(), TransactionStatus::Pending);
}

#[tokio::test]
async fn test_intent_creation_failure_fails_the_transaction() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 75, 1).await;
    h.gateway.fail_next_create(PaymentGatewayError::CardDeclined {
        reason: "insufficient_funds".to_string(),
    });

    let err = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[0].id(), buyer.id, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarketplaceError::Gateway(PaymentGatewayError::CardDeclined { .. })
    ));

    let txns = h.market.transactions.transactions_by_buyer(buyer.id).await.unwrap();
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].status(), TransactionStatus::Failed);
    assert!(txns[0].failure_reason().unwrap().contains("insufficient_funds"));
    let ticket = h.market.inventory.ticket(tickets[0].id()).await.unwrap();
    assert_eq!(ticket.status(), TicketStatus::Available);
}

#[tokio::test]
async fn test_slow_gateway_times_out() {
    let gateway = MockPaymentGateway::new().with_latency(std::time::Duration::from_secs(5));
    let payments = PaymentConfig {
        gateway_timeout_ms: 50,
        ..PaymentConfig::default()
    };
    let h = Harness::with_gateway(gateway, payments);
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 75, 1).await;

    let err = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[0].id(), buyer.id, PaymentMethod::Card)
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::Gateway(PaymentGatewayError::Timeout)));
    assert!(err.is_retryable());
    let txns = h.market.transactions.transactions_by_buyer(buyer.id).await.unwrap();
    assert_eq!(txns[0].status(), TransactionStatus::Failed);
}

#[tokio::test]
async fn test_declined_payment_fails_on_confirmation() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (event, tickets) = h.event_with_tickets(None, 75, 1).await;
    let intent = card_purchase(&h, &tickets[0], &buyer).await;
    h.gateway.set_status(&intent_ref(&intent), IntentStatus::Failed);

    let err = h
        .market
        .transactions
        .confirm_with_gateway(intent.transaction.id())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarketplaceError::PaymentNotSucceeded {
            status: IntentStatus::Failed,
            ..
        }
    ));

    let txn = h.market.transactions.transaction(intent.transaction.id()).await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Failed);
    assert_eq!(
        h.market.inventory.event(event.id()).await.unwrap().available_tickets(),
        1
    );
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_unreachable_gateway_on_confirmation() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 75, 1).await;
    let intent = card_purchase(&h, &tickets[0], &buyer).await;
    h.gateway.fail_next_retrieve(PaymentGatewayError::Other {
        message: "connection reset".to_string(),
    });

    let err = h
        .market
        .transactions
        .confirm_with_gateway(intent.transaction.id())
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::Gateway(PaymentGatewayError::Other { .. })));
    let txn = h.market.transactions.transaction(intent.transaction.id()).await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Failed);
}

#[tokio::test]
async fn test_balance_purchase_cannot_be_confirmed_by_gateway() {
    let h = Harness::new();
    let buyer = h.funded_user("u1", 100).await;
    let (_, tickets) = h.event_with_tickets(None, 75, 1).await;
    let intent = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[0].id(), buyer.id, PaymentMethod::Balance)
        .await
        .unwrap();
    assert!(intent.transaction.payment_intent_ref().is_none());
    assert!(intent.client_secret.is_none());

    let err = h
        .market
        .transactions
        .confirm_with_gateway(intent.transaction.id())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::InvalidState(_)));
    let txn = h.market.transactions.transaction(intent.transaction.id()).await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Pending);
}

#[tokio::test]
async fn test_card_resale_credits_seller_only() {
    let h = Harness::new();
    let seller = h.user("seller").await;
    let buyer = h.user("buyer").await;
    let (_, tickets) = h.event_with_tickets(None, 100, 1).await;
    h.market
        .inventory
        .complete_primary_purchase(tickets[0].id(), seller.id)
        .await
        .unwrap();
    let listing = h
        .market
        .listings
        .create_listing(tickets[0].id(), seller.id, Money::from_dollars(90), None)
        .await
        .unwrap();

    let intent = h
        .market
        .transactions
        .initiate_secondary_purchase(listing.id(), buyer.id, PaymentMethod::Card)
        .await
        .unwrap();
    h.gateway.set_status(&intent_ref(&intent), IntentStatus::Succeeded);
    let txn = h
        .market
        .transactions
        .confirm_with_gateway(intent.transaction.id())
        .await
        .unwrap();

    assert_eq!(txn.status(), TransactionStatus::Completed);
    assert_eq!(h.balance(&seller).await, Money::from_dollars(90));
    assert_eq!(h.balance(&buyer).await, Money::ZERO);
    assert!(h.market.wallets.history(buyer.id).await.unwrap().is_empty());
    let ticket = h.market.inventory.ticket(tickets[0].id()).await.unwrap();
    assert_eq!(ticket.owner_id(), Some(buyer.id));
    assert_eq!(ticket.status(), TicketStatus::Resold);
}

#[tokio::test]
async fn test_card_refund_goes_to_gateway_and_wallet() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 40, 1).await;
    let intent = card_purchase(&h, &tickets[0], &buyer).await;
    let reference = intent_ref(&intent);
    h.gateway.set_status(&reference, IntentStatus::Succeeded);
    h.market
        .transactions
        .confirm_with_gateway(intent.transaction.id())
        .await
        .unwrap();

    h.market
        .transactions
        .refund(intent.transaction.id(), "duplicate order")
        .await
        .unwrap();

    assert_eq!(h.gateway.refunds(), vec![(reference, Money::from_dollars(40))]);
    assert_eq!(h.balance(&buyer).await, Money::from_dollars(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_card_refunds_refund_once() {
    let gateway = MockPaymentGateway::new().with_latency(std::time::Duration::from_millis(50));
    let h = Harness::with_gateway(gateway, PaymentConfig::default());
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 40, 1).await;
    let intent = card_purchase(&h, &tickets[0], &buyer).await;
    let reference = intent_ref(&intent);
    h.gateway.set_status(&reference, IntentStatus::Succeeded);
    let txn = intent.transaction.id();
    h.market.transactions.confirm_with_gateway(txn).await.unwrap();

    let (first, second) = tokio::join!(
        h.market.transactions.refund(txn, "customer request"),
        h.market.transactions.refund(txn, "customer request"),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, MarketplaceError::InvalidState(_))));
    assert_eq!(h.gateway.refunds(), vec![(reference, Money::from_dollars(40))]);
    assert_eq!(h.balance(&buyer).await, Money::from_dollars(40));
    assert_eq!(h.market.wallets.history(buyer.id).await.unwrap().len(), 1);
    let refunded = h.market.transactions.transaction(txn).await.unwrap();
    assert_eq!(refunded.status(), TransactionStatus::Refunded);
}

#[tokio::test]
async fn test_gateway_callbacks() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 30, 2).await;
    let reconciler = h.reconciler();

    let paid = card_purchase(&h, &tickets[0], &buyer).await;
    h.gateway.set_status(&intent_ref(&paid), IntentStatus::Succeeded);
    let succeeded = GatewayEvent {
        intent_ref: intent_ref(&paid),
        outcome: GatewayOutcome::Succeeded,
    };
    let settled = reconciler.handle_gateway_event(succeeded.clone()).await.unwrap();
    assert_eq!(settled.unwrap().status(), TransactionStatus::Completed);

    // Redelivery changes nothing
    assert!(reconciler.handle_gateway_event(succeeded).await.unwrap().is_none());
    assert_eq!(h.notifier.sent().len(), 1);

    let declined = card_purchase(&h, &tickets[1], &buyer).await;
    let failed = reconciler
        .handle_gateway_event(GatewayEvent {
            intent_ref: intent_ref(&declined),
            outcome: GatewayOutcome::Failed {
                reason: "card_declined".to_string(),
            },
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status(), TransactionStatus::Failed);
    assert_eq!(failed.failure_reason(), Some("card_declined"));

    let unknown = reconciler
        .handle_gateway_event(GatewayEvent {
            intent_ref: "pi_unknown".to_string(),
            outcome: GatewayOutcome::Succeeded,
        })
        .await
        .unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn test_success_callback_is_verified_with_gateway() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 30, 1).await;
    let intent = card_purchase(&h, &tickets[0], &buyer).await;

    // The gateway still reports the intent as pending
    let err = h
        .reconciler()
        .handle_gateway_event(GatewayEvent {
            intent_ref: intent_ref(&intent),
            outcome: GatewayOutcome::Succeeded,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::PaymentNotSucceeded { .. }));
    let txn = h.market.transactions.transaction(intent.transaction.id()).await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Pending);
    let ticket = h.market.inventory.ticket(tickets[0].id()).await.unwrap();
    assert_eq!(ticket.status(), TicketStatus::Available);
}

#[tokio::test]
async fn test_expiry_sweep() {
    let h = Harness::new();
    let buyer = h.funded_user("u1", 500).await;
    let (_, tickets) = h.event_with_tickets(None, 20, 4).await;

    let abandoned = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[0].id(), buyer.id, PaymentMethod::Balance)
        .await
        .unwrap();
    let waiting = card_purchase(&h, &tickets[1], &buyer).await;
    let captured = card_purchase(&h, &tickets[2], &buyer).await;
    h.gateway.set_status(&intent_ref(&captured), IntentStatus::Succeeded);

    h.clock.advance(Duration::minutes(20));
    let recent = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[3].id(), buyer.id, PaymentMethod::Balance)
        .await
        .unwrap();

    let sweep = h
        .reconciler()
        .expire_stale_pending(ReconciliationConfig::default().pending_ttl())
        .await
        .unwrap();
    assert_eq!(sweep.examined, 3);
    assert_eq!(sweep.completed, 1);
    assert_eq!(sweep.failed, 1);
    assert_eq!(sweep.still_pending, 1);

    let status = |intent: &PurchaseIntent| {
        let transactions = h.market.transactions.clone();
        let id = intent.transaction.id();
        async move { transactions.transaction(id).await.unwrap() }
    };
    let expired = status(&abandoned).await;
    assert_eq!(expired.status(), TransactionStatus::Failed);
    assert_eq!(expired.failure_reason(), Some("expired"));
    assert_eq!(status(&waiting).await.status(), TransactionStatus::Pending);
    assert_eq!(status(&captured).await.status(), TransactionStatus::Completed);
    assert_eq!(status(&recent).await.status(), TransactionStatus::Pending);

    // Expiry never debits and never touches inventory
    assert_eq!(h.balance(&buyer).await, Money::from_dollars(500));
    let ticket = h.market.inventory.ticket(tickets[0].id()).await.unwrap();
    assert_eq!(ticket.status(), TicketStatus::Available);
}

#[tokio::test]
async fn test_reconciler_runs_until_shutdown() {
    let h = Harness::new();
    let buyer = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 20, 1).await;
    let abandoned = h
        .market
        .transactions
        .initiate_primary_purchase(tickets[0].id(), buyer.id, PaymentMethod::Balance)
        .await
        .unwrap();
    h.clock.advance(Duration::hours(1));

    let config = ReconciliationConfig {
        pending_ttl_secs: 900,
        interval_secs: 3600,
    };
    let (handle, shutdown) = Reconciler::new(h.market.transactions.clone(), config).spawn();

    // The first tick fires immediately
    let mut status = TransactionStatus::Pending;
    for _ in 0..100 {
        status = h
            .market
            .transactions
            .transaction(abandoned.transaction.id())
            .await
            .unwrap()
            .status();
        if status != TransactionStatus::Pending {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(status, TransactionStatus::Failed);

    shutdown.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
