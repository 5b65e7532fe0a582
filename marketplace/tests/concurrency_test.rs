//! Races on the same ticket, wallet and listing.
//!
//! Each test runs on a multi-threaded runtime so the competing operations
//! really interleave; the store's locks must still let exactly one win.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use futures::future::join_all;
use marketplace::types::{LedgerReference, Money, PaymentMethod, TicketStatus, TransactionStatus};
use marketplace::MarketplaceError;
use proptest::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_ticket_sells_once() {
    let h = Harness::new();
    let (event, tickets) = h.event_with_tickets(None, 50, 1).await;
    let ticket = tickets[0].id();

    let mut buyers = Vec::new();
    let mut pending = Vec::new();
    for n in 0..8 {
        let buyer = h.funded_user(&format!("buyer{n}"), 100).await;
        let intent = h
            .market
            .transactions
            .initiate_primary_purchase(ticket, buyer.id, PaymentMethod::Balance)
            .await
            .unwrap();
        pending.push((intent.transaction.id(), buyer.id));
        buyers.push(buyer);
    }

    let handles = pending.into_iter().map(|(txn, buyer)| {
        let transactions = h.market.transactions.clone();
        tokio::spawn(async move { transactions.confirm_with_balance(txn, buyer).await })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(error) = result {
            assert!(matches!(error, MarketplaceError::InvalidState(_)), "unexpected {error:?}");
        }
    }
    let winner = winners[0].buyer_id();

    let sold = h.market.inventory.ticket(ticket).await.unwrap();
    assert_eq!(sold.status(), TicketStatus::Purchased);
    assert_eq!(sold.owner_id(), Some(winner));
    let event = h.market.inventory.event(event.id()).await.unwrap();
    assert_eq!(event.available_tickets(), 0);

    for buyer in &buyers {
        let expected = if buyer.id == winner { 50 } else { 100 };
        assert_eq!(h.balance(buyer).await, Money::from_dollars(expected));
        let txns = h.market.transactions.transactions_by_buyer(buyer.id).await.unwrap();
        let status = if buyer.id == winner {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };
        assert_eq!(txns[0].status(), status);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let h = Harness::new();
    let user = h.funded_user("u1", 100).await;

    let handles = (0..10).map(|_| {
        let wallets = h.market.wallets.clone();
        let user_id = user.id;
        tokio::spawn(async move {
            wallets
                .debit(user_id, Money::from_dollars(30), "Spend", LedgerReference::admin())
                .await
        })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 3);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, MarketplaceError::InsufficientBalance { .. })));

    assert_eq!(h.balance(&user).await, Money::from_dollars(10));
    let check = h.market.wallets.verify_ledger(user.id).await.unwrap();
    assert!(check.is_consistent());
    assert_eq!(h.market.wallets.history(user.id).await.unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_listing_of_one_ticket() {
    let h = Harness::new();
    let owner = h.user("u1").await;
    let (_, tickets) = h.event_with_tickets(None, 60, 1).await;
    h.market
        .inventory
        .complete_primary_purchase(tickets[0].id(), owner.id)
        .await
        .unwrap();

    let handles = [Money::from_dollars(50), Money::from_dollars(55)].map(|price| {
        let listings = h.market.listings.clone();
        let ticket = tickets[0].id();
        let seller = owner.id;
        tokio::spawn(async move { listings.create_listing(ticket, seller, price, None).await })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(MarketplaceError::DuplicateListing { .. }))));
    assert_eq!(h.market.listings.listings_by_seller(owner.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resale_purchases() {
    let h = Harness::new();
    let seller = h.user("seller").await;
    let (_, tickets) = h.event_with_tickets(None, 80, 1).await;
    h.market
        .inventory
        .complete_primary_purchase(tickets[0].id(), seller.id)
        .await
        .unwrap();
    let listing = h
        .market
        .listings
        .create_listing(tickets[0].id(), seller.id, Money::from_dollars(40), None)
        .await
        .unwrap();

    let mut buyers = Vec::new();
    for n in 0..5 {
        buyers.push(h.funded_user(&format!("buyer{n}"), 40).await);
    }
    let handles = buyers.iter().map(|buyer| {
        let transactions = h.market.transactions.clone();
        let buyer_id = buyer.id;
        let listing_id = listing.id();
        tokio::spawn(async move { transactions.purchase_listing_with_balance(listing_id, buyer_id).await })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.balance(&seller).await, Money::from_dollars(40));

    let mut spent = Money::ZERO;
    for buyer in &buyers {
        spent = spent.checked_add(Money::from_dollars(40).checked_sub(h.balance(buyer).await).unwrap()).unwrap();
    }
    assert_eq!(spent, Money::from_dollars(40));
}

#[derive(Debug, Clone)]
enum WalletOp {
    Credit(i64),
    Debit(i64),
    Withdraw(i64),
}

fn wallet_op() -> impl Strategy<Value = WalletOp> {
    prop_oneof![
        (-500i64..20_000).prop_map(WalletOp::Credit),
        (-500i64..20_000).prop_map(WalletOp::Debit),
        (-500i64..20_000).prop_map(WalletOp::Withdraw),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_balance_matches_ledger(ops in prop::collection::vec(wallet_op(), 1..40)) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let user = h.user("prop").await;
            let wallets = &h.market.wallets;
            let mut expected: i64 = 0;

            for op in ops {
                let (delta, should_apply, outcome) = match op {
                    WalletOp::Credit(cents) => (
                        cents,
                        cents > 0,
                        wallets.credit(user.id, Money::from_cents(cents), "in", LedgerReference::admin()).await,
                    ),
                    WalletOp::Debit(cents) => (
                        -cents,
                        cents > 0 && cents <= expected,
                        wallets.debit(user.id, Money::from_cents(cents), "out", LedgerReference::admin()).await,
                    ),
                    WalletOp::Withdraw(cents) => (
                        -cents,
                        cents > 0 && cents <= expected,
                        wallets.withdraw(user.id, Money::from_cents(cents), "out").await,
                    ),
                };
                assert_eq!(outcome.is_ok(), should_apply);
                if let Ok(balance) = outcome {
                    expected += delta;
                    assert_eq!(balance.balance(), Money::from_cents(expected));
                }
                assert!(expected >= 0);
            }

            let check = wallets.verify_ledger(user.id).await.unwrap();
            assert!(check.is_consistent());
            assert_eq!(h.balance(&user).await, Money::from_cents(expected));
        });
    }
}
