mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use tokio_test::assert_ok;

use bastion::domain::{OrderStyle, PositionIntent, Side, Signal, VenueId};
use bastion::engine::SubmitOutcome;
use bastion::error::{ExchangeError, ExecutionError};
use bastion::exchange::{LimitFillMode, RecentFill};
use bastion::execution::ExecutionOutcome;
use bastion::ledger::{ExitReason, TradeStatus};
use bastion::risk::DenyReason;

use common::{fast_config, long, spot_buy, Harness};

#[tokio::test]
async fn test_spot_round_trip_sells_fee_reduced_balance() {
    let h = Harness::new().await;

    let entry = h.open(&spot_buy("BTC/USDT", dec!(50000), dec!(0.01))).await;
    assert_eq!(entry.quantity, dec!(0.01));
    assert!(!entry.maker);
    // 0.1% taker fee is paid in BTC
    assert_eq!(h.binance.balance("BTC").await, dec!(0.00999));

    let position = h.tracked("BTC/USDT").await.expect("tracked after fill");
    h.binance.set_ticker("BTC/USDT", dec!(51000)).await;

    let outcome = h.submit(&Signal::exit(&position, dec!(51000))).await;
    let SubmitOutcome::Executed(ExecutionOutcome::Filled(exit)) = outcome else {
        panic!("exit did not fill: {:?}", outcome);
    };
    assert_eq!(exit.quantity, dec!(0.00999));
    assert_eq!(exit.price, dec!(51000));

    let pnl = exit.pnl.expect("exit carries pnl");
    assert_eq!(pnl.gross_pnl, dec!(9.99));
    assert!(pnl.net_pnl > dec!(0) && pnl.net_pnl < pnl.gross_pnl);

    let sells: Vec<_> = h
        .binance
        .placed_orders()
        .await
        .into_iter()
        .filter(|o| o.side == Side::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert!(!sells[0].reduce_only);

    let rows = h.ledger.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TradeStatus::Closed);
    assert_eq!(rows[0].exit_reason, Some(ExitReason::Signal));
    assert_eq!(rows[0].pnl, Some(pnl.net_pnl));
    assert!(h.tracked("BTC/USDT").await.is_none());
}

#[tokio::test]
async fn test_spot_entry_bumped_to_min_notional() {
    let h = Harness::new().await;

    // $3 order on a $5 minimum
    let fill = h.open(&spot_buy("BTC/USDT", dec!(50000), dec!(0.00006))).await;
    assert_eq!(fill.quantity, dec!(0.00011));

    let placed = h.binance.placed_orders().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].quantity, dec!(0.00011));
}

#[tokio::test]
async fn test_delta_entry_in_contracts_with_leverage() {
    let h = Harness::new().await;

    let fill = h
        .open(&long(VenueId::Delta, "BTCUSD", dec!(60000), dec!(0.0234), 10))
        .await;
    assert_eq!(fill.quantity, dec!(23));
    assert_eq!(h.delta.leverage_for("BTCUSD").await, Some(10));
    assert_eq!(h.delta.position("BTCUSD").await.map(|p| p.quantity), Some(dec!(23)));

    let position = h.tracked("BTCUSD").await.expect("tracked");
    assert_eq!(position.quantity, dec!(23));
    // 0.023 BTC * 60000 / 10
    assert_eq!(position.collateral, dec!(138));
}

#[tokio::test]
async fn test_delta_exit_pnl_in_underlying_units() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Delta, "BTCUSD", dec!(60000), dec!(0.0234), 10))
        .await;
    let position = h.tracked("BTCUSD").await.expect("tracked");

    h.delta.set_ticker("BTCUSD", dec!(61000)).await;
    let outcome = h.submit(&Signal::exit(&position, dec!(61000))).await;
    let SubmitOutcome::Executed(ExecutionOutcome::Filled(exit)) = outcome else {
        panic!("exit did not fill: {:?}", outcome);
    };

    let pnl = exit.pnl.expect("pnl");
    // 23 contracts = 0.023 BTC
    assert_eq!(pnl.gross_pnl, dec!(23));
    assert_eq!(pnl.collateral, dec!(138));
    assert!(h.delta.position("BTCUSD").await.is_none());
}

#[tokio::test]
async fn test_leverage_failure_does_not_block_entry() {
    let h = Harness::new().await;
    h.bybit
        .fail_leverage(Some(ExchangeError::Other("leverage not modified".into())))
        .await;

    let fill = h
        .open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    assert_eq!(fill.quantity, dec!(0.5));
}

#[tokio::test]
async fn test_entry_rejection_fails_fast_and_notifies_once() {
    let h = Harness::new().await;
    h.bybit
        .push_order_failure(ExchangeError::InsufficientFunds("margin".into()))
        .await;

    let outcome = h
        .submit(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Executed(ExecutionOutcome::NoFill(ExecutionError::VenueRejected(
            ExchangeError::InsufficientFunds(_)
        )))
    ));

    assert_eq!(h.bybit.placed_orders().await.len(), 1);
    assert_eq!(h.notifier.messages().len(), 1);
    assert!(h.tracked("ETHUSDT").await.is_none());
    assert!(h.ledger.rows().await.is_empty());
}

#[tokio::test]
async fn test_entry_retries_transient_errors() {
    let h = Harness::new().await;
    h.bybit
        .push_order_failure(ExchangeError::Network("reset".into()))
        .await;
    h.bybit
        .push_order_failure(ExchangeError::RateLimited("429".into()))
        .await;

    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    assert_eq!(h.bybit.placed_orders().await.len(), 3);
    assert!(h.notifier.messages().is_empty());
}

#[tokio::test]
async fn test_exit_retries_every_class_and_escalates_once() {
    let mut config = fast_config();
    config.execution.maker_exit_enabled = false;
    let h = Harness::with_config(config).await;

    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");
    let exit = Signal::exit(&position, dec!(2000));

    for err in [
        ExchangeError::InvalidOrder("lot".into()),
        ExchangeError::InsufficientFunds("margin".into()),
        ExchangeError::Network("reset".into()),
    ] {
        h.bybit.push_order_failure(err).await;
    }
    let outcome = h.core.executor().execute(&exit).await.unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::NoFill(ExecutionError::ExitExhausted { attempts: 3, .. })
    ));
    assert!(h.core.executor().is_alerted(VenueId::Bybit, "ETHUSDT"));
    assert!(h.tracked("ETHUSDT").await.is_some());

    for _ in 0..3 {
        h.bybit
            .push_order_failure(ExchangeError::Unavailable("maintenance".into()))
            .await;
    }
    let outcome = h.core.executor().execute(&exit).await.unwrap();
    assert!(!outcome.is_filled());
    assert_eq!(h.notifier.messages().len(), 1);

    let outcome = h.core.executor().execute(&exit).await.unwrap();
    assert!(outcome.is_filled());
    assert!(!h.core.executor().is_alerted(VenueId::Bybit, "ETHUSDT"));
    assert!(h.tracked("ETHUSDT").await.is_none());
}

#[tokio::test]
async fn test_maker_exit_fill_books_maker_fee() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    let fill = outcome.fill().expect("filled");
    assert!(fill.maker);
    assert_eq!(fill.fee_rate, dec!(0.0002));

    let orders = h.bybit.placed_orders().await;
    assert_eq!(orders.len(), 2);
    assert!(orders[1].reduce_only);
    assert_eq!(orders[1].price, Some(dec!(2000)));
}

#[tokio::test]
async fn test_unfilled_maker_exit_falls_back_to_market() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");
    h.bybit.set_limit_fill_mode(LimitFillMode::Resting).await;

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    let fill = outcome.fill().expect("filled");
    assert!(!fill.maker);
    assert_eq!(fill.fee_rate, dec!(0.00055));
    assert_eq!(fill.quantity, dec!(0.5));

    // entry, resting limit, market fallback
    assert_eq!(h.bybit.placed_orders().await.len(), 3);
    assert!(h.bybit.position("ETHUSDT").await.is_none());
}

#[tokio::test]
async fn test_maker_fill_after_status_check_is_not_closed_twice() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");
    h.bybit.set_limit_fill_mode(LimitFillMode::FillAfterCheck).await;

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    assert!(outcome.fill().expect("filled").maker);
    // no market order followed the limit
    assert_eq!(h.bybit.placed_orders().await.len(), 2);
    assert!(h.bybit.position("ETHUSDT").await.is_none());
    assert!(h.tracked("ETHUSDT").await.is_none());
}

#[tokio::test]
async fn test_exit_on_flat_venue_settles_external_close() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");

    // stop hit on the venue side
    h.bybit.remove_position("ETHUSDT").await;
    h.bybit
        .add_fill(
            "ETHUSDT",
            RecentFill {
                side: Side::Sell,
                price: dec!(1950),
                amount: dec!(0.5),
                time: Utc::now(),
            },
        )
        .await;

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    let ExecutionOutcome::AlreadyClosed(Some(pnl)) = outcome else {
        panic!("expected settled external close, got {:?}", outcome);
    };
    assert_eq!(pnl.gross_pnl, dec!(-25));

    // no exit order was sent
    assert_eq!(h.bybit.placed_orders().await.len(), 1);
    let rows = h.ledger.rows().await;
    assert_eq!(rows[0].exit_reason, Some(ExitReason::ExternalClose));
    assert_eq!(rows[0].exit_price, Some(dec!(1950)));
    assert!(h.tracked("ETHUSDT").await.is_none());
}

#[tokio::test]
async fn test_exit_approved_while_paused() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "SOLUSDT", dec!(150), dec!(2), 3))
        .await;
    let position = h.tracked("SOLUSDT").await.expect("tracked");

    h.core.risk().pause("operator halt").await.unwrap();
    let denied = h
        .submit(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    assert!(matches!(denied, SubmitOutcome::Denied(DenyReason::Paused(_))));

    let exit = h.submit(&Signal::exit(&position, dec!(150))).await;
    assert!(exit.is_filled());
}

#[tokio::test]
async fn test_spot_intent_on_derivatives_venue_refused() {
    let h = Harness::new().await;
    let signal = Signal::entry(
        "grid",
        VenueId::Bybit,
        "BTCUSDT",
        PositionIntent::Spot,
        dec!(50000),
        dec!(0.01),
        1,
    );

    let outcome = assert_ok!(h.core.executor().execute(&signal).await);
    assert!(matches!(outcome, ExecutionOutcome::NoFill(ExecutionError::Invalid(_))));
    assert!(h.bybit.placed_orders().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_symbol_denied_after_fill() {
    let h = Harness::new().await;
    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;

    let again = h
        .submit(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    assert!(matches!(
        again,
        SubmitOutcome::Denied(DenyReason::SymbolAlreadyOpen(_))
    ));
}

#[tokio::test]
async fn test_limit_entry_fee_carried_into_every_close() {
    let mut config = fast_config();
    config.risk.entry_cooldown_secs = 0;
    let h = Harness::with_config(config).await;
    let entry = long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5).with_style(OrderStyle::Limit);
    let fill = h.open(&entry).await;
    assert!(fill.maker);
    assert_eq!(fill.fee_rate, dec!(0.0002));
    assert_eq!(h.ledger.rows().await[0].entry_fee_rate, dec!(0.0002));
    let position = h.tracked("ETHUSDT").await.expect("tracked");

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    let pnl = outcome.fill().and_then(|f| f.pnl).expect("exit pnl");
    // 1000 notional each way at the maker rate
    assert_eq!(pnl.fees, dec!(0.4));
    assert_eq!(pnl.net_pnl, dec!(-0.4));

    h.open(&entry).await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");
    h.bybit.remove_position("ETHUSDT").await;

    let outcome = h.core.executor().execute(&Signal::exit(&position, dec!(2000))).await.unwrap();
    let ExecutionOutcome::AlreadyClosed(Some(pnl)) = outcome else {
        panic!("expected an external close, got {:?}", outcome);
    };
    // maker in, taker out
    assert_eq!(pnl.fees, dec!(0.75));
}

#[tokio::test]
async fn test_market_exit_acknowledged_without_fill_is_not_booked() {
    let mut config = fast_config();
    config.execution.maker_exit_enabled = false;
    let h = Harness::with_config(config).await;

    h.open(&long(VenueId::Bybit, "ETHUSDT", dec!(2000), dec!(0.5), 5))
        .await;
    let position = h.tracked("ETHUSDT").await.expect("tracked");
    let exit = Signal::exit(&position, dec!(2000));

    h.bybit.hold_market_orders(true).await;
    let outcome = h.core.executor().execute(&exit).await.unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::NoFill(ExecutionError::ExitExhausted { attempts: 1, .. })
    ));
    assert!(h.tracked("ETHUSDT").await.is_some());
    assert!(h.bybit.position("ETHUSDT").await.is_some());
    assert_eq!(h.ledger.rows().await[0].status, TradeStatus::Open);
    assert_eq!(h.core.snapshot().await.unwrap().results_recorded, 0);
    assert_eq!(h.notifier.messages().len(), 1);

    h.bybit.hold_market_orders(false).await;
    let outcome = h.core.executor().execute(&exit).await.unwrap();
    assert!(outcome.is_filled());
    assert!(h.tracked("ETHUSDT").await.is_none());
    assert_eq!(h.ledger.rows().await[0].status, TradeStatus::Closed);
}
