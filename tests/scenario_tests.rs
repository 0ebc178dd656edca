//! End-to-end scenarios through the full exchange: matching, margin,
//! fees, insurance, liquidation, and ADL, with exact micro-unit arithmetic.

use exchange_core::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

struct NullBroker;

impl HedgeBroker for NullBroker {
    fn submit_hedge(&self, instruction: &HedgeInstruction) -> Result<HedgeAck, BrokerError> {
        Ok(HedgeAck {
            filled_qty: instruction.qty,
            price: Price::new_unchecked(100 * MICRO_SCALE),
        })
    }
}

fn test_config(dir: &Path) -> ExchangeConfig {
    let mut config = ExchangeConfig::default();
    config.storage.ledger_dir = dir.join("ledger");
    config.storage.journal_dir = dir.join("journal");
    config.storage.db_path = dir.join("exchange.db");
    config.storage.ledger_fsync = false;
    config
}

fn perp_spec(taker_fee: f64) -> ProductSpec {
    ProductSpec {
        symbol: "XAU-MNT-PERP".to_string(),
        category: ProductCategory::Perpetual,
        quote_currency: "MNT".to_string(),
        external_symbol: Some("XAU/USD".to_string()),
        tick_size: 0.1,
        min_order_size: 0.01,
        max_order_size: 1000.0,
        margin_rate: 0.10,
        maker_fee: 0.0,
        taker_fee,
        initial_mark_price: 100.0,
    }
}

fn open_exchange(dir: &Path, taker_fee: f64) -> Exchange {
    Exchange::open(test_config(dir), &[perp_spec(taker_fee)], Arc::new(NullBroker)).unwrap()
}

fn limit(user: &str, side: Side, qty: f64, price: f64) -> OrderTicket {
    OrderTicket {
        symbol: "XAU-MNT-PERP".to_string(),
        user: user.to_string(),
        side,
        order_type: OrderType::Limit,
        price: Some(price),
        stop_price: None,
        quantity: qty,
        client_id: None,
        reduce_only: false,
    }
}

fn micro(units: f64) -> i64 {
    (units * MICRO_SCALE as f64).round() as i64
}

#[test]
fn cross_the_spread_fill() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("alice", 1_000.0).unwrap();
    exchange.deposit("bob", 1_000.0).unwrap();

    // resting ask: alice 1.0 @ 100
    let receipt = exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 100.0))
        .unwrap();
    assert_eq!(receipt.status, OrderStatus::Open);
    assert!(receipt.fills.is_empty());

    // bob lifts it with a buy limit at 101: executes at the maker's 100
    let receipt = exchange
        .submit_order(limit("bob", Side::Buy, 1.0, 101.0))
        .unwrap();
    assert_eq!(receipt.status, OrderStatus::Filled);
    assert_eq!(receipt.fills.len(), 1);
    assert_eq!(receipt.fills[0].price, 100.0);
    assert_eq!(receipt.fills[0].qty, 1.0);

    // positions: bob long 1 @ 100, alice short 1 @ 100
    let bob_pos = &exchange.positions("bob")[0];
    assert_eq!(bob_pos.size.micro(), micro(1.0));
    assert_eq!(bob_pos.entry_price.micro(), micro(100.0));
    let alice_pos = &exchange.positions("alice")[0];
    assert_eq!(alice_pos.size.micro(), -micro(1.0));

    // taker fee 100 * 1 * 0.0005 = 0.05; 20% to insurance, rest to revenue
    let bob = exchange.account("bob").unwrap();
    assert_eq!(micro(bob.balance), micro(1_000.0 - 0.05));
    assert_eq!(exchange.insurance_fund().micro(), micro(0.01));
    let income = exchange.ledger().income_statement("MNT");
    assert_eq!(income.revenue.micro(), micro(0.04));

    // book is empty afterwards
    let (bids, asks) = exchange.depth("XAU-MNT-PERP", 10).unwrap();
    assert!(bids.is_empty());
    assert!(asks.is_empty());
}

#[test]
fn weighted_average_entry() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("carol", 10_000.0).unwrap();
    exchange.deposit("dealer", 10_000.0).unwrap();

    exchange
        .submit_order(limit("dealer", Side::Sell, 1.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("carol", Side::Buy, 1.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("dealer", Side::Sell, 2.0, 110.0))
        .unwrap();
    exchange
        .submit_order(limit("carol", Side::Buy, 2.0, 110.0))
        .unwrap();

    let position = &exchange.positions("carol")[0];
    assert_eq!(position.size.micro(), micro(3.0));
    // (1*100 + 2*110) / 3 = 106.666667, rounded at the 6th decimal
    assert_eq!(position.entry_price.micro(), 106_666_667);
    // margin accrues per fill: 10 + 22 = 32 exactly
    assert_eq!(position.margin_used.micro(), micro(32.0));
}

#[test]
fn flip_through_zero() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("dave", 10_000.0).unwrap();
    exchange.deposit("dealer", 100_000.0).unwrap();

    // dave long 1.0 @ 100
    exchange
        .submit_order(limit("dealer", Side::Sell, 1.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("dave", Side::Buy, 1.0, 100.0))
        .unwrap();
    let balance_before = exchange.account("dave").unwrap().balance;

    // dave sells 3.0 @ 120 against a resting bid
    exchange
        .submit_order(limit("dealer", Side::Buy, 3.0, 120.0))
        .unwrap();
    exchange
        .submit_order(limit("dave", Side::Sell, 3.0, 120.0))
        .unwrap();

    // close 1.0 realizing +20, open short 2.0 @ 120 with fresh margin 24
    let position = &exchange.positions("dave")[0];
    assert_eq!(position.size.micro(), -micro(2.0));
    assert_eq!(position.entry_price.micro(), micro(120.0));
    assert_eq!(position.margin_used.micro(), micro(24.0));
    assert_eq!(position.realized_pnl.micro(), 0);

    let dave = exchange.account("dave").unwrap();
    let fee = 120.0 * 3.0 * 0.0005;
    assert_eq!(
        micro(dave.balance),
        micro(balance_before + 20.0 - fee)
    );
}

#[test]
fn post_only_rejection_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("alice", 1_000.0).unwrap();
    exchange.deposit("bob", 1_000.0).unwrap();

    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 100.0))
        .unwrap();
    let bob_before = exchange.account("bob").unwrap();

    let mut ticket = limit("bob", Side::Buy, 1.0, 100.0);
    ticket.order_type = OrderType::PostOnly;
    let err = exchange.submit_order(ticket).unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Match(MatchError::PostOnlyWouldCross)
    ));

    // nothing changed: no trades, no position, no balance movement
    assert!(exchange.positions("bob").is_empty());
    let bob_after = exchange.account("bob").unwrap();
    assert_eq!(bob_after.balance, bob_before.balance);
    let (_, asks) = exchange.depth("XAU-MNT-PERP", 10).unwrap();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].total_qty.micro(), micro(1.0));
}

#[test]
fn graduated_liquidation_with_insurance_absorption() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.contribute_insurance(30.0).unwrap();
    exchange.deposit("eve", 10.0).unwrap();
    exchange.deposit("frank", 10_000.0).unwrap();

    // eve is the maker so no fee disturbs the arithmetic: long 1.0 @ 100
    // with margin 10 against a balance of exactly 10
    exchange
        .submit_order(limit("eve", Side::Buy, 1.0, 100.0))
        .unwrap();
    let frank_fill = exchange
        .submit_order(limit("frank", Side::Sell, 1.0, 100.0))
        .unwrap();
    assert_eq!(frank_fill.fills.len(), 1);
    let fund_after_fees = exchange.insurance_fund();

    // mark drops to 85: unrealized -15, equity -5, margin ratio < 1
    exchange.set_mark_price("XAU-MNT-PERP", 85.0).unwrap();
    let eve = exchange.account("eve").unwrap();
    assert_eq!(micro(eve.unrealized_pnl), micro(-15.0));
    assert_eq!(micro(eve.equity), micro(-5.0));

    let cycles = exchange.run_liquidations().unwrap();
    assert_eq!(cycles, 1);

    // full wipe: 25% then 50% then the rest, all at mark, balance restored
    // to zero by a 5.0 insurance draw
    let eve = exchange.account("eve").unwrap();
    assert_eq!(eve.balance, 0.0);
    assert!(exchange.positions("eve").is_empty());
    assert_eq!(
        exchange.insurance_fund().micro(),
        fund_after_fees.micro() - micro(5.0)
    );

    let income = exchange.ledger().income_statement("MNT");
    // the drawn 5.0 shows as an insurance expense
    let draws = exchange
        .ledger()
        .register(accounts::EXPENSE_INSURANCE_LIQUIDATION);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].amount.micro(), micro(5.0));
    assert!(income.expenses.micro() >= micro(5.0));

    // every committed transaction still balances
    for (_, sum) in exchange.ledger().trial_balance() {
        assert!(sum.is_zero());
    }
}

#[test]
fn adl_after_fund_exhaustion() {
    let dir = tempdir().unwrap();
    // zero fees keep the arithmetic exact
    let exchange = open_exchange(dir.path(), 0.0);

    exchange.contribute_insurance(30.0).unwrap();
    exchange.deposit("gary", 100.0).unwrap();
    exchange.deposit("helen", 200.0).unwrap();
    exchange.deposit("warehouse", 1_000_000.0).unwrap();

    // gary long 10 @ 100
    exchange
        .submit_order(limit("warehouse", Side::Sell, 10.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("gary", Side::Buy, 10.0, 100.0))
        .unwrap();

    // helen short 10 @ 88; the warehouse flattens itself on the other side
    exchange
        .submit_order(limit("warehouse", Side::Buy, 10.0, 88.0))
        .unwrap();
    exchange
        .submit_order(limit("helen", Side::Sell, 10.0, 88.0))
        .unwrap();
    assert!(exchange.positions("warehouse").is_empty());

    // mark 80: gary -200 on margin 100, helen +80
    exchange.set_mark_price("XAU-MNT-PERP", 80.0).unwrap();
    assert_eq!(exchange.adl_rank("helen", "XAU-MNT-PERP").unwrap(), 5);

    let cycles = exchange.run_liquidations().unwrap();
    assert_eq!(cycles, 1);

    // gary: wiped to zero. residual loss 100 = 30 insurance + 70 ADL
    let gary = exchange.account("gary").unwrap();
    assert_eq!(gary.balance, 0.0);
    assert!(exchange.positions("gary").is_empty());
    assert_eq!(exchange.insurance_fund(), Quote::ZERO);

    // helen force-closed at mark: +80 profit, 70 diverted, 10 kept
    let helen = exchange.account("helen").unwrap();
    assert_eq!(micro(helen.balance), micro(210.0));
    assert!(exchange.positions("helen").is_empty());

    // the ADL account saw 70 in and 70 back out to the bankrupt side
    let adl_entries = exchange.ledger().register(accounts::REVENUE_ADL);
    assert_eq!(adl_entries.len(), 2);
    let net: Quote = adl_entries.iter().map(|e| e.amount).sum();
    assert!(net.is_zero());

    for (_, sum) in exchange.ledger().trial_balance() {
        assert!(sum.is_zero());
    }
}

#[test]
fn fok_insufficient_depth_rejects_without_trades() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("alice", 10_000.0).unwrap();
    exchange.deposit("bob", 10_000.0).unwrap();

    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 100.0))
        .unwrap();

    let mut ticket = limit("bob", Side::Buy, 2.0, 100.0);
    ticket.order_type = OrderType::Fok;
    let err = exchange.submit_order(ticket).unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Match(MatchError::FokInsufficientDepth { .. })
    ));
    assert!(exchange.positions("bob").is_empty());

    // with depth present the same order fills completely
    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 100.0))
        .unwrap();
    let mut ticket = limit("bob", Side::Buy, 2.0, 100.0);
    ticket.order_type = OrderType::Fok;
    let receipt = exchange.submit_order(ticket).unwrap();
    assert_eq!(receipt.status, OrderStatus::Filled);
}

#[test]
fn order_size_bounds_are_inclusive() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 1_000_000.0).unwrap();

    // exactly min and max accepted
    assert!(exchange
        .submit_order(limit("alice", Side::Buy, 0.01, 90.0))
        .is_ok());
    assert!(exchange
        .submit_order(limit("alice", Side::Buy, 1000.0, 0.1))
        .is_ok());

    // outside either bound rejected
    assert!(matches!(
        exchange.submit_order(limit("alice", Side::Buy, 0.0099, 90.0)),
        Err(ExchangeError::Match(MatchError::Product(
            ProductError::QtyBelowMinimum { .. }
        )))
    ));
    assert!(matches!(
        exchange.submit_order(limit("alice", Side::Buy, 1000.01, 90.0)),
        Err(ExchangeError::Match(MatchError::Product(
            ProductError::QtyAboveMaximum { .. }
        )))
    ));
}

#[test]
fn open_interest_cap_blocks_increase_allows_reduce() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.limits.max_open_interest_per_product = 10 * MICRO_SCALE; // 10 units
    let exchange =
        Exchange::open(config, &[perp_spec(0.0)], Arc::new(NullBroker)).unwrap();

    exchange.deposit("alice", 100_000.0).unwrap();
    exchange.deposit("bob", 100_000.0).unwrap();

    // fill OI to exactly the cap: 5 long + 5 short = 10
    exchange
        .submit_order(limit("alice", Side::Sell, 5.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("bob", Side::Buy, 5.0, 100.0))
        .unwrap();

    // any further increase breaches the cap before matching
    let err = exchange
        .submit_order(limit("bob", Side::Buy, 1.0, 100.0))
        .unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Match(MatchError::Risk(RiskError::OpenInterestLimit { .. }))
    ));

    // reductions stay allowed
    let mut reduce = limit("bob", Side::Sell, 2.0, 100.0);
    reduce.reduce_only = true;
    assert!(exchange.submit_order(reduce).is_ok());
}

#[test]
fn stop_limit_triggers_after_crossing_trade() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);

    exchange.deposit("alice", 100_000.0).unwrap();
    exchange.deposit("bob", 100_000.0).unwrap();
    exchange.deposit("stopper", 100_000.0).unwrap();

    // parked buy stop: trigger 105, limit 106
    let mut stop = limit("stopper", Side::Buy, 1.0, 106.0);
    stop.order_type = OrderType::StopLimit;
    stop.stop_price = Some(105.0);
    let receipt = exchange.submit_order(stop).unwrap();
    assert_eq!(receipt.status, OrderStatus::Open);
    assert!(receipt.fills.is_empty());

    // trade at 100 does not reach the trigger
    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("bob", Side::Buy, 1.0, 100.0))
        .unwrap();
    assert!(exchange.positions("stopper").is_empty());

    // ask at 106 plus a print at 105 fires the stop, which lifts the ask
    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 106.0))
        .unwrap();
    exchange
        .submit_order(limit("alice", Side::Sell, 1.0, 105.0))
        .unwrap();
    exchange
        .submit_order(limit("bob", Side::Buy, 1.0, 105.0))
        .unwrap();

    let position = exchange.positions("stopper");
    assert_eq!(position.len(), 1);
    assert_eq!(position[0].size.micro(), micro(1.0));
    assert_eq!(position[0].entry_price.micro(), micro(106.0));
}

#[test]
fn cancel_after_no_fills_restores_everything() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 1_000.0).unwrap();

    let before = exchange.account("alice").unwrap();
    let receipt = exchange
        .submit_order(limit("alice", Side::Buy, 1.0, 90.0))
        .unwrap();

    let cancelled = exchange
        .cancel_order("XAU-MNT-PERP", receipt.order_id, "alice")
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let after = exchange.account("alice").unwrap();
    assert_eq!(after.balance, before.balance);
    assert_eq!(after.margin_used, before.margin_used);
    let (bids, _) = exchange.depth("XAU-MNT-PERP", 10).unwrap();
    assert!(bids.is_empty());

    // cancelling again is a no-op
    assert!(exchange
        .cancel_order("XAU-MNT-PERP", receipt.order_id, "alice")
        .unwrap()
        .is_none());
}

#[test]
fn only_the_owner_may_cancel_or_modify() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 1_000.0).unwrap();
    exchange.deposit("mallory", 1_000.0).unwrap();

    let receipt = exchange
        .submit_order(limit("alice", Side::Buy, 1.0, 90.0))
        .unwrap();

    assert!(matches!(
        exchange.cancel_order("XAU-MNT-PERP", receipt.order_id, "mallory"),
        Err(ExchangeError::Match(MatchError::NotOrderOwner(_)))
    ));
    assert!(matches!(
        exchange.modify_order("XAU-MNT-PERP", receipt.order_id, "mallory", Some(91.0), None),
        Err(ExchangeError::Match(MatchError::NotOrderOwner(_)))
    ));
}

#[test]
fn modify_same_price_decrease_keeps_priority() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 10_000.0).unwrap();
    exchange.deposit("bob", 10_000.0).unwrap();
    exchange.deposit("carol", 10_000.0).unwrap();

    let first = exchange
        .submit_order(limit("alice", Side::Buy, 2.0, 100.0))
        .unwrap();
    exchange
        .submit_order(limit("bob", Side::Buy, 1.0, 100.0))
        .unwrap();

    // shrink the first order in place
    assert!(exchange
        .modify_order("XAU-MNT-PERP", first.order_id, "alice", None, Some(1.0))
        .unwrap());

    // a seller hits the level: alice still fills first
    let receipt = exchange
        .submit_order(limit("carol", Side::Sell, 1.0, 100.0))
        .unwrap();
    assert_eq!(receipt.fills.len(), 1);
    let alice_pos = exchange.positions("alice");
    assert_eq!(alice_pos.len(), 1);
    assert_eq!(alice_pos[0].size.micro(), micro(1.0));
    assert!(exchange.positions("bob").is_empty());
}

#[test]
fn halted_symbol_rejects_all_orders() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 1_000.0).unwrap();

    exchange.halt_symbol("XAU-MNT-PERP").unwrap();
    assert!(matches!(
        exchange.submit_order(limit("alice", Side::Buy, 1.0, 90.0)),
        Err(ExchangeError::Control(RiskControlError::SymbolHalted(_)))
    ));

    exchange.resume_symbol("XAU-MNT-PERP").unwrap();
    assert!(exchange
        .submit_order(limit("alice", Side::Buy, 1.0, 90.0))
        .is_ok());
}

#[test]
fn funding_transfers_from_longs_to_shorts() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0);

    exchange.deposit("long", 10_000.0).unwrap();
    exchange.deposit("short", 10_000.0).unwrap();

    // matched position at 102 while mark is 100: perp trades rich, so the
    // long pays
    exchange
        .submit_order(limit("short", Side::Sell, 1.0, 102.0))
        .unwrap();
    exchange
        .submit_order(limit("long", Side::Buy, 1.0, 102.0))
        .unwrap();

    let settled = exchange.process_funding().unwrap();
    assert_eq!(settled, 1);

    // premium 2%, dampening 0.1 -> rate 0.2%; payment = 1 * 100 * 0.002
    let long = exchange.account("long").unwrap();
    let short = exchange.account("short").unwrap();
    assert_eq!(micro(long.balance), micro(10_000.0 - 0.2));
    assert_eq!(micro(short.balance), micro(10_000.0 + 0.2));

    for (_, sum) in exchange.ledger().trial_balance() {
        assert!(sum.is_zero());
    }
}

#[test]
fn order_ticket_arrives_as_json() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("alice", 1_000.0).unwrap();

    // the transport hands the core a JSON body; conversion and validation
    // happen once, at the boundary
    let ticket: OrderTicket = serde_json::from_str(
        r#"{
            "symbol": "XAU-MNT-PERP",
            "user": "alice",
            "side": "Buy",
            "order_type": "Limit",
            "price": 99.0,
            "stop_price": null,
            "quantity": 1.0,
            "client_id": "web-1",
            "reduce_only": false
        }"#,
    )
    .unwrap();

    let receipt = exchange.submit_order(ticket).unwrap();
    assert_eq!(receipt.status, OrderStatus::Open);

    let order = exchange
        .get_order("XAU-MNT-PERP", receipt.order_id)
        .unwrap()
        .unwrap();
    assert_eq!(order.client_id.as_deref(), Some("web-1"));
    assert_eq!(order.price.unwrap().micro(), micro(99.0));
}

#[test]
fn spot_settlement_moves_cash_only() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("buyer", 1_000.0).unwrap();
    exchange.deposit("seller", 10.0).unwrap();

    exchange
        .settle_spot_trade("buyer", "seller", "XAU-MNT-PERP", 2.0, 100.0, 0.0)
        .unwrap();

    assert_eq!(micro(exchange.account("buyer").unwrap().balance), micro(800.0));
    assert_eq!(micro(exchange.account("seller").unwrap().balance), micro(210.0));
    assert!(exchange.positions("buyer").is_empty());
    assert!(exchange.positions("seller").is_empty());

    // buyer cannot overspend
    assert!(exchange
        .settle_spot_trade("buyer", "seller", "XAU-MNT-PERP", 100.0, 100.0, 0.0)
        .is_err());
}

#[test]
fn spot_markup_posts_spread_revenue() {
    let dir = tempdir().unwrap();
    let exchange = open_exchange(dir.path(), 0.0005);
    exchange.deposit("buyer", 1_000.0).unwrap();
    exchange.deposit("seller", 0.0).unwrap_err();
    exchange.deposit("seller", 10.0).unwrap();

    // buyer pays 200, the exchange keeps 2 as markup, seller nets 198
    exchange
        .settle_spot_trade("buyer", "seller", "XAU-MNT-PERP", 2.0, 100.0, 2.0)
        .unwrap();

    assert_eq!(micro(exchange.account("buyer").unwrap().balance), micro(800.0));
    assert_eq!(micro(exchange.account("seller").unwrap().balance), micro(208.0));

    let spread = exchange.ledger().register(accounts::REVENUE_SPREAD);
    assert_eq!(spread.len(), 1);
    assert_eq!(spread[0].amount.micro(), micro(-2.0));
    let income = exchange.ledger().income_statement("MNT");
    assert_eq!(income.revenue.micro(), micro(2.0));

    // a markup larger than the notional is nonsense and rejected
    assert!(matches!(
        exchange.settle_spot_trade("buyer", "seller", "XAU-MNT-PERP", 1.0, 100.0, 101.0),
        Err(ExchangeError::Risk(RiskError::InvalidSpread { .. }))
    ));

    for (_, sum) in exchange.ledger().trial_balance() {
        assert!(sum.is_zero());
    }
}
