//! Invariant suites over random inputs: the book never crosses, order
//! quantity identities hold, every committed ledger transaction balances,
//! and money is conserved across the whole system.

use exchange_core::*;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn perp_spec() -> ProductSpec {
    ProductSpec {
        symbol: "XAU-MNT-PERP".to_string(),
        category: ProductCategory::Perpetual,
        quote_currency: "MNT".to_string(),
        external_symbol: None,
        tick_size: 0.1,
        min_order_size: 0.01,
        max_order_size: 1000.0,
        margin_rate: 0.10,
        maker_fee: 0.0002,
        taker_fee: 0.0005,
        initial_mark_price: 100.0,
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    catalog: Arc<ProductCatalog>,
    ledger: Arc<Ledger>,
    manager: Arc<PositionManager>,
    engine: MatchingEngine,
    symbol: Symbol,
}

fn rig() -> Rig {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(ProductCatalog::new());
    catalog.load(&[perp_spec()]).unwrap();
    let ledger = Arc::new(Ledger::open(dir.path(), false).unwrap());
    let manager = Arc::new(PositionManager::new(
        catalog.clone(),
        ledger.clone(),
        RiskLimits::default(),
        Rate::from_ppm(200_000),
        Quote::ZERO,
    ));
    let engine = MatchingEngine::new(catalog.clone(), manager.clone());
    Rig {
        _dir: dir,
        catalog,
        ledger,
        manager,
        engine,
        symbol: Symbol::new("XAU-MNT-PERP").unwrap(),
    }
}

#[derive(Debug, Clone)]
struct RandomOrder {
    user: usize,
    is_buy: bool,
    price_ticks: i64,
    qty_centi: i64,
}

fn order_strategy() -> impl Strategy<Value = RandomOrder> {
    (0..4usize, any::<bool>(), 900i64..1100, 1i64..500).prop_map(
        |(user, is_buy, price_ticks, qty_centi)| RandomOrder {
            user,
            is_buy,
            price_ticks,
            qty_centi,
        },
    )
}

fn submit(rig: &Rig, order: &RandomOrder) -> Option<SubmitResult> {
    let request = OrderRequest {
        symbol: rig.symbol.clone(),
        user: UserId::new(format!("user{}", order.user)),
        side: if order.is_buy { Side::Buy } else { Side::Sell },
        order_type: OrderType::Limit,
        price: Some(Price::new_unchecked(order.price_ticks * 100_000)),
        stop_price: None,
        quantity: Qty::from_micro(order.qty_centi * 10_000),
        client_id: None,
        reduce_only: false,
    };
    rig.engine
        .submit(request, PriceLimits::none(), Timestamp::from_millis(0))
        .ok()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After any sequence of limit submissions the top of book never
    /// crosses and every order keeps filled + remaining = quantity.
    #[test]
    fn book_never_crossed(orders in proptest::collection::vec(order_strategy(), 1..60)) {
        let rig = rig();
        for n in 0..4 {
            rig.manager
                .deposit(
                    &UserId::new(format!("user{n}")),
                    Quote::from_micro(1_000_000 * MICRO_SCALE),
                    Timestamp::from_millis(0),
                )
                .unwrap();
        }

        for order in &orders {
            let Some(result) = submit(&rig, order) else { continue };

            let (bid, ask) = rig.engine.bbo(&rig.symbol);
            if let (Some(bid), Some(ask)) = (bid, ask) {
                prop_assert!(bid < ask, "crossed book: bid {bid} >= ask {ask}");
            }

            prop_assert_eq!(
                result.order.filled_qty.add(result.order.remaining_qty),
                result.order.quantity
            );
            for trade in &result.trades {
                prop_assert!(!trade.quantity.is_zero());
            }
        }
    }

    /// Money is conserved: deposits = sum of balances + insurance fund +
    /// (revenue - expenses), to the micro.
    #[test]
    fn money_is_conserved(orders in proptest::collection::vec(order_strategy(), 1..40)) {
        let rig = rig();
        let deposit_each = Quote::from_micro(1_000_000 * MICRO_SCALE);
        for n in 0..4 {
            rig.manager
                .deposit(
                    &UserId::new(format!("user{n}")),
                    deposit_each,
                    Timestamp::from_millis(0),
                )
                .unwrap();
        }

        for order in &orders {
            let _ = submit(&rig, order);
        }

        let balances: Quote = (0..4)
            .filter_map(|n| rig.manager.account(&UserId::new(format!("user{n}"))))
            .map(|a| a.balance)
            .sum();
        let fund = rig.manager.insurance_fund();
        let income = rig.ledger.income_statement("MNT");

        let total = balances
            .add(fund)
            .add(income.net_income);
        prop_assert_eq!(total.micro(), 4 * deposit_each.micro());

        for (commodity, sum) in rig.ledger.trial_balance() {
            prop_assert!(sum.is_zero(), "{commodity} does not balance: {sum}");
        }
    }

    /// Open interest equals the sum of |size| across users, and net
    /// exposure equals the signed sum.
    #[test]
    fn open_interest_identity(orders in proptest::collection::vec(order_strategy(), 1..40)) {
        let rig = rig();
        for n in 0..4 {
            rig.manager
                .deposit(
                    &UserId::new(format!("user{n}")),
                    Quote::from_micro(1_000_000 * MICRO_SCALE),
                    Timestamp::from_millis(0),
                )
                .unwrap();
        }
        for order in &orders {
            let _ = submit(&rig, order);
        }

        let mut oi = 0i64;
        let mut net = 0i64;
        for n in 0..4 {
            for position in rig.manager.positions_of(&UserId::new(format!("user{n}"))) {
                oi += position.size.abs().micro();
                net += position.size.micro();
            }
        }
        let exposure = rig.manager.exposure(&rig.symbol);
        let (tracked_oi, tracked_net) = exposure
            .map(|e| (e.open_interest.micro(), e.net_position.micro()))
            .unwrap_or((0, 0));
        prop_assert_eq!(tracked_oi, oi);
        prop_assert_eq!(tracked_net, net);
    }

    /// The funding rate is always the dampened premium, hard-clamped.
    #[test]
    fn funding_rate_is_clamped(last_units in 1i64..10_000, mark_units in 1i64..10_000) {
        let config = FundingConfig::default();
        let last = Price::new_unchecked(last_units * MICRO_SCALE);
        let mark = Price::new_unchecked(mark_units * MICRO_SCALE);

        let rate = funding::funding_rate(last, mark, &config);
        prop_assert!(rate.ppm().abs() <= config.max_rate.ppm());

        // sign always follows the premium
        if last_units > mark_units {
            prop_assert!(rate.ppm() >= 0);
        } else if last_units < mark_units {
            prop_assert!(rate.ppm() <= 0);
        } else {
            prop_assert_eq!(rate.ppm(), 0);
        }
    }

    /// Balanced transactions always append; any single-sided mutation of a
    /// leg gets rejected.
    #[test]
    fn ledger_accepts_only_balanced(amounts in proptest::collection::vec(-1_000_000i64..1_000_000, 1..6)) {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), false).unwrap();

        let mut postings: Vec<Posting> = amounts
            .iter()
            .enumerate()
            .map(|(i, micro)| {
                Posting::new(format!("Assets:Test:{i}"), Quote::from_micro(*micro), "MNT")
            })
            .collect();
        let residual: i64 = amounts.iter().sum();
        postings.push(Posting::new(
            "Equity:Test",
            Quote::from_micro(-residual),
            "MNT",
        ));

        let tx = Transaction::new("2026/08/01", "balanced").with_postings(postings.clone());
        prop_assert!(ledger.append(JournalFile::Trades, tx).is_ok());

        // skew one leg: must be rejected and leave the index untouched
        let count_before = ledger.transaction_count();
        postings[0].amount = postings[0].amount.add(Quote::from_micro(1));
        let tx = Transaction::new("2026/08/01", "skewed").with_postings(postings);
        prop_assert!(ledger.append(JournalFile::Trades, tx).is_err());
        prop_assert_eq!(ledger.transaction_count(), count_before);
    }

    /// Reducing a position by the full size at the entry price is a
    /// perfect round trip.
    #[test]
    fn round_trip_close_is_neutral(
        qty_centi in 1i64..100_000,
        price_ticks in 1i64..1_000_000,
    ) {
        let symbol = Symbol::new("XAU-MNT-PERP").unwrap();
        let qty = Qty::from_micro(qty_centi * 10_000);
        let price = Price::new_unchecked(price_ticks * 100_000);
        let margin = price.notional(qty).apply(Rate::from_ppm(100_000));

        let opened = Position::open(
            symbol,
            SignedQty::from_side(Side::Buy, qty),
            price,
            margin,
            Timestamp::from_millis(0),
        );
        let delta = position::reduce(&opened, qty, price, Timestamp::from_millis(1));
        prop_assert!(delta.position.is_none());
        prop_assert_eq!(delta.realized_pnl, Quote::ZERO);
        prop_assert_eq!(delta.margin_released, margin);
    }
}

#[test]
fn catalog_is_shared_state_not_copies() {
    // one writer updating the mark is visible to all readers
    let rig = rig();
    rig.catalog
        .set_mark_price(&rig.symbol, Price::new_unchecked(123 * MICRO_SCALE))
        .unwrap();
    assert_eq!(
        rig.catalog.get(&rig.symbol).unwrap().mark_price.micro(),
        123 * MICRO_SCALE
    );
}
