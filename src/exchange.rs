//! The exchange composition root.
//!
//! One `Exchange` value owns every service: product catalog, accounting
//! ledger, event journal, relational store, position manager, matching
//! engine, circuit breakers, FX band controller, and the hedge tracker.
//! The routing layer talks to this type only.
//!
//! The submit pipeline runs validate -> band gate -> margin check -> match
//! -> settle -> journal -> persist. Every externally observable effect is
//! appended to the event journal before the call returns; startup replays
//! the journal to rebuild books, positions, and balances, while the ledger
//! and the relational store are durable on their own and are not re-posted
//! during recovery.

use crate::book::{Order, OrderStatus, OrderType, Trade};
use crate::config::ExchangeConfig;
use crate::events::{ExchangeEvent, InsuranceReason, PositionChange};
use crate::funding;
use crate::hedge::{HedgeBroker, HedgeTracker};
use crate::journal::{EventJournal, JournalEntry, JournalError};
use crate::ledger::{accounts, JournalFile, Ledger, LedgerError, Posting, Transaction};
use crate::manager::{PositionManager, RiskError, UserAccount};
use crate::matching::{
    MatchError, MatchingEngine, ModifyOutcome, OrderRequest, PriceLimits, SubmitResult,
};
use crate::position::Position;
use crate::product::{ProductCatalog, ProductCategory, ProductError, ProductSpec};
use crate::risk::{CircuitBreakers, CircuitState, FxBandController, RiskControlError};
use crate::store::{Store, StoreError};
use crate::types::{
    NumericError, OrderId, Price, Qty, Quote, Side, SignedQty, Symbol, Timestamp, UserId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Product(#[from] ProductError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Control(#[from] RiskControlError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Numeric(#[from] NumericError),

    #[error("malformed symbol {0:?}")]
    BadSymbol(String),
}

/// Boundary order input, deserializable straight from the transport's JSON.
/// Floats are validated and converted exactly once, here.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrderTicket {
    pub symbol: String,
    pub user: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: f64,
    pub client_id: Option<String>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FillInfo {
    pub trade_id: u64,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderReceipt {
    pub order_id: u64,
    pub status: OrderStatus,
    pub fills: Vec<FillInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummary {
    pub user_id: String,
    pub balance: f64,
    pub equity: f64,
    pub available: f64,
    pub margin_used: f64,
    pub unrealized_pnl: f64,
    pub margin_ratio: Option<f64>,
    pub open_positions: usize,
}

// 15.0: the exchange. construct once, share behind an Arc.
pub struct Exchange {
    config: ExchangeConfig,
    catalog: Arc<ProductCatalog>,
    ledger: Arc<Ledger>,
    journal: EventJournal,
    store: Store,
    manager: Arc<PositionManager>,
    engine: MatchingEngine,
    breakers: CircuitBreakers,
    fx: FxBandController,
    hedge: HedgeTracker,
}

impl Exchange {
    /// Build the service graph, then replay the event journal so books,
    /// positions, and balances match the last durable state. Product
    /// metadata always comes from the spec list, never from the journal.
    pub fn open(
        config: ExchangeConfig,
        specs: &[ProductSpec],
        broker: Arc<dyn HedgeBroker>,
    ) -> Result<Self, ExchangeError> {
        if let Some(parent) = config.storage.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    ExchangeError::Journal(JournalError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })
                })?;
            }
        }

        let catalog = Arc::new(ProductCatalog::new());
        catalog.load(specs)?;

        let ledger = Arc::new(Ledger::open(
            &config.storage.ledger_dir,
            config.storage.ledger_fsync,
        )?);
        let store = Store::open(&config.storage.db_path)?;

        let journal = EventJournal::open(
            &config.storage.journal_dir,
            config.storage.journal_segment_bytes,
            config.storage.ledger_fsync,
        )?;
        let entries = journal.read_all()?;

        // a journal replay reconstructs the fund from zero (contributions,
        // fee cuts, and draws are all in the event stream); the persisted
        // scalar only seeds a deployment without a journal
        let insurance_opening = if entries.is_empty() {
            store.load_insurance_fund()?
        } else {
            Quote::ZERO
        };

        let manager = Arc::new(PositionManager::new(
            catalog.clone(),
            ledger.clone(),
            config.limits.clone(),
            config.fees.insurance_contribution,
            insurance_opening,
        ));
        let engine = MatchingEngine::new(catalog.clone(), manager.clone());
        let breakers = CircuitBreakers::new(config.circuit_breaker.clone());
        let fx = FxBandController::new(config.fx_band.clone());
        let hedge = HedgeTracker::new(
            config.hedge.clone(),
            manager.clone(),
            catalog.clone(),
            broker,
        );

        let exchange = Self {
            config,
            catalog,
            ledger,
            journal,
            store,
            manager,
            engine,
            breakers,
            fx,
            hedge,
        };
        exchange.recover(&entries)?;
        Ok(exchange)
    }

    fn recover(&self, entries: &[JournalEntry]) -> Result<(), ExchangeError> {
        if entries.is_empty() {
            return Ok(());
        }
        info!(events = entries.len(), "replaying event journal");
        self.manager.set_recording(false);

        let result = (|| -> Result<(), ExchangeError> {
            for entry in entries {
                let timestamp = Timestamp::from_millis((entry.timestamp_ns / 1_000_000) as i64);
                match &entry.event {
                    ExchangeEvent::OrderSubmit {
                        order,
                        band_min,
                        band_max,
                    } => {
                        let bands = PriceLimits {
                            min: *band_min,
                            max: *band_max,
                        };
                        self.engine.replay_submit(order.clone(), bands, timestamp)?;
                    }
                    ExchangeEvent::OrderCancel {
                        symbol,
                        order_id,
                        user,
                    } => {
                        self.engine.cancel(symbol, *order_id, user, timestamp)?;
                    }
                    ExchangeEvent::OrderReduce {
                        symbol,
                        order_id,
                        new_remaining,
                        ..
                    } => {
                        self.engine.replay_reduce(symbol, *order_id, *new_remaining)?;
                    }
                    // trades regenerate from the order stream
                    ExchangeEvent::Trade { .. } => {}
                    ExchangeEvent::PositionChange(change) => match change {
                        PositionChange::Deposit { user, amount } => {
                            self.manager.deposit(user, *amount, timestamp)?;
                        }
                        PositionChange::Withdraw { user, amount } => {
                            self.manager.withdraw(user, *amount, timestamp)?;
                        }
                        PositionChange::SpotSettle {
                            buyer,
                            seller,
                            symbol,
                            qty,
                            price,
                            spread,
                        } => {
                            self.manager.settle_spot(
                                buyer, seller, symbol, *qty, *price, *spread, timestamp,
                            )?;
                        }
                        PositionChange::AdlClose {
                            user,
                            symbol,
                            qty,
                            price,
                            diverted,
                        } => {
                            self.manager
                                .replay_adl_close(user, symbol, *qty, *price, *diverted, timestamp)?;
                        }
                    },
                    ExchangeEvent::Funding { symbol, rate, mark } => {
                        self.manager.apply_funding(symbol, *rate, *mark, timestamp)?;
                        self.catalog.set_funding_rate(symbol, *rate)?;
                    }
                    ExchangeEvent::Liquidation(record) => {
                        self.manager.replay_liquidation(record, timestamp)?;
                    }
                    ExchangeEvent::Hedge { symbol, qty, .. } => {
                        self.manager
                            .update_hedge_position(symbol, SignedQty::from_micro(*qty));
                    }
                    ExchangeEvent::Insurance { delta, reason } => {
                        if *reason == InsuranceReason::AdminContribution {
                            self.manager.contribute_insurance(*delta, timestamp)?;
                        }
                    }
                }
            }
            Ok(())
        })();

        self.manager.set_recording(true);
        result
    }

    fn journal_event(
        &self,
        event: &ExchangeEvent,
        timestamp: Timestamp,
    ) -> Result<(), ExchangeError> {
        self.journal.append(timestamp, event)?;
        Ok(())
    }

    // --- order flow ----------------------------------------------------

    pub fn submit_order(&self, ticket: OrderTicket) -> Result<OrderReceipt, ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(ticket.symbol.clone())
            .ok_or_else(|| ExchangeError::BadSymbol(ticket.symbol.clone()))?;
        let product = self.catalog.get_active(&symbol)?;

        let quantity = Qty::from_f64(ticket.quantity)?;
        let price = ticket.price.map(Price::from_f64).transpose()?;
        let stop_price = ticket.stop_price.map(Price::from_f64).transpose()?;

        if product.category == ProductCategory::Fx {
            if let Some(price) = price {
                self.fx.check_price(&symbol, price)?;
            }
        }

        let bands = self.breakers.gate_order(&symbol, timestamp)?;
        if self.breakers.direction_rejected(&symbol, ticket.side, price) {
            let state = self.breakers.state(&symbol);
            return Err(ExchangeError::Control(RiskControlError::DirectionBlocked {
                symbol,
                state,
            }));
        }

        let request = OrderRequest {
            symbol: symbol.clone(),
            user: UserId::new(ticket.user),
            side: ticket.side,
            order_type: ticket.order_type,
            price,
            stop_price,
            quantity,
            client_id: ticket.client_id,
            reduce_only: ticket.reduce_only,
        };
        let result = self.engine.submit(request, bands, timestamp)?;

        self.record_submission(&result, bands, timestamp)?;

        let fills = result
            .trades
            .iter()
            .map(|t| FillInfo {
                trade_id: t.id.0,
                price: t.price.to_f64(),
                qty: t.quantity.to_f64(),
                fee: t.taker_fee.to_f64(),
                timestamp: t.timestamp.as_millis(),
            })
            .collect();
        Ok(OrderReceipt {
            order_id: result.order.id.0,
            status: result.order.status,
            fills,
        })
    }

    /// Journal and persist everything one submission produced. The store
    /// rows all land in one transaction; the journal and ledger were
    /// already appended before it commits.
    fn record_submission(
        &self,
        result: &SubmitResult,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<(), ExchangeError> {
        // journal the order in its pre-match state, then its trades
        let mut pristine = result.order.clone();
        pristine.filled_qty = Qty::ZERO;
        pristine.remaining_qty = pristine.quantity;
        pristine.status = OrderStatus::Pending;
        self.journal_event(
            &ExchangeEvent::OrderSubmit {
                order: pristine,
                band_min: bands.min,
                band_max: bands.max,
            },
            timestamp,
        )?;

        let mut touched: BTreeSet<UserId> = BTreeSet::new();
        touched.insert(result.order.user_id.clone());

        let all_trades: Vec<&Trade> = result
            .trades
            .iter()
            .chain(result.stop_activations.iter().flat_map(|a| a.trades.iter()))
            .collect();
        for trade in &all_trades {
            self.note_trade(trade, timestamp)?;
            touched.insert(trade.maker_user.clone());
            touched.insert(trade.taker_user.clone());
        }

        let activation_orders: Vec<Order> = result
            .stop_activations
            .iter()
            .map(|a| a.order.clone())
            .collect();
        let balances: Vec<(UserId, Quote, Quote)> = touched
            .iter()
            .filter_map(|user| self.account_row(user))
            .collect();
        self.store.persist_submission(
            &result.order,
            &activation_orders,
            &all_trades,
            &balances,
            self.manager.insurance_fund(),
            timestamp,
        )?;

        let symbol = &result.order.symbol;
        if self
            .catalog
            .get(symbol)
            .map(|p| p.is_hedgeable())
            .unwrap_or(false)
        {
            self.hedge.on_position_change(symbol, timestamp);
        }
        Ok(())
    }

    /// Journal one trade and feed the market-data side effects: last price
    /// and the circuit breaker state machine.
    fn note_trade(&self, trade: &Trade, timestamp: Timestamp) -> Result<(), ExchangeError> {
        self.journal_event(
            &ExchangeEvent::Trade {
                trade: trade.clone(),
            },
            timestamp,
        )?;
        self.catalog.set_last_price(&trade.symbol, trade.price)?;

        if let Some(transition) = self.breakers.observe_trade(&trade.symbol, trade.price, timestamp)
        {
            warn!(
                symbol = %transition.symbol,
                from = ?transition.from,
                to = ?transition.to,
                "circuit breaker transition"
            );
            self.store.record_audit(
                "system",
                "circuit_breaker",
                &format!("{:?} -> {:?} on {}", transition.from, transition.to, transition.symbol),
                timestamp,
            )?;
        }
        Ok(())
    }

    pub fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
        user: &str,
    ) -> Result<Option<OrderReceipt>, ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let user = UserId::new(user);

        let Some(cancelled) = self
            .engine
            .cancel(&symbol, OrderId(order_id), &user, timestamp)?
        else {
            return Ok(None);
        };

        self.journal_event(
            &ExchangeEvent::OrderCancel {
                symbol,
                order_id: cancelled.id,
                user,
            },
            timestamp,
        )?;
        self.store.update_order(&cancelled)?;
        Ok(Some(OrderReceipt {
            order_id: cancelled.id.0,
            status: cancelled.status,
            fills: Vec::new(),
        }))
    }

    pub fn cancel_all_orders(&self, symbol: &str, user: &str) -> Result<usize, ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let user = UserId::new(user);

        let cancelled = self.engine.cancel_all(&symbol, &user, timestamp)?;
        for order in &cancelled {
            self.journal_event(
                &ExchangeEvent::OrderCancel {
                    symbol: symbol.clone(),
                    order_id: order.id,
                    user: user.clone(),
                },
                timestamp,
            )?;
            self.store.update_order(order)?;
        }
        Ok(cancelled.len())
    }

    /// Cancel-and-replace. Journaled as a cancel plus a fresh submission of
    /// the remainder under the same order id.
    pub fn modify_order(
        &self,
        symbol: &str,
        order_id: u64,
        user: &str,
        new_price: Option<f64>,
        new_qty: Option<f64>,
    ) -> Result<bool, ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let user = UserId::new(user);
        let new_price = new_price.map(Price::from_f64).transpose()?;
        let new_qty = new_qty.map(Qty::from_f64).transpose()?;

        let outcome =
            self.engine
                .modify(&symbol, OrderId(order_id), &user, new_price, new_qty, timestamp)?;
        let Some(outcome) = outcome else {
            return Ok(false);
        };

        match &outcome {
            ModifyOutcome::Reduced { order } => {
                self.journal_event(
                    &ExchangeEvent::OrderReduce {
                        symbol: symbol.clone(),
                        order_id: order.id,
                        user,
                        new_remaining: order.remaining_qty,
                    },
                    timestamp,
                )?;
            }
            ModifyOutcome::Replaced { order } => {
                self.journal_event(
                    &ExchangeEvent::OrderCancel {
                        symbol: symbol.clone(),
                        order_id: order.id,
                        user,
                    },
                    timestamp,
                )?;
                let mut replacement = order.clone();
                replacement.quantity = order.remaining_qty;
                replacement.filled_qty = Qty::ZERO;
                replacement.remaining_qty = order.remaining_qty;
                self.journal_event(
                    &ExchangeEvent::OrderSubmit {
                        order: replacement,
                        band_min: None,
                        band_max: None,
                    },
                    timestamp,
                )?;
            }
        }
        self.store.update_order(outcome.order())?;
        Ok(true)
    }

    // --- balances ------------------------------------------------------

    pub fn deposit(&self, user: &str, amount: f64) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let user = UserId::new(user);
        let amount = Quote::from_f64(amount)?;
        self.manager.deposit(&user, amount, timestamp)?;
        self.journal_event(
            &ExchangeEvent::PositionChange(PositionChange::Deposit {
                user: user.clone(),
                amount,
            }),
            timestamp,
        )?;
        self.persist_balance(&user, timestamp)?;
        Ok(())
    }

    pub fn withdraw(&self, user: &str, amount: f64) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let user = UserId::new(user);
        let amount = Quote::from_f64(amount)?;
        self.manager.withdraw(&user, amount, timestamp)?;
        self.journal_event(
            &ExchangeEvent::PositionChange(PositionChange::Withdraw {
                user: user.clone(),
                amount,
            }),
            timestamp,
        )?;
        self.persist_balance(&user, timestamp)?;
        Ok(())
    }

    /// Spot settlement outside the margined books: buyer pays, seller
    /// delivers, both journaled. A non-zero spread is the markup the
    /// exchange keeps as spread revenue.
    pub fn settle_spot_trade(
        &self,
        buyer: &str,
        seller: &str,
        symbol: &str,
        qty: f64,
        price: f64,
        spread: f64,
    ) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let buyer = UserId::new(buyer);
        let seller = UserId::new(seller);
        let qty = Qty::from_f64(qty)?;
        let price = Price::from_f64(price)?;
        let spread = Quote::from_f64(spread)?;

        self.manager
            .settle_spot(&buyer, &seller, &symbol, qty, price, spread, timestamp)?;
        self.journal_event(
            &ExchangeEvent::PositionChange(PositionChange::SpotSettle {
                buyer: buyer.clone(),
                seller: seller.clone(),
                symbol,
                qty,
                price,
                spread,
            }),
            timestamp,
        )?;
        self.persist_balance(&buyer, timestamp)?;
        self.persist_balance(&seller, timestamp)?;
        Ok(())
    }

    // --- scheduled risk operations ------------------------------------

    /// Funding settlement across every active perpetual with a traded
    /// price. Rates derive from the last trade against mark, dampened and
    /// clamped.
    pub fn process_funding(&self) -> Result<usize, ExchangeError> {
        let timestamp = Timestamp::now();
        let mut settled = 0usize;
        for product in self.catalog.all() {
            if !product.is_perpetual() || !product.is_active {
                continue;
            }
            let Some(last) = product.last_price.or(self.engine.last_price(&product.symbol))
            else {
                continue;
            };
            let rate = funding::funding_rate(last, product.mark_price, &self.config.funding);
            if rate.ppm() == 0 {
                continue;
            }
            let outcome =
                self.manager
                    .apply_funding(&product.symbol, rate, product.mark_price, timestamp)?;
            self.catalog.set_funding_rate(&product.symbol, rate)?;
            self.journal_event(
                &ExchangeEvent::Funding {
                    symbol: product.symbol.clone(),
                    rate,
                    mark: product.mark_price,
                },
                timestamp,
            )?;
            self.store.record_funding(
                &outcome.symbol,
                outcome.rate,
                outcome.mark,
                outcome.accounts_affected,
                outcome.total_paid_by_longs,
                timestamp,
            )?;
            settled += 1;
        }
        Ok(settled)
    }

    /// Mark every book to market and liquidate whoever dropped below
    /// maintenance.
    pub fn run_liquidations(&self) -> Result<usize, ExchangeError> {
        let timestamp = Timestamp::now();
        for product in self.catalog.all() {
            self.manager
                .mark_to_market(&product.symbol, product.mark_price);
        }

        let mut cycles = 0usize;
        for user in self.manager.undermargined_users() {
            let outcomes = self.manager.liquidate(&user, timestamp)?;
            for outcome in outcomes {
                cycles += 1;
                self.journal_event(&ExchangeEvent::Liquidation(outcome.record.clone()), timestamp)?;
                for execution in &outcome.adl {
                    self.journal_event(
                        &ExchangeEvent::PositionChange(PositionChange::AdlClose {
                            user: execution.user.clone(),
                            symbol: execution.symbol.clone(),
                            qty: execution.qty,
                            price: execution.price,
                            diverted: execution.diverted,
                        }),
                        timestamp,
                    )?;
                }

                // one store transaction per cycle: steps, balances, fund
                let steps: Vec<_> = outcome
                    .record
                    .steps
                    .iter()
                    .map(|s| (s.fraction_ppm / 10_000, s.qty, s.price, s.realized_pnl))
                    .collect();
                let mut balances: Vec<(UserId, Quote, Quote)> = Vec::new();
                balances.extend(self.account_row(&outcome.record.user));
                for execution in &outcome.adl {
                    balances.extend(self.account_row(&execution.user));
                }
                self.store.persist_liquidation(
                    &outcome.record.user,
                    &outcome.record.symbol,
                    &steps,
                    outcome.record.insurance_draw,
                    outcome.record.socialized_loss,
                    &balances,
                    self.manager.insurance_fund(),
                    timestamp,
                )?;
            }
            for product in self.catalog.all().iter().filter(|p| p.is_hedgeable()) {
                self.hedge.on_position_change(&product.symbol, timestamp);
            }
        }
        Ok(cycles)
    }

    /// Drive queued hedge instructions into the broker and account for the
    /// fills.
    pub fn pump_hedges(&self) -> Result<usize, ExchangeError> {
        let timestamp = Timestamp::now();
        let fills = self.hedge.pump(timestamp);
        for fill in &fills {
            let signed = SignedQty::from_side(fill.instruction.direction, fill.ack.filled_qty);
            let notional = fill.ack.price.notional(fill.ack.filled_qty);
            let tx = Transaction::new(
                timestamp.ledger_date(),
                format!(
                    "Hedge {} {} {} ({})",
                    fill.instruction.direction,
                    fill.ack.filled_qty,
                    fill.instruction.external_symbol,
                    fill.instruction.symbol
                ),
            )
            .with_postings(vec![
                Posting::new(
                    accounts::hedge_position(&fill.instruction.external_symbol),
                    notional,
                    "MNT",
                ),
                Posting::new(accounts::HEDGE_CASH, notional.negate(), "MNT"),
            ]);
            self.ledger.append(JournalFile::Hedging, tx)?;
            self.journal_event(
                &ExchangeEvent::Hedge {
                    symbol: fill.instruction.symbol.clone(),
                    external_symbol: fill.instruction.external_symbol.clone(),
                    qty: signed.micro(),
                    price: fill.ack.price,
                },
                timestamp,
            )?;
        }
        Ok(fills.len())
    }

    /// Periodic hedge reconcile, same rule as the trade-driven path.
    pub fn reconcile_hedges(&self) -> Result<usize, ExchangeError> {
        self.hedge.reconcile(Timestamp::now());
        self.pump_hedges()
    }

    /// Realized P&L reported back by the hedge desk.
    pub fn record_hedge_pnl(&self, external_symbol: &str, pnl: f64) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let pnl = Quote::from_f64(pnl)?;
        if pnl.is_zero() {
            return Ok(());
        }
        let postings = if !pnl.is_negative() {
            vec![
                Posting::new(accounts::HEDGE_CASH, pnl, "MNT"),
                Posting::new(accounts::REVENUE_HEDGING, pnl.negate(), "MNT"),
            ]
        } else {
            let loss = pnl.abs();
            vec![
                Posting::new(accounts::EXPENSE_HEDGING, loss, "MNT"),
                Posting::new(accounts::HEDGE_CASH, loss.negate(), "MNT"),
            ]
        };
        let tx = Transaction::new(
            timestamp.ledger_date(),
            format!("Hedge PnL {external_symbol}"),
        )
        .with_postings(postings);
        self.ledger.append(JournalFile::Hedging, tx)?;
        Ok(())
    }

    // --- admin ---------------------------------------------------------

    pub fn halt_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        self.breakers.halt_symbol(&symbol, timestamp);
        self.ledger
            .append_audit(JournalFile::Prices, &format!("admin halt {symbol}"))?;
        self.store
            .record_audit("admin", "halt_symbol", symbol.as_str(), timestamp)?;
        Ok(())
    }

    pub fn resume_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        self.breakers.resume_symbol(&symbol);
        self.store
            .record_audit("admin", "resume_symbol", symbol.as_str(), timestamp)?;
        Ok(())
    }

    pub fn halt_market(&self) {
        self.breakers.halt_market();
    }

    pub fn resume_market(&self) {
        self.breakers.resume_market();
    }

    /// Circuit-breaker reference price, usually refreshed from mark.
    pub fn set_reference_price(&self, symbol: &str, price: f64) -> Result<(), ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let price = Price::from_f64(price)?;
        self.breakers.set_reference(&symbol, price);
        Ok(())
    }

    /// FX band reference, e.g. the central-bank USD-MNT rate.
    pub fn set_fx_reference_rate(&self, symbol: &str, rate: f64) -> Result<(), ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let rate = Price::from_f64(rate)?;
        self.fx.set_reference_rate(&symbol, rate);
        Ok(())
    }

    /// Oracle mark update: catalog, open positions, and the price journal.
    pub fn set_mark_price(&self, symbol: &str, price: f64) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        let price = Price::from_f64(price)?;
        self.catalog.set_mark_price(&symbol, price)?;
        self.manager.mark_to_market(&symbol, price);
        self.ledger
            .write_price(timestamp, symbol.as_str(), price, "MNT")?;
        Ok(())
    }

    pub fn set_product_active(&self, symbol: &str, active: bool) -> Result<(), ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        self.catalog.set_active(&symbol, active)?;
        Ok(())
    }

    pub fn contribute_insurance(&self, amount: f64) -> Result<(), ExchangeError> {
        let timestamp = Timestamp::now();
        let amount = Quote::from_f64(amount)?;
        self.manager.contribute_insurance(amount, timestamp)?;
        self.journal_event(
            &ExchangeEvent::Insurance {
                delta: amount,
                reason: InsuranceReason::AdminContribution,
            },
            timestamp,
        )?;
        self.store
            .save_insurance_fund(self.manager.insurance_fund(), timestamp)?;
        Ok(())
    }

    // --- queries -------------------------------------------------------

    pub fn account(&self, user: &str) -> Option<AccountSummary> {
        let user = UserId::new(user);
        let account = self.manager.account(&user)?;
        let open_positions = self.manager.positions_of(&user).len();
        Some(summarize(&account, open_positions))
    }

    pub fn positions(&self, user: &str) -> Vec<Position> {
        self.manager.positions_of(&UserId::new(user))
    }

    pub fn depth(
        &self,
        symbol: &str,
        levels: usize,
    ) -> Result<(Vec<crate::book::BookLevel>, Vec<crate::book::BookLevel>), ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.engine.depth(&symbol, levels))
    }

    pub fn bbo(&self, symbol: &str) -> Result<(Option<Price>, Option<Price>), ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.engine.bbo(&symbol))
    }

    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.engine.recent_trades(&symbol, limit))
    }

    pub fn get_order(&self, symbol: &str, order_id: u64) -> Result<Option<Order>, ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.engine.get_order(&symbol, OrderId(order_id)))
    }

    pub fn list_open_orders(&self, user: &str) -> Vec<Order> {
        let user = UserId::new(user);
        let mut orders = Vec::new();
        for symbol in self.catalog.symbols() {
            orders.extend(self.engine.user_orders(&symbol, &user));
        }
        orders
    }

    /// Most recent fills involving a user, from the relational store.
    pub fn list_fills(&self, user: &str, limit: usize) -> Result<Vec<FillInfo>, ExchangeError> {
        let rows = self.store.user_fills(&UserId::new(user), limit)?;
        Ok(rows
            .into_iter()
            .map(|(trade_id, price, qty, ts, fee_micro)| FillInfo {
                trade_id,
                price,
                qty,
                fee: Quote::from_micro(fee_micro).to_f64(),
                timestamp: ts,
            })
            .collect())
    }

    pub fn exposures(&self) -> Vec<crate::manager::ExchangeExposure> {
        self.manager.all_exposures()
    }

    pub fn insurance_fund(&self) -> Quote {
        self.manager.insurance_fund()
    }

    pub fn adl_rank(&self, user: &str, symbol: &str) -> Result<u8, ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.manager.adl_rank(&UserId::new(user), &symbol))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn circuit_state(&self, symbol: &str) -> Result<CircuitState, ExchangeError> {
        let symbol = Symbol::new(symbol).ok_or_else(|| ExchangeError::BadSymbol(symbol.into()))?;
        Ok(self.breakers.state(&symbol))
    }

    // --- internals -----------------------------------------------------

    fn persist_balance(&self, user: &UserId, timestamp: Timestamp) -> Result<(), ExchangeError> {
        if let Some(account) = self.manager.account(user) {
            self.store
                .upsert_balance(user, account.balance, account.margin_used, timestamp)?;
        }
        Ok(())
    }

    fn account_row(&self, user: &UserId) -> Option<(UserId, Quote, Quote)> {
        self.manager
            .account(user)
            .map(|a| (user.clone(), a.balance, a.margin_used))
    }
}

fn summarize(account: &UserAccount, open_positions: usize) -> AccountSummary {
    AccountSummary {
        user_id: account.user_id.to_string(),
        balance: account.balance.to_f64(),
        equity: account.equity().to_f64(),
        available: account.available().to_f64(),
        margin_used: account.margin_used.to_f64(),
        unrealized_pnl: account.unrealized_pnl.to_f64(),
        margin_ratio: account.margin_ratio_ppm().map(|ppm| ppm as f64 / 1e6),
        open_positions,
    }
}
