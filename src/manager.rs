//! Position and margin manager.
//!
//! Owns every user account, every (user, symbol) position, per-symbol
//! exposure aggregates, and the insurance fund. All mutation happens under
//! one lock so reads are point-in-time consistent; the matching engine calls
//! in only for short, bounded sections. Every balance effect posts a
//! balanced transaction to the accounting ledger before the lock is
//! released.

use crate::book::Trade;
use crate::config::RiskLimits;
use crate::events::{LiquidationRecord, LiquidationStep};
use crate::funding;
use crate::ledger::{accounts, JournalFile, Ledger, LedgerError, Posting, Transaction};
use crate::position::{self, Position};
use crate::product::{Product, ProductCatalog};
use crate::types::{
    mul_div, Price, Qty, Quote, Rate, Side, SignedQty, Symbol, Timestamp, UserId, MICRO_SCALE,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    /// Total cash, including the part reserved as margin.
    pub balance: Quote,
    /// Reservation against open positions; released proportionally on
    /// close. Never negative.
    pub margin_used: Quote,
    pub unrealized_pnl: Quote,
    pub is_active: bool,
}

impl UserAccount {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Quote::ZERO,
            margin_used: Quote::ZERO,
            unrealized_pnl: Quote::ZERO,
            is_active: true,
        }
    }

    pub fn equity(&self) -> Quote {
        self.balance.add(self.unrealized_pnl)
    }

    pub fn available(&self) -> Quote {
        self.equity().sub(self.margin_used)
    }

    /// equity / margin_used in ppm; None means no margin in use (infinite).
    pub fn margin_ratio_ppm(&self) -> Option<i64> {
        if self.margin_used.is_zero() {
            return None;
        }
        Some(mul_div(
            self.equity().micro(),
            MICRO_SCALE,
            self.margin_used.micro(),
        ))
    }

    pub fn is_undermargined(&self) -> bool {
        !self.margin_used.is_zero() && self.equity() < self.margin_used
    }
}

/// Aggregated client exposure per symbol, the input to the hedge tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeExposure {
    pub symbol: Symbol,
    /// Sum of all client position sizes.
    pub net_position: SignedQty,
    /// Position held with the external broker, ideally opposite in sign.
    pub hedge_position: SignedQty,
    /// Sum of |size| across users.
    pub open_interest: Qty,
}

impl ExchangeExposure {
    fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            net_position: SignedQty::ZERO,
            hedge_position: SignedQty::ZERO,
            open_interest: Qty::ZERO,
        }
    }

    pub fn unhedged(&self) -> SignedQty {
        self.net_position.add(self.hedge_position)
    }

    pub fn exposure_quote(&self, mark: Price) -> Quote {
        mark.notional_signed(self.net_position)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskError {
    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("account {0} is not active")]
    AccountInactive(UserId),

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Quote,
        available: Quote,
    },

    #[error("position size limit exceeded: would be {would_be}, limit {limit}")]
    PositionLimit { would_be: Qty, limit: Qty },

    #[error("notional limit exceeded: would be {would_be}, limit {limit}")]
    NotionalLimit { would_be: Quote, limit: Quote },

    #[error("open position count limit ({0}) reached")]
    OpenPositionsLimit(usize),

    #[error("open interest limit exceeded on {symbol}: would be {would_be}, limit {limit}")]
    OpenInterestLimit {
        symbol: Symbol,
        would_be: Qty,
        limit: Qty,
    },

    #[error("order notional {notional} exceeds fat finger threshold {threshold}")]
    FatFinger { notional: Quote, threshold: Quote },

    #[error("reduce-only order has no opposing position to reduce")]
    NoOpposingPosition,

    #[error("spot spread {spread} invalid against cost {cost}")]
    InvalidSpread { spread: Quote, cost: Quote },

    #[error("deposit/withdraw amount must be positive")]
    NonPositiveAmount,

    #[error("ledger rejected posting: {0}")]
    Ledger(String),
}

impl From<LedgerError> for RiskError {
    fn from(err: LedgerError) -> Self {
        RiskError::Ledger(err.to_string())
    }
}

/// Amounts applied while settling one trade, for event emission upstream.
#[derive(Debug, Clone, Default)]
pub struct TradeSettlement {
    pub insurance_contribution: Quote,
}

#[derive(Debug, Clone)]
pub struct FundingOutcome {
    pub symbol: Symbol,
    pub rate: Rate,
    pub mark: Price,
    pub accounts_affected: usize,
    pub total_paid_by_longs: Quote,
}

/// One forced close during auto-deleveraging.
#[derive(Debug, Clone)]
pub struct AdlExecution {
    pub user: UserId,
    pub symbol: Symbol,
    pub qty: Qty,
    pub price: Price,
    pub realized_pnl: Quote,
    pub diverted: Quote,
}

#[derive(Debug, Clone)]
pub struct LiquidationOutcome {
    pub record: LiquidationRecord,
    pub adl: Vec<AdlExecution>,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<UserId, UserAccount>,
    positions: HashMap<(UserId, Symbol), Position>,
    exposures: HashMap<Symbol, ExchangeExposure>,
    insurance_fund: Quote,
}

// 10.0: the manager service. single lock over all account state; the ledger
// has its own lock and is always taken second.
pub struct PositionManager {
    state: Mutex<State>,
    catalog: Arc<ProductCatalog>,
    ledger: Arc<Ledger>,
    limits: RiskLimits,
    insurance_contribution: Rate,
    /// False during journal replay: the ledger files are already durable,
    /// so recovery must not double-post them.
    recording: AtomicBool,
}

impl PositionManager {
    pub fn new(
        catalog: Arc<ProductCatalog>,
        ledger: Arc<Ledger>,
        limits: RiskLimits,
        insurance_contribution: Rate,
        insurance_fund_opening: Quote,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                insurance_fund: insurance_fund_opening,
                ..State::default()
            }),
            catalog,
            ledger,
            limits,
            insurance_contribution,
            recording: AtomicBool::new(true),
        }
    }

    /// Recovery switch: while off, no ledger postings are emitted.
    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::SeqCst);
    }

    fn ledger_append(&self, file: JournalFile, tx: Transaction) -> Result<(), LedgerError> {
        if !self.recording.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.ledger.append(file, tx)
    }

    // --- accounts ------------------------------------------------------

    pub fn deposit(
        &self,
        user: &UserId,
        amount: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        if amount <= Quote::ZERO {
            return Err(RiskError::NonPositiveAmount);
        }
        let mut state = self.state.lock();
        let account = state
            .accounts
            .entry(user.clone())
            .or_insert_with(|| UserAccount::new(user.clone()));
        account.balance = account.balance.add(amount);

        let tx = Transaction::new(timestamp.ledger_date(), format!("Deposit from {user}"))
            .with_postings(vec![
                Posting::new(accounts::BANK_MNT, amount, "MNT"),
                Posting::new(accounts::customer_balance(user), amount.negate(), "MNT"),
            ]);
        self.ledger_append(JournalFile::Deposits, tx)?;
        Ok(())
    }

    pub fn withdraw(
        &self,
        user: &UserId,
        amount: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        if amount <= Quote::ZERO {
            return Err(RiskError::NonPositiveAmount);
        }
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(user)
            .ok_or_else(|| RiskError::UnknownUser(user.clone()))?;
        let withdrawable = account.available().min(account.balance);
        if amount > withdrawable {
            return Err(RiskError::InsufficientBalance {
                requested: amount,
                available: withdrawable,
            });
        }
        account.balance = account.balance.sub(amount);

        let tx = Transaction::new(timestamp.ledger_date(), format!("Withdrawal to {user}"))
            .with_postings(vec![
                Posting::new(accounts::customer_balance(user), amount, "MNT"),
                Posting::new(accounts::BANK_MNT, amount.negate(), "MNT"),
            ]);
        self.ledger_append(JournalFile::Withdrawals, tx)?;
        Ok(())
    }

    pub fn account(&self, user: &UserId) -> Option<UserAccount> {
        self.state.lock().accounts.get(user).cloned()
    }

    pub fn position(&self, user: &UserId, symbol: &Symbol) -> Option<Position> {
        self.state
            .lock()
            .positions
            .get(&(user.clone(), symbol.clone()))
            .cloned()
    }

    pub fn positions_of(&self, user: &UserId) -> Vec<Position> {
        self.state
            .lock()
            .positions
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn insurance_fund(&self) -> Quote {
        self.state.lock().insurance_fund
    }

    pub fn open_interest(&self, symbol: &Symbol) -> Qty {
        self.state
            .lock()
            .exposures
            .get(symbol)
            .map(|e| e.open_interest)
            .unwrap_or(Qty::ZERO)
    }

    pub fn exposure(&self, symbol: &Symbol) -> Option<ExchangeExposure> {
        self.state.lock().exposures.get(symbol).cloned()
    }

    pub fn all_exposures(&self) -> Vec<ExchangeExposure> {
        self.state.lock().exposures.values().cloned().collect()
    }

    /// Broker acknowledgement: the hedge position moved by `delta`.
    pub fn update_hedge_position(&self, symbol: &Symbol, delta: SignedQty) {
        let mut state = self.state.lock();
        let exposure = state
            .exposures
            .entry(symbol.clone())
            .or_insert_with(|| ExchangeExposure::new(symbol.clone()));
        exposure.hedge_position = exposure.hedge_position.add(delta);
    }

    /// Admin top-up of the insurance fund, seeded from exchange equity.
    pub fn contribute_insurance(
        &self,
        amount: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        if amount <= Quote::ZERO {
            return Err(RiskError::NonPositiveAmount);
        }
        let mut state = self.state.lock();
        state.insurance_fund = state.insurance_fund.add(amount);
        let tx = Transaction::new(timestamp.ledger_date(), "Insurance fund contribution")
            .with_postings(vec![
                Posting::new("Equity:Openings", amount, "MNT"),
                Posting::new(accounts::INSURANCE_FUND, amount.negate(), "MNT"),
            ]);
        self.ledger_append(JournalFile::Liquidations, tx)?;
        Ok(())
    }

    // --- pre-trade checks ---------------------------------------------

    /// Conditional check before the book is touched: the order's worst-case
    /// effect must stay inside margin and every limit. The engine rejects
    /// without producing trades when this fails.
    pub fn check_order(
        &self,
        user: &UserId,
        product: &Product,
        side: Side,
        qty: Qty,
        reference_price: Price,
        reduce_only: bool,
    ) -> Result<(), RiskError> {
        let state = self.state.lock();
        let account = state
            .accounts
            .get(user)
            .ok_or_else(|| RiskError::UnknownUser(user.clone()))?;
        if !account.is_active {
            return Err(RiskError::AccountInactive(user.clone()));
        }

        let notional = reference_price.notional(qty);
        if notional > self.limits.fat_finger_threshold {
            return Err(RiskError::FatFinger {
                notional,
                threshold: self.limits.fat_finger_threshold,
            });
        }

        let key = (user.clone(), product.symbol.clone());
        let current = state.positions.get(&key);

        if reduce_only {
            let opposes = current
                .map(|p| p.size.side() == Some(side.opposite()) && qty <= p.size.abs())
                .unwrap_or(false);
            if !opposes {
                return Err(RiskError::NoOpposingPosition);
            }
            // a pure reduction frees margin; nothing else to check
            return Ok(());
        }

        // worst case: the whole order increases exposure on `side`
        let current_size = current.map(|p| p.size).unwrap_or(SignedQty::ZERO);
        let increase_qty = worst_case_increase(current_size, side, qty);

        let would_be_size = current_size
            .add(SignedQty::from_side(side, qty))
            .abs()
            .max(current_size.abs());
        let limit_qty = Qty::from_micro(self.limits.max_position_per_user);
        if would_be_size > limit_qty {
            return Err(RiskError::PositionLimit {
                would_be: would_be_size,
                limit: limit_qty,
            });
        }

        if !increase_qty.is_zero() {
            // margin for the increasing part only
            let required = reference_price.notional(increase_qty).apply(product.margin_rate);
            let available = account.available();
            if required > available {
                return Err(RiskError::InsufficientMargin {
                    required,
                    available,
                });
            }

            // gross notional across all positions after the increase
            let gross: Quote = state
                .positions
                .iter()
                .filter(|((owner, _), _)| owner == user)
                .map(|((_, sym), p)| {
                    let mark = self
                        .catalog
                        .get(sym)
                        .map(|prod| prod.mark_price)
                        .unwrap_or(p.entry_price);
                    mark.notional(p.size.abs())
                })
                .sum();
            let would_be = gross.add(reference_price.notional(increase_qty));
            if would_be > self.limits.max_notional_per_user {
                return Err(RiskError::NotionalLimit {
                    would_be,
                    limit: self.limits.max_notional_per_user,
                });
            }

            if current.is_none() {
                let open_count = state
                    .positions
                    .keys()
                    .filter(|(owner, _)| owner == user)
                    .count();
                if open_count >= self.limits.max_open_positions {
                    return Err(RiskError::OpenPositionsLimit(self.limits.max_open_positions));
                }
            }

            let oi = state
                .exposures
                .get(&product.symbol)
                .map(|e| e.open_interest)
                .unwrap_or(Qty::ZERO);
            let oi_would_be = oi.add(increase_qty);
            let oi_limit = Qty::from_micro(self.limits.max_open_interest_per_product);
            if oi_would_be > oi_limit {
                return Err(RiskError::OpenInterestLimit {
                    symbol: product.symbol.clone(),
                    would_be: oi_would_be,
                    limit: oi_limit,
                });
            }
        }

        Ok(())
    }

    // --- trade settlement ---------------------------------------------

    /// Settle both counterparties of a trade: position deltas, margin moves,
    /// realized P&L, fees, and the insurance cut of the taker fee.
    pub fn apply_trade(
        &self,
        trade: &Trade,
        product: &Product,
    ) -> Result<TradeSettlement, RiskError> {
        let mut state = self.state.lock();

        let contribution = trade.taker_fee.apply(self.insurance_contribution);

        self.settle_party(
            &mut state,
            &trade.taker_user,
            product,
            trade.taker_side,
            trade.quantity,
            trade.price,
            trade.taker_fee,
            trade.timestamp,
        )?;
        self.settle_party(
            &mut state,
            &trade.maker_user,
            product,
            trade.maker_side(),
            trade.quantity,
            trade.price,
            trade.maker_fee,
            trade.timestamp,
        )?;

        state.insurance_fund = state.insurance_fund.add(contribution);

        // one fee transaction for the pair; taker fee carries the
        // insurance cut
        let mut postings = Vec::new();
        if !trade.taker_fee.is_zero() {
            postings.push(Posting::new(
                accounts::customer_balance(&trade.taker_user),
                trade.taker_fee,
                "MNT",
            ));
            postings.push(Posting::new(
                accounts::REVENUE_FEES,
                trade.taker_fee.sub(contribution).negate(),
                "MNT",
            ));
            if !contribution.is_zero() {
                postings.push(Posting::new(
                    accounts::INSURANCE_FUND,
                    contribution.negate(),
                    "MNT",
                ));
            }
        }
        if !trade.maker_fee.is_zero() {
            postings.push(Posting::new(
                accounts::customer_balance(&trade.maker_user),
                trade.maker_fee,
                "MNT",
            ));
            postings.push(Posting::new(
                accounts::REVENUE_FEES,
                trade.maker_fee.negate(),
                "MNT",
            ));
        }
        if !postings.is_empty() {
            let tx = Transaction::new(
                trade.timestamp.ledger_date(),
                format!("{} {} @ {}", trade.symbol, trade.quantity, trade.price),
            )
            .with_postings(postings);
            self.ledger_append(JournalFile::Trades, tx)?;
        }

        Ok(TradeSettlement {
            insurance_contribution: contribution,
        })
    }

    /// Spot settlement: buyer pays seller, no margined position. Both sides
    /// must be funded or nothing moves. When the execution price carries a
    /// markup, the spread stays with the exchange as spread revenue and the
    /// seller receives the net.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_spot(
        &self,
        buyer: &UserId,
        seller: &UserId,
        symbol: &Symbol,
        qty: Qty,
        price: Price,
        spread: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        let cost = price.notional(qty);
        if spread.is_negative() || spread > cost {
            return Err(RiskError::InvalidSpread { spread, cost });
        }
        let seller_receives = cost.sub(spread);
        let mut state = self.state.lock();

        let buyer_account = state
            .accounts
            .get(buyer)
            .ok_or_else(|| RiskError::UnknownUser(buyer.clone()))?;
        if buyer_account.available() < cost {
            return Err(RiskError::InsufficientBalance {
                requested: cost,
                available: buyer_account.available(),
            });
        }
        if !state.accounts.contains_key(seller) {
            return Err(RiskError::UnknownUser(seller.clone()));
        }

        {
            let buyer_account = state.accounts.get_mut(buyer).expect("checked above");
            buyer_account.balance = buyer_account.balance.sub(cost);
        }
        {
            let seller_account = state.accounts.get_mut(seller).expect("checked above");
            seller_account.balance = seller_account.balance.add(seller_receives);
        }

        let mut postings = vec![
            Posting::new(accounts::customer_balance(buyer), cost, "MNT"),
            Posting::new(
                accounts::customer_balance(seller),
                seller_receives.negate(),
                "MNT",
            ),
        ];
        if !spread.is_zero() {
            postings.push(Posting::new(accounts::REVENUE_SPREAD, spread.negate(), "MNT"));
        }
        let tx = Transaction::new(
            timestamp.ledger_date(),
            format!("{} {} @ {} spot", symbol, qty, price),
        )
        .with_postings(postings);
        self.ledger_append(JournalFile::Trades, tx)?;
        Ok(())
    }

    // --- mark to market and funding -----------------------------------

    /// Recompute unrealized P&L for every position on `symbol` at `mark`.
    pub fn mark_to_market(&self, symbol: &Symbol, mark: Price) {
        let mut state = self.state.lock();
        let users: Vec<UserId> = state
            .positions
            .iter_mut()
            .filter(|((_, sym), _)| sym == symbol)
            .map(|((user, _), position)| {
                position.mark_to_market(mark);
                user.clone()
            })
            .collect();
        for user in users {
            refresh_account(&mut state, &user);
        }
    }

    /// One funding settlement for `symbol` at the given rate and mark.
    /// Positive payments flow from longs to shorts via the funding
    /// accounts; every transaction balances on its own.
    pub fn apply_funding(
        &self,
        symbol: &Symbol,
        rate: Rate,
        mark: Price,
        timestamp: Timestamp,
    ) -> Result<FundingOutcome, RiskError> {
        let mut state = self.state.lock();
        let mut affected = 0usize;
        let mut total_longs = Quote::ZERO;

        let parties: Vec<(UserId, SignedQty)> = state
            .positions
            .iter()
            .filter(|((_, sym), _)| sym == symbol)
            .map(|((user, _), p)| (user.clone(), p.size))
            .collect();

        for (user, size) in parties {
            let payment = funding::funding_payment(size, mark, rate);
            if payment.is_zero() {
                continue;
            }
            if let Some(account) = state.accounts.get_mut(&user) {
                account.balance = account.balance.sub(payment);
            }
            affected += 1;
            if payment > Quote::ZERO {
                total_longs = total_longs.add(payment);
            }

            let tx = if payment > Quote::ZERO {
                // position pays
                Transaction::new(
                    timestamp.ledger_date(),
                    format!("Funding paid {} - {}", symbol, user),
                )
                .with_postings(vec![
                    Posting::new(accounts::customer_balance(&user), payment, "MNT"),
                    Posting::new(accounts::funding_revenue(symbol), payment.negate(), "MNT"),
                ])
            } else {
                // position receives
                let received = payment.abs();
                Transaction::new(
                    timestamp.ledger_date(),
                    format!("Funding received {} - {}", symbol, user),
                )
                .with_postings(vec![
                    Posting::new(accounts::funding_expense(symbol), received, "MNT"),
                    Posting::new(accounts::customer_balance(&user), received.negate(), "MNT"),
                ])
            };
            self.ledger_append(JournalFile::Funding, tx)?;
        }

        Ok(FundingOutcome {
            symbol: symbol.clone(),
            rate,
            mark,
            accounts_affected: affected,
            total_paid_by_longs: total_longs,
        })
    }

    // --- liquidation ---------------------------------------------------

    /// Users whose margin ratio has dropped below 1.0.
    pub fn undermargined_users(&self) -> Vec<UserId> {
        let state = self.state.lock();
        state
            .accounts
            .values()
            .filter(|a| a.is_undermargined())
            .map(|a| a.user_id.clone())
            .collect()
    }

    /// Run one full liquidation cycle for `user`: graduated partial closes
    /// at mark, insurance draw, then ADL for any residual. Transient
    /// negative balances never escape this call.
    pub fn liquidate(
        &self,
        user: &UserId,
        timestamp: Timestamp,
    ) -> Result<Vec<LiquidationOutcome>, RiskError> {
        let mut state = self.state.lock();
        let mut outcomes = Vec::new();

        // positions ordered worst unrealized first
        let mut targets: Vec<(Symbol, Quote)> = state
            .positions
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|((_, sym), p)| (sym.clone(), p.unrealized_pnl))
            .collect();
        targets.sort_by_key(|(_, pnl)| *pnl);

        for (symbol, _) in targets {
            let recovered = state
                .accounts
                .get(user)
                .map(|a| !a.is_undermargined())
                .unwrap_or(true);
            if recovered {
                break;
            }
            let Some(product) = self.catalog.get(&symbol) else {
                continue;
            };
            let outcome =
                self.liquidate_position(&mut state, user, &product, timestamp)?;
            if let Some(outcome) = outcome {
                outcomes.push(outcome);
            }
        }

        Ok(outcomes)
    }

    fn liquidate_position(
        &self,
        state: &mut State,
        user: &UserId,
        product: &Product,
        timestamp: Timestamp,
    ) -> Result<Option<LiquidationOutcome>, RiskError> {
        let symbol = product.symbol.clone();
        let key = (user.clone(), symbol.clone());
        let Some(initial) = state.positions.get(&key).cloned() else {
            return Ok(None);
        };
        let mark = product.mark_price;
        let initial_abs = initial.size.abs();
        let mut steps = Vec::new();

        // 25% -> 50% -> 100% of the size at sweep start, at mark
        let fractions = [250_000i64, 500_000, 1_000_000];
        for fraction in fractions {
            let Some(current) = state.positions.get(&key).cloned() else {
                break;
            };
            let step_qty = if fraction == 1_000_000 {
                current.size.abs()
            } else {
                initial_abs.scale(Rate::from_ppm(fraction)).min(current.size.abs())
            };
            if step_qty.is_zero() {
                break;
            }

            let delta = position::reduce(&current, step_qty, mark, timestamp);
            apply_delta(state, user, &symbol, &current, &delta);
            refresh_position_pnl(state, &key, mark);
            refresh_account(state, user);

            self.post_realized_pnl(
                JournalFile::Liquidations,
                user,
                delta.realized_pnl,
                timestamp,
                &format!("Liquidation step {}% {} - {}", fraction / 10_000, symbol, user),
            )?;
            self.post_margin_release(user, delta.margin_released, timestamp)?;

            steps.push(LiquidationStep {
                fraction_ppm: fraction,
                qty: step_qty,
                price: mark,
                realized_pnl: delta.realized_pnl,
            });

            warn!(
                user = %user,
                symbol = %symbol,
                step = fraction / 10_000,
                qty = %step_qty,
                "liquidation partial close"
            );

            let recovered = state
                .accounts
                .get(user)
                .map(|a| !a.is_undermargined())
                .unwrap_or(true);
            if recovered {
                break;
            }
        }

        if steps.is_empty() {
            return Ok(None);
        }

        // shortfall handling: insurance first, then ADL
        let balance = state
            .accounts
            .get(user)
            .map(|a| a.balance)
            .unwrap_or(Quote::ZERO);
        let mut insurance_draw = Quote::ZERO;
        let mut socialized = Quote::ZERO;
        let mut adl = Vec::new();

        if balance.is_negative() {
            let shortfall = balance.abs();
            insurance_draw = shortfall.min(state.insurance_fund);
            if !insurance_draw.is_zero() {
                state.insurance_fund = state.insurance_fund.sub(insurance_draw);
                let account = state.accounts.get_mut(user).expect("account exists");
                account.balance = account.balance.add(insurance_draw);

                let tx = Transaction::new(
                    timestamp.ledger_date(),
                    format!("Insurance draw - liquidation of {user}"),
                )
                .with_postings(vec![
                    Posting::new(accounts::EXPENSE_INSURANCE_LIQUIDATION, insurance_draw, "MNT"),
                    Posting::new(accounts::INSURANCE_FUND, insurance_draw.negate(), "MNT"),
                ]);
                self.ledger_append(JournalFile::Liquidations, tx)?;

                let tx = Transaction::new(
                    timestamp.ledger_date(),
                    format!("Insurance payout restoring {user}"),
                )
                .with_postings(vec![
                    Posting::new(accounts::INSURANCE_FUND, insurance_draw, "MNT"),
                    Posting::new(
                        accounts::customer_balance(user),
                        insurance_draw.negate(),
                        "MNT",
                    ),
                ]);
                self.ledger_append(JournalFile::Liquidations, tx)?;
            }

            let residual = shortfall.sub(insurance_draw);
            if !residual.is_zero() {
                adl = self.auto_deleverage(state, user, &symbol, residual, mark, timestamp)?;
                // what ADL actually covered; replay restores exactly this
                socialized = adl.iter().map(|e| e.diverted).sum();
            }

            // the cycle ends with the account at zero, never negative
            let account = state.accounts.get_mut(user).expect("account exists");
            if account.balance.is_negative() {
                account.balance = Quote::ZERO;
            }
            refresh_account(state, user);
        }

        info!(
            user = %user,
            symbol = %symbol,
            steps = steps.len(),
            draw = %insurance_draw,
            socialized = %socialized,
            "liquidation cycle complete"
        );

        Ok(Some(LiquidationOutcome {
            record: LiquidationRecord {
                user: user.clone(),
                symbol,
                steps,
                insurance_draw,
                socialized_loss: socialized,
            },
            adl,
        }))
    }

    /// Socialize `loss` by force-closing profitable opposing positions on
    /// `symbol`, best score first. Diverted profit goes to the ADL revenue
    /// account; the same account funds the bankrupt user's restoration.
    fn auto_deleverage(
        &self,
        state: &mut State,
        bankrupt: &UserId,
        symbol: &Symbol,
        loss: Quote,
        mark: Price,
        timestamp: Timestamp,
    ) -> Result<Vec<AdlExecution>, RiskError> {
        let bankrupt_side = state
            .positions
            .get(&(bankrupt.clone(), symbol.clone()))
            .and_then(|p| p.size.side());

        let mut candidates = rank_adl_candidates(state, symbol, bankrupt, bankrupt_side, mark);
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut remaining = loss;
        let mut executions = Vec::new();

        for (user, _score) in candidates {
            if remaining.is_zero() {
                break;
            }
            let key = (user.clone(), symbol.clone());
            let Some(current) = state.positions.get(&key).cloned() else {
                continue;
            };
            let profit = current.unrealized_pnl;
            if profit <= Quote::ZERO {
                continue;
            }

            let qty = current.size.abs();
            let delta = position::reduce(&current, qty, mark, timestamp);
            apply_delta(state, &user, symbol, &current, &delta);
            refresh_account(state, &user);

            let realized = delta.realized_pnl;
            let diverted = realized.min(remaining);
            remaining = remaining.sub(diverted);

            // realize the profit, then divert the covered share
            self.post_realized_pnl(
                JournalFile::Liquidations,
                &user,
                realized,
                timestamp,
                &format!("ADL close {} - {}", symbol, user),
            )?;
            self.post_margin_release(&user, delta.margin_released, timestamp)?;
            if !diverted.is_zero() {
                let account = state.accounts.get_mut(&user).expect("account exists");
                account.balance = account.balance.sub(diverted);

                let tx = Transaction::new(
                    timestamp.ledger_date(),
                    format!("ADL diversion {} - {}", symbol, user),
                )
                .with_postings(vec![
                    Posting::new(accounts::customer_balance(&user), diverted, "MNT"),
                    Posting::new(accounts::REVENUE_ADL, diverted.negate(), "MNT"),
                ]);
                self.ledger_append(JournalFile::Liquidations, tx)?;
            }

            executions.push(AdlExecution {
                user: user.clone(),
                symbol: symbol.clone(),
                qty,
                price: mark,
                realized_pnl: realized,
                diverted,
            });
        }

        let covered = loss.sub(remaining);
        if !covered.is_zero() {
            // restoration of the bankrupt account, funded by the diverted
            // profit sitting in the ADL account
            let account = state.accounts.get_mut(bankrupt).expect("account exists");
            account.balance = account.balance.add(covered);

            let tx = Transaction::new(
                timestamp.ledger_date(),
                format!("ADL restoration of {bankrupt}"),
            )
            .with_postings(vec![
                Posting::new(accounts::REVENUE_ADL, covered, "MNT"),
                Posting::new(accounts::customer_balance(bankrupt), covered.negate(), "MNT"),
            ]);
            self.ledger_append(JournalFile::Liquidations, tx)?;
        }
        if !remaining.is_zero() {
            warn!(symbol = %symbol, uncovered = %remaining, "ADL exhausted all candidates");
        }

        Ok(executions)
    }

    /// ADL rank quintile for a user on a symbol: 1 = safe, 5 = first in
    /// line to be deleveraged.
    pub fn adl_rank(&self, user: &UserId, symbol: &Symbol) -> u8 {
        let state = self.state.lock();
        let Some(position) = state.positions.get(&(user.clone(), symbol.clone())) else {
            return 1;
        };
        if position.unrealized_pnl <= Quote::ZERO {
            return 1;
        }
        let mark = match self.catalog.get(symbol) {
            Some(p) => p.mark_price,
            None => return 1,
        };
        let mut scores: Vec<(UserId, i128)> = Vec::new();
        for ((owner, sym), p) in state.positions.iter() {
            if sym != symbol || p.unrealized_pnl <= Quote::ZERO {
                continue;
            }
            scores.push((owner.clone(), adl_score(p, mark)));
        }
        if scores.is_empty() {
            return 1;
        }
        // descending score: index 0 is first in line for deleveraging
        scores.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let index = scores
            .iter()
            .position(|(owner, _)| owner == user)
            .unwrap_or(scores.len() - 1);
        (5 - index * 5 / scores.len()) as u8
    }

    // --- replay helpers -----------------------------------------------

    /// Mechanical re-application of a recorded liquidation: closes follow
    /// the recorded steps and amounts, no margin ratios re-derived.
    pub fn replay_liquidation(
        &self,
        record: &LiquidationRecord,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        let mut state = self.state.lock();
        let key = (record.user.clone(), record.symbol.clone());
        for step in &record.steps {
            let Some(current) = state.positions.get(&key).cloned() else {
                break;
            };
            let delta = position::reduce(&current, step.qty, step.price, timestamp);
            apply_delta(&mut state, &record.user, &record.symbol, &current, &delta);
            self.post_realized_pnl(
                JournalFile::Liquidations,
                &record.user,
                delta.realized_pnl,
                timestamp,
                &format!(
                    "Liquidation step {}% {} - {}",
                    step.fraction_ppm / 10_000,
                    record.symbol,
                    record.user
                ),
            )?;
            self.post_margin_release(&record.user, delta.margin_released, timestamp)?;
            refresh_position_pnl(&mut state, &key, step.price);
            refresh_account(&mut state, &record.user);
        }

        if !record.insurance_draw.is_zero() {
            state.insurance_fund = state.insurance_fund.sub(record.insurance_draw);
            if let Some(account) = state.accounts.get_mut(&record.user) {
                account.balance = account.balance.add(record.insurance_draw);
            }
        }
        if !record.socialized_loss.is_zero() {
            if let Some(account) = state.accounts.get_mut(&record.user) {
                account.balance = account.balance.add(record.socialized_loss);
            }
        }
        if let Some(account) = state.accounts.get_mut(&record.user) {
            if account.balance.is_negative() {
                account.balance = Quote::ZERO;
            }
        }
        refresh_account(&mut state, &record.user);
        Ok(())
    }

    /// Mechanical re-application of one recorded ADL force-close.
    pub fn replay_adl_close(
        &self,
        user: &UserId,
        symbol: &Symbol,
        qty: Qty,
        price: Price,
        diverted: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        let mut state = self.state.lock();
        let key = (user.clone(), symbol.clone());
        if let Some(current) = state.positions.get(&key).cloned() {
            let delta = position::reduce(&current, qty, price, timestamp);
            apply_delta(&mut state, user, symbol, &current, &delta);
            if let Some(account) = state.accounts.get_mut(user) {
                account.balance = account.balance.sub(diverted);
            }
            refresh_account(&mut state, user);
        }
        Ok(())
    }

    // --- internals -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn settle_party(
        &self,
        state: &mut State,
        user: &UserId,
        product: &Product,
        side: Side,
        qty: Qty,
        price: Price,
        fee: Quote,
        timestamp: Timestamp,
    ) -> Result<(), RiskError> {
        let symbol = product.symbol.clone();
        let key = (user.clone(), symbol.clone());

        state
            .accounts
            .entry(user.clone())
            .or_insert_with(|| UserAccount::new(user.clone()));

        let current = state.positions.get(&key).cloned();
        let delta = match current {
            None => {
                let size = SignedQty::from_side(side, qty);
                let margin = price.notional(qty).apply(product.margin_rate);
                let opened = Position::open(symbol.clone(), size, price, margin, timestamp);
                position::PositionDelta {
                    position: Some(opened),
                    realized_pnl: Quote::ZERO,
                    margin_released: Quote::ZERO,
                    margin_required: margin,
                }
            }
            Some(ref current) if current.size.side() == Some(side) => {
                position::increase(current, qty, price, product.margin_rate, timestamp)
            }
            Some(ref current) if qty <= current.size.abs() => {
                position::reduce(current, qty, price, timestamp)
            }
            Some(ref current) => {
                position::flip(current, qty, price, product.margin_rate, timestamp)
            }
        };

        let pre = current.unwrap_or_else(|| {
            Position::open(
                symbol.clone(),
                SignedQty::ZERO,
                price,
                Quote::ZERO,
                timestamp,
            )
        });
        apply_delta(state, user, &symbol, &pre, &delta);

        // fees come straight off the balance
        if !fee.is_zero() {
            let account = state.accounts.get_mut(user).expect("account exists");
            account.balance = account.balance.sub(fee);
        }

        refresh_position_pnl(state, &key, product.mark_price);
        refresh_account(state, user);

        // ledger: margin moves and realized pnl
        if !delta.margin_required.is_zero() {
            self.post_margin_lock(user, delta.margin_required, timestamp)?;
        }
        if !delta.margin_released.is_zero() {
            self.post_margin_release(user, delta.margin_released, timestamp)?;
        }
        if !delta.realized_pnl.is_zero() {
            self.post_realized_pnl(
                JournalFile::Pnl,
                user,
                delta.realized_pnl,
                timestamp,
                &format!("Realized PnL {} - {}", symbol, user),
            )?;
        }

        Ok(())
    }

    fn post_margin_lock(
        &self,
        user: &UserId,
        amount: Quote,
        timestamp: Timestamp,
    ) -> Result<(), LedgerError> {
        let tx = Transaction::new(timestamp.ledger_date(), format!("Margin lock {user}"))
            .with_postings(vec![
                Posting::new(accounts::customer_balance(user), amount, "MNT"),
                Posting::new(accounts::customer_margin(user), amount.negate(), "MNT"),
            ]);
        self.ledger_append(JournalFile::Margin, tx)
    }

    fn post_margin_release(
        &self,
        user: &UserId,
        amount: Quote,
        timestamp: Timestamp,
    ) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        let tx = Transaction::new(timestamp.ledger_date(), format!("Margin release {user}"))
            .with_postings(vec![
                Posting::new(accounts::customer_margin(user), amount, "MNT"),
                Posting::new(accounts::customer_balance(user), amount.negate(), "MNT"),
            ]);
        self.ledger_append(JournalFile::Margin, tx)
    }

    fn post_realized_pnl(
        &self,
        file: JournalFile,
        user: &UserId,
        pnl: Quote,
        timestamp: Timestamp,
        description: &str,
    ) -> Result<(), LedgerError> {
        if pnl.is_zero() {
            return Ok(());
        }
        let postings = if !pnl.is_negative() {
            vec![
                Posting::new(accounts::EXPENSE_CUSTOMER_PAYOUT, pnl, "MNT"),
                Posting::new(accounts::customer_balance(user), pnl.negate(), "MNT"),
            ]
        } else {
            let loss = pnl.abs();
            vec![
                Posting::new(accounts::customer_balance(user), loss, "MNT"),
                Posting::new(accounts::REVENUE_CUSTOMER_LOSS, loss.negate(), "MNT"),
            ]
        };
        let tx =
            Transaction::new(timestamp.ledger_date(), description.to_string()).with_postings(postings);
        self.ledger_append(file, tx)
    }
}

/// Apply a position delta to the maps, the account cash effects of realized
/// P&L, and the exposure aggregates.
fn apply_delta(
    state: &mut State,
    user: &UserId,
    symbol: &Symbol,
    pre: &Position,
    delta: &position::PositionDelta,
) {
    let key = (user.clone(), symbol.clone());
    let old_size = pre.size;
    let new_size = delta
        .position
        .as_ref()
        .map(|p| p.size)
        .unwrap_or(SignedQty::ZERO);

    match &delta.position {
        Some(position) if !position.is_flat() => {
            state.positions.insert(key, position.clone());
        }
        _ => {
            state.positions.remove(&key);
        }
    }

    let account = state
        .accounts
        .entry(user.clone())
        .or_insert_with(|| UserAccount::new(user.clone()));
    account.balance = account.balance.add(delta.realized_pnl);

    let exposure = state
        .exposures
        .entry(symbol.clone())
        .or_insert_with(|| ExchangeExposure::new(symbol.clone()));
    exposure.net_position = exposure
        .net_position
        .add(SignedQty::from_micro(new_size.micro() - old_size.micro()));
    let oi_delta = new_size.abs().micro() - old_size.abs().micro();
    exposure.open_interest = Qty::from_micro(exposure.open_interest.micro() + oi_delta);
}

fn refresh_position_pnl(state: &mut State, key: &(UserId, Symbol), mark: Price) {
    if let Some(position) = state.positions.get_mut(key) {
        position.mark_to_market(mark);
    }
}

/// Recompute an account's aggregates from its positions.
fn refresh_account(state: &mut State, user: &UserId) {
    let mut margin = Quote::ZERO;
    let mut unrealized = Quote::ZERO;
    for ((owner, _), position) in state.positions.iter() {
        if owner == user {
            margin = margin.add(position.margin_used);
            unrealized = unrealized.add(position.unrealized_pnl);
        }
    }
    if let Some(account) = state.accounts.get_mut(user) {
        account.margin_used = margin;
        account.unrealized_pnl = unrealized;
    }
}

fn worst_case_increase(current: SignedQty, side: Side, qty: Qty) -> Qty {
    match current.side() {
        Some(existing) if existing != side => {
            let reduce = qty.min(current.abs());
            qty.sub(reduce)
        }
        _ => qty,
    }
}

/// score = (unrealized_profit / margin) * leverage, in fixed point. The
/// most profitable, most levered opposing positions go first.
fn adl_score(position: &Position, mark: Price) -> i128 {
    if position.margin_used.is_zero() {
        return 0;
    }
    let notional = position.notional_at(mark).micro() as i128;
    let profit = position.unrealized_pnl.micro() as i128;
    let margin = position.margin_used.micro() as i128;
    // (profit / margin) * (notional / margin), scaled to micro
    profit * notional * MICRO_SCALE as i128 / (margin * margin)
}

fn rank_adl_candidates(
    state: &State,
    symbol: &Symbol,
    bankrupt: &UserId,
    bankrupt_side: Option<Side>,
    mark: Price,
) -> Vec<(UserId, i128)> {
    state
        .positions
        .iter()
        .filter(|((owner, sym), _)| sym == symbol && owner != bankrupt)
        .filter(|(_, p)| match bankrupt_side {
            // opposing side only; with the bankrupt position already fully
            // closed, any profitable position qualifies
            Some(side) => p.size.side() == Some(side.opposite()),
            None => true,
        })
        .filter(|(_, p)| p.unrealized_pnl > Quote::ZERO)
        .map(|((owner, _), p)| (owner.clone(), adl_score(p, mark)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Trade;
    use crate::product::{ProductCategory, ProductSpec};
    use crate::types::{OrderId, TradeId, MICRO_SCALE};
    use tempfile::tempdir;

    fn spec() -> ProductSpec {
        ProductSpec {
            symbol: "XAU-MNT-PERP".to_string(),
            category: ProductCategory::Perpetual,
            quote_currency: "MNT".to_string(),
            external_symbol: None,
            tick_size: 0.1,
            min_order_size: 0.01,
            max_order_size: 1000.0,
            margin_rate: 0.10,
            maker_fee: 0.0,
            taker_fee: 0.0005,
            initial_mark_price: 100.0,
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<ProductCatalog>, PositionManager) {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(ProductCatalog::new());
        catalog.load(&[spec()]).unwrap();
        let ledger = Arc::new(Ledger::open(dir.path(), false).unwrap());
        let manager = PositionManager::new(
            catalog.clone(),
            ledger,
            RiskLimits::default(),
            Rate::from_ppm(200_000),
            Quote::ZERO,
        );
        (dir, catalog, manager)
    }

    fn symbol() -> Symbol {
        Symbol::new("XAU-MNT-PERP").unwrap()
    }

    fn quote(units: i64) -> Quote {
        Quote::from_micro(units * MICRO_SCALE)
    }

    fn trade(taker: &str, maker: &str, taker_side: Side, qty: f64, price_units: i64) -> Trade {
        let quantity = Qty::from_f64(qty).unwrap();
        let price = Price::new_unchecked(price_units * MICRO_SCALE);
        Trade {
            id: TradeId(1),
            symbol: symbol(),
            maker_order_id: OrderId(1),
            taker_order_id: OrderId(2),
            maker_user: UserId::new(maker),
            taker_user: UserId::new(taker),
            taker_side,
            price,
            quantity,
            maker_fee: Quote::ZERO,
            taker_fee: price.notional(quantity).apply(Rate::from_ppm(500)),
            timestamp: Timestamp::from_millis(0),
        }
    }

    #[test]
    fn withdraw_requires_free_funds() {
        let (_dir, catalog, manager) = setup();
        let user = UserId::new("u1");
        manager.deposit(&user, quote(100), Timestamp::from_millis(0)).unwrap();

        let product = catalog.get(&symbol()).unwrap();
        let counter = UserId::new("u2");
        manager.deposit(&counter, quote(10_000), Timestamp::from_millis(0)).unwrap();
        manager
            .apply_trade(&trade("u1", "u2", Side::Buy, 5.0, 100), &product)
            .unwrap();

        // margin 50 locked out of ~99.75 cash
        let account = manager.account(&user).unwrap();
        assert_eq!(account.margin_used, quote(50));
        assert!(manager
            .withdraw(&user, quote(60), Timestamp::from_millis(1))
            .is_err());
        assert!(manager
            .withdraw(&user, quote(40), Timestamp::from_millis(1))
            .is_ok());
    }

    #[test]
    fn check_order_rejects_margin_and_position_limits() {
        let (_dir, catalog, manager) = setup();
        let product = catalog.get(&symbol()).unwrap();
        let user = UserId::new("u1");
        manager.deposit(&user, quote(100), Timestamp::from_millis(0)).unwrap();

        let price = Price::new_unchecked(100 * MICRO_SCALE);
        // 100 balance covers margin for 10 units at 10%
        assert!(manager
            .check_order(&user, &product, Side::Buy, Qty::from_f64(10.0).unwrap(), price, false)
            .is_ok());
        assert!(matches!(
            manager.check_order(
                &user,
                &product,
                Side::Buy,
                Qty::from_f64(10.1).unwrap(),
                price,
                false
            ),
            Err(RiskError::InsufficientMargin { .. })
        ));

        // reduce-only with no position
        assert!(matches!(
            manager.check_order(
                &user,
                &product,
                Side::Sell,
                Qty::from_f64(1.0).unwrap(),
                price,
                true
            ),
            Err(RiskError::NoOpposingPosition)
        ));
    }

    #[test]
    fn apply_trade_settles_both_sides() {
        let (_dir, catalog, manager) = setup();
        let product = catalog.get(&symbol()).unwrap();
        manager.deposit(&UserId::new("buyer"), quote(1_000), Timestamp::from_millis(0)).unwrap();
        manager.deposit(&UserId::new("seller"), quote(1_000), Timestamp::from_millis(0)).unwrap();

        let settlement = manager
            .apply_trade(&trade("buyer", "seller", Side::Buy, 1.0, 100), &product)
            .unwrap();

        // taker fee 0.05, a fifth of it to the fund
        assert_eq!(settlement.insurance_contribution.micro(), 10_000);
        assert_eq!(manager.insurance_fund().micro(), 10_000);

        let long = manager.position(&UserId::new("buyer"), &symbol()).unwrap();
        assert_eq!(long.size.micro(), MICRO_SCALE);
        let short = manager.position(&UserId::new("seller"), &symbol()).unwrap();
        assert_eq!(short.size.micro(), -MICRO_SCALE);

        // open interest and net exposure
        let exposure = manager.exposure(&symbol()).unwrap();
        assert_eq!(exposure.open_interest.micro(), 2 * MICRO_SCALE);
        assert!(exposure.net_position.is_zero());
    }

    #[test]
    fn graduated_steps_insurance_and_zero_floor() {
        let (_dir, catalog, manager) = setup();
        let product = catalog.get(&symbol()).unwrap();
        manager.contribute_insurance(quote(30), Timestamp::from_millis(0)).unwrap();
        manager.deposit(&UserId::new("eve"), quote(10), Timestamp::from_millis(0)).unwrap();
        manager.deposit(&UserId::new("frank"), quote(10_000), Timestamp::from_millis(0)).unwrap();

        // eve long 1 @ 100 as maker (no fee)
        manager
            .apply_trade(&trade("frank", "eve", Side::Sell, 1.0, 100), &product)
            .unwrap();

        catalog
            .set_mark_price(&symbol(), Price::new_unchecked(85 * MICRO_SCALE))
            .unwrap();
        manager.mark_to_market(&symbol(), Price::new_unchecked(85 * MICRO_SCALE));

        let eve = UserId::new("eve");
        assert!(manager.account(&eve).unwrap().is_undermargined());

        let outcomes = manager.liquidate(&eve, Timestamp::from_millis(1)).unwrap();
        assert_eq!(outcomes.len(), 1);
        let record = &outcomes[0].record;
        assert_eq!(record.steps.len(), 3);
        assert_eq!(record.steps[0].qty, Qty::from_f64(0.25).unwrap());
        assert_eq!(record.steps[1].qty, Qty::from_f64(0.5).unwrap());
        assert_eq!(record.steps[2].qty, Qty::from_f64(0.25).unwrap());
        assert_eq!(record.steps[0].realized_pnl, quote(-15).apply(Rate::from_ppm(250_000)));
        assert_eq!(record.insurance_draw, quote(5));
        assert!(record.socialized_loss.is_zero());

        let account = manager.account(&eve).unwrap();
        assert_eq!(account.balance, Quote::ZERO);
        assert!(manager.positions_of(&eve).is_empty());
    }

    #[test]
    fn adl_rank_is_five_for_the_only_candidate() {
        let (_dir, catalog, manager) = setup();
        let product = catalog.get(&symbol()).unwrap();
        manager.deposit(&UserId::new("long"), quote(10_000), Timestamp::from_millis(0)).unwrap();
        manager.deposit(&UserId::new("short"), quote(10_000), Timestamp::from_millis(0)).unwrap();

        manager
            .apply_trade(&trade("long", "short", Side::Buy, 1.0, 100), &product)
            .unwrap();
        catalog
            .set_mark_price(&symbol(), Price::new_unchecked(110 * MICRO_SCALE))
            .unwrap();
        manager.mark_to_market(&symbol(), Price::new_unchecked(110 * MICRO_SCALE));

        assert_eq!(manager.adl_rank(&UserId::new("long"), &symbol()), 5);
        assert_eq!(manager.adl_rank(&UserId::new("short"), &symbol()), 1);
    }
}
