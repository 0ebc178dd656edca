//! Matching engine.
//!
//! Price-time priority matching, one shard per symbol. A shard's lock
//! serializes submit/cancel/modify for that symbol while other symbols
//! proceed in parallel. Executions always happen at the maker's price. The
//! position manager is consulted before the book is touched (conditional
//! margin and limit check) and again after every trade (settlement), both
//! as short critical sections inside the symbol lock.
//!
//! A shard that detects a broken book invariant is poisoned: it rejects
//! everything for that symbol until the exchange rebuilds it from the event
//! journal.

use crate::book::{BookLevel, Order, OrderBook, OrderStatus, OrderType, Trade};
use crate::manager::{PositionManager, RiskError};
use crate::product::{Product, ProductCatalog, ProductError};
use crate::types::{OrderId, Price, Qty, Side, Symbol, Timestamp, TradeId, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

const RECENT_TRADES_KEPT: usize = 100;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchError {
    #[error(transparent)]
    Product(#[from] ProductError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("post-only order would cross the book")]
    PostOnlyWouldCross,

    #[error("fill-or-kill: resting depth {available} below requested {requested}")]
    FokInsufficientDepth { requested: Qty, available: Qty },

    #[error("order type requires a price")]
    MissingPrice,

    #[error("stop-limit order requires a stop price")]
    MissingStopPrice,

    #[error("order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("order {0:?} belongs to another user")]
    NotOrderOwner(OrderId),

    #[error("modified order would cross the book")]
    ModifyWouldCross,

    #[error("symbol {0} is poisoned after an invariant breach; rebuild required")]
    SymbolPoisoned(Symbol),
}

/// Band limits injected by the circuit-breaker layer. Matching never
/// executes a trade at a maker price outside them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceLimits {
    pub min: Option<Price>,
    pub max: Option<Price>,
}

impl PriceLimits {
    pub fn none() -> Self {
        Self::default()
    }

    fn allows(&self, price: Price) -> bool {
        if let Some(min) = self.min {
            if price < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if price > max {
                return false;
            }
        }
        true
    }
}

/// What a submission did: the order's terminal state, the taker's trades,
/// and any stop orders that the trade sequence activated (with their own
/// trades, in activation order).
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub order: Order,
    pub trades: Vec<Trade>,
    pub stop_activations: Vec<StopActivation>,
}

#[derive(Debug, Clone)]
pub struct StopActivation {
    pub order: Order,
    pub trades: Vec<Trade>,
}

/// How a cancel-replace resolved, so the caller can journal it faithfully.
#[derive(Debug, Clone)]
pub enum ModifyOutcome {
    /// Same-price quantity decrease, level position kept.
    Reduced { order: Order },
    /// Re-entered at the back of its (possibly new) level.
    Replaced { order: Order },
}

impl ModifyOutcome {
    pub fn order(&self) -> &Order {
        match self {
            ModifyOutcome::Reduced { order } | ModifyOutcome::Replaced { order } => order,
        }
    }
}

/// Everything the exchange layer must supply for one submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub user: UserId,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub quantity: Qty,
    pub client_id: Option<String>,
    pub reduce_only: bool,
}

#[derive(Debug)]
struct Shard {
    book: OrderBook,
    next_order_id: u64,
    last_price: Option<Price>,
    recent: VecDeque<Trade>,
    poisoned: bool,
}

impl Shard {
    fn new() -> Self {
        Self {
            book: OrderBook::new(),
            next_order_id: 1,
            last_price: None,
            recent: VecDeque::with_capacity(RECENT_TRADES_KEPT),
            poisoned: false,
        }
    }
}

// 11.0: the engine. shards map is read-mostly; each shard mutates only under
// its own lock.
pub struct MatchingEngine {
    catalog: Arc<ProductCatalog>,
    manager: Arc<PositionManager>,
    shards: RwLock<HashMap<Symbol, Arc<Mutex<Shard>>>>,
    trade_seq: AtomicU64,
}

impl MatchingEngine {
    pub fn new(catalog: Arc<ProductCatalog>, manager: Arc<PositionManager>) -> Self {
        Self {
            catalog,
            manager,
            shards: RwLock::new(HashMap::new()),
            trade_seq: AtomicU64::new(1),
        }
    }

    fn shard(&self, symbol: &Symbol) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self.shards.read().get(symbol) {
            return shard.clone();
        }
        let mut shards = self.shards.write();
        shards
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Shard::new())))
            .clone()
    }

    /// Submit an order. Validation and the conditional margin check happen
    /// before the book is touched; on success the order's terminal status
    /// is in the result.
    pub fn submit(
        &self,
        request: OrderRequest,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<SubmitResult, MatchError> {
        let product = self.catalog.get_active(&request.symbol)?;
        let shard_handle = self.shard(&request.symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(request.symbol.clone()));
        }

        self.validate(&request, &product)?;

        // margin and limits against the order's worst case
        let reference = self.reference_price(&shard, &request, &product);
        self.manager.check_order(
            &request.user,
            &product,
            request.side,
            request.quantity,
            reference,
            request.reduce_only,
        )?;

        let order_id = OrderId(shard.next_order_id);
        shard.next_order_id += 1;
        let order = Order::new(
            order_id,
            request.symbol.clone(),
            request.user.clone(),
            request.side,
            request.order_type,
            request.price,
            request.stop_price,
            request.quantity,
            request.client_id.clone(),
            request.reduce_only,
            timestamp,
        );

        self.execute_order(&mut shard, order, &product, bands, timestamp)
    }

    /// Re-run a journaled submission during recovery. The recorded order id
    /// is honored and the id counter advanced past it; matching follows the
    /// recorded band clamp, so the rebuilt book equals the live one.
    pub fn replay_submit(
        &self,
        order: Order,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<SubmitResult, MatchError> {
        let product = self.catalog.get_active(&order.symbol)?;
        let shard_handle = self.shard(&order.symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(order.symbol.clone()));
        }
        shard.next_order_id = shard.next_order_id.max(order.id.0 + 1);

        let mut pristine = order;
        pristine.remaining_qty = pristine.quantity;
        pristine.filled_qty = Qty::ZERO;
        pristine.status = OrderStatus::Pending;
        self.execute_order(&mut shard, pristine, &product, bands, timestamp)
    }

    fn execute_order(
        &self,
        shard: &mut Shard,
        order: Order,
        product: &Product,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<SubmitResult, MatchError> {
        let request_symbol = order.symbol.clone();

        // stop-limits park without matching
        if order.order_type == OrderType::StopLimit {
            let mut parked = order;
            parked.status = OrderStatus::Open;
            shard.book.insert_stop(parked.clone());
            debug!(symbol = %request_symbol, id = parked.id.0, stop = %parked.stop_price.expect("validated"), "stop order parked");
            return Ok(SubmitResult {
                order: parked,
                trades: Vec::new(),
                stop_activations: Vec::new(),
            });
        }

        if order.order_type == OrderType::PostOnly && self.would_cross(shard, &order) {
            return Err(MatchError::PostOnlyWouldCross);
        }
        if order.order_type == OrderType::Fok {
            // walk exactly what matching would consume: crossing prices,
            // inside the bands, stopping at our own resting order
            let mut available = Qty::ZERO;
            for resting in shard.book.opposing_iter(order.side) {
                let maker_price = resting.price.expect("resting orders carry prices");
                let crosses = match order.price {
                    None => true,
                    Some(limit) => match order.side {
                        Side::Buy => limit >= maker_price,
                        Side::Sell => limit <= maker_price,
                    },
                };
                if !crosses || !bands.allows(maker_price) || resting.user_id == order.user_id {
                    break;
                }
                available = available.add(resting.remaining_qty);
                if available >= order.quantity {
                    break;
                }
            }
            if available < order.quantity {
                return Err(MatchError::FokInsufficientDepth {
                    requested: order.quantity,
                    available,
                });
            }
        }

        let (order, trades) = self.run_match(shard, order, product, bands, timestamp)?;
        self.check_book_invariants(shard, &request_symbol)?;

        let stop_activations = if trades.is_empty() {
            Vec::new()
        } else {
            self.fire_stops(shard, product, bands, timestamp)?
        };

        Ok(SubmitResult {
            order,
            trades,
            stop_activations,
        })
    }

    /// Cancel a resting or parked order. Only the owner may cancel.
    pub fn cancel(
        &self,
        symbol: &Symbol,
        order_id: OrderId,
        user: &UserId,
        timestamp: Timestamp,
    ) -> Result<Option<Order>, MatchError> {
        let shard_handle = self.shard(symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(symbol.clone()));
        }

        match shard.book.get(order_id) {
            None => return Ok(None),
            Some(order) if &order.user_id != user => {
                return Err(MatchError::NotOrderOwner(order_id));
            }
            Some(_) => {}
        }
        let mut cancelled = shard.book.remove(order_id).expect("present above");
        cancelled.status = OrderStatus::Cancelled;
        cancelled.updated_at = timestamp;
        Ok(Some(cancelled))
    }

    /// Cancel everything a user has resting or parked on a symbol.
    pub fn cancel_all(
        &self,
        symbol: &Symbol,
        user: &UserId,
        timestamp: Timestamp,
    ) -> Result<Vec<Order>, MatchError> {
        let shard_handle = self.shard(symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(symbol.clone()));
        }
        let ids: Vec<OrderId> = shard
            .book
            .user_orders(user)
            .into_iter()
            .map(|o| o.id)
            .collect();
        let mut cancelled = Vec::new();
        for id in ids {
            if let Some(mut order) = shard.book.remove(id) {
                order.status = OrderStatus::Cancelled;
                order.updated_at = timestamp;
                cancelled.push(order);
            }
        }
        Ok(cancelled)
    }

    /// Cancel-and-replace. A same-price quantity decrease keeps time
    /// priority; any price change or quantity increase re-enters the back
    /// of its level. The replacement must still rest: a price that would
    /// cross is rejected with the original untouched.
    pub fn modify(
        &self,
        symbol: &Symbol,
        order_id: OrderId,
        user: &UserId,
        new_price: Option<Price>,
        new_qty: Option<Qty>,
        timestamp: Timestamp,
    ) -> Result<Option<ModifyOutcome>, MatchError> {
        let product = self.catalog.get_active(symbol)?;
        let shard_handle = self.shard(symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(symbol.clone()));
        }

        let current = match shard.book.get(order_id) {
            None => return Ok(None),
            Some(order) => order.clone(),
        };
        if &current.user_id != user {
            return Err(MatchError::NotOrderOwner(order_id));
        }
        // parked stops are cancel-and-resubmit only
        if current.order_type == OrderType::StopLimit {
            return Ok(None);
        }

        let price = match new_price {
            Some(p) => {
                product.validate_price(p)?;
                p
            }
            None => current.price.ok_or(MatchError::MissingPrice)?,
        };
        let remaining = match new_qty {
            Some(q) => {
                product.validate_qty(q)?;
                // the already-filled part stays filled
                if q <= current.filled_qty {
                    return Ok(None);
                }
                q.sub(current.filled_qty)
            }
            None => current.remaining_qty,
        };

        let same_price = current.price == Some(price);
        if same_price && remaining < current.remaining_qty {
            if !shard.book.decrease_qty(order_id, remaining) {
                return Ok(None);
            }
            let order = shard.book.get(order_id).expect("still resting").clone();
            return Ok(Some(ModifyOutcome::Reduced { order }));
        }

        // replacement must rest, never trade
        let crosses = match shard.book.best_opposing(current.side) {
            Some(head) => {
                let head_price = head.price.expect("resting orders carry prices");
                match current.side {
                    Side::Buy => price >= head_price,
                    Side::Sell => price <= head_price,
                }
            }
            None => false,
        };
        if crosses {
            return Err(MatchError::ModifyWouldCross);
        }

        let mut replaced = shard.book.remove(order_id).expect("present above");
        replaced.price = Some(price);
        replaced.quantity = replaced.filled_qty.add(remaining);
        replaced.remaining_qty = remaining;
        replaced.updated_at = timestamp;
        shard.book.insert(replaced.clone());
        Ok(Some(ModifyOutcome::Replaced { order: replaced }))
    }

    /// Replay a journaled same-price quantity decrease in place.
    pub fn replay_reduce(
        &self,
        symbol: &Symbol,
        order_id: OrderId,
        new_remaining: Qty,
    ) -> Result<bool, MatchError> {
        let shard_handle = self.shard(symbol);
        let mut shard = shard_handle.lock();
        if shard.poisoned {
            return Err(MatchError::SymbolPoisoned(symbol.clone()));
        }
        Ok(shard.book.decrease_qty(order_id, new_remaining))
    }

    pub fn get_order(&self, symbol: &Symbol, order_id: OrderId) -> Option<Order> {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        shard.book.get(order_id).cloned()
    }

    pub fn user_orders(&self, symbol: &Symbol, user: &UserId) -> Vec<Order> {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        shard.book.user_orders(user)
    }

    pub fn depth(&self, symbol: &Symbol, levels: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        (shard.book.bid_levels(levels), shard.book.ask_levels(levels))
    }

    pub fn bbo(&self, symbol: &Symbol) -> (Option<Price>, Option<Price>) {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        (shard.book.best_bid(), shard.book.best_ask())
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<Price> {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        shard.last_price
    }

    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Vec<Trade> {
        let shard_handle = self.shard(symbol);
        let shard = shard_handle.lock();
        shard.recent.iter().rev().take(limit).cloned().collect()
    }

    /// Drop a poisoned shard so the exchange can rebuild it by replay.
    pub fn reset_symbol(&self, symbol: &Symbol) {
        self.shards.write().remove(symbol);
    }

    // --- internals -----------------------------------------------------

    fn validate(&self, request: &OrderRequest, product: &Product) -> Result<(), MatchError> {
        product.validate_qty(request.quantity)?;
        if request.order_type.requires_price() {
            let price = request.price.ok_or(MatchError::MissingPrice)?;
            product.validate_price(price)?;
        }
        if request.order_type == OrderType::StopLimit {
            let stop = request.stop_price.ok_or(MatchError::MissingStopPrice)?;
            product.validate_price(stop)?;
        }
        if request.reduce_only {
            let opposes = self
                .manager
                .position(&request.user, &request.symbol)
                .map(|p| {
                    p.size.side() == Some(request.side.opposite())
                        && request.quantity <= p.size.abs()
                })
                .unwrap_or(false);
            if !opposes {
                return Err(MatchError::Risk(RiskError::NoOpposingPosition));
            }
        }
        Ok(())
    }

    /// Worst-case execution price for the margin pre-check: the limit price
    /// when there is one, otherwise top of the opposite side, otherwise
    /// mark.
    fn reference_price(&self, shard: &Shard, request: &OrderRequest, product: &Product) -> Price {
        if let Some(price) = request.price {
            return price;
        }
        shard
            .book
            .best_opposing(request.side)
            .and_then(|o| o.price)
            .unwrap_or(product.mark_price)
    }

    fn would_cross(&self, shard: &Shard, order: &Order) -> bool {
        let Some(limit) = order.price else {
            return shard.book.best_opposing(order.side).is_some();
        };
        match shard.book.best_opposing(order.side) {
            Some(head) => {
                let head_price = head.price.expect("resting orders carry prices");
                match order.side {
                    Side::Buy => limit >= head_price,
                    Side::Sell => limit <= head_price,
                }
            }
            None => false,
        }
    }

    /// The core loop: walk the opposite side while the taker crosses,
    /// execute at maker prices, settle each trade with the position
    /// manager.
    fn run_match(
        &self,
        shard: &mut Shard,
        mut taker: Order,
        product: &Product,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<(Order, Vec<Trade>), MatchError> {
        let mut trades = Vec::new();

        while !taker.remaining_qty.is_zero() {
            let head = match shard.book.best_opposing(taker.side) {
                Some(head) => head,
                None => break,
            };
            let maker_price = head.price.expect("resting orders carry prices");
            let crosses = match taker.price {
                None => true, // market orders always cross
                Some(limit) => match taker.side {
                    Side::Buy => limit >= maker_price,
                    Side::Sell => limit <= maker_price,
                },
            };
            if !crosses || !bands.allows(maker_price) {
                break;
            }
            // no self-trading: the head maker being our own order ends the walk
            if head.user_id == taker.user_id {
                break;
            }

            let maker_id = head.id;
            let maker_user = head.user_id.clone();
            let fill_qty = taker.remaining_qty.min(head.remaining_qty);

            let notional = maker_price.notional(fill_qty);
            let trade = Trade {
                id: TradeId(self.trade_seq.fetch_add(1, Ordering::SeqCst)),
                symbol: taker.symbol.clone(),
                maker_order_id: maker_id,
                taker_order_id: taker.id,
                maker_user: maker_user.clone(),
                taker_user: taker.user_id.clone(),
                taker_side: taker.side,
                price: maker_price,
                quantity: fill_qty,
                maker_fee: notional.apply(product.maker_fee),
                taker_fee: notional.apply(product.taker_fee),
                timestamp,
            };

            taker.fill(fill_qty, timestamp);
            let maker_filled = {
                let maker = shard
                    .book
                    .best_opposing_mut(taker.side)
                    .expect("head still present");
                maker.fill(fill_qty, timestamp);
                maker.is_filled()
            };
            if maker_filled {
                shard.book.remove(maker_id);
            }

            // settlement inside the symbol lock, short and bounded
            if let Err(err) = self.manager.apply_trade(&trade, product) {
                error!(symbol = %taker.symbol, trade = trade.id.0, %err, "settlement failed after book mutation; poisoning symbol");
                shard.poisoned = true;
                return Err(MatchError::SymbolPoisoned(taker.symbol.clone()));
            }

            shard.last_price = Some(maker_price);
            if shard.recent.len() == RECENT_TRADES_KEPT {
                shard.recent.pop_front();
            }
            shard.recent.push_back(trade.clone());
            trades.push(trade);
        }

        // remainder disposition by order type
        match taker.order_type {
            OrderType::Limit | OrderType::PostOnly => {
                if !taker.remaining_qty.is_zero() {
                    // a remainder that still crosses was blocked by a band
                    // or by our own resting order; resting it would cross
                    // the book, so it cancels instead
                    if self.would_cross(shard, &taker) {
                        taker.status = OrderStatus::Cancelled;
                    } else {
                        shard.book.insert(taker.clone());
                        taker.status = if taker.filled_qty.is_zero() {
                            OrderStatus::Open
                        } else {
                            OrderStatus::Partial
                        };
                    }
                }
            }
            OrderType::Market | OrderType::Ioc => {
                if !taker.remaining_qty.is_zero() {
                    taker.status = OrderStatus::Cancelled;
                }
            }
            OrderType::Fok => {
                // depth was pre-checked; a partial here is an engine bug
                debug_assert!(taker.remaining_qty.is_zero(), "FOK must fill completely");
                if !taker.remaining_qty.is_zero() {
                    taker.status = OrderStatus::Cancelled;
                }
            }
            OrderType::StopLimit => unreachable!("stops are parked before matching"),
        }

        Ok((taker, trades))
    }

    /// After a trade sequence, pop and execute any stops whose trigger
    /// crossed. Activations run strictly after the triggering sequence, in
    /// trigger-price order, and may cascade.
    fn fire_stops(
        &self,
        shard: &mut Shard,
        product: &Product,
        bands: PriceLimits,
        timestamp: Timestamp,
    ) -> Result<Vec<StopActivation>, MatchError> {
        let mut activations = Vec::new();

        loop {
            let Some(last) = shard.last_price else {
                break;
            };
            let triggered = shard.book.take_triggered_stops(last);
            if triggered.is_empty() {
                break;
            }
            for stop in triggered {
                let limit_price = stop.price.expect("stop-limits carry a limit price");
                let mut activated = stop.clone();
                activated.order_type = OrderType::Limit;
                activated.stop_price = None;
                activated.updated_at = timestamp;

                // margin is checked at activation, not while parked
                let check = self.manager.check_order(
                    &activated.user_id,
                    product,
                    activated.side,
                    activated.remaining_qty,
                    limit_price,
                    activated.reduce_only,
                );
                if let Err(err) = check {
                    debug!(id = activated.id.0, %err, "triggered stop rejected");
                    activated.status = OrderStatus::Rejected;
                    activations.push(StopActivation {
                        order: activated,
                        trades: Vec::new(),
                    });
                    continue;
                }

                let (final_order, trades) =
                    self.run_match(shard, activated, product, bands, timestamp)?;
                activations.push(StopActivation {
                    order: final_order,
                    trades,
                });
            }
        }

        Ok(activations)
    }

    fn check_book_invariants(
        &self,
        shard: &mut Shard,
        symbol: &Symbol,
    ) -> Result<(), MatchError> {
        if shard.book.is_crossed() {
            error!(symbol = %symbol, "book crossed after matching; poisoning symbol");
            shard.poisoned = true;
            return Err(MatchError::SymbolPoisoned(symbol.clone()));
        }
        Ok(())
    }
}
