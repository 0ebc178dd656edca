// 4.0: order model and the per-symbol book. bids and asks are btree maps keyed
// by (price, arrival seq) so FIFO inside a price level falls out of the key
// order. a side index gives O(log n) cancel/modify. stop orders wait in their
// own sets until triggered.

use crate::types::{OrderId, Price, Qty, Quote, Side, Symbol, Timestamp, TradeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    /// Immediate-or-cancel: fill what crosses, cancel the rest.
    Ioc,
    /// Fill-or-kill: full quantity or nothing, checked before matching.
    Fok,
    /// Maker-only: rejected if it would cross.
    PostOnly,
    /// Parks in the stop set; re-enters as a Limit when the last trade
    /// price crosses the stop.
    StopLimit,
}

impl OrderType {
    pub fn requires_price(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub user_id: UserId,
    pub side: Side,
    pub order_type: OrderType,
    /// None only for Market orders.
    pub price: Option<Price>,
    /// Present only for StopLimit orders.
    pub stop_price: Option<Price>,
    pub quantity: Qty,
    pub filled_qty: Qty,
    pub remaining_qty: Qty,
    pub status: OrderStatus,
    pub client_id: Option<String>,
    pub reduce_only: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OrderId,
        symbol: Symbol,
        user_id: UserId,
        side: Side,
        order_type: OrderType,
        price: Option<Price>,
        stop_price: Option<Price>,
        quantity: Qty,
        client_id: Option<String>,
        reduce_only: bool,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            symbol,
            user_id,
            side,
            order_type,
            price,
            stop_price,
            quantity,
            filled_qty: Qty::ZERO,
            remaining_qty: quantity,
            status: OrderStatus::Pending,
            client_id,
            reduce_only,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.remaining_qty.is_zero()
    }

    /// filled + remaining == quantity stays true through every fill.
    pub fn fill(&mut self, qty: Qty, timestamp: Timestamp) {
        debug_assert!(qty <= self.remaining_qty, "cannot fill more than remaining");
        self.filled_qty = self.filled_qty.add(qty);
        self.remaining_qty = self.remaining_qty.sub(qty);
        self.status = if self.remaining_qty.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.updated_at = timestamp;
    }
}

/// An execution between a resting maker and an incoming taker. Immutable
/// once recorded; the price is always the maker's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: Symbol,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub maker_user: UserId,
    pub taker_user: UserId,
    pub taker_side: Side,
    pub price: Price,
    pub quantity: Qty,
    pub maker_fee: Quote,
    pub taker_fee: Quote,
    pub timestamp: Timestamp,
}

impl Trade {
    pub fn notional(&self) -> Quote {
        self.price.notional(self.quantity)
    }

    pub fn maker_side(&self) -> Side {
        self.taker_side.opposite()
    }
}

// 4.1: key inside a side. price order first, then arrival sequence. the
// sequence is book-assigned on insertion, so a cancel-replace naturally goes
// to the back of its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct LevelKey {
    price: Price,
    seq: u64,
}

/// Aggregated view of one price level, for depth snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub total_qty: Qty,
    pub order_count: usize,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Ascending by key; best bid is the last entry.
    bids: BTreeMap<LevelKey, Order>,
    /// Ascending by key; best ask is the first entry.
    asks: BTreeMap<LevelKey, Order>,
    index: HashMap<OrderId, (Side, LevelKey)>,
    /// Buy stops trigger when last >= stop, lowest stop first.
    buy_stops: BTreeMap<(Price, OrderId), Order>,
    /// Sell stops trigger when last <= stop, highest stop first.
    sell_stops: BTreeMap<(Price, OrderId), Order>,
    /// Arrival counter feeding [`LevelKey::seq`].
    next_seq: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next_back().map(|k| k.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().map(|k| k.price)
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn stop_count(&self) -> usize {
        self.buy_stops.len() + self.sell_stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Rest a limit order. The caller has already matched it; whatever
    /// remains goes into the side structure at the back of its level.
    pub fn insert(&mut self, mut order: Order) {
        let price = order.price.expect("resting order must carry a price");
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Open;
        }
        self.next_seq += 1;
        let key = LevelKey {
            price,
            seq: self.next_seq,
        };
        self.index.insert(order.id, (order.side, key));
        match order.side {
            Side::Buy => self.bids.insert(key, order),
            Side::Sell => self.asks.insert(key, order),
        };
    }

    /// In-place quantity decrease. Keeps level position, which is exactly
    /// why only a same-price decrease may use it.
    pub fn decrease_qty(&mut self, order_id: OrderId, new_remaining: Qty) -> bool {
        let Some((side, key)) = self.index.get(&order_id).copied() else {
            return false;
        };
        let order = match side {
            Side::Buy => self.bids.get_mut(&key),
            Side::Sell => self.asks.get_mut(&key),
        };
        match order {
            Some(order) if !new_remaining.is_zero() && new_remaining < order.remaining_qty => {
                order.quantity = order.quantity.sub(order.remaining_qty.sub(new_remaining));
                order.remaining_qty = new_remaining;
                true
            }
            _ => false,
        }
    }

    pub fn insert_stop(&mut self, order: Order) {
        let stop = order.stop_price.expect("stop order must carry a stop price");
        match order.side {
            Side::Buy => self.buy_stops.insert((stop, order.id), order),
            Side::Sell => self.sell_stops.insert((stop, order.id), order),
        };
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        if let Some((side, key)) = self.index.remove(&order_id) {
            return match side {
                Side::Buy => self.bids.remove(&key),
                Side::Sell => self.asks.remove(&key),
            };
        }
        // not resting; might be a parked stop
        self.remove_stop(order_id)
    }

    fn remove_stop(&mut self, order_id: OrderId) -> Option<Order> {
        if let Some(key) = self
            .buy_stops
            .keys()
            .find(|(_, id)| *id == order_id)
            .copied()
        {
            return self.buy_stops.remove(&key);
        }
        if let Some(key) = self
            .sell_stops
            .keys()
            .find(|(_, id)| *id == order_id)
            .copied()
        {
            return self.sell_stops.remove(&key);
        }
        None
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        if let Some((side, key)) = self.index.get(&order_id) {
            return match side {
                Side::Buy => self.bids.get(key),
                Side::Sell => self.asks.get(key),
            };
        }
        self.buy_stops
            .values()
            .chain(self.sell_stops.values())
            .find(|o| o.id == order_id)
    }

    /// Head of the opposite side for an incoming taker.
    pub fn best_opposing(&self, taker_side: Side) -> Option<&Order> {
        match taker_side {
            Side::Buy => self.asks.values().next(),
            Side::Sell => self.bids.values().next_back(),
        }
    }

    pub fn best_opposing_mut(&mut self, taker_side: Side) -> Option<&mut Order> {
        match taker_side {
            Side::Buy => self.asks.values_mut().next(),
            Side::Sell => self.bids.values_mut().next_back(),
        }
    }

    /// Best-first walk of the opposite side, the order matching consumes it.
    pub fn opposing_iter(&self, taker_side: Side) -> Box<dyn Iterator<Item = &Order> + '_> {
        match taker_side {
            Side::Buy => Box::new(self.asks.values()),
            Side::Sell => Box::new(self.bids.values().rev()),
        }
    }

    /// Resting quantity on the opposite side at prices acceptable to the
    /// taker. Fill-or-kill pre-checks with this before touching the book.
    pub fn opposing_qty_within(&self, taker_side: Side, limit: Option<Price>) -> Qty {
        let mut total = Qty::ZERO;
        match taker_side {
            Side::Buy => {
                for (key, order) in self.asks.iter() {
                    if let Some(limit) = limit {
                        if key.price > limit {
                            break;
                        }
                    }
                    total = total.add(order.remaining_qty);
                }
            }
            Side::Sell => {
                for (key, order) in self.bids.iter().rev() {
                    if let Some(limit) = limit {
                        if key.price < limit {
                            break;
                        }
                    }
                    total = total.add(order.remaining_qty);
                }
            }
        }
        total
    }

    pub fn bid_levels(&self, max_levels: usize) -> Vec<BookLevel> {
        aggregate_levels(self.bids.iter().rev().map(|(k, o)| (k.price, o)), max_levels)
    }

    pub fn ask_levels(&self, max_levels: usize) -> Vec<BookLevel> {
        aggregate_levels(self.asks.iter().map(|(k, o)| (k.price, o)), max_levels)
    }

    pub fn user_orders(&self, user: &UserId) -> Vec<Order> {
        self.bids
            .values()
            .chain(self.asks.values())
            .chain(self.buy_stops.values())
            .chain(self.sell_stops.values())
            .filter(|o| &o.user_id == user)
            .cloned()
            .collect()
    }

    /// Pop every stop whose trigger has been crossed by `last`, in trigger
    /// order: buy stops ascending, sell stops descending.
    pub fn take_triggered_stops(&mut self, last: Price) -> Vec<Order> {
        let mut triggered = Vec::new();

        let buy_keys: Vec<_> = self
            .buy_stops
            .range(..=(last, OrderId(u64::MAX)))
            .map(|(k, _)| *k)
            .collect();
        for key in buy_keys {
            if let Some(order) = self.buy_stops.remove(&key) {
                triggered.push(order);
            }
        }

        let sell_keys: Vec<_> = self
            .sell_stops
            .range((last, OrderId(0))..)
            .map(|(k, _)| *k)
            .rev()
            .collect();
        for key in sell_keys {
            if let Some(order) = self.sell_stops.remove(&key) {
                triggered.push(order);
            }
        }

        triggered
    }
}

fn aggregate_levels<'a>(
    orders: impl Iterator<Item = (Price, &'a Order)>,
    max_levels: usize,
) -> Vec<BookLevel> {
    let mut levels: Vec<BookLevel> = Vec::new();
    for (price, order) in orders {
        match levels.last_mut() {
            Some(level) if level.price == price => {
                level.total_qty = level.total_qty.add(order.remaining_qty);
                level.order_count += 1;
            }
            _ => {
                if levels.len() >= max_levels {
                    break;
                }
                levels.push(BookLevel {
                    price,
                    total_qty: order.remaining_qty,
                    order_count: 1,
                });
            }
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MICRO_SCALE;

    fn order(id: u64, side: Side, price: i64, qty: f64) -> Order {
        Order::new(
            OrderId(id),
            Symbol::new("XAU-MNT-PERP").unwrap(),
            UserId::new(format!("user{id}")),
            side,
            OrderType::Limit,
            Some(Price::new_unchecked(price * MICRO_SCALE)),
            None,
            Qty::from_f64(qty).unwrap(),
            None,
            false,
            Timestamp::from_millis(id as i64),
        )
    }

    fn stop_order(id: u64, side: Side, stop: i64, limit: i64) -> Order {
        Order::new(
            OrderId(id),
            Symbol::new("XAU-MNT-PERP").unwrap(),
            UserId::new(format!("user{id}")),
            side,
            OrderType::StopLimit,
            Some(Price::new_unchecked(limit * MICRO_SCALE)),
            Some(Price::new_unchecked(stop * MICRO_SCALE)),
            Qty::from_f64(1.0).unwrap(),
            None,
            false,
            Timestamp::from_millis(id as i64),
        )
    }

    #[test]
    fn best_prices_and_cross_detection() {
        let mut book = OrderBook::new();
        assert!(book.best_bid().is_none());

        book.insert(order(1, Side::Buy, 99, 1.0));
        book.insert(order(2, Side::Sell, 101, 1.0));
        assert_eq!(book.best_bid().unwrap().micro(), 99 * MICRO_SCALE);
        assert_eq!(book.best_ask().unwrap().micro(), 101 * MICRO_SCALE);
        assert!(!book.is_crossed());

        book.insert(order(3, Side::Buy, 102, 1.0));
        assert!(book.is_crossed());
    }

    #[test]
    fn fifo_within_level() {
        let mut book = OrderBook::new();
        book.insert(order(2, Side::Sell, 100, 1.0));
        book.insert(order(5, Side::Sell, 100, 1.0));
        book.insert(order(3, Side::Sell, 100, 1.0));

        // first inserted at the level is the head
        assert_eq!(book.best_opposing(Side::Buy).unwrap().id, OrderId(2));
        book.remove(OrderId(2));
        assert_eq!(book.best_opposing(Side::Buy).unwrap().id, OrderId(5));
    }

    #[test]
    fn level_aggregation() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Buy, 100, 1.0));
        book.insert(order(2, Side::Buy, 100, 2.0));
        book.insert(order(3, Side::Buy, 99, 1.0));

        let levels = book.bid_levels(10);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price.micro(), 100 * MICRO_SCALE);
        assert_eq!(levels[0].total_qty, Qty::from_f64(3.0).unwrap());
        assert_eq!(levels[0].order_count, 2);
        assert_eq!(levels[1].price.micro(), 99 * MICRO_SCALE);
    }

    #[test]
    fn fok_depth_precheck() {
        let mut book = OrderBook::new();
        book.insert(order(1, Side::Sell, 100, 1.0));
        book.insert(order(2, Side::Sell, 101, 2.0));
        book.insert(order(3, Side::Sell, 105, 5.0));

        let within = book.opposing_qty_within(
            Side::Buy,
            Some(Price::new_unchecked(101 * MICRO_SCALE)),
        );
        assert_eq!(within, Qty::from_f64(3.0).unwrap());

        let all = book.opposing_qty_within(Side::Buy, None);
        assert_eq!(all, Qty::from_f64(8.0).unwrap());
    }

    #[test]
    fn stop_triggering_order() {
        let mut book = OrderBook::new();
        book.insert_stop(stop_order(1, Side::Buy, 105, 106));
        book.insert_stop(stop_order(2, Side::Buy, 103, 104));
        book.insert_stop(stop_order(3, Side::Sell, 95, 94));
        book.insert_stop(stop_order(4, Side::Sell, 97, 96));

        // last trade at 104: buy stop at 103 fires, ascending order
        let fired = book.take_triggered_stops(Price::new_unchecked(104 * MICRO_SCALE));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, OrderId(2));

        // last trade at 96: sell stop at 97 fires (highest first)
        let fired = book.take_triggered_stops(Price::new_unchecked(96 * MICRO_SCALE));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, OrderId(4));
        assert_eq!(book.stop_count(), 2);
    }

    #[test]
    fn fill_keeps_quantity_identity() {
        let mut o = order(1, Side::Buy, 100, 3.0);
        o.fill(Qty::from_f64(1.0).unwrap(), Timestamp::from_millis(5));
        assert_eq!(o.status, OrderStatus::Partial);
        assert_eq!(o.filled_qty.add(o.remaining_qty), o.quantity);

        o.fill(Qty::from_f64(2.0).unwrap(), Timestamp::from_millis(6));
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(o.is_filled());
    }
}
