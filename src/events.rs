// 8.0: every externally observable effect becomes one of these, appended to
// the event journal before the effect is visible anywhere else. replay feeds
// them back through the exchange: order flow is re-matched (the engine is
// deterministic), everything else is applied mechanically from the recorded
// amounts.

use crate::book::{Order, Trade};
use crate::types::{OrderId, Price, Qty, Quote, Rate, Symbol, UserId};
use serde::{Deserialize, Serialize};

/// Frame kind bytes, fixed for the life of the journal format.
pub mod kind {
    pub const ORDER_SUBMIT: u8 = 1;
    pub const ORDER_CANCEL: u8 = 2;
    pub const TRADE: u8 = 3;
    pub const POSITION_CHANGE: u8 = 4;
    pub const FUNDING: u8 = 5;
    pub const LIQUIDATION: u8 = 6;
    pub const HEDGE: u8 = 7;
    pub const INSURANCE: u8 = 8;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeEvent {
    /// An order accepted for matching, recorded in its pre-match state
    /// together with the band clamp that applied, so replay matches
    /// exactly what the live run matched.
    OrderSubmit {
        order: Order,
        band_min: Option<Price>,
        band_max: Option<Price>,
    },
    OrderCancel {
        symbol: Symbol,
        order_id: OrderId,
        user: UserId,
    },
    /// Partial cancel: a same-price quantity decrease that keeps its level
    /// position. Shares the ORDER_CANCEL frame kind.
    OrderReduce {
        symbol: Symbol,
        order_id: OrderId,
        user: UserId,
        new_remaining: Qty,
    },
    Trade { trade: Trade },
    PositionChange(PositionChange),
    /// One funding settlement for one perpetual, with the inputs it used.
    Funding {
        symbol: Symbol,
        rate: Rate,
        mark: Price,
    },
    Liquidation(LiquidationRecord),
    /// Broker acknowledgement of a hedge fill.
    Hedge {
        symbol: Symbol,
        external_symbol: String,
        /// Signed hedge quantity delta, micro-units of base.
        qty: i64,
        price: Price,
    },
    Insurance {
        delta: Quote,
        reason: InsuranceReason,
    },
}

/// Account-level changes that do not flow through the matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PositionChange {
    Deposit {
        user: UserId,
        amount: Quote,
    },
    Withdraw {
        user: UserId,
        amount: Quote,
    },
    SpotSettle {
        buyer: UserId,
        seller: UserId,
        symbol: Symbol,
        qty: Qty,
        price: Price,
        /// Markup retained by the exchange as spread revenue.
        spread: Quote,
    },
    /// Forced close of a profitable opposing position during ADL.
    AdlClose {
        user: UserId,
        symbol: Symbol,
        qty: Qty,
        price: Price,
        /// Profit diverted to cover the socialized loss.
        diverted: Quote,
    },
}

/// A completed liquidation cycle for one (user, symbol), step by step, with
/// the amounts actually applied. Replay applies these without re-deriving
/// margin ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub user: UserId,
    pub symbol: Symbol,
    pub steps: Vec<LiquidationStep>,
    pub insurance_draw: Quote,
    pub socialized_loss: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationStep {
    /// 250_000 / 500_000 / 1_000_000 ppm of the remaining size.
    pub fraction_ppm: i64,
    pub qty: Qty,
    pub price: Price,
    pub realized_pnl: Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsuranceReason {
    /// Cut of a taker fee.
    FeeContribution,
    /// Admin top-up.
    AdminContribution,
    /// Draw against a bankrupt liquidation.
    LiquidationDraw,
}

impl ExchangeEvent {
    pub fn kind(&self) -> u8 {
        match self {
            ExchangeEvent::OrderSubmit { .. } => kind::ORDER_SUBMIT,
            ExchangeEvent::OrderCancel { .. } => kind::ORDER_CANCEL,
            ExchangeEvent::OrderReduce { .. } => kind::ORDER_CANCEL,
            ExchangeEvent::Trade { .. } => kind::TRADE,
            ExchangeEvent::PositionChange(_) => kind::POSITION_CHANGE,
            ExchangeEvent::Funding { .. } => kind::FUNDING,
            ExchangeEvent::Liquidation(_) => kind::LIQUIDATION,
            ExchangeEvent::Hedge { .. } => kind::HEDGE,
            ExchangeEvent::Insurance { .. } => kind::INSURANCE,
        }
    }
}
