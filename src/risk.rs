//! Circuit breakers and the FX band controller.
//!
//! Each symbol carries a breaker state machine driven by trade prices
//! against a periodically refreshed reference price. Three bands widen
//! around the reference:
//!
//! - inside `level1`: Normal, no constraints beyond the hard halt band.
//! - `level1..level2`: LimitUp/LimitDown. Orders keep trading on both
//!   sides, but no execution may go through the band edge in the offending
//!   direction.
//! - `level2..level3`: LimitUp/LimitDown, orders priced through the
//!   `level2` edge in the offending direction are rejected outright
//!   (`direction_rejected`).
//! - beyond `level3`: Halted. Everything is rejected until the halt
//!   duration lapses or an admin resumes the symbol.

use crate::config::{CircuitBreakerConfig, FxBandConfig};
use crate::matching::PriceLimits;
use crate::types::{mul_div, Price, Qty, Rate, Side, Symbol, Timestamp, MICRO_SCALE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Normal,
    LimitUp,
    LimitDown,
    Halted,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskControlError {
    #[error("symbol {0} is halted")]
    SymbolHalted(Symbol),

    #[error("market is halted")]
    MarketHalted,

    #[error("order direction blocked by {state:?} on {symbol}")]
    DirectionBlocked { symbol: Symbol, state: CircuitState },

    #[error("no reference price for {0}")]
    NoReference(Symbol),

    #[error("price {price} outside the band {low}..{high} around reference")]
    OutsideReferenceBand {
        price: Price,
        low: Price,
        high: Price,
    },
}

/// Emitted on every state transition, for observers and the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub symbol: Symbol,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reference: Price,
    pub trade_price: Option<Price>,
    pub at: Timestamp,
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    reference: Option<Price>,
    halted_at: Option<Timestamp>,
    manual_halt: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Normal,
            reference: None,
            halted_at: None,
            manual_halt: false,
        }
    }
}

fn band_edge(reference: Price, band: Rate, up: bool) -> Price {
    let delta = mul_div(reference.micro(), band.ppm(), MICRO_SCALE);
    let micro = if up {
        reference.micro() + delta
    } else {
        (reference.micro() - delta).max(1)
    };
    Price::new_unchecked(micro)
}

// 12.0: breaker service. per-symbol state under one RwLock; reads dominate.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    states: RwLock<HashMap<Symbol, BreakerState>>,
    market_halted: RwLock<bool>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            market_halted: RwLock::new(false),
        }
    }

    pub fn set_reference(&self, symbol: &Symbol, reference: Price) {
        let mut states = self.states.write();
        states
            .entry(symbol.clone())
            .or_insert_with(BreakerState::new)
            .reference = Some(reference);
    }

    pub fn state(&self, symbol: &Symbol) -> CircuitState {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Normal)
    }

    pub fn halt_market(&self) {
        *self.market_halted.write() = true;
    }

    pub fn resume_market(&self) {
        *self.market_halted.write() = false;
    }

    pub fn is_market_halted(&self) -> bool {
        *self.market_halted.read()
    }

    /// Admin halt for one symbol; stays down until `resume_symbol`.
    pub fn halt_symbol(&self, symbol: &Symbol, at: Timestamp) {
        let mut states = self.states.write();
        let state = states.entry(symbol.clone()).or_insert_with(BreakerState::new);
        state.state = CircuitState::Halted;
        state.halted_at = Some(at);
        state.manual_halt = true;
    }

    pub fn resume_symbol(&self, symbol: &Symbol) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(symbol) {
            state.state = CircuitState::Normal;
            state.halted_at = None;
            state.manual_halt = false;
        }
    }

    /// Gate an incoming order and derive the execution clamp the matching
    /// engine must honor. Called before the book is touched.
    pub fn gate_order(
        &self,
        symbol: &Symbol,
        now: Timestamp,
    ) -> Result<PriceLimits, RiskControlError> {
        if self.is_market_halted() {
            return Err(RiskControlError::MarketHalted);
        }
        let mut states = self.states.write();
        let state = states.entry(symbol.clone()).or_insert_with(BreakerState::new);

        // automatic halts lapse after the configured duration
        if state.state == CircuitState::Halted {
            let expired = !state.manual_halt
                && state
                    .halted_at
                    .map(|at| now.as_millis() - at.as_millis() >= self.config.halt_duration_ms)
                    .unwrap_or(false);
            if expired {
                state.state = CircuitState::Normal;
                state.halted_at = None;
            } else {
                return Err(RiskControlError::SymbolHalted(symbol.clone()));
            }
        }

        let Some(reference) = state.reference else {
            // no reference yet: nothing to clamp against
            return Ok(PriceLimits::none());
        };

        let hard_low = band_edge(reference, self.config.level3, false);
        let hard_high = band_edge(reference, self.config.level3, true);

        // LimitUp/LimitDown forbid trades only through the band in the
        // offending direction: the side pressing the band keeps trading,
        // clamped to the level1 edge. Outright rejection is reserved for
        // level2 breaches, checked by `direction_rejected`.
        match state.state {
            CircuitState::Normal => Ok(PriceLimits {
                min: Some(hard_low),
                max: Some(hard_high),
            }),
            CircuitState::LimitUp => Ok(PriceLimits {
                min: Some(hard_low),
                max: Some(band_edge(reference, self.config.level1, true)),
            }),
            CircuitState::LimitDown => Ok(PriceLimits {
                min: Some(band_edge(reference, self.config.level1, false)),
                max: Some(hard_high),
            }),
            CircuitState::Halted => Err(RiskControlError::SymbolHalted(symbol.clone())),
        }
    }

    /// Feed an executed trade price through the state machine. Returns the
    /// transition when one fires.
    pub fn observe_trade(
        &self,
        symbol: &Symbol,
        price: Price,
        at: Timestamp,
    ) -> Option<CircuitTransition> {
        let mut states = self.states.write();
        let state = states.entry(symbol.clone()).or_insert_with(BreakerState::new);
        let reference = state.reference?;

        let deviation_ppm = mul_div(
            (price.micro() - reference.micro()).abs(),
            MICRO_SCALE,
            reference.micro(),
        );
        let up = price.micro() > reference.micro();

        let next = if deviation_ppm >= self.config.level3.ppm() {
            CircuitState::Halted
        } else if deviation_ppm >= self.config.level1.ppm() {
            if up {
                CircuitState::LimitUp
            } else {
                CircuitState::LimitDown
            }
        } else {
            CircuitState::Normal
        };

        if next == state.state || state.manual_halt {
            return None;
        }
        let from = state.state;
        state.state = next;
        if next == CircuitState::Halted {
            state.halted_at = Some(at);
            warn!(symbol = %symbol, price = %price, reference = %reference, "circuit breaker halt");
        }

        Some(CircuitTransition {
            symbol: symbol.clone(),
            from,
            to: next,
            reference,
            trade_price: Some(price),
            at,
        })
    }

    /// Directional rejection threshold: beyond level2 the offending side
    /// may not even enter orders.
    pub fn direction_rejected(&self, symbol: &Symbol, side: Side, limit: Option<Price>) -> bool {
        let states = self.states.read();
        let Some(state) = states.get(symbol) else {
            return false;
        };
        let Some(reference) = state.reference else {
            return false;
        };
        let Some(limit) = limit else {
            return false;
        };
        match side {
            Side::Buy => limit > band_edge(reference, self.config.level2, true),
            Side::Sell => limit < band_edge(reference, self.config.level2, false),
        }
    }
}

// 12.1: FX band controller for cross-currency products. the reference is an
// authoritative central-bank rate, not a market price.
pub struct FxBandController {
    config: FxBandConfig,
    references: RwLock<HashMap<Symbol, Price>>,
}

/// Quote-quality verdict for an FX book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxQuoteHealth {
    pub spread_ok: bool,
    pub bid_depth_ok: bool,
    pub ask_depth_ok: bool,
}

impl FxBandController {
    pub fn new(config: FxBandConfig) -> Self {
        Self {
            config,
            references: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_reference_rate(&self, symbol: &Symbol, rate: Price) {
        self.references.write().insert(symbol.clone(), rate);
    }

    pub fn reference_rate(&self, symbol: &Symbol) -> Option<Price> {
        self.references.read().get(symbol).copied()
    }

    /// Orders priced outside the band around the reference rate are
    /// rejected with the band attached for the caller's error message.
    pub fn check_price(&self, symbol: &Symbol, price: Price) -> Result<(), RiskControlError> {
        let references = self.references.read();
        let reference = references
            .get(symbol)
            .ok_or_else(|| RiskControlError::NoReference(symbol.clone()))?;
        let low = band_edge(*reference, self.config.band, false);
        let high = band_edge(*reference, self.config.band, true);
        if price < low || price > high {
            return Err(RiskControlError::OutsideReferenceBand { price, low, high });
        }
        Ok(())
    }

    /// Passive quality check on the current book shape.
    pub fn quote_health(
        &self,
        best_bid: Option<(Price, Qty)>,
        best_ask: Option<(Price, Qty)>,
    ) -> FxQuoteHealth {
        let spread_ok = match (best_bid, best_ask) {
            (Some((bid, _)), Some((ask, _))) => {
                ask.micro() - bid.micro() >= self.config.min_spread.micro()
            }
            _ => false,
        };
        let min_depth = Qty::from_micro(self.config.min_depth);
        FxQuoteHealth {
            spread_ok,
            bid_depth_ok: best_bid.map(|(_, q)| q >= min_depth).unwrap_or(false),
            ask_depth_ok: best_ask.map(|(_, q)| q >= min_depth).unwrap_or(false),
        }
    }
}
