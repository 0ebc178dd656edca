// 5.0: margined position tracking. pnl = size * (mark - entry).
// 5.2+ has the increase/reduce/flip logic used by the manager on every fill.

use crate::types::{mul_div, Price, Qty, Quote, Rate, SignedQty, Symbol, Timestamp, MICRO_SCALE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Positive = long, negative = short.
    pub size: SignedQty,
    /// Weighted-average entry of opens on the current side.
    pub entry_price: Price,
    /// Margin locked against this position. Accrued per fill, released
    /// proportionally on reduction.
    pub margin_used: Quote,
    pub unrealized_pnl: Quote,
    pub realized_pnl: Quote,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn open(
        symbol: Symbol,
        size: SignedQty,
        entry_price: Price,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            symbol,
            size,
            entry_price,
            margin_used: margin,
            unrealized_pnl: Quote::ZERO,
            realized_pnl: Quote::ZERO,
            opened_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    pub fn notional_at(&self, price: Price) -> Quote {
        price.notional(self.size.abs())
    }

    // 5.1: the pnl formula. size * (mark - entry), sign carried by size.
    pub fn mark_to_market(&mut self, mark: Price) {
        self.unrealized_pnl = unrealized_pnl(self.size, self.entry_price, mark);
    }
}

pub fn unrealized_pnl(size: SignedQty, entry: Price, mark: Price) -> Quote {
    Quote::from_micro(mul_div(
        size.micro(),
        mark.micro() - entry.micro(),
        MICRO_SCALE,
    ))
}

/// P&L realized by closing `close_qty` of a position opened at `entry`, in
/// the direction given by `size_sign` (+1 long, -1 short).
pub fn realized_pnl(close_qty: Qty, entry: Price, exit: Price, size_sign: i64) -> Quote {
    Quote::from_micro(mul_div(
        size_sign * close_qty.micro(),
        exit.micro() - entry.micro(),
        MICRO_SCALE,
    ))
}

/// Outcome of applying one fill to a position.
#[derive(Debug, Clone)]
pub struct PositionDelta {
    pub position: Option<Position>,
    pub realized_pnl: Quote,
    pub margin_released: Quote,
    pub margin_required: Quote,
}

// 5.2: same-side increase. entry becomes the notional-weighted average and
// margin grows by the fill's own notional * margin_rate, so margin never
// drifts from what was actually charged.
pub fn increase(
    position: &Position,
    fill_qty: Qty,
    fill_price: Price,
    margin_rate: Rate,
    timestamp: Timestamp,
) -> PositionDelta {
    let old_abs = position.size.abs();
    let new_abs = old_abs.add(fill_qty);

    let weighted = mul_div(old_abs.micro(), position.entry_price.micro(), MICRO_SCALE)
        + mul_div(fill_qty.micro(), fill_price.micro(), MICRO_SCALE);
    let new_entry = Price::new_unchecked(mul_div(weighted, MICRO_SCALE, new_abs.micro()));

    let margin_required = fill_price.notional(fill_qty).apply(margin_rate);

    let mut updated = position.clone();
    updated.size = SignedQty::from_micro(position.size.signum() * new_abs.micro());
    updated.entry_price = new_entry;
    updated.margin_used = position.margin_used.add(margin_required);
    updated.updated_at = timestamp;

    PositionDelta {
        position: Some(updated),
        realized_pnl: Quote::ZERO,
        margin_released: Quote::ZERO,
        margin_required,
    }
}

// 5.3: opposite-side reduction. realizes pnl at the fill price, releases
// margin proportional to the closed fraction, entry unchanged for the rest.
pub fn reduce(
    position: &Position,
    close_qty: Qty,
    fill_price: Price,
    timestamp: Timestamp,
) -> PositionDelta {
    let old_abs = position.size.abs();
    let close_qty = close_qty.min(old_abs);
    debug_assert!(!close_qty.is_zero(), "reduce of zero quantity");

    let realized = realized_pnl(
        close_qty,
        position.entry_price,
        fill_price,
        position.size.signum(),
    );

    let margin_released = if close_qty == old_abs {
        position.margin_used
    } else {
        Quote::from_micro(mul_div(
            position.margin_used.micro(),
            close_qty.micro(),
            old_abs.micro(),
        ))
    };

    let remaining = old_abs.sub(close_qty);
    let position = if remaining.is_zero() {
        None
    } else {
        let mut updated = position.clone();
        updated.size = SignedQty::from_micro(position.size.signum() * remaining.micro());
        updated.margin_used = position.margin_used.sub(margin_released);
        updated.realized_pnl = position.realized_pnl.add(realized);
        updated.updated_at = timestamp;
        Some(updated)
    };

    PositionDelta {
        position,
        realized_pnl: realized,
        margin_released,
        margin_required: Quote::ZERO,
    }
}

// 5.4: flip through zero. closing and reopening with a fresh entry; never a
// blended position across sides.
pub fn flip(
    position: &Position,
    fill_qty: Qty,
    fill_price: Price,
    margin_rate: Rate,
    timestamp: Timestamp,
) -> PositionDelta {
    let old_abs = position.size.abs();
    debug_assert!(fill_qty > old_abs, "flip requires fill beyond current size");

    let close = reduce(position, old_abs, fill_price, timestamp);

    let leftover = fill_qty.sub(old_abs);
    let new_side_sign = -position.size.signum();
    let margin_required = fill_price.notional(leftover).apply(margin_rate);

    let reopened = Position::open(
        position.symbol.clone(),
        SignedQty::from_micro(new_side_sign * leftover.micro()),
        fill_price,
        margin_required,
        timestamp,
    );

    PositionDelta {
        position: Some(reopened),
        realized_pnl: close.realized_pnl,
        margin_released: close.margin_released,
        margin_required,
    }
}
