// 6.0: dynamic funding. every interval the perp's premium over mark sets the
// rate; positive rate means longs pay shorts. payment = size * mark * rate.

use crate::config::FundingConfig;
use crate::types::{mul_div, Price, Quote, Rate, SignedQty, MICRO_SCALE};

// 6.1: how far the traded price sits from mark. positive = trading rich.
pub fn premium(last: Price, mark: Price) -> Rate {
    Rate::from_ppm(mul_div(
        last.micro() - mark.micro(),
        MICRO_SCALE,
        mark.micro(),
    ))
}

// 6.2: dampen, then clamp. keeps one bad print from setting an extreme rate.
pub fn funding_rate(last: Price, mark: Price, config: &FundingConfig) -> Rate {
    let dampened = Rate::from_ppm(mul_div(
        premium(last, mark).ppm(),
        config.dampening.ppm(),
        MICRO_SCALE,
    ));
    dampened.clamp_abs(config.max_rate)
}

/// Funding owed by a position for one interval. Positive = the position
/// pays, negative = it receives.
pub fn funding_payment(size: SignedQty, mark: Price, rate: Rate) -> Quote {
    mark.notional_signed(size).apply(rate)
}
