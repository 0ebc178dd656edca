// 1.0: all the primitives live here. nothing in the core works without these types.
// money, prices, quantities and rates are signed 64-bit integers in micro-units
// (1 unit = 1_000_000 micro). floats exist only at the boundary, converted once,
// validated once. each primitive is a newtype so the compiler catches mixups.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

/// 1 quote unit = 10^6 micro-units.
pub const MICRO_SCALE: i64 = 1_000_000;

// 1.1: widening multiply-divide. all cross-unit arithmetic funnels through here
// so rounding is uniform: half away from zero.
pub(crate) fn mul_div(a: i64, b: i64, d: i64) -> i64 {
    debug_assert!(d != 0);
    let num = a as i128 * b as i128;
    let d = d as i128;
    let q = num / d;
    let r = num % d;
    let adj = if r.abs() * 2 >= d.abs() { num.signum() } else { 0 };
    (q + adj) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum NumericError {
    #[error("value is not a finite number")]
    NotFinite,
    #[error("value {0} is out of representable range")]
    OutOfRange(f64),
    #[error("value {0} must be positive")]
    NotPositive(f64),
}

fn micro_from_f64(value: f64) -> Result<i64, NumericError> {
    if !value.is_finite() {
        return Err(NumericError::NotFinite);
    }
    let scaled = (value * MICRO_SCALE as f64).round();
    if scaled.abs() > i64::MAX as f64 / 4.0 {
        return Err(NumericError::OutOfRange(value));
    }
    Ok(scaled as i64)
}

// 1.2: money in micro-units of the quote currency. pnl, fees, margin, balances.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Quote(i64);

impl Quote {
    pub const ZERO: Quote = Quote(0);

    pub fn from_micro(micro: i64) -> Self {
        Self(micro)
    }

    /// Boundary conversion. Rejects non-finite and out-of-range input.
    pub fn from_f64(value: f64) -> Result<Self, NumericError> {
        Ok(Self(micro_from_f64(value)?))
    }

    pub fn micro(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO_SCALE as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn add(&self, other: Quote) -> Self {
        Self(self.0 + other.0)
    }

    pub fn sub(&self, other: Quote) -> Self {
        Self(self.0 - other.0)
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    pub fn min(&self, other: Quote) -> Self {
        Self(self.0.min(other.0))
    }

    /// Apply a ppm rate: fee = notional.apply(taker_fee).
    pub fn apply(&self, rate: Rate) -> Self {
        Self(mul_div(self.0, rate.ppm(), MICRO_SCALE))
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

impl Sum for Quote {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, q| acc.add(q))
    }
}

impl<'a> Sum<&'a Quote> for Quote {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, q| acc.add(*q))
    }
}

// 1.3: price in micro-units of quote per 1.0 of base. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(i64);

impl Price {
    #[must_use]
    pub fn new(micro: i64) -> Option<Self> {
        if micro > 0 {
            Some(Self(micro))
        } else {
            None
        }
    }

    pub fn new_unchecked(micro: i64) -> Self {
        debug_assert!(micro > 0);
        Self(micro)
    }

    pub fn from_f64(value: f64) -> Result<Self, NumericError> {
        let micro = micro_from_f64(value)?;
        Self::new(micro).ok_or(NumericError::NotPositive(value))
    }

    pub fn micro(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO_SCALE as f64
    }

    pub fn is_tick_aligned(&self, tick: Quote) -> bool {
        tick.micro() > 0 && self.0 % tick.micro() == 0
    }

    /// price * qty, in quote micro-units.
    pub fn notional(&self, qty: Qty) -> Quote {
        Quote(mul_div(self.0, qty.micro(), MICRO_SCALE))
    }

    pub fn notional_signed(&self, size: SignedQty) -> Quote {
        Quote(mul_div(self.0, size.micro(), MICRO_SCALE))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

// 1.4: unsigned order quantity in micro-units of base. always > 0 on an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Qty(i64);

impl Qty {
    pub const ZERO: Qty = Qty(0);

    pub fn from_micro(micro: i64) -> Self {
        debug_assert!(micro >= 0);
        Self(micro)
    }

    pub fn from_f64(value: f64) -> Result<Self, NumericError> {
        let micro = micro_from_f64(value)?;
        if micro <= 0 {
            return Err(NumericError::NotPositive(value));
        }
        Ok(Self(micro))
    }

    pub fn micro(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO_SCALE as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn add(&self, other: Qty) -> Self {
        Self(self.0 + other.0)
    }

    pub fn sub(&self, other: Qty) -> Self {
        debug_assert!(other.0 <= self.0, "cannot subtract below zero");
        Self(self.0 - other.0)
    }

    pub fn min(&self, other: Qty) -> Self {
        Self(self.0.min(other.0))
    }

    /// Fraction of this quantity, ppm-scaled. The graduated liquidation
    /// steps use this for the 25%/50% partial closes.
    pub fn scale(&self, rate: Rate) -> Self {
        Self(mul_div(self.0, rate.ppm(), MICRO_SCALE))
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

// 1.5: signed position size. positive = long, negative = short.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SignedQty(i64);

impl SignedQty {
    pub const ZERO: SignedQty = SignedQty(0);

    pub fn from_micro(micro: i64) -> Self {
        Self(micro)
    }

    pub fn from_side(side: Side, qty: Qty) -> Self {
        Self(side.sign() * qty.micro())
    }

    pub fn micro(&self) -> i64 {
        self.0
    }

    pub fn abs(&self) -> Qty {
        Qty(self.0.abs())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_long(&self) -> bool {
        self.0 > 0
    }

    pub fn is_short(&self) -> bool {
        self.0 < 0
    }

    pub fn side(&self) -> Option<Side> {
        if self.is_long() {
            Some(Side::Buy)
        } else if self.is_short() {
            Some(Side::Sell)
        } else {
            None
        }
    }

    pub fn signum(&self) -> i64 {
        self.0.signum()
    }

    pub fn add(&self, delta: SignedQty) -> Self {
        Self(self.0 + delta.0)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO_SCALE as f64
    }
}

impl fmt::Display for SignedQty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

// 1.6: dimensionless fraction in parts-per-million. 0.0005 = 500 ppm.
// fees, margin rates, funding rates, band percentages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Rate(i64);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    pub fn from_ppm(ppm: i64) -> Self {
        Self(ppm)
    }

    pub fn from_f64(value: f64) -> Result<Self, NumericError> {
        Ok(Self(micro_from_f64(value)?))
    }

    pub fn ppm(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO_SCALE as f64
    }

    pub fn clamp_abs(&self, max_abs: Rate) -> Self {
        Self(self.0.clamp(-max_abs.0.abs(), max_abs.0.abs()))
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    /// Ratio of two quote amounts as a ppm rate. None when the denominator
    /// is zero.
    pub fn ratio(num: Quote, den: Quote) -> Option<Self> {
        if den.micro() == 0 {
            return None;
        }
        Some(Self(mul_div(num.micro(), MICRO_SCALE, den.micro())))
    }
}

/// Side of the book. Buy rests on bids, Sell on asks; a long position has
/// positive size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

// 1.7: identifiers. order ids are monotonic within a symbol; trade ids and
// journal sequence numbers are global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product symbol. ASCII upper-alphanumerics plus `-` and `_`, max 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Option<Self> {
        let s = symbol.into();
        let valid = !s.is_empty()
            && s.len() <= 32
            && s.bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if valid {
            Some(Self(s))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.8: millisecond timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn as_nanos(&self) -> u64 {
        (self.0.max(0) as u64) * 1_000_000
    }

    pub fn ledger_date(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.0)
            .map(|dt| dt.format("%Y/%m/%d").to_string())
            .unwrap_or_else(|| "1970/01/01".to_string())
    }
}
