// 2.0 config.rs: every tunable in one place. risk limits, fees, funding,
// circuit breakers, hedging, persistence. defaults here, overridable from the
// environment so deployments never patch code to retune.

use crate::types::{Quote, Rate, MICRO_SCALE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-user and per-product risk limits, checked before any trade commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    // Largest |position| per (user, symbol), micro-units of base.
    pub max_position_per_user: i64,
    // Gross notional across all of a user's positions.
    pub max_notional_per_user: Quote,
    // Number of simultaneously open positions per user.
    pub max_open_positions: usize,
    // Sum of |size| across all users per product, micro-units of base.
    pub max_open_interest_per_product: i64,
    // Orders whose notional exceeds this are rejected outright.
    pub fat_finger_threshold: Quote,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_per_user: 1_000 * MICRO_SCALE,
            max_notional_per_user: Quote::from_micro(1_000_000_000 * MICRO_SCALE),
            max_open_positions: 20,
            max_open_interest_per_product: 100_000 * MICRO_SCALE,
            fat_finger_threshold: Quote::from_micro(100_000_000 * MICRO_SCALE),
        }
    }
}

/// Circuit breaker bands around the reference price, widest band last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    // Soft band: trades through it flip the symbol to LimitUp/LimitDown.
    pub level1: Rate,
    pub level2: Rate,
    // Hard band: crossing it halts the symbol entirely.
    pub level3: Rate,
    // How long a Halted symbol rejects all orders, milliseconds.
    pub halt_duration_ms: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            level1: Rate::from_ppm(50_000),  // 5%
            level2: Rate::from_ppm(100_000), // 10%
            level3: Rate::from_ppm(150_000), // 15%
            halt_duration_ms: 300_000,
        }
    }
}

/// Funding settlement parameters for perpetual products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    // premium is multiplied by this before clamping.
    pub dampening: Rate,
    // |rate| never exceeds this per interval.
    pub max_rate: Rate,
    // Settlement interval, milliseconds. Default 8 hours.
    pub interval_ms: i64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            dampening: Rate::from_ppm(100_000), // 0.1
            max_rate: Rate::from_ppm(10_000),   // 1%
            interval_ms: 8 * 3_600_000,
        }
    }
}

/// Hedging thresholds for products with an external underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    // Unhedged exposure in quote terms that triggers a broker order.
    pub threshold_quote: Quote,
    // Reconcile sweep period, milliseconds.
    pub reconcile_interval_ms: i64,
    // Retry back-off: base delay, doubling up to the cap.
    pub retry_base_ms: i64,
    pub retry_max_ms: i64,
    pub max_retries: u32,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            threshold_quote: Quote::from_micro(10_000_000 * MICRO_SCALE),
            reconcile_interval_ms: 60_000,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            max_retries: 6,
        }
    }
}

/// FX band controller parameters (USD-MNT and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxBandConfig {
    // Allowed deviation from the central-bank reference rate.
    pub band: Rate,
    // Quotes tighter than this are rejected.
    pub min_spread: Quote,
    // Minimum resting depth expected on each side, micro-units of base.
    pub min_depth: i64,
}

impl Default for FxBandConfig {
    fn default() -> Self {
        Self {
            band: Rate::from_ppm(20_000), // 2%
            min_spread: Quote::from_micro(MICRO_SCALE), // 1 MNT
            min_depth: 100 * MICRO_SCALE,
        }
    }
}

/// Durability knobs for the ledger, event journal and relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub ledger_dir: PathBuf,
    pub journal_dir: PathBuf,
    pub db_path: PathBuf,
    // fsync ledger files on every transaction boundary.
    pub ledger_fsync: bool,
    // Event journal segment rollover size, bytes.
    pub journal_segment_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from("data/ledger"),
            journal_dir: PathBuf::from("data/journal"),
            db_path: PathBuf::from("data/exchange.db"),
            ledger_fsync: true,
            journal_segment_bytes: 64 * 1024 * 1024,
        }
    }
}

// 2.1: the whole thing. one value wired through the Exchange at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub limits: RiskLimits,
    pub circuit_breaker: CircuitBreakerConfig,
    pub funding: FundingConfig,
    pub hedge: HedgeConfig,
    pub fx_band: FxBandConfig,
    pub storage: StorageConfig,
    pub fees: FeePolicy,
}

/// Exchange-wide fee routing. Per-product maker/taker rates live on the
/// product itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePolicy {
    // Fraction of every taker fee routed to the insurance fund.
    pub insurance_contribution: Rate,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            insurance_contribution: Rate::from_ppm(200_000), // 20%
        }
    }
}

impl ExchangeConfig {
    /// Environment overrides, original deployment style: every key has a
    /// documented default above and an `EXCHANGE_*` variable here.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_i64("EXCHANGE_MAX_POSITION") {
            cfg.limits.max_position_per_user = v;
        }
        if let Some(v) = env_i64("EXCHANGE_MAX_NOTIONAL") {
            cfg.limits.max_notional_per_user = Quote::from_micro(v);
        }
        if let Some(v) = env_i64("EXCHANGE_MAX_OPEN_POSITIONS") {
            cfg.limits.max_open_positions = v.max(0) as usize;
        }
        if let Some(v) = env_i64("EXCHANGE_MAX_OPEN_INTEREST") {
            cfg.limits.max_open_interest_per_product = v;
        }
        if let Some(v) = env_i64("EXCHANGE_FAT_FINGER") {
            cfg.limits.fat_finger_threshold = Quote::from_micro(v);
        }
        if let Some(v) = env_i64("EXCHANGE_FUNDING_MAX_RATE_PPM") {
            cfg.funding.max_rate = Rate::from_ppm(v);
        }
        if let Some(v) = env_i64("EXCHANGE_FUNDING_INTERVAL_MS") {
            cfg.funding.interval_ms = v;
        }
        if let Some(v) = env_i64("EXCHANGE_INSURANCE_CONTRIB_PPM") {
            cfg.fees.insurance_contribution = Rate::from_ppm(v);
        }
        if let Some(v) = env_i64("EXCHANGE_HEDGE_THRESHOLD") {
            cfg.hedge.threshold_quote = Quote::from_micro(v);
        }
        if let Some(v) = env_i64("EXCHANGE_HALT_DURATION_MS") {
            cfg.circuit_breaker.halt_duration_ms = v;
        }
        cfg
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ExchangeConfig::default();
        assert_eq!(cfg.fees.insurance_contribution.ppm(), 200_000);
        assert_eq!(cfg.funding.interval_ms, 8 * 3_600_000);
        assert_eq!(cfg.circuit_breaker.level3.ppm(), 150_000);
        assert!(cfg.storage.ledger_fsync);
    }
}
