//! Hedge exposure tracker.
//!
//! Client flow leaves the exchange with net exposure per hedgeable product.
//! When the unhedged notional crosses the configured threshold, the tracker
//! queues a hedge instruction for the external broker. The matching path
//! never waits on the broker: instructions go through a bounded channel and
//! a worker pumps them, retrying with exponential back-off and alerting when
//! a hedge stays failed. A periodic reconcile sweep applies the same
//! threshold rule to catch anything the trade-driven path missed.

use crate::config::HedgeConfig;
use crate::manager::PositionManager;
use crate::product::ProductCatalog;
use crate::types::{Price, Qty, Side, SignedQty, Symbol, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeInstruction {
    pub symbol: Symbol,
    pub external_symbol: String,
    pub qty: Qty,
    pub direction: Side,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HedgeAck {
    pub filled_qty: Qty,
    pub price: Price,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker timeout")]
    Timeout,
    #[error("broker rejected hedge: {0}")]
    Rejected(String),
}

/// Narrow seam to the external broker. The real client lives outside the
/// core; tests plug in a recording stub.
pub trait HedgeBroker: Send + Sync {
    fn submit_hedge(&self, instruction: &HedgeInstruction) -> Result<HedgeAck, BrokerError>;
}

/// A broker fill the exchange layer still has to journal and post.
#[derive(Debug, Clone)]
pub struct HedgeFill {
    pub instruction: HedgeInstruction,
    pub ack: HedgeAck,
}

#[derive(Debug)]
struct PendingHedge {
    instruction: HedgeInstruction,
    attempts: u32,
    not_before: Timestamp,
}

// 13.0: tracker service. enqueue on the hot path, broker I/O in pump().
pub struct HedgeTracker {
    config: HedgeConfig,
    manager: Arc<PositionManager>,
    catalog: Arc<ProductCatalog>,
    broker: Arc<dyn HedgeBroker>,
    queue_tx: Sender<PendingHedge>,
    queue_rx: Receiver<PendingHedge>,
}

impl HedgeTracker {
    pub fn new(
        config: HedgeConfig,
        manager: Arc<PositionManager>,
        catalog: Arc<ProductCatalog>,
        broker: Arc<dyn HedgeBroker>,
    ) -> Self {
        let (queue_tx, queue_rx) = bounded(1024);
        Self {
            config,
            manager,
            catalog,
            broker,
            queue_tx,
            queue_rx,
        }
    }

    /// Trade-driven check: queue a hedge when the symbol's unhedged
    /// notional breaches the threshold. Non-blocking; called from the
    /// submit pipeline.
    pub fn on_position_change(&self, symbol: &Symbol, now: Timestamp) {
        if let Some(instruction) = self.instruction_for(symbol) {
            self.enqueue(instruction, now);
        }
    }

    /// Periodic sweep applying the same rule across every hedgeable
    /// product.
    pub fn reconcile(&self, now: Timestamp) {
        for product in self.catalog.all() {
            if product.is_hedgeable() {
                self.on_position_change(&product.symbol, now);
            }
        }
    }

    /// Drain due instructions and call the broker. Failed hedges re-queue
    /// with doubled back-off until the retry budget runs out. Returns the
    /// fills for the exchange layer to record.
    pub fn pump(&self, now: Timestamp) -> Vec<HedgeFill> {
        let mut fills = Vec::new();
        let mut deferred = Vec::new();

        while let Ok(pending) = self.queue_rx.try_recv() {
            if pending.not_before > now {
                deferred.push(pending);
                continue;
            }
            match self.broker.submit_hedge(&pending.instruction) {
                Ok(ack) => {
                    let signed = SignedQty::from_side(pending.instruction.direction, ack.filled_qty);
                    self.manager
                        .update_hedge_position(&pending.instruction.symbol, signed);
                    info!(
                        symbol = %pending.instruction.symbol,
                        external = %pending.instruction.external_symbol,
                        qty = %ack.filled_qty,
                        price = %ack.price,
                        "hedge filled"
                    );
                    fills.push(HedgeFill {
                        instruction: pending.instruction,
                        ack,
                    });
                }
                Err(err) => {
                    let attempts = pending.attempts + 1;
                    if attempts > self.config.max_retries {
                        error!(
                            symbol = %pending.instruction.symbol,
                            %err,
                            attempts,
                            "hedge failed permanently; operator attention required"
                        );
                        continue;
                    }
                    let backoff = (self.config.retry_base_ms << (attempts - 1))
                        .min(self.config.retry_max_ms);
                    debug!(symbol = %pending.instruction.symbol, %err, attempts, backoff, "hedge retry scheduled");
                    deferred.push(PendingHedge {
                        instruction: pending.instruction,
                        attempts,
                        not_before: Timestamp::from_millis(now.as_millis() + backoff),
                    });
                }
            }
        }

        for pending in deferred {
            if self.queue_tx.try_send(pending).is_err() {
                error!("hedge queue full while re-queueing; instruction dropped");
            }
        }
        fills
    }

    pub fn pending_count(&self) -> usize {
        self.queue_rx.len()
    }

    fn instruction_for(&self, symbol: &Symbol) -> Option<HedgeInstruction> {
        let product = self.catalog.get(symbol)?;
        let external_symbol = product.external_symbol.clone()?;
        let exposure = self.manager.exposure(symbol)?;

        let unhedged = exposure.unhedged();
        let unhedged_notional = product.mark_price.notional(unhedged.abs());
        if unhedged_notional.abs() <= self.config.threshold_quote {
            return None;
        }

        // hedge in the opposite direction of the residual exposure
        let direction = match unhedged.side()? {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        };
        Some(HedgeInstruction {
            symbol: symbol.clone(),
            external_symbol,
            qty: unhedged.abs(),
            direction,
        })
    }

    fn enqueue(&self, instruction: HedgeInstruction, now: Timestamp) {
        let pending = PendingHedge {
            instruction,
            attempts: 0,
            not_before: now,
        };
        match self.queue_tx.try_send(pending) {
            Ok(()) => {}
            Err(TrySendError::Full(pending)) => {
                error!(symbol = %pending.instruction.symbol, "hedge queue full; instruction dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("hedge queue disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskLimits;
    use crate::ledger::Ledger;
    use crate::product::{ProductCategory, ProductSpec};
    use crate::types::{Quote, Rate, MICRO_SCALE};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    struct StubBroker {
        calls: Mutex<Vec<HedgeInstruction>>,
        fail_first: Mutex<u32>,
    }

    impl StubBroker {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
            }
        }
    }

    impl HedgeBroker for StubBroker {
        fn submit_hedge(&self, instruction: &HedgeInstruction) -> Result<HedgeAck, BrokerError> {
            self.calls.lock().push(instruction.clone());
            let mut failures = self.fail_first.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(BrokerError::Timeout);
            }
            Ok(HedgeAck {
                filled_qty: instruction.qty,
                price: Price::new_unchecked(100 * MICRO_SCALE),
            })
        }
    }

    fn setup(
        fail_first: u32,
    ) -> (
        tempfile::TempDir,
        Arc<PositionManager>,
        HedgeTracker,
        Arc<StubBroker>,
        Symbol,
    ) {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(ProductCatalog::new());
        catalog
            .load(&[ProductSpec {
                symbol: "XAU-MNT-PERP".to_string(),
                category: ProductCategory::Perpetual,
                quote_currency: "MNT".to_string(),
                external_symbol: Some("XAU/USD".to_string()),
                tick_size: 0.1,
                min_order_size: 0.01,
                max_order_size: 1000.0,
                margin_rate: 0.10,
                maker_fee: 0.0002,
                taker_fee: 0.0005,
                initial_mark_price: 100.0,
            }])
            .unwrap();
        let ledger = Arc::new(Ledger::open(dir.path(), false).unwrap());
        let manager = Arc::new(PositionManager::new(
            catalog.clone(),
            ledger,
            RiskLimits::default(),
            Rate::from_ppm(200_000),
            Quote::ZERO,
        ));
        let broker = Arc::new(StubBroker::new(fail_first));
        let mut config = HedgeConfig::default();
        config.threshold_quote = Quote::from_micro(500 * MICRO_SCALE);
        let tracker = HedgeTracker::new(
            config,
            manager.clone(),
            catalog.clone(),
            broker.clone(),
        );
        let symbol = Symbol::new("XAU-MNT-PERP").unwrap();
        (dir, manager, tracker, broker, symbol)
    }

    /// Push net exposure directly through the hedge-position channel's
    /// inverse: a fake short hedge makes unhedged = -hedge.
    fn force_exposure(manager: &PositionManager, symbol: &Symbol, qty_units: i64) {
        manager.update_hedge_position(
            symbol,
            SignedQty::from_micro(qty_units * MICRO_SCALE),
        );
    }

    #[test]
    fn below_threshold_is_quiet() {
        let (_dir, manager, tracker, broker, symbol) = setup(0);
        force_exposure(&manager, &symbol, 4); // 400 notional < 500 threshold
        tracker.on_position_change(&symbol, Timestamp::from_millis(0));
        assert_eq!(tracker.pending_count(), 0);
        tracker.pump(Timestamp::from_millis(1));
        assert!(broker.calls.lock().is_empty());
    }

    #[test]
    fn breach_queues_and_fills_opposite_direction() {
        let (_dir, manager, tracker, broker, symbol) = setup(0);
        force_exposure(&manager, &symbol, 10); // 1000 notional > threshold

        tracker.on_position_change(&symbol, Timestamp::from_millis(0));
        assert_eq!(tracker.pending_count(), 1);

        let fills = tracker.pump(Timestamp::from_millis(1));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].instruction.direction, Side::Sell);
        assert_eq!(fills[0].instruction.external_symbol, "XAU/USD");

        // ack flows back into the hedge position: 10 - 10 = flat
        let exposure = manager.exposure(&symbol).unwrap();
        assert!(exposure.unhedged().is_zero());
        assert_eq!(broker.calls.lock().len(), 1);
    }

    #[test]
    fn failures_back_off_then_succeed() {
        let (_dir, manager, tracker, broker, symbol) = setup(2);
        force_exposure(&manager, &symbol, 10);
        tracker.on_position_change(&symbol, Timestamp::from_millis(0));

        // first attempt fails, requeued with back-off
        assert!(tracker.pump(Timestamp::from_millis(0)).is_empty());
        assert_eq!(tracker.pending_count(), 1);

        // not due yet
        assert!(tracker.pump(Timestamp::from_millis(100)).is_empty());

        // second failure, longer back-off, then success
        assert!(tracker.pump(Timestamp::from_millis(600)).is_empty());
        let fills = tracker.pump(Timestamp::from_millis(5_000));
        assert_eq!(fills.len(), 1);
        assert_eq!(broker.calls.lock().len(), 3);
    }

    #[test]
    fn reconcile_sweeps_hedgeable_products() {
        let (_dir, manager, tracker, _broker, symbol) = setup(0);
        force_exposure(&manager, &symbol, 10);

        tracker.reconcile(Timestamp::from_millis(0));
        assert_eq!(tracker.pending_count(), 1);
        let fills = tracker.pump(Timestamp::from_millis(1));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].instruction.symbol, symbol);
    }
}
