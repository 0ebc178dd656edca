// exchange-core: CLOB derivatives exchange kernel.
// deterministic matching, margin math, and double-entry accounting take
// priority; every monetary value is an i64 in micro-units of the quote
// currency and floats exist only at the boundary.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Quote, Price, Qty, SignedQty, Rate, ids
//   2.x  config.rs: risk limits, breaker bands, funding, hedging, storage
//   3.x  product.rs: product catalog, tick/size validation, mark prices
//   4.x  book.rs: orders, trades, per-symbol book with stop sets
//   5.x  position.rs: increase/reduce/flip math, pnl formulas
//   6.x  funding.rs: premium -> dampened clamped rate -> payments
//   7.x  ledger.rs: double-entry journal files + master index queries
//   8.x  events.rs: journaled event payloads and kind bytes
//   9.x  journal.rs: CRC-framed append-only event log with rollover
//   10.x manager.rs: accounts, margin, liquidation, ADL, insurance fund
//   11.x matching.rs: price-time matching engine, per-symbol shards
//   12.x risk.rs: circuit breakers and the FX band controller
//   13.x hedge.rs: exposure tracker and broker instruction queue
//   14.x store.rs: sqlite persistence for orders/trades/balances/candles
//   15.x exchange.rs: composition root, submit pipeline, recovery replay

pub mod book;
pub mod config;
pub mod events;
pub mod exchange;
pub mod funding;
pub mod hedge;
pub mod journal;
pub mod ledger;
pub mod manager;
pub mod matching;
pub mod position;
pub mod product;
pub mod risk;
pub mod store;
pub mod types;

pub use book::{BookLevel, Order, OrderBook, OrderStatus, OrderType, Trade};
pub use config::{
    CircuitBreakerConfig, ExchangeConfig, FeePolicy, FundingConfig, FxBandConfig, HedgeConfig,
    RiskLimits, StorageConfig,
};
pub use events::{ExchangeEvent, InsuranceReason, LiquidationRecord, PositionChange};
pub use exchange::{AccountSummary, Exchange, ExchangeError, FillInfo, OrderReceipt, OrderTicket};
pub use hedge::{BrokerError, HedgeAck, HedgeBroker, HedgeInstruction, HedgeTracker};
pub use journal::{EventJournal, JournalEntry, JournalError};
pub use ledger::{
    accounts, BalanceSheet, IncomeStatement, JournalFile, Ledger, LedgerError, Posting,
    RegisterEntry, Transaction,
};
pub use manager::{
    ExchangeExposure, FundingOutcome, PositionManager, RiskError, TradeSettlement, UserAccount,
};
pub use matching::{
    MatchError, MatchingEngine, ModifyOutcome, OrderRequest, PriceLimits, StopActivation,
    SubmitResult,
};
pub use position::Position;
pub use product::{
    specs_from_json, Product, ProductCatalog, ProductCategory, ProductError, ProductSpec,
};
pub use risk::{
    CircuitBreakers, CircuitState, CircuitTransition, FxBandController, FxQuoteHealth,
    RiskControlError,
};
pub use store::{Store, StoreError};
pub use types::{
    NumericError, OrderId, Price, Qty, Quote, Rate, Side, SignedQty, Symbol, Timestamp, TradeId,
    UserId, MICRO_SCALE,
};
