//! Relational store.
//!
//! SQLite persistence for orders, trades, balances, fees, liquidations,
//! funding payments, candles, the insurance fund, audit entries, and a
//! mirror of ledger postings for SQL-side reporting. Price and quantity
//! columns hold quote-unit floats as the external representation; the
//! canonical value is always the micro-unit integer and readers convert
//! through the fixed-point types.
//!
//! Every row written for one event commits in a single SQL transaction
//! ([`Store::persist_submission`], [`Store::persist_liquidation`]) - a
//! mid-event failure rolls all of them back. The ledger appends to its own
//! files strictly before the store commit; the event journal plus ledger
//! remain the authoritative record a diverged store is rebuilt from.

use crate::book::{Order, Trade};
use crate::types::{Price, Qty, Quote, Rate, Symbol, Timestamp, UserId};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// Candle bucketing applied to every trade.
pub const CANDLE_TIMEFRAME: &str = "1m";
const CANDLE_BUCKET_MS: i64 = 60_000;

pub fn candle_bucket(timestamp: Timestamp) -> i64 {
    timestamp.as_millis() / CANDLE_BUCKET_MS * CANDLE_BUCKET_MS
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("numeric conversion failed: {0}")]
    Numeric(#[from] crate::types::NumericError),
}

// 14.0: the store. single connection behind a mutex; WAL keeps readers out
// of the writers' way.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                user_id TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price REAL,
                stop_price REAL,
                quantity REAL NOT NULL,
                filled_qty REAL NOT NULL,
                status TEXT NOT NULL,
                client_id TEXT,
                reduce_only INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (symbol, id)
            );
            CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
            CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);
            CREATE INDEX IF NOT EXISTS idx_orders_ts ON orders(created_at);

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                maker_order_id INTEGER NOT NULL,
                taker_order_id INTEGER NOT NULL,
                maker_user TEXT NOT NULL,
                taker_user TEXT NOT NULL,
                taker_side TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                maker_fee REAL NOT NULL,
                taker_fee REAL NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(timestamp);
            CREATE INDEX IF NOT EXISTS idx_trades_taker ON trades(taker_user);
            CREATE INDEX IF NOT EXISTS idx_trades_maker ON trades(maker_user);

            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT PRIMARY KEY,
                balance_micro INTEGER NOT NULL,
                margin_micro INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(timestamp);

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_date TEXT NOT NULL,
                description TEXT NOT NULL,
                account TEXT NOT NULL,
                amount_micro INTEGER NOT NULL,
                commodity TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger_entries(account);

            CREATE TABLE IF NOT EXISTS fees (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                amount_micro INTEGER NOT NULL,
                is_taker INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fees_user ON fees(user_id);

            CREATE TABLE IF NOT EXISTS insurance_fund (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance_micro INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS liquidations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                step_pct INTEGER NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                realized_micro INTEGER NOT NULL,
                insurance_draw_micro INTEGER NOT NULL,
                socialized_micro INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_liquidations_user ON liquidations(user_id);

            CREATE TABLE IF NOT EXISTS funding_payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                rate_ppm INTEGER NOT NULL,
                mark_price REAL NOT NULL,
                accounts_affected INTEGER NOT NULL,
                total_paid_micro INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_funding_symbol ON funding_payments(symbol);

            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, timeframe, time)
            );
            CREATE INDEX IF NOT EXISTS idx_candles ON candles(symbol, timeframe, time);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run several writes atomically. Any error rolls everything back.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    pub fn record_order(&self, order: &Order) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_order(&conn, order)
    }

    pub fn record_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_trade(&conn, trade)
    }

    pub fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        update_order_conn(&conn, order)
    }

    pub fn upsert_balance(
        &self,
        user: &UserId,
        balance: Quote,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        upsert_balance_conn(&conn, user, balance, margin, timestamp)
    }

    pub fn record_audit(
        &self,
        actor: &str,
        action: &str,
        details: &str,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (actor, action, details, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![actor, action, details, timestamp.as_millis()],
        )?;
        Ok(())
    }

    pub fn record_fee(
        &self,
        trade_id: u64,
        user: &UserId,
        amount: Quote,
        is_taker: bool,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_fee_conn(&conn, trade_id, user, amount, is_taker, timestamp)
    }

    /// The insurance fund scalar, persisted so a restart recovers the
    /// latest balance.
    pub fn save_insurance_fund(&self, balance: Quote, timestamp: Timestamp) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        save_insurance_conn(&conn, balance, timestamp)
    }

    pub fn load_insurance_fund(&self) -> Result<Quote, StoreError> {
        let conn = self.conn.lock();
        let micro: Option<i64> = conn
            .query_row("SELECT balance_micro FROM insurance_fund WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(Quote::from_micro(micro.unwrap_or(0)))
    }

    /// Everything one submission produced, committed atomically: the order
    /// row, activated stops, trades with their fees and candle folds,
    /// balance snapshots, and the insurance fund scalar.
    pub fn persist_submission(
        &self,
        order: &Order,
        activations: &[Order],
        trades: &[&Trade],
        balances: &[(UserId, Quote, Quote)],
        insurance_fund: Quote,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        self.in_transaction(|conn| {
            insert_order(conn, order)?;
            for activation in activations {
                update_order_conn(conn, activation)?;
            }
            for trade in trades {
                insert_trade(conn, trade)?;
                insert_fee_conn(conn, trade.id.0, &trade.taker_user, trade.taker_fee, true, timestamp)?;
                if !trade.maker_fee.is_zero() {
                    insert_fee_conn(
                        conn,
                        trade.id.0,
                        &trade.maker_user,
                        trade.maker_fee,
                        false,
                        timestamp,
                    )?;
                }
                upsert_candle_conn(
                    conn,
                    &trade.symbol,
                    CANDLE_TIMEFRAME,
                    candle_bucket(trade.timestamp),
                    trade.price,
                    trade.quantity,
                )?;
            }
            for (user, balance, margin) in balances {
                upsert_balance_conn(conn, user, *balance, *margin, timestamp)?;
            }
            save_insurance_conn(conn, insurance_fund, timestamp)?;
            Ok(())
        })
    }

    /// One liquidation cycle committed atomically: every partial-close row,
    /// the affected balances, and the insurance fund scalar.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_liquidation(
        &self,
        user: &UserId,
        symbol: &Symbol,
        steps: &[(i64, Qty, Price, Quote)],
        insurance_draw: Quote,
        socialized: Quote,
        balances: &[(UserId, Quote, Quote)],
        insurance_fund: Quote,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        self.in_transaction(|conn| {
            for (step_pct, qty, price, realized) in steps {
                conn.execute(
                    "INSERT INTO liquidations
                         (user_id, symbol, step_pct, quantity, price, realized_micro,
                          insurance_draw_micro, socialized_micro, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        user.as_str(),
                        symbol.as_str(),
                        step_pct,
                        qty.to_f64(),
                        price.to_f64(),
                        realized.micro(),
                        insurance_draw.micro(),
                        socialized.micro(),
                        timestamp.as_millis()
                    ],
                )?;
            }
            for (owner, balance, margin) in balances {
                upsert_balance_conn(conn, owner, *balance, *margin, timestamp)?;
            }
            save_insurance_conn(conn, insurance_fund, timestamp)?;
            Ok(())
        })
    }

    pub fn record_funding(
        &self,
        symbol: &Symbol,
        rate: Rate,
        mark: Price,
        accounts_affected: usize,
        total_paid: Quote,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO funding_payments
                 (symbol, rate_ppm, mark_price, accounts_affected, total_paid_micro, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                symbol.as_str(),
                rate.ppm(),
                mark.to_f64(),
                accounts_affected as i64,
                total_paid.micro(),
                timestamp.as_millis()
            ],
        )?;
        Ok(())
    }

    /// Fold a trade into its candle bucket.
    pub fn upsert_candle(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        bucket: i64,
        price: Price,
        qty: Qty,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        upsert_candle_conn(&conn, symbol, timeframe, bucket, price, qty)
    }

    pub fn mirror_ledger_posting(
        &self,
        date: &str,
        description: &str,
        account: &str,
        amount: Quote,
        commodity: &str,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ledger_entries
                 (tx_date, description, account, amount_micro, commodity, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                date,
                description,
                account,
                amount.micro(),
                commodity,
                timestamp.as_millis()
            ],
        )?;
        Ok(())
    }

    // --- queries -------------------------------------------------------

    pub fn user_order_count(&self, user: &UserId) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE user_id = ?1",
            params![user.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn trade_count(&self, symbol: &Symbol) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1",
            params![symbol.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Fills involving a user, newest first, with that user's fee attached.
    /// Canonical values are the micro integers; prices convert on the way
    /// out.
    pub fn user_fills(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<(u64, f64, f64, i64, i64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.price, t.quantity, t.timestamp,
                    COALESCE((SELECT SUM(f.amount_micro) FROM fees f
                              WHERE f.trade_id = t.id AND f.user_id = ?1), 0)
             FROM trades t
             WHERE t.taker_user = ?1 OR t.maker_user = ?1
             ORDER BY t.timestamp DESC, t.id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user.as_str(), limit as i64], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;
        let mut fills = Vec::new();
        for row in rows {
            fills.push(row?);
        }
        Ok(fills)
    }
}

fn insert_order(conn: &Connection, order: &Order) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO orders
             (id, symbol, user_id, side, order_type, price, stop_price, quantity,
              filled_qty, status, client_id, reduce_only, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            order.id.0,
            order.symbol.as_str(),
            order.user_id.as_str(),
            order.side.to_string(),
            format!("{:?}", order.order_type),
            order.price.map(|p| p.to_f64()),
            order.stop_price.map(|p| p.to_f64()),
            order.quantity.to_f64(),
            order.filled_qty.to_f64(),
            format!("{:?}", order.status),
            order.client_id,
            order.reduce_only as i64,
            order.created_at.as_millis(),
            order.updated_at.as_millis()
        ],
    )?;
    Ok(())
}

fn update_order_conn(conn: &Connection, order: &Order) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE orders SET filled_qty = ?1, status = ?2, updated_at = ?3
         WHERE symbol = ?4 AND id = ?5",
        params![
            order.filled_qty.to_f64(),
            format!("{:?}", order.status),
            order.updated_at.as_millis(),
            order.symbol.as_str(),
            order.id.0
        ],
    )?;
    Ok(())
}

fn upsert_balance_conn(
    conn: &Connection,
    user: &UserId,
    balance: Quote,
    margin: Quote,
    timestamp: Timestamp,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO balances (user_id, balance_micro, margin_micro, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             balance_micro = excluded.balance_micro,
             margin_micro = excluded.margin_micro,
             updated_at = excluded.updated_at",
        params![
            user.as_str(),
            balance.micro(),
            margin.micro(),
            timestamp.as_millis()
        ],
    )?;
    Ok(())
}

fn insert_fee_conn(
    conn: &Connection,
    trade_id: u64,
    user: &UserId,
    amount: Quote,
    is_taker: bool,
    timestamp: Timestamp,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO fees (trade_id, user_id, amount_micro, is_taker, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            trade_id,
            user.as_str(),
            amount.micro(),
            is_taker as i64,
            timestamp.as_millis()
        ],
    )?;
    Ok(())
}

fn save_insurance_conn(
    conn: &Connection,
    balance: Quote,
    timestamp: Timestamp,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO insurance_fund (id, balance_micro, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             balance_micro = excluded.balance_micro,
             updated_at = excluded.updated_at",
        params![balance.micro(), timestamp.as_millis()],
    )?;
    Ok(())
}

fn upsert_candle_conn(
    conn: &Connection,
    symbol: &Symbol,
    timeframe: &str,
    bucket: i64,
    price: Price,
    qty: Qty,
) -> Result<(), StoreError> {
    let p = price.to_f64();
    conn.execute(
        "INSERT INTO candles (symbol, timeframe, time, open, high, low, close, volume)
         VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?4, ?5)
         ON CONFLICT(symbol, timeframe, time) DO UPDATE SET
             high = MAX(high, excluded.high),
             low = MIN(low, excluded.low),
             close = excluded.close,
             volume = volume + excluded.volume",
        params![symbol.as_str(), timeframe, bucket, p, qty.to_f64()],
    )?;
    Ok(())
}

fn insert_trade(conn: &Connection, trade: &Trade) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO trades
             (id, symbol, maker_order_id, taker_order_id, maker_user, taker_user,
              taker_side, price, quantity, maker_fee, taker_fee, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            trade.id.0,
            trade.symbol.as_str(),
            trade.maker_order_id.0,
            trade.taker_order_id.0,
            trade.maker_user.as_str(),
            trade.taker_user.as_str(),
            trade.taker_side.to_string(),
            trade.price.to_f64(),
            trade.quantity.to_f64(),
            trade.maker_fee.to_f64(),
            trade.taker_fee.to_f64(),
            trade.timestamp.as_millis()
        ],
    )?;
    Ok(())
}
