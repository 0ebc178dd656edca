//! Double-entry accounting ledger.
//!
//! Every economic effect in the exchange posts a balanced multi-leg
//! transaction here. The on-disk format is plain ledger text, one journal
//! file per category, so the books remain auditable with standard tooling.
//! An in-memory master index composes all files for queries; appends and
//! queries share one writer lock so readers always see whole transactions.
//!
//! The invariant is absolute: for every transaction and every commodity the
//! postings sum to zero, and an append that does not balance is rejected
//! before anything touches disk.

use crate::types::{Price, Quote, Timestamp, UserId, MICRO_SCALE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub account: String,
    /// Signed amount, ledger convention: debits positive, credits negative.
    pub amount: Quote,
    pub commodity: String,
}

impl Posting {
    pub fn new(account: impl Into<String>, amount: Quote, commodity: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            amount,
            commodity: commodity.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// YYYY/MM/DD.
    pub date: String,
    pub description: String,
    pub cleared: bool,
    pub postings: Vec<Posting>,
}

impl Transaction {
    pub fn new(date: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            description: description.into(),
            cleared: true,
            postings: Vec::new(),
        }
    }

    pub fn with_postings(mut self, postings: Vec<Posting>) -> Self {
        self.postings = postings;
        self
    }

    /// Residual per commodity. Empty iff the transaction balances.
    pub fn imbalances(&self) -> Vec<(String, Quote)> {
        let mut sums: Vec<(String, Quote)> = Vec::new();
        for posting in &self.postings {
            match sums.iter_mut().find(|(c, _)| c == &posting.commodity) {
                Some((_, sum)) => *sum = sum.add(posting.amount),
                None => sums.push((posting.commodity.clone(), posting.amount)),
            }
        }
        sums.retain(|(_, sum)| !sum.is_zero());
        sums
    }
}

// 7.0: chart of accounts. builders for every account the core posts to, so
// nothing concatenates account paths ad hoc.
pub mod accounts {
    use crate::types::{Symbol, UserId};

    pub const BANK_MNT: &str = "Assets:Exchange:Bank:MNT";
    pub const EXCHANGE_TRADING: &str = "Assets:Exchange:Trading";
    pub const INSURANCE_FUND: &str = "Assets:Exchange:InsuranceFund";
    pub const HEDGE_CASH: &str = "Assets:Hedge:Broker:Cash";

    pub const REVENUE_FEES: &str = "Revenue:Trading:Fees";
    pub const REVENUE_SPREAD: &str = "Revenue:Trading:Spread";
    pub const REVENUE_CUSTOMER_LOSS: &str = "Revenue:Trading:CustomerLoss";
    pub const REVENUE_ADL: &str = "Revenue:Trading:ADL";
    pub const REVENUE_HEDGING: &str = "Revenue:Hedging:Realized";

    pub const EXPENSE_CUSTOMER_PAYOUT: &str = "Expenses:Trading:CustomerPayout";
    pub const EXPENSE_INSURANCE_LIQUIDATION: &str = "Expenses:Insurance:Liquidation";
    pub const EXPENSE_HEDGING: &str = "Expenses:Hedging:Realized";

    pub fn customer_balance(user: &UserId) -> String {
        format!("Liabilities:Customer:{}:Balance", user)
    }

    pub fn customer_margin(user: &UserId) -> String {
        format!("Liabilities:Customer:{}:Margin", user)
    }

    pub fn funding_revenue(symbol: &Symbol) -> String {
        format!("Revenue:Funding:{}", symbol)
    }

    pub fn funding_expense(symbol: &Symbol) -> String {
        format!("Expenses:Funding:{}", symbol)
    }

    /// Broker symbols may contain '/', which collides with the account
    /// hierarchy separator in ledger tooling.
    pub fn hedge_position(external_symbol: &str) -> String {
        format!(
            "Assets:Hedge:Broker:Positions:{}",
            external_symbol.replace('/', "_")
        )
    }
}

/// One journal file per posting category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalFile {
    Deposits,
    Withdrawals,
    Trades,
    Margin,
    Pnl,
    Funding,
    Liquidations,
    Hedging,
    Prices,
}

impl JournalFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            JournalFile::Deposits => "deposits.ledger",
            JournalFile::Withdrawals => "withdrawals.ledger",
            JournalFile::Trades => "trades.ledger",
            JournalFile::Margin => "margin.ledger",
            JournalFile::Pnl => "pnl.ledger",
            JournalFile::Funding => "funding.ledger",
            JournalFile::Liquidations => "liquidations.ledger",
            JournalFile::Hedging => "hedging.ledger",
            JournalFile::Prices => "prices.ledger",
        }
    }

    pub fn all() -> [JournalFile; 9] {
        [
            JournalFile::Deposits,
            JournalFile::Withdrawals,
            JournalFile::Trades,
            JournalFile::Margin,
            JournalFile::Pnl,
            JournalFile::Funding,
            JournalFile::Liquidations,
            JournalFile::Hedging,
            JournalFile::Prices,
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction `{description}` does not balance: {residuals:?}")]
    Unbalanced {
        description: String,
        residuals: Vec<(String, Quote)>,
    },

    #[error("transaction `{0}` has fewer than two postings")]
    TooFewPostings(String),

    #[error("ledger io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger line {line} in {path}")]
    Parse { path: PathBuf, line: usize },
}

#[derive(Debug, Default)]
struct LedgerIndex {
    transactions: Vec<Transaction>,
}

/// Register query row.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterEntry {
    pub date: String,
    pub description: String,
    pub account: String,
    pub amount: Quote,
    pub commodity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomeStatement {
    pub revenue: Quote,
    pub expenses: Quote,
    pub net_income: Quote,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSheet {
    pub assets: Quote,
    pub liabilities: Quote,
    pub net_income: Quote,
}

// 7.1: the ledger service. single writer across all files; the lock also
// covers the index so queries never see half a transaction.
#[derive(Debug)]
pub struct Ledger {
    dir: PathBuf,
    fsync: bool,
    inner: Mutex<LedgerIndex>,
}

impl Ledger {
    /// Open the ledger directory, replaying any existing journal files into
    /// the master index.
    pub fn open(dir: impl Into<PathBuf>, fsync: bool) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| LedgerError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut index = LedgerIndex::default();
        for file in JournalFile::all() {
            let path = dir.join(file.file_name());
            if path.exists() {
                parse_journal_file(&path, &mut index.transactions)?;
            }
        }

        Ok(Self {
            dir,
            fsync,
            inner: Mutex::new(index),
        })
    }

    /// Append a balanced transaction to its category file. Rejects before
    /// touching disk if any commodity does not sum to zero.
    pub fn append(&self, file: JournalFile, tx: Transaction) -> Result<(), LedgerError> {
        if tx.postings.len() < 2 {
            return Err(LedgerError::TooFewPostings(tx.description));
        }
        let residuals = tx.imbalances();
        if !residuals.is_empty() {
            return Err(LedgerError::Unbalanced {
                description: tx.description,
                residuals,
            });
        }

        let mut text = String::new();
        let _ = writeln!(
            text,
            "{} {}{}",
            tx.date,
            if tx.cleared { "* " } else { "" },
            tx.description
        );
        for posting in &tx.postings {
            let _ = writeln!(
                text,
                "    {}    {} {}",
                posting.account,
                format_amount(posting.amount.micro()),
                posting.commodity
            );
        }
        text.push('\n');

        let mut inner = self.inner.lock();
        self.write_file(file, &text)?;
        inner.transactions.push(tx);
        Ok(())
    }

    /// Audit annotation on its own comment line, e.g. admin overrides.
    pub fn append_audit(&self, file: JournalFile, note: &str) -> Result<(), LedgerError> {
        let _inner = self.inner.lock();
        self.write_file(file, &format!("; [AUDIT] {}\n\n", note))
    }

    /// `P` price directive for mark price updates.
    pub fn write_price(
        &self,
        timestamp: Timestamp,
        commodity: &str,
        price: Price,
        base: &str,
    ) -> Result<(), LedgerError> {
        let _inner = self.inner.lock();
        let line = format!(
            "P {} {} {} {}\n",
            timestamp.ledger_date(),
            commodity,
            format_amount(price.micro()),
            base
        );
        self.write_file(JournalFile::Prices, &line)
    }

    fn write_file(&self, file: JournalFile, text: &str) -> Result<(), LedgerError> {
        let path = self.dir.join(file.file_name());
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        handle.write_all(text.as_bytes()).map_err(io_err)?;
        if self.fsync {
            handle.sync_data().map_err(io_err)?;
        }
        Ok(())
    }

    // --- queries -------------------------------------------------------

    /// Signed ledger balance for accounts under `prefix`. Liability and
    /// revenue accounts report negative by convention.
    pub fn balance(&self, prefix: &str, commodity: &str) -> Quote {
        let inner = self.inner.lock();
        inner
            .transactions
            .iter()
            .flat_map(|tx| tx.postings.iter())
            .filter(|p| p.account.starts_with(prefix) && p.commodity == commodity)
            .map(|p| p.amount)
            .sum()
    }

    /// Customer-facing balance: the negated liability.
    pub fn customer_balance(&self, user: &UserId, commodity: &str) -> Quote {
        self.balance(&accounts::customer_balance(user), commodity)
            .negate()
    }

    pub fn register(&self, prefix: &str) -> Vec<RegisterEntry> {
        let inner = self.inner.lock();
        inner
            .transactions
            .iter()
            .flat_map(|tx| {
                tx.postings
                    .iter()
                    .filter(|p| p.account.starts_with(prefix))
                    .map(move |p| RegisterEntry {
                        date: tx.date.clone(),
                        description: tx.description.clone(),
                        account: p.account.clone(),
                        amount: p.amount,
                        commodity: p.commodity.clone(),
                    })
            })
            .collect()
    }

    pub fn income_statement(&self, commodity: &str) -> IncomeStatement {
        let revenue = self.balance("Revenue", commodity).negate();
        let expenses = self.balance("Expenses", commodity);
        IncomeStatement {
            revenue,
            expenses,
            net_income: revenue.sub(expenses),
        }
    }

    pub fn balance_sheet(&self, commodity: &str) -> BalanceSheet {
        let assets = self.balance("Assets", commodity);
        let liabilities = self.balance("Liabilities", commodity).negate();
        let is = self.income_statement(commodity);
        BalanceSheet {
            assets,
            liabilities,
            net_income: is.net_income,
        }
    }

    /// Sum of every posting per commodity. Zero for each commodity, always.
    pub fn trial_balance(&self) -> Vec<(String, Quote)> {
        let inner = self.inner.lock();
        let mut sums: Vec<(String, Quote)> = Vec::new();
        for posting in inner.transactions.iter().flat_map(|tx| tx.postings.iter()) {
            match sums.iter_mut().find(|(c, _)| c == &posting.commodity) {
                Some((_, sum)) => *sum = sum.add(posting.amount),
                None => sums.push((posting.commodity.clone(), posting.amount)),
            }
        }
        sums
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().transactions.len()
    }
}

// 7.2: exact decimal formatting from micro integers. float formatting never
// touches the books.
pub(crate) fn format_amount(micro: i64) -> String {
    let sign = if micro < 0 { "-" } else { "" };
    let abs = micro.unsigned_abs();
    let units = abs / MICRO_SCALE as u64;
    let frac = abs % MICRO_SCALE as u64;
    if frac == 0 {
        format!("{sign}{units}")
    } else {
        let frac = format!("{frac:06}");
        format!("{sign}{units}.{}", frac.trim_end_matches('0'))
    }
}

pub(crate) fn parse_amount(text: &str) -> Option<i64> {
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, text),
    };
    let (units, frac) = match digits.split_once('.') {
        Some((u, f)) => (u, f),
        None => (digits, ""),
    };
    if frac.len() > 6 || units.is_empty() {
        return None;
    }
    let units: i64 = units.parse().ok()?;
    let frac_micro: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<6}").parse().ok()?
    };
    Some(sign * (units * MICRO_SCALE + frac_micro))
}

fn parse_journal_file(path: &Path, out: &mut Vec<Transaction>) -> Result<(), LedgerError> {
    let file = File::open(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut current: Option<Transaction> = None;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim_end();

        if trimmed.is_empty() {
            if let Some(tx) = current.take() {
                out.push(tx);
            }
            continue;
        }
        // comments and price directives carry no postings
        if trimmed.starts_with(';') || trimmed.starts_with("P ") {
            continue;
        }

        if line.starts_with("    ") {
            let posting = parse_posting(trimmed).ok_or(LedgerError::Parse {
                path: path.to_path_buf(),
                line: line_no + 1,
            })?;
            match current.as_mut() {
                Some(tx) => tx.postings.push(posting),
                None => {
                    return Err(LedgerError::Parse {
                        path: path.to_path_buf(),
                        line: line_no + 1,
                    })
                }
            }
        } else {
            if let Some(tx) = current.take() {
                out.push(tx);
            }
            current = Some(parse_header(trimmed).ok_or(LedgerError::Parse {
                path: path.to_path_buf(),
                line: line_no + 1,
            })?);
        }
    }
    if let Some(tx) = current.take() {
        out.push(tx);
    }
    Ok(())
}

fn parse_header(line: &str) -> Option<Transaction> {
    let (date, rest) = line.split_once(' ')?;
    let (cleared, description) = match rest.strip_prefix("* ") {
        Some(desc) => (true, desc),
        None => (false, rest),
    };
    Some(Transaction {
        date: date.to_string(),
        description: description.to_string(),
        cleared,
        postings: Vec::new(),
    })
}

fn parse_posting(line: &str) -> Option<Posting> {
    let body = line.trim_start();
    let (account, rest) = body.split_once("    ")?;
    let mut parts = rest.trim().split_whitespace();
    let amount = parse_amount(parts.next()?)?;
    let commodity = parts.next()?;
    Some(Posting::new(
        account.trim(),
        Quote::from_micro(amount),
        commodity,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quote(units: i64) -> Quote {
        Quote::from_micro(units * MICRO_SCALE)
    }

    fn deposit_tx(user: &str, amount: i64) -> Transaction {
        let user = UserId::new(user);
        Transaction::new("2026/08/01", format!("Deposit from {}", user)).with_postings(vec![
            Posting::new(accounts::BANK_MNT, quote(amount), "MNT"),
            Posting::new(accounts::customer_balance(&user), quote(-amount), "MNT"),
        ])
    }

    #[test]
    fn balanced_append_and_query() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), false).unwrap();

        ledger
            .append(JournalFile::Deposits, deposit_tx("user1", 100))
            .unwrap();

        let user = UserId::new("user1");
        assert_eq!(ledger.customer_balance(&user, "MNT"), quote(100));
        assert_eq!(ledger.balance(accounts::BANK_MNT, "MNT"), quote(100));
        assert!(ledger.trial_balance().is_empty() || ledger
            .trial_balance()
            .iter()
            .all(|(_, sum)| sum.is_zero()));
    }

    #[test]
    fn unbalanced_append_is_rejected() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), false).unwrap();

        let tx = Transaction::new("2026/08/01", "broken").with_postings(vec![
            Posting::new(accounts::BANK_MNT, quote(100), "MNT"),
            Posting::new("Liabilities:Customer:u:Balance", quote(-99), "MNT"),
        ]);
        assert!(matches!(
            ledger.append(JournalFile::Deposits, tx),
            Err(LedgerError::Unbalanced { .. })
        ));
        assert_eq!(ledger.transaction_count(), 0);
    }

    #[test]
    fn multi_commodity_must_balance_per_commodity() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), false).unwrap();

        // balanced in MNT and in XAU separately
        let tx = Transaction::new("2026/08/01", "BUY XAU 1 @ 100").with_postings(vec![
            Posting::new("Assets:Client:buyer:XAU", quote(1), "XAU"),
            Posting::new("Assets:Client:seller:XAU", quote(-1), "XAU"),
            Posting::new("Assets:Client:seller:MNT", quote(100), "MNT"),
            Posting::new("Assets:Client:buyer:MNT", quote(-100), "MNT"),
        ]);
        ledger.append(JournalFile::Trades, tx).unwrap();

        // cross-commodity "balance" does not count
        let tx = Transaction::new("2026/08/01", "bad").with_postings(vec![
            Posting::new("Assets:Client:buyer:XAU", quote(100), "XAU"),
            Posting::new("Assets:Client:buyer:MNT", quote(-100), "MNT"),
        ]);
        assert!(ledger.append(JournalFile::Trades, tx).is_err());
    }

    #[test]
    fn reload_from_disk_round_trips() {
        let dir = tempdir().unwrap();
        {
            let ledger = Ledger::open(dir.path(), true).unwrap();
            ledger
                .append(JournalFile::Deposits, deposit_tx("user1", 250))
                .unwrap();
            ledger
                .append(JournalFile::Deposits, deposit_tx("user2", 50))
                .unwrap();
            ledger.append_audit(JournalFile::Deposits, "manual top-up").unwrap();
            ledger
                .write_price(
                    Timestamp::from_millis(0),
                    "XAU",
                    Price::new_unchecked(100 * MICRO_SCALE),
                    "MNT",
                )
                .unwrap();
        }

        let reopened = Ledger::open(dir.path(), false).unwrap();
        assert_eq!(reopened.transaction_count(), 2);
        assert_eq!(
            reopened.customer_balance(&UserId::new("user1"), "MNT"),
            quote(250)
        );
        let register = reopened.register("Liabilities:Customer:user2");
        assert_eq!(register.len(), 1);
        assert_eq!(register[0].amount, quote(-50));
    }

    #[test]
    fn income_statement_signs() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), false).unwrap();

        // fee revenue: customer pays 1, revenue 1
        let user = UserId::new("user1");
        let tx = Transaction::new("2026/08/01", "fee").with_postings(vec![
            Posting::new(accounts::customer_balance(&user), quote(1), "MNT"),
            Posting::new(accounts::REVENUE_FEES, quote(-1), "MNT"),
        ]);
        ledger.append(JournalFile::Trades, tx).unwrap();

        let is = ledger.income_statement("MNT");
        assert_eq!(is.revenue, quote(1));
        assert_eq!(is.expenses, Quote::ZERO);
        assert_eq!(is.net_income, quote(1));
    }

    #[test]
    fn amount_format_round_trip() {
        for micro in [0, 1, -1, 50_000, -50_000, 1_500_000, 123_456_789, -100 * MICRO_SCALE] {
            let text = format_amount(micro);
            assert_eq!(parse_amount(&text), Some(micro), "text was {text}");
        }
        assert_eq!(format_amount(50_000), "0.05");
        assert_eq!(format_amount(-2 * MICRO_SCALE), "-2");
    }
}
