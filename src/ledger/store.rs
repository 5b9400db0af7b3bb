//! Account rows, balance mutations, and item inventory.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{LedgerError, LedgerResult};
use crate::models::{BetSource, Item};

/// A ledger account.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub real_balance: f64,
    pub bonus_balance: f64,
    pub lifetime_deposited: f64,
    pub rollover_progress: f64,
    pub affiliate_cpa_accrued: f64,
    pub affiliate_revshare_accrued: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed ledger.
pub struct LedgerDb {
    pub(super) conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    /// Open (or create) the ledger database and initialize the schema.
    pub fn new(db_path: &str) -> LedgerResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> LedgerResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                real_balance REAL NOT NULL DEFAULT 0.0,
                bonus_balance REAL NOT NULL DEFAULT 0.0,
                lifetime_deposited REAL NOT NULL DEFAULT 0.0,
                rollover_progress REAL NOT NULL DEFAULT 0.0,
                affiliate_cpa_accrued REAL NOT NULL DEFAULT 0.0,
                affiliate_revshare_accrued REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS inventory (
                account_id INTEGER NOT NULL,
                item TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(account_id, item),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                tx_type TEXT NOT NULL,
                amount REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                external_ref TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS referrals (
                referrer_id INTEGER NOT NULL,
                referred_id INTEGER UNIQUE NOT NULL,
                cpa_paid INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (referrer_id) REFERENCES accounts(id),
                FOREIGN KEY (referred_id) REFERENCES accounts(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tx_account ON transactions(account_id)",
            [],
        )?;

        Ok(())
    }

    /// Get or create an account by username.
    pub async fn get_or_create_account(&self, username: &str) -> LedgerResult<Account> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        let existing = conn
            .query_row(
                "SELECT * FROM accounts WHERE username = ?",
                [username],
                row_to_account,
            )
            .optional()?;

        if let Some(account) = existing {
            return Ok(account);
        }

        conn.execute(
            "INSERT INTO accounts (username, created_at, updated_at) VALUES (?, ?, ?)",
            params![username, &now, &now],
        )?;
        let id = conn.last_insert_rowid();
        info!("Created ledger account {} ({})", id, username);

        conn.query_row("SELECT * FROM accounts WHERE id = ?", [id], row_to_account)
            .map_err(Into::into)
    }

    pub async fn get_account(&self, account_id: i64) -> LedgerResult<Account> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM accounts WHERE id = ?",
            [account_id],
            row_to_account,
        )
        .optional()?
        .ok_or(LedgerError::AccountNotFound(account_id))
    }

    /// Guarded conditional decrement against one balance pool.
    ///
    /// The balance check and the decrement are one statement; a concurrent
    /// debit cannot slip between them. Fails closed with `InsufficientFunds`.
    pub async fn try_debit(
        &self,
        account_id: i64,
        source: BetSource,
        amount: f64,
    ) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let column = balance_column(source);

        let changed = conn.execute(
            &format!(
                "UPDATE accounts SET {col} = {col} - ?1, updated_at = ?2
                 WHERE id = ?3 AND {col} >= ?1",
                col = column
            ),
            params![amount, &now, account_id],
        )?;

        if changed == 0 {
            return Err(LedgerError::InsufficientFunds);
        }
        Ok(())
    }

    /// Unconditional credit to one balance pool.
    pub async fn credit(
        &self,
        account_id: i64,
        source: BetSource,
        amount: f64,
    ) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let column = balance_column(source);

        let changed = conn.execute(
            &format!(
                "UPDATE accounts SET {col} = {col} + ?1, updated_at = ?2 WHERE id = ?3",
                col = column
            ),
            params![amount, &now, account_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        Ok(())
    }

    /// Credit a confirmed deposit: real balance and lifetime total in one step.
    pub async fn credit_deposit(&self, account_id: i64, amount: f64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE accounts SET real_balance = real_balance + ?1,
                    lifetime_deposited = lifetime_deposited + ?1,
                    updated_at = ?2
             WHERE id = ?3",
            params![amount, &now, account_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        Ok(())
    }

    /// Track rollover progress for bonus-sourced winnings.
    pub async fn add_rollover_progress(&self, account_id: i64, amount: f64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE accounts SET rollover_progress = rollover_progress + ?1, updated_at = ?2
             WHERE id = ?3",
            params![amount, &now, account_id],
        )?;
        Ok(())
    }

    // ===== Item inventory =====

    pub async fn item_count(&self, account_id: i64, item: Item) -> LedgerResult<i64> {
        let conn = self.conn.lock().await;
        let count = conn
            .query_row(
                "SELECT count FROM inventory WHERE account_id = ? AND item = ?",
                params![account_id, item.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }

    pub async fn grant_item(&self, account_id: i64, item: Item, count: i64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO inventory (account_id, item, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, item) DO UPDATE SET count = count + ?3",
            params![account_id, item.as_str(), count],
        )?;
        Ok(())
    }

    /// Guarded decrement of one unit of an item. Fails if none remain.
    pub async fn try_consume_item(&self, account_id: i64, item: Item) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE inventory SET count = count - 1
             WHERE account_id = ? AND item = ? AND count >= 1",
            params![account_id, item.as_str()],
        )?;
        if changed == 0 {
            return Err(LedgerError::NoItem(match item {
                Item::Shield => "shield",
                Item::Magnet => "magnet",
                Item::ExtraLife => "extra life",
            }));
        }
        Ok(())
    }
}

fn balance_column(source: BetSource) -> &'static str {
    match source {
        BetSource::Real => "real_balance",
        BetSource::Bonus => "bonus_balance",
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        real_balance: row.get(2)?,
        bonus_balance: row.get(3)?,
        lifetime_deposited: row.get(4)?,
        rollover_progress: row.get(5)?,
        affiliate_cpa_accrued: row.get(6)?,
        affiliate_revshare_accrued: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
