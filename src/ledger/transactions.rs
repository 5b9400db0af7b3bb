//! Transaction records keyed by external reference.
//!
//! The UNIQUE constraint on `external_ref` plus the guarded
//! PENDING -> COMPLETED transition make confirmation exactly-once even when
//! a poll and a webhook race for the same reference.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{LedgerDb, LedgerResult};
use crate::models::{TransactionRecord, TxStatus, TxType};

impl LedgerDb {
    /// Insert a PENDING transaction. Returns `Ok(false)` if a record for this
    /// external reference already exists (the uniqueness constraint fired).
    pub async fn insert_pending_tx(
        &self,
        account_id: i64,
        tx_type: TxType,
        amount: f64,
        external_ref: &str,
    ) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let result = conn.execute(
            "INSERT INTO transactions (account_id, tx_type, amount, status, external_ref, created_at)
             VALUES (?, ?, ?, 'PENDING', ?, ?)",
            params![account_id, tx_type.as_str(), amount, external_ref, &now],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn tx_by_external_ref(
        &self,
        external_ref: &str,
    ) -> LedgerResult<Option<TransactionRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, account_id, tx_type, amount, status, external_ref, created_at
                 FROM transactions WHERE external_ref = ?",
                [external_ref],
                row_to_tx,
            )
            .optional()?;
        Ok(record)
    }

    /// Attempt the PENDING -> COMPLETED transition, updating the amount to the
    /// authoritative figure. Returns `true` only for the caller that actually
    /// performed the transition; every later caller gets `false`.
    pub async fn try_complete_tx(&self, external_ref: &str, amount: f64) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE transactions SET status = 'COMPLETED', amount = ?
             WHERE external_ref = ? AND status = 'PENDING'",
            params![amount, external_ref],
        )?;
        Ok(changed == 1)
    }

    /// Mark a pending transaction REJECTED (terminal, no further transitions).
    pub async fn try_reject_tx(&self, external_ref: &str) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE transactions SET status = 'REJECTED'
             WHERE external_ref = ? AND status = 'PENDING'",
            [external_ref],
        )?;
        Ok(changed == 1)
    }

    pub async fn transactions_for_account(
        &self,
        account_id: i64,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, tx_type, amount, status, external_ref, created_at
             FROM transactions WHERE account_id = ? ORDER BY id DESC LIMIT ?",
        )?;
        let records = stmt
            .query_map(params![account_id, limit], row_to_tx)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let tx_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(TransactionRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        tx_type: TxType::from_str(&tx_type).unwrap_or(TxType::Deposit),
        amount: row.get(3)?,
        status: TxStatus::from_str(&status).unwrap_or(TxStatus::Pending),
        external_ref: row.get(5)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&row.get::<_, String>(6)?)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}
