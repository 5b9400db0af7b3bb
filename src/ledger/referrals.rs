//! Referral edges and affiliate earnings.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{LedgerDb, LedgerError, LedgerResult};

impl LedgerDb {
    /// Record a referral edge. A referred account has at most one referrer;
    /// a second registration for the same account is ignored.
    pub async fn set_referrer(&self, referred_id: i64, referrer_id: i64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO referrals (referrer_id, referred_id, created_at)
             VALUES (?, ?, ?)",
            params![referrer_id, referred_id, &now],
        )?;
        Ok(())
    }

    pub async fn referrer_of(&self, account_id: i64) -> LedgerResult<Option<i64>> {
        let conn = self.conn.lock().await;
        let referrer = conn
            .query_row(
                "SELECT referrer_id FROM referrals WHERE referred_id = ?",
                [account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(referrer)
    }

    /// Flip the per-edge CPA flag. Returns `true` only for the first caller;
    /// the guarded UPDATE makes the commission at-most-once per edge.
    pub async fn try_mark_cpa_paid(&self, referred_id: i64) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE referrals SET cpa_paid = 1 WHERE referred_id = ? AND cpa_paid = 0",
            [referred_id],
        )?;
        Ok(changed == 1)
    }

    pub async fn add_cpa_earnings(&self, referrer_id: i64, amount: f64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE accounts SET affiliate_cpa_accrued = affiliate_cpa_accrued + ?1,
                    updated_at = ?2
             WHERE id = ?3",
            params![amount, &now, referrer_id],
        )?;
        Ok(())
    }

    pub async fn add_revshare_earnings(&self, referrer_id: i64, amount: f64) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE accounts SET affiliate_revshare_accrued = affiliate_revshare_accrued + ?1,
                    updated_at = ?2
             WHERE id = ?3",
            params![amount, &now, referrer_id],
        )?;
        Ok(())
    }

    /// Claim all accrued affiliate earnings: zero both accrual fields and
    /// credit their sum to the real balance, atomically. Never partial.
    pub async fn claim_affiliate_earnings(&self, account_id: i64) -> LedgerResult<f64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let (cpa, revshare): (f64, f64) = tx
            .query_row(
                "SELECT affiliate_cpa_accrued, affiliate_revshare_accrued
                 FROM accounts WHERE id = ?",
                [account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(LedgerError::AccountNotFound(account_id))?;

        let total = cpa + revshare;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE accounts SET affiliate_cpa_accrued = 0.0,
                    affiliate_revshare_accrued = 0.0,
                    real_balance = real_balance + ?1,
                    updated_at = ?2
             WHERE id = ?3",
            params![total, &now, account_id],
        )?;
        tx.commit()?;

        if total > 0.0 {
            info!("Account {} claimed {:.2} affiliate earnings", account_id, total);
        }
        Ok(total)
    }
}
