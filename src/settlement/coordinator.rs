//! Settlement coordinator.
//!
//! Every balance mutation funnels through here: bet reservation, payout
//! credit, deposit confirmation, withdrawal debit, and referral commission.
//! Gateway-reported state is always re-verified; webhook payloads are never
//! trusted at face value.

use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::gateway::{DepositCharge, PaymentGateway};
use crate::ledger::{LedgerDb, LedgerError};
use crate::models::{BetSource, Item, TxStatus, TxType};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("insufficient balance")]
    InsufficientFunds,
    #[error("minimum {kind} is {minimum:.2}")]
    BelowMinimum { kind: &'static str, minimum: f64 },
    #[error("transaction is not paid")]
    NotPaid,
    #[error("unknown transaction reference")]
    UnknownTransaction,
    #[error("no {0} item available")]
    NoItem(&'static str),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error("payment gateway error: {0}")]
    Gateway(#[from] anyhow::Error),
}

impl From<LedgerError> for SettlementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds => SettlementError::InsufficientFunds,
            LedgerError::NoItem(item) => SettlementError::NoItem(item),
            other => SettlementError::Ledger(other),
        }
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

/// Coordinates ledger and gateway so each money movement happens exactly once.
pub struct SettlementCoordinator {
    ledger: Arc<LedgerDb>,
    gateway: Arc<dyn PaymentGateway>,
    config: Arc<ConfigHandle>,
}

impl SettlementCoordinator {
    pub fn new(
        ledger: Arc<LedgerDb>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerDb> {
        &self.ledger
    }

    // ===== Session money movement =====

    /// Reserve the bet from the chosen balance pool. The guarded decrement is
    /// the funds check; there is no separate pre-read to race against.
    pub async fn reserve_bet(
        &self,
        account_id: i64,
        session_id: Uuid,
        amount: f64,
        source: BetSource,
    ) -> SettlementResult<()> {
        let cfg = self.config.current();
        if amount < cfg.min_bet {
            return Err(SettlementError::BelowMinimum {
                kind: "bet",
                minimum: cfg.min_bet,
            });
        }

        self.ledger.try_debit(account_id, source, amount).await?;
        let bet_ref = format!("bet:{}", session_id);
        self.ledger
            .insert_pending_tx(account_id, TxType::Bet, amount, &bet_ref)
            .await?;
        self.ledger.try_complete_tx(&bet_ref, amount).await?;
        info!(account_id, %session_id, amount, source = source.as_str(), "Bet reserved");
        Ok(())
    }

    /// Refund a LOBBY cancellation. Keyed by session id so a double cancel
    /// refunds once.
    pub async fn refund_bet(
        &self,
        account_id: i64,
        session_id: Uuid,
        amount: f64,
        source: BetSource,
    ) -> SettlementResult<()> {
        let refund_ref = format!("refund:{}", session_id);
        if !self
            .ledger
            .insert_pending_tx(account_id, TxType::Win, amount, &refund_ref)
            .await?
        {
            return Ok(());
        }
        self.ledger.try_complete_tx(&refund_ref, amount).await?;
        self.ledger.credit(account_id, source, amount).await?;
        info!(account_id, %session_id, amount, "Bet refunded on cancel");
        Ok(())
    }

    /// Credit a settled session's payout. The WIN record keyed by session id
    /// makes this exactly-once; a duplicate settlement is absorbed.
    /// A zero payout on a real-money bet posts revenue share to the referrer.
    pub async fn settle_session(
        &self,
        account_id: i64,
        session_id: Uuid,
        bet: f64,
        source: BetSource,
        payout: f64,
    ) -> SettlementResult<f64> {
        let win_ref = format!("win:{}", session_id);
        if !self
            .ledger
            .insert_pending_tx(account_id, TxType::Win, payout, &win_ref)
            .await?
        {
            warn!(%session_id, "Duplicate settlement absorbed");
            let account = self.ledger.get_account(account_id).await?;
            return Ok(match source {
                BetSource::Real => account.real_balance,
                BetSource::Bonus => account.bonus_balance,
            });
        }
        self.ledger.try_complete_tx(&win_ref, payout).await?;

        if payout > 0.0 {
            self.ledger.credit(account_id, source, payout).await?;
            if source == BetSource::Bonus {
                let profit = payout - bet;
                if profit > 0.0 {
                    self.ledger.add_rollover_progress(account_id, profit).await?;
                }
            }
            info!(account_id, %session_id, payout, "Payout credited");
        } else if source == BetSource::Real {
            self.post_revshare(account_id, bet).await?;
        }

        let account = self.ledger.get_account(account_id).await?;
        Ok(match source {
            BetSource::Real => account.real_balance,
            BetSource::Bonus => account.bonus_balance,
        })
    }

    async fn post_revshare(&self, loser_id: i64, bet: f64) -> SettlementResult<()> {
        if let Some(referrer_id) = self.ledger.referrer_of(loser_id).await? {
            let pct = self.config.current().revshare_pct;
            let commission = bet * pct;
            self.ledger
                .add_revshare_earnings(referrer_id, commission)
                .await?;
            info!(referrer_id, loser_id, commission, "Revenue share posted");
        }
        Ok(())
    }

    // ===== Deposits =====

    /// Create a deposit charge at the gateway. Nothing is reserved yet, so a
    /// gateway failure here surfaces to the caller without ledger changes.
    pub async fn create_deposit(
        &self,
        account_id: i64,
        amount: f64,
        payer_tax_id: &str,
    ) -> SettlementResult<DepositCharge> {
        let cfg = self.config.current();
        if amount < cfg.min_deposit {
            return Err(SettlementError::BelowMinimum {
                kind: "deposit",
                minimum: cfg.min_deposit,
            });
        }

        let charge = self.gateway.create_deposit(amount, payer_tax_id).await?;
        self.ledger
            .insert_pending_tx(account_id, TxType::Deposit, amount, &charge.transaction_id)
            .await?;
        info!(account_id, amount, tx = %charge.transaction_id, "Deposit charge created");
        Ok(charge)
    }

    /// Confirm a deposit by external reference. The amount is never taken
    /// from the caller; it is re-derived from the gateway's authoritative
    /// answer. Idempotent before and after the gateway round-trip.
    /// References are direction-specific: a withdrawal reference posted
    /// here is rejected, not re-credited.
    pub async fn confirm_deposit(&self, external_ref: &str) -> SettlementResult<()> {
        let record = self
            .ledger
            .tx_by_external_ref(external_ref)
            .await?
            .ok_or(SettlementError::UnknownTransaction)?;
        if record.tx_type != TxType::Deposit {
            warn!(tx = external_ref, "Non-deposit reference posted to deposit confirmation");
            return Err(SettlementError::UnknownTransaction);
        }

        // Fast path: someone already completed this reference.
        if record.status == TxStatus::Completed {
            return Ok(());
        }

        let gateway_tx = self.gateway.query_transaction(external_ref).await?;
        if !gateway_tx.status.is_paid() {
            return Err(SettlementError::NotPaid);
        }

        // Second check, after the round-trip: only the caller that wins the
        // PENDING -> COMPLETED transition credits the balance.
        if !self
            .ledger
            .try_complete_tx(external_ref, gateway_tx.paid_amount)
            .await?
        {
            return Ok(());
        }

        self.ledger
            .credit_deposit(record.account_id, gateway_tx.paid_amount)
            .await?;
        info!(
            account_id = record.account_id,
            amount = gateway_tx.paid_amount,
            tx = external_ref,
            "Deposit confirmed"
        );

        self.evaluate_cpa(record.account_id).await?;
        Ok(())
    }

    /// Deposit webhook: same path as polling confirmation, so the payload's
    /// own status/amount fields are ignored entirely.
    pub async fn deposit_webhook(&self, external_ref: &str) -> SettlementResult<()> {
        self.confirm_deposit(external_ref).await
    }

    async fn evaluate_cpa(&self, account_id: i64) -> SettlementResult<()> {
        let Some(referrer_id) = self.ledger.referrer_of(account_id).await? else {
            return Ok(());
        };
        let cfg = self.config.current();
        let account = self.ledger.get_account(account_id).await?;
        if account.lifetime_deposited >= cfg.cpa_threshold
            && self.ledger.try_mark_cpa_paid(account_id).await?
        {
            self.ledger
                .add_cpa_earnings(referrer_id, cfg.cpa_amount)
                .await?;
            info!(referrer_id, referred = account_id, amount = cfg.cpa_amount, "CPA paid");
        }
        Ok(())
    }

    // ===== Withdrawals =====

    /// Debit first, then call the gateway. The debit is the same guarded
    /// conditional decrement as a bet reservation, so two concurrent
    /// withdrawals cannot both pass. Gateway failure refunds the debit.
    pub async fn request_withdrawal(
        &self,
        account_id: i64,
        amount: f64,
        payout_key: &str,
        key_type: &str,
    ) -> SettlementResult<String> {
        let cfg = self.config.current();
        if amount < cfg.min_withdrawal {
            return Err(SettlementError::BelowMinimum {
                kind: "withdrawal",
                minimum: cfg.min_withdrawal,
            });
        }

        self.ledger
            .try_debit(account_id, BetSource::Real, amount)
            .await?;

        let receipt = match self
            .gateway
            .request_withdrawal(amount, payout_key, key_type)
            .await
        {
            Ok(receipt) if !receipt.status.is_failed() => receipt,
            Ok(receipt) => {
                warn!(account_id, status = ?receipt.status, "Withdrawal refused, refunding");
                self.ledger
                    .credit(account_id, BetSource::Real, amount)
                    .await?;
                return Err(SettlementError::NotPaid);
            }
            Err(err) => {
                warn!(account_id, %err, "Withdrawal gateway call failed, refunding");
                self.ledger
                    .credit(account_id, BetSource::Real, amount)
                    .await?;
                return Err(err.into());
            }
        };

        self.ledger
            .insert_pending_tx(account_id, TxType::Withdraw, amount, &receipt.transaction_id)
            .await?;
        info!(account_id, amount, tx = %receipt.transaction_id, "Withdrawal submitted");
        Ok(receipt.transaction_id)
    }

    /// Withdrawal webhook: re-verify with the gateway, then either finalize
    /// the record or refund the earlier debit. Both arms are guarded status
    /// transitions, so duplicates are absorbed.
    pub async fn withdrawal_webhook(&self, external_ref: &str) -> SettlementResult<()> {
        let record = self
            .ledger
            .tx_by_external_ref(external_ref)
            .await?
            .ok_or(SettlementError::UnknownTransaction)?;
        if record.tx_type != TxType::Withdraw {
            // A canceled deposit reference posted here would "refund" money
            // that was never debited.
            warn!(tx = external_ref, "Non-withdrawal reference posted to withdrawal webhook");
            return Err(SettlementError::UnknownTransaction);
        }

        if record.status != TxStatus::Pending {
            return Ok(());
        }

        let gateway_tx = self.gateway.query_transaction(external_ref).await?;
        if gateway_tx.status.is_paid() {
            self.ledger
                .try_complete_tx(external_ref, record.amount)
                .await?;
            info!(tx = external_ref, "Withdrawal confirmed paid");
        } else if gateway_tx.status.is_failed() {
            // Only the caller that wins the transition refunds.
            if self.ledger.try_reject_tx(external_ref).await? {
                self.ledger
                    .credit(record.account_id, BetSource::Real, record.amount)
                    .await?;
                info!(tx = external_ref, amount = record.amount, "Failed withdrawal refunded");
            }
        }
        // Still pending at the provider: nothing to do yet.
        Ok(())
    }

    // ===== Items and prizes =====

    /// Buy one item at the configured price.
    pub async fn buy_item(&self, account_id: i64, item: Item) -> SettlementResult<()> {
        let price = self.config.current().item_price(item);
        self.ledger
            .try_debit(account_id, BetSource::Real, price)
            .await?;
        self.ledger.grant_item(account_id, item, 1).await?;
        info!(account_id, item = item.as_str(), price, "Item purchased");
        Ok(())
    }

    /// Open a mystery box: threshold-tiered prize over a uniform roll,
    /// credited to the real balance. The tier shape is the contract; the
    /// coefficients are tunable.
    pub async fn open_mystery_box(&self, account_id: i64) -> SettlementResult<f64> {
        let cfg = self.config.current();
        self.ledger
            .try_debit(account_id, BetSource::Real, cfg.mystery_box_price)
            .await?;

        let roll: f64 = rand::thread_rng().gen();
        let prize = mystery_prize(cfg.mystery_box_price, roll);
        if prize > 0.0 {
            self.ledger
                .credit(account_id, BetSource::Real, prize)
                .await?;
        }
        info!(account_id, roll, prize, "Mystery box opened");
        Ok(prize)
    }

    // ===== Affiliate =====

    pub async fn claim_affiliate_earnings(&self, account_id: i64) -> SettlementResult<f64> {
        let claimed = self.ledger.claim_affiliate_earnings(account_id).await?;
        if claimed > 0.0 {
            let claim_ref = format!("claim:{}", Uuid::new_v4());
            self.ledger
                .insert_pending_tx(account_id, TxType::AffiliateClaim, claimed, &claim_ref)
                .await?;
            self.ledger.try_complete_tx(&claim_ref, claimed).await?;
        }
        Ok(claimed)
    }
}

/// Descending threshold tiers over a uniform [0, 1) roll.
fn mystery_prize(box_price: f64, roll: f64) -> f64 {
    if roll < 0.02 {
        box_price * 10.0
    } else if roll < 0.10 {
        box_price * 3.0
    } else if roll < 0.35 {
        box_price
    } else {
        box_price * 0.2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, ConfigSnapshot};
    use crate::gateway::{GatewayStatus, GatewayTransaction, WithdrawalReceipt};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    /// In-memory gateway double with scriptable statuses.
    #[derive(Default)]
    struct FakeGateway {
        transactions: Mutex<HashMap<String, GatewayTransaction>>,
        fail_payouts: Mutex<bool>,
        next_id: Mutex<u64>,
    }

    impl FakeGateway {
        fn script(&self, id: &str, status: GatewayStatus, paid_amount: f64) {
            self.transactions.lock().insert(
                id.to_string(),
                GatewayTransaction {
                    transaction_id: id.to_string(),
                    status,
                    paid_amount,
                },
            );
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_deposit(
            &self,
            amount: f64,
            _payer_tax_id: &str,
        ) -> anyhow::Result<DepositCharge> {
            let mut next = self.next_id.lock();
            *next += 1;
            let id = format!("DEP-{}", *next);
            self.script(&id, GatewayStatus::Pending, amount);
            Ok(DepositCharge {
                transaction_id: id.clone(),
                payment_code: format!("br-code-{}", id),
                payment_code_image: format!("qr-{}.png", id),
            })
        }

        async fn query_transaction(
            &self,
            transaction_id: &str,
        ) -> anyhow::Result<GatewayTransaction> {
            self.transactions
                .lock()
                .get(transaction_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown transaction"))
        }

        async fn request_withdrawal(
            &self,
            amount: f64,
            _payout_key: &str,
            _key_type: &str,
        ) -> anyhow::Result<WithdrawalReceipt> {
            if *self.fail_payouts.lock() {
                anyhow::bail!("gateway unavailable");
            }
            let mut next = self.next_id.lock();
            *next += 1;
            let id = format!("WD-{}", *next);
            self.script(&id, GatewayStatus::Pending, amount);
            Ok(WithdrawalReceipt {
                transaction_id: id,
                status: GatewayStatus::Pending,
            })
        }
    }

    struct Fixture {
        coordinator: SettlementCoordinator,
        gateway: Arc<FakeGateway>,
        ledger: Arc<LedgerDb>,
        _temp: NamedTempFile,
    }

    fn fixture() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let ledger = Arc::new(LedgerDb::new(temp.path().to_str().unwrap()).unwrap());
        let gateway = Arc::new(FakeGateway::default());
        let config = Arc::new(ConfigHandle::new(ConfigSnapshot::default()));
        let coordinator =
            SettlementCoordinator::new(ledger.clone(), gateway.clone(), config);
        Fixture {
            coordinator,
            gateway,
            ledger,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn reserve_then_settle_scenario() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("alice").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 100.0).await.unwrap();

        let session_id = Uuid::new_v4();
        f.coordinator
            .reserve_bet(account.id, session_id, 10.0, BetSource::Real)
            .await
            .unwrap();
        let mid = f.ledger.get_account(account.id).await.unwrap();
        assert!((mid.real_balance - 90.0).abs() < f64::EPSILON);

        // One pickup at tier multiplier 0.5: payout = accrued 5 + stake 10.
        let balance = f
            .coordinator
            .settle_session(account.id, session_id, 10.0, BetSource::Real, 15.0)
            .await
            .unwrap();
        assert!((balance - 105.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn settlement_is_exactly_once_per_session() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("bob").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 100.0).await.unwrap();

        let session_id = Uuid::new_v4();
        f.coordinator
            .reserve_bet(account.id, session_id, 10.0, BetSource::Real)
            .await
            .unwrap();
        f.coordinator
            .settle_session(account.id, session_id, 10.0, BetSource::Real, 15.0)
            .await
            .unwrap();
        // Duplicate settlement is absorbed without a second credit.
        let balance = f
            .coordinator
            .settle_session(account.id, session_id, 10.0, BetSource::Real, 15.0)
            .await
            .unwrap();
        assert!((balance - 105.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn bonus_win_tracks_rollover_profit() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("carol").await.unwrap();
        f.ledger.credit(account.id, BetSource::Bonus, 50.0).await.unwrap();

        let session_id = Uuid::new_v4();
        f.coordinator
            .reserve_bet(account.id, session_id, 10.0, BetSource::Bonus)
            .await
            .unwrap();
        f.coordinator
            .settle_session(account.id, session_id, 10.0, BetSource::Bonus, 25.0)
            .await
            .unwrap();

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.rollover_progress - 15.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_deposit_confirmations_credit_once() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("dave").await.unwrap();

        let charge = f
            .coordinator
            .create_deposit(account.id, 30.0, "12345678900")
            .await
            .unwrap();
        f.gateway
            .script(&charge.transaction_id, GatewayStatus::Paid, 30.0);

        f.coordinator
            .confirm_deposit(&charge.transaction_id)
            .await
            .unwrap();
        // Webhook races in with the same reference.
        f.coordinator
            .deposit_webhook(&charge.transaction_id)
            .await
            .unwrap();

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 30.0).abs() < f64::EPSILON);
        assert!((account.lifetime_deposited - 30.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn deposit_amount_comes_from_gateway_not_caller() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("eve").await.unwrap();

        // Charge created for 30 but the provider reports 12 actually paid.
        let charge = f
            .coordinator
            .create_deposit(account.id, 30.0, "12345678900")
            .await
            .unwrap();
        f.gateway
            .script(&charge.transaction_id, GatewayStatus::Completed, 12.0);

        f.coordinator
            .confirm_deposit(&charge.transaction_id)
            .await
            .unwrap();
        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 12.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unpaid_deposit_is_rejected_without_credit() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("frank").await.unwrap();
        let charge = f
            .coordinator
            .create_deposit(account.id, 30.0, "12345678900")
            .await
            .unwrap();

        let err = f.coordinator.confirm_deposit(&charge.transaction_id).await;
        assert!(matches!(err, Err(SettlementError::NotPaid)));
        let account = f.ledger.get_account(account.id).await.unwrap();
        assert_eq!(account.real_balance, 0.0);
    }

    #[tokio::test]
    async fn concurrent_withdrawals_cannot_both_pass() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("grace").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 30.0).await.unwrap();

        let first = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await;
        let second = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(SettlementError::InsufficientFunds)));
        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn gateway_failure_refunds_withdrawal_debit() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("heidi").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 50.0).await.unwrap();
        *f.gateway.fail_payouts.lock() = true;

        let result = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await;
        assert!(result.is_err());

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_withdrawal_webhook_refunds_once() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("ivan").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 50.0).await.unwrap();

        let tx_id = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await
            .unwrap();
        f.gateway.script(&tx_id, GatewayStatus::Canceled, 25.0);

        f.coordinator.withdrawal_webhook(&tx_id).await.unwrap();
        // Provider retries the webhook.
        f.coordinator.withdrawal_webhook(&tx_id).await.unwrap();

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn withdrawal_webhook_rejects_deposit_reference() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("mallory").await.unwrap();

        // Unpaid deposit charge, canceled at the provider. Posting its
        // reference to the withdrawal path must not mint a "refund".
        let charge = f
            .coordinator
            .create_deposit(account.id, 1000.0, "12345678900")
            .await
            .unwrap();
        f.gateway
            .script(&charge.transaction_id, GatewayStatus::Canceled, 1000.0);

        let err = f.coordinator.withdrawal_webhook(&charge.transaction_id).await;
        assert!(matches!(err, Err(SettlementError::UnknownTransaction)));

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert_eq!(account.real_balance, 0.0);
        let record = f
            .ledger
            .tx_by_external_ref(&charge.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TxStatus::Pending);
    }

    #[tokio::test]
    async fn confirm_deposit_rejects_withdrawal_reference() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("oscar").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 50.0).await.unwrap();

        let tx_id = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await
            .unwrap();
        f.gateway.script(&tx_id, GatewayStatus::Paid, 25.0);

        // Confirming the paid payout as a deposit must not re-credit it.
        let err = f.coordinator.confirm_deposit(&tx_id).await;
        assert!(matches!(err, Err(SettlementError::UnknownTransaction)));

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 25.0).abs() < f64::EPSILON);
        assert_eq!(account.lifetime_deposited, 0.0);
    }

    #[tokio::test]
    async fn paid_withdrawal_webhook_completes_record() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("judy").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 50.0).await.unwrap();

        let tx_id = f
            .coordinator
            .request_withdrawal(account.id, 25.0, "key", "cpf")
            .await
            .unwrap();
        f.gateway.script(&tx_id, GatewayStatus::Paid, 25.0);
        f.coordinator.withdrawal_webhook(&tx_id).await.unwrap();

        let record = f.ledger.tx_by_external_ref(&tx_id).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Completed);
        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cpa_pays_once_when_threshold_crossed() {
        let f = fixture();
        let referrer = f.ledger.get_or_create_account("ref").await.unwrap();
        let referred = f.ledger.get_or_create_account("new").await.unwrap();
        f.ledger.set_referrer(referred.id, referrer.id).await.unwrap();

        // First deposit under the 50.0 threshold: no CPA.
        let charge = f
            .coordinator
            .create_deposit(referred.id, 30.0, "123")
            .await
            .unwrap();
        f.gateway.script(&charge.transaction_id, GatewayStatus::Paid, 30.0);
        f.coordinator.confirm_deposit(&charge.transaction_id).await.unwrap();
        let r = f.ledger.get_account(referrer.id).await.unwrap();
        assert_eq!(r.affiliate_cpa_accrued, 0.0);

        // Second deposit crosses the threshold: CPA paid once.
        let charge = f
            .coordinator
            .create_deposit(referred.id, 30.0, "123")
            .await
            .unwrap();
        f.gateway.script(&charge.transaction_id, GatewayStatus::Paid, 30.0);
        f.coordinator.confirm_deposit(&charge.transaction_id).await.unwrap();
        let r = f.ledger.get_account(referrer.id).await.unwrap();
        assert!((r.affiliate_cpa_accrued - 10.0).abs() < f64::EPSILON);

        // Third deposit: flag already set, no second CPA.
        let charge = f
            .coordinator
            .create_deposit(referred.id, 30.0, "123")
            .await
            .unwrap();
        f.gateway.script(&charge.transaction_id, GatewayStatus::Paid, 30.0);
        f.coordinator.confirm_deposit(&charge.transaction_id).await.unwrap();
        let r = f.ledger.get_account(referrer.id).await.unwrap();
        assert!((r.affiliate_cpa_accrued - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn real_loss_posts_revshare() {
        let f = fixture();
        let referrer = f.ledger.get_or_create_account("ref").await.unwrap();
        let loser = f.ledger.get_or_create_account("loser").await.unwrap();
        f.ledger.set_referrer(loser.id, referrer.id).await.unwrap();
        f.ledger.credit(loser.id, BetSource::Real, 20.0).await.unwrap();

        let session_id = Uuid::new_v4();
        f.coordinator
            .reserve_bet(loser.id, session_id, 20.0, BetSource::Real)
            .await
            .unwrap();
        f.coordinator
            .settle_session(loser.id, session_id, 20.0, BetSource::Real, 0.0)
            .await
            .unwrap();

        let r = f.ledger.get_account(referrer.id).await.unwrap();
        // 5% of the 20.0 losing bet.
        assert!((r.affiliate_revshare_accrued - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cancel_refund_is_idempotent() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("kate").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 100.0).await.unwrap();

        let session_id = Uuid::new_v4();
        f.coordinator
            .reserve_bet(account.id, session_id, 10.0, BetSource::Real)
            .await
            .unwrap();
        f.coordinator
            .refund_bet(account.id, session_id, 10.0, BetSource::Real)
            .await
            .unwrap();
        f.coordinator
            .refund_bet(account.id, session_id, 10.0, BetSource::Real)
            .await
            .unwrap();

        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn buying_an_item_debits_and_grants() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("liam").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 10.0).await.unwrap();

        f.coordinator.buy_item(account.id, Item::Shield).await.unwrap();
        assert_eq!(f.ledger.item_count(account.id, Item::Shield).await.unwrap(), 1);

        // Shield costs 5.0; a second purchase exhausts the balance.
        f.coordinator.buy_item(account.id, Item::Shield).await.unwrap();
        let err = f.coordinator.buy_item(account.id, Item::Shield).await;
        assert!(matches!(err, Err(SettlementError::InsufficientFunds)));
    }

    #[test]
    fn mystery_prize_tiers_descend() {
        assert_eq!(mystery_prize(3.0, 0.0), 30.0);
        assert_eq!(mystery_prize(3.0, 0.05), 9.0);
        assert_eq!(mystery_prize(3.0, 0.2), 3.0);
        assert!((mystery_prize(3.0, 0.9) - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn below_minimum_rejected_before_any_mutation() {
        let f = fixture();
        let account = f.ledger.get_or_create_account("mia").await.unwrap();
        f.ledger.credit(account.id, BetSource::Real, 100.0).await.unwrap();

        let err = f
            .coordinator
            .request_withdrawal(account.id, 5.0, "key", "cpf")
            .await;
        assert!(matches!(err, Err(SettlementError::BelowMinimum { .. })));
        let account = f.ledger.get_account(account.id).await.unwrap();
        assert!((account.real_balance - 100.0).abs() < f64::EPSILON);
    }
}
