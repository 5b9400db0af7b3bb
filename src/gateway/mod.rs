//! Payment-provider integration.
//!
//! The settlement coordinator only depends on the [`PaymentGateway`] trait;
//! the PIX implementation lives in [`pix`], and tests substitute an
//! in-memory fake.

pub mod pix;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Normalized provider status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayStatus {
    Pending,
    Paid,
    Completed,
    Approved,
    Failed,
    Canceled,
    Unknown,
}

impl GatewayStatus {
    /// Statuses that count as money actually received.
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            GatewayStatus::Paid | GatewayStatus::Completed | GatewayStatus::Approved
        )
    }

    /// Terminal failure statuses for a withdrawal.
    pub fn is_failed(self) -> bool {
        matches!(self, GatewayStatus::Failed | GatewayStatus::Canceled)
    }
}

/// Response from creating a deposit charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCharge {
    pub transaction_id: String,
    /// Copy-and-paste payment code shown to the payer.
    pub payment_code: String,
    /// Reference to the payment-code image (QR).
    pub payment_code_image: String,
}

/// Authoritative transaction state as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub transaction_id: String,
    pub status: GatewayStatus,
    /// Amount actually paid, as reported by the provider.
    pub paid_amount: f64,
}

/// Response from submitting a withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub transaction_id: String,
    pub status: GatewayStatus,
}

/// Outbound payment-provider contract.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a deposit charge for `amount` against the payer's tax id.
    async fn create_deposit(&self, amount: f64, payer_tax_id: &str)
        -> anyhow::Result<DepositCharge>;

    /// Query the authoritative status and paid amount of a transaction.
    async fn query_transaction(&self, transaction_id: &str) -> anyhow::Result<GatewayTransaction>;

    /// Submit a withdrawal to `payout_key` (`key_type` per provider vocabulary).
    async fn request_withdrawal(
        &self,
        amount: f64,
        payout_key: &str,
        key_type: &str,
    ) -> anyhow::Result<WithdrawalReceipt>;
}
