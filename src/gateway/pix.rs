//! PIX payment-provider client.
//!
//! Speaks the provider's REST API and normalizes its status vocabulary.
//! The provider deals in integer centavos; this adapter converts at the
//! boundary so the rest of the system stays in BRL.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use super::{
    DepositCharge, GatewayStatus, GatewayTransaction, PaymentGateway, WithdrawalReceipt,
};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// PIX gateway REST client.
pub struct PixClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PixClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("ViperGrid/1.0 (Settlement)")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn post_with_retry<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body);

            match timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send()).await {
                Ok(Ok(response)) => {
                    if response.status().is_success() {
                        return Ok(response);
                    } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
                        warn!("Gateway rate limited on attempt {}, backing off", attempt + 1);
                        sleep(Duration::from_millis(backoff * 10)).await;
                    } else {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        error!("Gateway error {}: {}", status, text);
                        bail!("Gateway error {}: {}", status, text);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Gateway request failed (attempt {}): {}", attempt + 1, e);
                }
                Err(_) => {
                    warn!("Gateway request timeout (attempt {})", attempt + 1);
                }
            }

            if attempt < MAX_RETRIES - 1 {
                debug!("Retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("Max retries exceeded for {}", url)
    }

    async fn get_with_retry(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self.client.get(&url).bearer_auth(&self.api_key);

            match timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send()).await {
                Ok(Ok(response)) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    error!("Gateway error {}: {}", status, text);
                    bail!("Gateway error {}: {}", status, text);
                }
                Ok(Err(e)) => {
                    warn!("Gateway request failed (attempt {}): {}", attempt + 1, e);
                }
                Err(_) => {
                    warn!("Gateway request timeout (attempt {})", attempt + 1);
                }
            }

            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("Max retries exceeded for {}", url)
    }
}

/// Map the provider's free-form status strings onto the normalized vocabulary.
pub fn normalize_status(raw: &str) -> GatewayStatus {
    match raw.to_ascii_uppercase().as_str() {
        "PENDING" | "WAITING_FOR_APPROVAL" | "PROCESSING" => GatewayStatus::Pending,
        "PAID" | "PAID_OUT" => GatewayStatus::Paid,
        "COMPLETED" => GatewayStatus::Completed,
        "APPROVED" => GatewayStatus::Approved,
        "FAILED" | "ERROR" => GatewayStatus::Failed,
        "CANCELED" | "CANCELLED" | "REFUSED" => GatewayStatus::Canceled,
        other => {
            warn!("Unrecognized gateway status '{}'", other);
            GatewayStatus::Unknown
        }
    }
}

fn to_centavos(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_centavos(centavos: i64) -> f64 {
    centavos as f64 / 100.0
}

// ===== Wire types =====

#[derive(Serialize)]
struct CreateChargeRequest {
    amount: i64,
    payer_document: String,
}

#[derive(Deserialize)]
struct CreateChargeResponse {
    id: String,
    #[serde(rename = "brCode")]
    br_code: String,
    #[serde(rename = "qrCodeImage")]
    qr_code_image: String,
}

#[derive(Deserialize)]
struct TransactionResponse {
    id: String,
    status: String,
    #[serde(default)]
    amount: i64,
}

#[derive(Serialize)]
struct PayoutRequest {
    amount: i64,
    #[serde(rename = "pixKey")]
    pix_key: String,
    #[serde(rename = "pixKeyType")]
    pix_key_type: String,
}

#[derive(Deserialize)]
struct PayoutResponse {
    id: String,
    status: String,
}

#[async_trait]
impl PaymentGateway for PixClient {
    async fn create_deposit(
        &self,
        amount: f64,
        payer_tax_id: &str,
    ) -> Result<DepositCharge> {
        let body = CreateChargeRequest {
            amount: to_centavos(amount),
            payer_document: payer_tax_id.to_string(),
        };
        let response = self.post_with_retry("/v1/charges", &body).await?;
        let charge: CreateChargeResponse = response
            .json()
            .await
            .context("Failed to parse charge response")?;

        debug!("Created PIX charge {}", charge.id);
        Ok(DepositCharge {
            transaction_id: charge.id,
            payment_code: charge.br_code,
            payment_code_image: charge.qr_code_image,
        })
    }

    async fn query_transaction(&self, transaction_id: &str) -> Result<GatewayTransaction> {
        let response = self
            .get_with_retry(&format!("/v1/transactions/{}", transaction_id))
            .await?;
        let tx: TransactionResponse = response
            .json()
            .await
            .context("Failed to parse transaction response")?;

        Ok(GatewayTransaction {
            transaction_id: tx.id,
            status: normalize_status(&tx.status),
            paid_amount: from_centavos(tx.amount),
        })
    }

    async fn request_withdrawal(
        &self,
        amount: f64,
        payout_key: &str,
        key_type: &str,
    ) -> Result<WithdrawalReceipt> {
        let body = PayoutRequest {
            amount: to_centavos(amount),
            pix_key: payout_key.to_string(),
            pix_key_type: key_type.to_string(),
        };
        let response = self.post_with_retry("/v1/payouts", &body).await?;
        let payout: PayoutResponse = response
            .json()
            .await
            .context("Failed to parse payout response")?;

        Ok(WithdrawalReceipt {
            transaction_id: payout.id,
            status: normalize_status(&payout.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalization_covers_paid_variants() {
        assert_eq!(normalize_status("paid"), GatewayStatus::Paid);
        assert_eq!(normalize_status("COMPLETED"), GatewayStatus::Completed);
        assert_eq!(normalize_status("Approved"), GatewayStatus::Approved);
        assert!(normalize_status("PAID").is_paid());
        assert!(!normalize_status("PENDING").is_paid());
    }

    #[test]
    fn status_normalization_covers_failure_variants() {
        assert!(normalize_status("CANCELLED").is_failed());
        assert!(normalize_status("failed").is_failed());
        assert_eq!(normalize_status("garbage"), GatewayStatus::Unknown);
        assert!(!GatewayStatus::Unknown.is_paid());
    }

    #[test]
    fn centavo_conversion_round_trips() {
        assert_eq!(to_centavos(12.34), 1234);
        assert!((from_centavos(1234) - 12.34).abs() < f64::EPSILON);
        // Floating point dust does not drop a centavo
        assert_eq!(to_centavos(0.1 + 0.2), 30);
    }
}
