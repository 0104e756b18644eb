//! Outbound payout client for the mobile money network.
//!
//! The initiation call only tells us the request was accepted. The payout
//! outcome arrives later on the disbursement result callback.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::models::Money;
use crate::services::metrics::GATEWAY_REQUESTS_TOTAL;

/// Tokens are refreshed this long before the network says they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// A payout the ledger wants sent.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub event_id: Uuid,
    pub loan_id: Uuid,
    pub msisdn: String,
    pub amount: Money,
    pub idempotency_key: String,
}

/// The network accepted the request and will call back with this reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutAccepted {
    pub correlation_ref: String,
    pub description: Option<String>,
}

#[async_trait]
pub trait DisbursementGateway: Send + Sync {
    async fn send_payout(&self, request: &PayoutRequest) -> Result<PayoutAccepted>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// The network sends `expires_in` as a string; accept a number too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Number(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> i64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PaymentRequest<'a> {
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: &'a str,
    initiator_name: &'a str,
    security_credential: &'a str,
    #[serde(rename = "CommandID")]
    command_id: &'static str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    queue_time_out_url: &'a str,
    #[serde(rename = "ResultURL")]
    result_url: &'a str,
    occasion: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: Option<String>,
    #[serde(rename = "ConversationID")]
    conversation_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
}

/// OAuth client-credentials gateway client over HTTPS.
pub struct HttpDisbursementGateway {
    client: Client,
    config: GatewayConfig,
    token: Mutex<Option<CachedToken>>,
}

impl HttpDisbursementGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    /// Check if the gateway is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.consumer_key.is_empty()
            && !self.config.consumer_secret.expose_secret().is_empty()
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    #[instrument(skip(self))]
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let credentials = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.consumer_key,
            self.config.consumer_secret.expose_secret()
        ));

        let response = self
            .client
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.base_url()
            ))
            .header("Authorization", format!("Basic {}", credentials))
            .send()
            .await
            .context("token request failed")?;

        if !response.status().is_success() {
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&["token", "error"])
                .inc();
            return Err(anyhow!("token request returned {}", response.status()));
        }

        let body: TokenResponse = response.json().await.context("invalid token response")?;
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&["token", "ok"])
            .inc();

        let refresh_at =
            Utc::now() + Duration::seconds(body.expires_in.seconds() - TOKEN_EXPIRY_MARGIN_SECS);
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at,
        });

        Ok(body.access_token)
    }
}

#[async_trait]
impl DisbursementGateway for HttpDisbursementGateway {
    #[instrument(skip(self, request), fields(event_id = %request.event_id, loan_id = %request.loan_id, amount_cents = request.amount.cents()))]
    async fn send_payout(&self, request: &PayoutRequest) -> Result<PayoutAccepted> {
        if request.amount.cents() % 100 != 0 {
            return Err(anyhow!(
                "payouts must be whole currency units, got {}",
                request.amount
            ));
        }

        let token = self.access_token().await?;
        let payload = PaymentRequest {
            originator_conversation_id: &request.idempotency_key,
            initiator_name: &self.config.initiator_name,
            security_credential: self.config.security_credential.expose_secret(),
            command_id: "BusinessPayment",
            amount: request.amount.cents() / 100,
            party_a: &self.config.shortcode,
            party_b: &request.msisdn,
            remarks: format!("Loan disbursement {}", request.loan_id),
            queue_time_out_url: &self.config.timeout_url,
            result_url: &self.config.result_url,
            occasion: request.loan_id.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/mpesa/b2c/v1/paymentrequest", self.base_url()))
            .bearer_auth(token)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&payload)
            .send()
            .await
            .context("payout request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&["payout", "error"])
                .inc();
            warn!(status = %status, body = %body, "Payout request rejected");
            return Err(anyhow!("payout request returned {}: {}", status, body));
        }

        let body: PaymentResponse = response.json().await.context("invalid payout response")?;
        if body.response_code.as_deref().is_some_and(|code| code != "0") {
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&["payout", "rejected"])
                .inc();
            return Err(anyhow!(
                "payout not accepted: {}",
                body.response_description.unwrap_or_default()
            ));
        }

        let correlation_ref = body
            .originator_conversation_id
            .or(body.conversation_id)
            .ok_or_else(|| anyhow!("payout response carried no conversation id"))?;

        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&["payout", "ok"])
            .inc();
        info!(correlation_id = %correlation_ref, "Payout accepted by gateway");

        Ok(PayoutAccepted {
            correlation_ref,
            description: body.response_description,
        })
    }
}
