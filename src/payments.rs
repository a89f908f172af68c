//! Client for the external payment processor. Checkout creation is a
//! pass-through (the processor hosts the payment page); charge reversal is
//! consumed by the refund flow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PackConfig;

const DEFAULT_BASE_URL: &str = "https://api.payvault.dev/v1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub redirect_url: String,
    #[serde(default)]
    pub checkout_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("payment http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid payment response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        user_id: &str,
        pack: &PackConfig,
    ) -> Result<CheckoutSession, PaymentError>;

    /// Reverses a settled charge. Returns the processor's reversal id.
    async fn reverse_charge(&self, payment_ref: &str) -> Result<String, PaymentError>;
}

pub struct HttpPaymentClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentClient {
    pub fn new(secret_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            secret_key: secret_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for HttpPaymentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPaymentClient")
            .field("base_url", &self.base_url)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct CheckoutRequestBody<'a> {
    user_id: &'a str,
    pack_id: &'a str,
    credits: i64,
    amount_usd_cents: u64,
}

#[derive(Deserialize)]
struct ReversalResponseBody {
    reversal_id: String,
}

#[async_trait]
impl PaymentProcessor for HttpPaymentClient {
    async fn create_checkout_session(
        &self,
        user_id: &str,
        pack: &PackConfig,
    ) -> Result<CheckoutSession, PaymentError> {
        let body = CheckoutRequestBody {
            user_id,
            pack_id: &pack.id,
            credits: pack.credits,
            amount_usd_cents: pack.price_usd_cents,
        };
        let response = self
            .http
            .post(self.url("/checkout/sessions"))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api { status, body });
        }
        let session: CheckoutSession = response
            .json()
            .await
            .map_err(|err| PaymentError::InvalidResponse(err.to_string()))?;
        if session.redirect_url.trim().is_empty() {
            return Err(PaymentError::InvalidResponse(
                "checkout session has no redirect url".to_string(),
            ));
        }
        Ok(session)
    }

    async fn reverse_charge(&self, payment_ref: &str) -> Result<String, PaymentError> {
        let response = self
            .http
            .post(self.url(&format!("/charges/{payment_ref}/reverse")))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api { status, body });
        }
        let body: ReversalResponseBody = response
            .json()
            .await
            .map_err(|err| PaymentError::InvalidResponse(err.to_string()))?;
        Ok(body.reversal_id)
    }
}
