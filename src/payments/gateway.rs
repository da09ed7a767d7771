use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::PaymentError;
use crate::config::PaymentConfig;

/// Gateway code for a successful request or verification
const CODE_OK: i64 = 100;
/// Gateway code for a payment that was already verified
const CODE_ALREADY_VERIFIED: i64 = 101;

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: i64,
    pub description: String,
    pub mobile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentSession {
    pub authority: String,
    /// Where the customer completes the payment
    pub payment_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request(&self, req: &PaymentRequest) -> Result<PaymentSession, PaymentError>;

    /// Confirm a completed payment, returning the gateway reference id
    async fn verify(&self, authority: &str, amount: i64) -> Result<String, PaymentError>;
}

/// Envelope shared by the request and verify endpoints
#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Value,
}

impl GatewayResponse {
    fn code(&self) -> Option<i64> {
        self.data
            .get("code")
            .and_then(Value::as_i64)
            .or_else(|| self.errors.get("code").and_then(Value::as_i64))
    }

    fn error(&self) -> PaymentError {
        let message = self
            .errors
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| self.data.get("message").and_then(Value::as_str))
            .unwrap_or("unknown error")
            .to_string();
        PaymentError::Gateway {
            code: self.code().unwrap_or(0),
            message,
        }
    }
}

/// JSON payment gateway with `request.json` / `verify.json` endpoints
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    merchant_id: String,
    api_url: String,
    redirect_url: String,
    callback_url: String,
}

impl HttpPaymentGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            merchant_id: config.merchant_id.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            redirect_url: config.redirect_url.trim_end_matches('/').to_string(),
            callback_url: config.callback_url.clone(),
        })
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<GatewayResponse, PaymentError> {
        let response = self
            .client
            .post(format!("{}/{}", self.api_url, endpoint))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|_| {
            PaymentError::InvalidResponse(format!("HTTP {}: {}", status.as_u16(), text))
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn request(&self, req: &PaymentRequest) -> Result<PaymentSession, PaymentError> {
        let mut body = json!({
            "merchant_id": self.merchant_id,
            "amount": req.amount,
            "callback_url": self.callback_url,
            "description": req.description,
        });
        if let Some(mobile) = &req.mobile {
            body["metadata"] = json!({ "mobile": mobile });
        }

        let response = self.post("request.json", body).await?;
        if response.code() != Some(CODE_OK) {
            return Err(response.error());
        }

        let authority = response
            .data
            .get("authority")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymentError::InvalidResponse("missing authority".to_string()))?
            .to_string();

        Ok(PaymentSession {
            payment_url: format!("{}/{}", self.redirect_url, authority),
            authority,
        })
    }

    async fn verify(&self, authority: &str, amount: i64) -> Result<String, PaymentError> {
        let body = json!({
            "merchant_id": self.merchant_id,
            "amount": amount,
            "authority": authority,
        });

        let response = self.post("verify.json", body).await?;
        match response.code() {
            Some(CODE_OK) | Some(CODE_ALREADY_VERIFIED) => {
                let ref_id = response
                    .data
                    .get("ref_id")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .ok_or_else(|| PaymentError::InvalidResponse("missing ref_id".to_string()))?;
                Ok(ref_id)
            }
            _ => Err(response.error()),
        }
    }
}
