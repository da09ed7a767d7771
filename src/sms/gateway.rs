use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::SmsConfig;

/// What to deliver: free text, or a gateway-side pattern filled with variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SmsContent {
    Text {
        body: String,
    },
    Pattern {
        code: String,
        variables: BTreeMap<String, String>,
    },
}

impl SmsContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Text stored in the delivery log
    pub fn log_text(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Pattern { code, variables } => {
                let vars: Vec<String> = variables
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                format!("pattern:{} {}", code, vars.join(","))
            }
        }
    }

    pub fn parts(&self) -> i64 {
        match self {
            Self::Text { body } => super::count_parts(body),
            Self::Pattern { .. } => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("SMS gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("SMS gateway rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Unexpected SMS gateway response: {0}")]
    InvalidResponse(String),
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl SmsError {
    /// Client errors will fail the same way on every retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::InvalidResponse(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidRecipient(_) => false,
        }
    }
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Deliver one message, returning the gateway's message id
    async fn send(&self, phone: &str, content: &SmsContent) -> Result<String, SmsError>;

    fn name(&self) -> &'static str;
}

/// JSON-over-HTTP SMS web service authenticated with an `apikey` header
pub struct HttpSmsGateway {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

impl HttpSmsGateway {
    pub fn new(config: &SmsConfig) -> Result<Self, SmsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sender: config.sender.clone(),
        })
    }

    fn request_body(&self, phone: &str, content: &SmsContent) -> Value {
        match content {
            SmsContent::Text { body } => json!({
                "sending_type": "webservice",
                "from_number": self.sender,
                "message": body,
                "params": { "recipients": [phone] },
            }),
            SmsContent::Pattern { code, variables } => json!({
                "sending_type": "pattern",
                "from_number": self.sender,
                "code": code,
                "recipients": [phone],
                "params": variables,
            }),
        }
    }
}

/// Pull the message id out of `{"data": {"message_outbox_ids": [..]}}` or
/// `{"data": {"message_id": ..}}`
fn extract_message_id(body: &Value) -> Option<String> {
    let data = body.get("data")?;
    let id = data
        .get("message_outbox_ids")
        .and_then(|ids| ids.get(0))
        .or_else(|| data.get("message_id"))
        .or_else(|| data.get("bulk_id"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, phone: &str, content: &SmsContent) -> Result<String, SmsError> {
        let response = self
            .client
            .post(format!("{}/send", self.api_url))
            .header("apikey", &self.api_key)
            .json(&self.request_body(phone, content))
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let message = body
                .pointer("/meta/message")
                .and_then(Value::as_str)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error"))
                .to_string();
            return Err(SmsError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        extract_message_id(&body).ok_or_else(|| SmsError::InvalidResponse(body.to_string()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Writes messages to the log instead of sending them
pub struct LogGateway;

#[async_trait]
impl SmsGateway for LogGateway {
    async fn send(&self, phone: &str, content: &SmsContent) -> Result<String, SmsError> {
        tracing::info!(phone = %phone, content = %content.log_text(), "SMS delivery disabled, message logged");
        Ok(format!("log-{}", uuid::Uuid::new_v4()))
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_serialization_is_tagged() {
        let content = SmsContent::text("hello");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json, json!({"type": "text", "body": "hello"}));

        let parsed: SmsContent = serde_json::from_value(json!({
            "type": "pattern",
            "code": "otp-login",
            "variables": {"code": "123456"}
        }))
        .unwrap();
        assert_eq!(parsed.parts(), 1);
        assert_eq!(parsed.log_text(), "pattern:otp-login code=123456");
    }

    #[test]
    fn test_extract_message_id() {
        let outbox = json!({"status": "OK", "data": {"message_outbox_ids": [771]}});
        assert_eq!(extract_message_id(&outbox).as_deref(), Some("771"));

        let single = json!({"data": {"message_id": "abc"}});
        assert_eq!(extract_message_id(&single).as_deref(), Some("abc"));

        assert!(extract_message_id(&json!({"data": {}})).is_none());
        assert!(extract_message_id(&json!({})).is_none());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SmsError::Rejected { status: 503, message: String::new() }.is_retryable());
        assert!(SmsError::Rejected { status: 429, message: String::new() }.is_retryable());
        assert!(!SmsError::Rejected { status: 400, message: String::new() }.is_retryable());
        assert!(!SmsError::InvalidRecipient("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_log_gateway_returns_id() {
        let id = LogGateway.send("09121234567", &SmsContent::text("hi")).await.unwrap();
        assert!(id.starts_with("log-"));
    }
}
