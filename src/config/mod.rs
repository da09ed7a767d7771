use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base URL used to build customer booking links (e.g. "https://ontime.example")
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Browser origins allowed to call the API with credentials
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            public_base_url: default_public_base_url(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign session tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_session_days")]
    pub session_days: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_admin_cookie_name")]
    pub admin_cookie_name: String,
    /// Mark cookies `Secure` (disable only for local HTTP development)
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    #[serde(default = "default_otp_ttl_seconds")]
    pub otp_ttl_seconds: i64,
    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: i64,
    /// Login codes a single phone may request per hour
    #[serde(default = "default_otp_requests_per_hour")]
    pub otp_requests_per_hour: i64,
    /// Admin account created on startup when no admin with this username exists
    pub bootstrap_admin_username: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            session_days: default_session_days(),
            cookie_name: default_cookie_name(),
            admin_cookie_name: default_admin_cookie_name(),
            cookie_secure: default_true(),
            otp_ttl_seconds: default_otp_ttl_seconds(),
            otp_max_attempts: default_otp_max_attempts(),
            otp_requests_per_hour: default_otp_requests_per_hour(),
            bootstrap_admin_username: None,
            bootstrap_admin_password: None,
        }
    }
}

fn default_jwt_secret() -> String {
    // Sessions do not survive a restart unless a secret is configured
    format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
}

fn default_session_days() -> i64 {
    7
}

fn default_cookie_name() -> String {
    "ontime_session".to_string()
}

fn default_admin_cookie_name() -> String {
    "ontime_admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_otp_ttl_seconds() -> i64 {
    120
}

fn default_otp_max_attempts() -> i64 {
    5
}

fn default_otp_requests_per_hour() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    /// When disabled, messages are logged instead of sent to the gateway
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sms_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Sender line number
    #[serde(default)]
    pub sender: String,
    /// Gateway pattern used for login codes; plain text is sent when unset
    pub otp_pattern_code: Option<String>,
    #[serde(default = "default_sms_max_attempts")]
    pub max_attempts: i64,
    /// Base retry delay, doubled after every failed attempt
    #[serde(default = "default_sms_backoff_seconds")]
    pub backoff_seconds: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs left in `processing` longer than this are handed out again
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: i64,
    #[serde(default = "default_reminder_minutes")]
    pub default_reminder_minutes: i64,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    /// Free SMS credits for a newly registered business
    #[serde(default = "default_trial_balance")]
    pub trial_balance: i64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_sms_api_url(),
            api_key: String::new(),
            sender: String::new(),
            otp_pattern_code: None,
            max_attempts: default_sms_max_attempts(),
            backoff_seconds: default_sms_backoff_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_seconds: default_stale_after_seconds(),
            default_reminder_minutes: default_reminder_minutes(),
            country_code: default_country_code(),
            trial_balance: default_trial_balance(),
        }
    }
}

fn default_sms_api_url() -> String {
    "https://api2.ippanel.com/api/v1/sms".to_string()
}

fn default_sms_max_attempts() -> i64 {
    3
}

fn default_sms_backoff_seconds() -> i64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stale_after_seconds() -> i64 {
    300
}

fn default_reminder_minutes() -> i64 {
    120
}

fn default_country_code() -> String {
    "98".to_string()
}

fn default_trial_balance() -> i64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub merchant_id: String,
    #[serde(default = "default_payment_api_url")]
    pub api_url: String,
    /// Page the customer is sent to, the authority is appended as a path segment
    #[serde(default = "default_payment_redirect_url")]
    pub redirect_url: String,
    /// Our callback endpoint as seen by the gateway
    #[serde(default = "default_payment_callback_url")]
    pub callback_url: String,
    /// Frontend page shown after the callback is processed
    #[serde(default = "default_payment_result_url")]
    pub result_url: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            api_url: default_payment_api_url(),
            redirect_url: default_payment_redirect_url(),
            callback_url: default_payment_callback_url(),
            result_url: default_payment_result_url(),
        }
    }
}

fn default_payment_api_url() -> String {
    "https://payment.zarinpal.com/pg/v4/payment".to_string()
}

fn default_payment_redirect_url() -> String {
    "https://payment.zarinpal.com/pg/StartPay".to_string()
}

fn default_payment_callback_url() -> String {
    "http://localhost:8080/api/payments/callback".to_string()
}

fn default_payment_result_url() -> String {
    "http://localhost:3000/dashboard/payment-result".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: u32,
    /// Offset of business-local time from UTC, in minutes
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_booking_horizon_days")]
    pub booking_horizon_days: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            slot_minutes: default_slot_minutes(),
            utc_offset_minutes: default_utc_offset_minutes(),
            booking_horizon_days: default_booking_horizon_days(),
        }
    }
}

fn default_slot_minutes() -> u32 {
    30
}

fn default_utc_offset_minutes() -> i32 {
    210
}

fn default_booking_horizon_days() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    /// OTP request/verify and admin login
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    /// Public booking pages and customer links
    #[serde(default = "default_public_requests")]
    pub public_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Take the client address from `X-Forwarded-For` (only behind a reverse proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            public_requests_per_window: default_public_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
            trust_forwarded_for: false,
        }
    }
}

fn default_api_requests() -> u32 {
    300
}

fn default_auth_requests() -> u32 {
    10
}

fn default_public_requests() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            sms: SmsConfig::default(),
            payment: PaymentConfig::default(),
            scheduling: SchedulingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scheduling.slot_minutes, 30);
        assert_eq!(config.sms.max_attempts, 3);
        assert!(!config.sms.enabled);
        assert_eq!(config.auth.cookie_name, "ontime_session");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sms]
            enabled = true
            api_key = "key"
            sender = "3000505"

            [scheduling]
            utc_offset_minutes = 0
            "#,
        )
        .unwrap();

        assert!(config.sms.enabled);
        assert_eq!(config.sms.sender, "3000505");
        assert_eq!(config.sms.backoff_seconds, 30);
        assert_eq!(config.scheduling.utc_offset_minutes, 0);
        assert_eq!(config.scheduling.booking_horizon_days, 60);
    }

    #[test]
    fn test_generated_jwt_secrets_differ() {
        assert_ne!(AuthConfig::default().jwt_secret, AuthConfig::default().jwt_secret);
    }
}
