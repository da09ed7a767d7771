pub mod api;
pub mod config;
pub mod db;
pub mod payments;
pub mod scheduling;
pub mod sms;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::payments::PaymentGateway;
use crate::sms::SmsQueue;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub sms: SmsQueue,
    pub payments: Arc<dyn PaymentGateway>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, payments: Arc<dyn PaymentGateway>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let sms = SmsQueue::new(db.clone(), &config.sms);
        Self {
            config,
            db,
            sms,
            payments,
            rate_limiter,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
