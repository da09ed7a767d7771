use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{FailOutcome, SmsGateway, SmsPayload, SmsQueue};
use crate::api::metrics::{record_sms_failed, record_sms_retried, record_sms_sent};

/// Single background consumer of the SMS queue
pub struct SmsWorker {
    queue: SmsQueue,
    gateway: Arc<dyn SmsGateway>,
    poll_interval: Duration,
}

impl SmsWorker {
    pub fn new(queue: SmsQueue, gateway: Arc<dyn SmsGateway>, poll_interval_ms: u64) -> Self {
        Self {
            queue,
            gateway,
            poll_interval: Duration::from_millis(poll_interval_ms.max(10)),
        }
    }

    /// Process jobs until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(gateway = self.gateway.name(), "SMS worker started");

        if let Err(e) = self.queue.recover_stale().await {
            tracing::error!(error = %e, "Failed to recover stale SMS jobs");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "SMS worker iteration failed"),
            }

            if let Err(e) = self.queue.recover_stale().await {
                tracing::error!(error = %e, "Failed to recover stale SMS jobs");
            }

            tokio::select! {
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("SMS worker stopped");
    }

    /// Deliver one due job. Returns false when nothing was due.
    pub async fn process_next(&self) -> Result<bool, sqlx::Error> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(false);
        };

        let payload: SmsPayload = match serde_json::from_str(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Dropping SMS job with unreadable payload");
                self.queue
                    .give_up(&job, &format!("Invalid payload: {}", e))
                    .await?;
                record_sms_failed();
                return Ok(true);
            }
        };

        match self.gateway.send(&payload.phone, &payload.content).await {
            Ok(message_id) => {
                self.queue.complete(&job, &message_id).await?;
                record_sms_sent();
                tracing::info!(
                    job_id = %job.id,
                    phone = %payload.phone,
                    message_id = %message_id,
                    attempts = job.attempts,
                    "SMS sent"
                );
            }
            Err(e) if !e.is_retryable() => {
                self.queue.give_up(&job, &e.to_string()).await?;
                record_sms_failed();
                tracing::error!(job_id = %job.id, phone = %payload.phone, error = %e, "SMS rejected");
            }
            Err(e) => match self.queue.fail(&job, &e.to_string()).await? {
                FailOutcome::Retrying { run_at } => {
                    record_sms_retried();
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        retry_at = %run_at,
                        error = %e,
                        "SMS delivery failed, will retry"
                    );
                }
                FailOutcome::Failed => {
                    record_sms_failed();
                    tracing::error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "SMS delivery failed permanently"
                    );
                }
            },
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::queue::tests::test_queue;
    use crate::sms::{OutgoingSms, SmsContent, SmsError};
    use crate::db::SmsKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` sends with the given status, then succeeds
    struct FakeGateway {
        failures: usize,
        status: u16,
        calls: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl FakeGateway {
        fn new(failures: usize, status: u16) -> Arc<Self> {
            Arc::new(Self {
                failures,
                status,
                calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SmsGateway for FakeGateway {
        async fn send(&self, phone: &str, _content: &SmsContent) -> Result<String, SmsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SmsError::Rejected {
                    status: self.status,
                    message: "unavailable".to_string(),
                });
            }
            self.sent.lock().unwrap().push(phone.to_string());
            Ok(format!("gw-{}", call))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn message() -> OutgoingSms {
        OutgoingSms {
            user_id: None,
            booking_id: None,
            phone: "09121234567".to_string(),
            content: SmsContent::text("hi"),
            kind: SmsKind::Otp,
        }
    }

    async fn job_state(queue: &SmsQueue, job_id: &str) -> (String, i64) {
        sqlx::query_as("SELECT status, attempts FROM sms_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(queue.db())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_next_delivers() {
        let queue = test_queue().await;
        let gateway = FakeGateway::new(0, 503);
        let worker = SmsWorker::new(queue.clone(), gateway.clone(), 100);

        assert!(!worker.process_next().await.unwrap());

        let queued = queue.enqueue(message(), chrono::Duration::zero()).await.unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(job_state(&queue, &queued.job_id).await, ("done".to_string(), 1));
        assert_eq!(*gateway.sent.lock().unwrap(), vec!["09121234567".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let queue = test_queue().await;
        let gateway = FakeGateway::new(1, 503);
        let worker = SmsWorker::new(queue.clone(), gateway.clone(), 100);

        let queued = queue.enqueue(message(), chrono::Duration::zero()).await.unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(job_state(&queue, &queued.job_id).await, ("queued".to_string(), 1));

        sqlx::query("UPDATE sms_jobs SET run_at = '2000-01-01T00:00:00Z'")
            .execute(queue.db())
            .await
            .unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(job_state(&queue, &queued.job_id).await, ("done".to_string(), 2));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let queue = test_queue().await;
        let gateway = FakeGateway::new(1, 400);
        let worker = SmsWorker::new(queue.clone(), gateway.clone(), 100);

        let queued = queue.enqueue(message(), chrono::Duration::zero()).await.unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(job_state(&queue, &queued.job_id).await, ("failed".to_string(), 1));
    }

    #[tokio::test]
    async fn test_unreadable_payload_fails_job() {
        let queue = test_queue().await;
        let worker = SmsWorker::new(queue.clone(), FakeGateway::new(0, 503), 100);

        let queued = queue.enqueue(message(), chrono::Duration::zero()).await.unwrap();
        sqlx::query("UPDATE sms_jobs SET payload = 'not json' WHERE id = ?")
            .bind(&queued.job_id)
            .execute(queue.db())
            .await
            .unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(job_state(&queue, &queued.job_id).await.0, "failed");
    }

    #[tokio::test]
    async fn test_run_wakes_on_enqueue_and_stops_on_shutdown() {
        let queue = test_queue().await;
        let gateway = FakeGateway::new(0, 503);
        // Long poll interval so only the wake-up can trigger delivery in time
        let worker = SmsWorker::new(queue.clone(), gateway.clone(), 60_000);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(message(), chrono::Duration::zero()).await.unwrap();

        let mut delivered = false;
        for _ in 0..100 {
            if !gateway.sent.lock().unwrap().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
