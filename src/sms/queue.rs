//! Durable delayed queue over the `sms_jobs` table.
//!
//! Delivery is at-least-once: a job is claimed by flipping it to `processing`
//! in a single statement, and jobs whose worker died mid-delivery are put back
//! by `recover_stale`. Each job owns one `sms_logs` row that mirrors its
//! user-visible state.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::SmsContent;
use crate::config::SmsConfig;
use crate::db::{self, SmsJob, SmsKind, SmsLogStatus};
use crate::DbPool;

/// JSON stored in `sms_jobs.payload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsPayload {
    pub phone: String,
    pub content: SmsContent,
}

/// A message to enqueue
#[derive(Debug, Clone)]
pub struct OutgoingSms {
    /// Owner billed for the message; `None` for system messages
    pub user_id: Option<String>,
    pub booking_id: Option<String>,
    pub phone: String,
    pub content: SmsContent,
    pub kind: SmsKind,
}

#[derive(Debug, Clone)]
pub struct EnqueuedSms {
    pub job_id: String,
    pub log_id: String,
    pub parts: i64,
    pub run_at: String,
}

/// Result of reporting a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: String },
    Failed,
}

#[derive(Clone)]
pub struct SmsQueue {
    db: DbPool,
    notify: Arc<Notify>,
    max_attempts: i64,
    backoff_seconds: i64,
    stale_after_seconds: i64,
}

impl SmsQueue {
    pub fn new(db: DbPool, config: &SmsConfig) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            max_attempts: config.max_attempts.max(1),
            backoff_seconds: config.backoff_seconds.max(0),
            stale_after_seconds: config.stale_after_seconds.max(1),
        }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    /// Resolves when a job has been enqueued since the last wake-up
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Store the message and schedule delivery after `delay`
    pub async fn enqueue(&self, sms: OutgoingSms, delay: Duration) -> Result<EnqueuedSms, sqlx::Error> {
        let now = Utc::now();
        let created_at = db::timestamp(now);
        let run_at = db::timestamp(now + delay.max(Duration::zero()));
        let log_id = uuid::Uuid::new_v4().to_string();
        let job_id = uuid::Uuid::new_v4().to_string();
        let parts = sms.content.parts();
        let payload = serde_json::to_string(&SmsPayload {
            phone: sms.phone.clone(),
            content: sms.content.clone(),
        })
        .map_err(|e| sqlx::Error::Protocol(format!("Failed to encode SMS payload: {}", e)))?;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sms_logs (id, user_id, booking_id, phone, content, parts, kind, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log_id)
        .bind(&sms.user_id)
        .bind(&sms.booking_id)
        .bind(&sms.phone)
        .bind(sms.content.log_text())
        .bind(parts)
        .bind(sms.kind.as_str())
        .bind(SmsLogStatus::Queued.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sms_jobs (id, log_id, booking_id, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(&log_id)
        .bind(&sms.booking_id)
        .bind(&payload)
        .bind(self.max_attempts)
        .bind(&run_at)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            job_id = %job_id,
            kind = %sms.kind,
            run_at = %run_at,
            parts = parts,
            "SMS enqueued"
        );
        self.notify.notify_one();

        Ok(EnqueuedSms {
            job_id,
            log_id,
            parts,
            run_at,
        })
    }

    /// Take the earliest due job, marking it `processing`
    pub async fn claim_next(&self) -> Result<Option<SmsJob>, sqlx::Error> {
        let now = db::now();
        sqlx::query_as::<_, SmsJob>(
            r#"
            UPDATE sms_jobs
            SET status = 'processing', locked_at = ?, attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM sms_jobs
                WHERE status = 'queued' AND run_at <= ?
                ORDER BY run_at, created_at
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.db)
        .await
    }

    /// Mark a delivered job done, its log `sent`, and bill the owner
    pub async fn complete(&self, job: &SmsJob, gateway_message_id: &str) -> Result<(), sqlx::Error> {
        let now = db::now();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE sms_jobs SET status = 'done', locked_at = NULL, last_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE sms_logs SET status = 'sent', gateway_message_id = ?, error_message = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(gateway_message_id)
        .bind(&now)
        .bind(&job.log_id)
        .execute(&mut *tx)
        .await?;

        // System messages have no owner, so nothing matches
        sqlx::query(
            r#"
            UPDATE users
            SET sms_balance = MAX(0, sms_balance - (SELECT parts FROM sms_logs WHERE id = ?)), updated_at = ?
            WHERE id = (SELECT user_id FROM sms_logs WHERE id = ?)
            "#,
        )
        .bind(&job.log_id)
        .bind(&now)
        .bind(&job.log_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = (attempts - 1).clamp(0, 20) as u32;
        Duration::seconds(self.backoff_seconds.saturating_mul(1i64 << exponent))
    }

    /// Report a failed delivery; retries with exponential backoff until
    /// `max_attempts` is reached
    pub async fn fail(&self, job: &SmsJob, error: &str) -> Result<FailOutcome, sqlx::Error> {
        if job.attempts >= job.max_attempts {
            self.give_up(job, error).await?;
            return Ok(FailOutcome::Failed);
        }

        let now = Utc::now();
        let run_at = db::timestamp(now + self.backoff(job.attempts));
        sqlx::query(
            r#"
            UPDATE sms_jobs
            SET status = 'queued', locked_at = NULL, last_error = ?, run_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(&run_at)
        .bind(db::timestamp(now))
        .bind(&job.id)
        .execute(&self.db)
        .await?;

        Ok(FailOutcome::Retrying { run_at })
    }

    /// Mark the job and its log permanently failed
    pub async fn give_up(&self, job: &SmsJob, error: &str) -> Result<(), sqlx::Error> {
        let now = db::now();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE sms_jobs SET status = 'failed', locked_at = NULL, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sms_logs SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(&now)
            .bind(&job.log_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Cancel still-queued jobs of a booking, optionally only of one kind.
    /// Returns the number of cancelled jobs.
    pub async fn cancel_for_booking(
        &self,
        booking_id: &str,
        kind: Option<SmsKind>,
    ) -> Result<u64, sqlx::Error> {
        let now = db::now();
        let kind = kind.map(|k| k.as_str());
        let mut tx = self.db.begin().await?;

        let log_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT j.log_id FROM sms_jobs j
            JOIN sms_logs l ON l.id = j.log_id
            WHERE j.booking_id = ? AND j.status = 'queued' AND (? IS NULL OR l.kind = ?)
            "#,
        )
        .bind(booking_id)
        .bind(kind)
        .bind(kind)
        .fetch_all(&mut *tx)
        .await?;

        for log_id in &log_ids {
            sqlx::query(
                "UPDATE sms_jobs SET status = 'cancelled', updated_at = ? WHERE log_id = ? AND status = 'queued'",
            )
            .bind(&now)
            .bind(log_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE sms_logs SET status = 'cancelled', updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(log_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !log_ids.is_empty() {
            tracing::debug!(booking_id = %booking_id, count = log_ids.len(), "Cancelled queued SMS");
        }
        Ok(log_ids.len() as u64)
    }

    /// Put jobs left in `processing` past the stale timeout back in the queue
    pub async fn recover_stale(&self) -> Result<u64, sqlx::Error> {
        let now = Utc::now();
        let cutoff = db::timestamp(now - Duration::seconds(self.stale_after_seconds));
        let result = sqlx::query(
            r#"
            UPDATE sms_jobs
            SET status = 'queued', locked_at = NULL, updated_at = ?
            WHERE status = 'processing' AND locked_at < ?
            "#,
        )
        .bind(db::timestamp(now))
        .bind(&cutoff)
        .execute(&self.db)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(count = recovered, "Requeued stale SMS jobs");
        }
        Ok(recovered)
    }

    /// Jobs of an owner still waiting for delivery
    pub async fn pending_for_user(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sms_jobs j
            JOIN sms_logs l ON l.id = j.log_id
            WHERE l.user_id = ? AND j.status IN ('queued', 'processing')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await
    }

    /// Parts queued for an owner that will be charged once sent
    pub async fn reserved_parts(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(l.parts), 0) FROM sms_jobs j
            JOIN sms_logs l ON l.id = j.log_id
            WHERE l.user_id = ? AND j.status IN ('queued', 'processing')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await
    }
}
