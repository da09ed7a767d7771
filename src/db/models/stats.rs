//! Platform-wide statistics for the admin dashboard.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingCounts {
    pub active: i64,
    pub cancelled: i64,
    pub done: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmsCounts {
    pub sent: i64,
    pub failed: i64,
    pub queued: i64,
    /// Billable parts of sent messages
    pub parts_sent: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminStats {
    pub users: i64,
    pub active_users: i64,
    pub subscribed_users: i64,
    pub bookings: BookingCounts,
    pub sms: SmsCounts,
    pub revenue: i64,
    pub paid_purchases: i64,
    pub pending_jobs: i64,
}

impl AdminStats {
    /// Aggregate current counters; `now` is a canonical timestamp
    pub async fn collect(pool: &SqlitePool, now: &str) -> Result<Self, sqlx::Error> {
        let (users, active_users): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM users",
        )
        .fetch_one(pool)
        .await?;

        let subscribed_users: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE plan_id IS NOT NULL AND plan_expires_at > ?",
        )
        .bind(now)
        .fetch_one(pool)
        .await?;

        let booking_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bookings GROUP BY status")
                .fetch_all(pool)
                .await?;
        let mut bookings = BookingCounts::default();
        for (status, count) in booking_rows {
            match status.as_str() {
                "active" => bookings.active = count,
                "cancelled" => bookings.cancelled = count,
                "done" => bookings.done = count,
                _ => {}
            }
        }

        let sms_rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*), COALESCE(SUM(parts), 0) FROM sms_logs GROUP BY status",
        )
        .fetch_all(pool)
        .await?;
        let mut sms = SmsCounts::default();
        for (status, count, parts) in sms_rows {
            match status.as_str() {
                "sent" => {
                    sms.sent = count;
                    sms.parts_sent = parts;
                }
                "failed" => sms.failed = count,
                "queued" => sms.queued = count,
                _ => {}
            }
        }

        let (paid_purchases, revenue): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM purchases WHERE status = 'paid'",
        )
        .fetch_one(pool)
        .await?;

        let pending_jobs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sms_jobs WHERE status IN ('queued', 'processing')",
        )
        .fetch_one(pool)
        .await?;

        Ok(Self {
            users,
            active_users,
            subscribed_users,
            bookings,
            sms,
            revenue,
            paid_purchases,
            pending_jobs,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminUserQuery {
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminUpdateUserRequest {
    pub is_active: Option<bool>,
    /// Added to the balance; negative values deduct, clamped at zero
    pub sms_balance_delta: Option<i64>,
}
