//! Database seeders for built-in data
//!
//! Seeds the plan and SMS pack catalogue on a fresh database and makes sure the
//! configured bootstrap admin account exists.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::api::auth::hash_password;

/// Seed the default plan and SMS pack catalogue when both are empty
pub async fn seed_catalog(pool: &SqlitePool) -> Result<()> {
    let plan_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans")
        .fetch_one(pool)
        .await?;

    if plan_count == 0 {
        info!("Seeding default plans...");
        // (name, price, duration_days, monthly_sms)
        let plans: [(&str, i64, i64, i64); 3] = [
            ("Basic", 990_000, 30, 200),
            ("Professional", 1_990_000, 30, 600),
            ("Business", 4_490_000, 90, 1_500),
        ];
        for (name, price, duration_days, monthly_sms) in plans {
            sqlx::query(
                "INSERT INTO plans (id, name, price, duration_days, monthly_sms) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(name)
            .bind(price)
            .bind(duration_days)
            .bind(monthly_sms)
            .execute(pool)
            .await?;
        }
    }

    let pack_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sms_packs")
        .fetch_one(pool)
        .await?;

    if pack_count == 0 {
        info!("Seeding default SMS packs...");
        // (name, price, sms_count)
        let packs: [(&str, i64, i64); 3] = [
            ("100 SMS", 250_000, 100),
            ("500 SMS", 1_100_000, 500),
            ("1000 SMS", 2_000_000, 1_000),
        ];
        for (name, price, sms_count) in packs {
            sqlx::query("INSERT INTO sms_packs (id, name, price, sms_count) VALUES (?, ?, ?, ?)")
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(name)
                .bind(price)
                .bind(sms_count)
                .execute(pool)
                .await?;
        }
    }

    Ok(())
}

/// Create the admin account if no admin with this username exists yet
pub async fn ensure_admin(pool: &SqlitePool, username: &str, password: &str) -> Result<()> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM admins WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Ok(());
    }

    let password_hash = hash_password(password)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;

    sqlx::query("INSERT INTO admins (id, username, password_hash) VALUES (?, ?, ?)")
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(username)
        .bind(&password_hash)
        .execute(pool)
        .await?;

    info!(username = %username, "Created bootstrap admin");
    Ok(())
}
