//! Plan and SMS pack purchases through an online payment gateway.
//!
//! A purchase is created `pending`, the customer is redirected to the
//! gateway, and the gateway calls back with the payment authority. The
//! callback verifies the payment and applies its effect exactly once.

mod gateway;

pub use gateway::*;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::db::{self, Plan, Purchase, PurchaseKind, SmsPack, User};
use crate::DbPool;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Payment gateway returned code {code}: {message}")]
    Gateway { code: i64, message: String },
    #[error("Unexpected payment gateway response: {0}")]
    InvalidResponse(String),
    #[error("Payment not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// What a purchase buys, resolved from the catalogue
#[derive(Debug, Clone)]
pub enum PurchaseItem {
    Plan(Plan),
    SmsPack(SmsPack),
}

impl PurchaseItem {
    pub fn kind(&self) -> PurchaseKind {
        match self {
            Self::Plan(_) => PurchaseKind::Plan,
            Self::SmsPack(_) => PurchaseKind::SmsPack,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Plan(p) => &p.id,
            Self::SmsPack(p) => &p.id,
        }
    }

    pub fn price(&self) -> i64 {
        match self {
            Self::Plan(p) => p.price,
            Self::SmsPack(p) => p.price,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Plan(p) => format!("OnTime plan: {}", p.name),
            Self::SmsPack(p) => format!("OnTime SMS pack: {}", p.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedPayment {
    pub purchase: Purchase,
    pub payment_url: String,
}

/// Outcome of a gateway callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Paid { ref_id: String },
    AlreadyPaid,
    Failed,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid { .. } | Self::AlreadyPaid => "success",
            Self::Failed => "failed",
        }
    }
}

/// Create a pending purchase and open a payment session for it
pub async fn start_payment(
    db: &DbPool,
    gateway: &dyn PaymentGateway,
    user: &User,
    item: &PurchaseItem,
) -> Result<StartedPayment, PaymentError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();

    sqlx::query(
        r#"
        INSERT INTO purchases (id, user_id, kind, item_id, amount, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(item.kind().as_str())
    .bind(item.id())
    .bind(item.price())
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    let session = match gateway
        .request(&PaymentRequest {
            amount: item.price(),
            description: item.description(),
            mobile: Some(user.phone.clone()),
        })
        .await
    {
        Ok(session) => session,
        Err(e) => {
            sqlx::query("UPDATE purchases SET status = 'failed', updated_at = ? WHERE id = ?")
                .bind(db::now())
                .bind(&id)
                .execute(db)
                .await?;
            return Err(e);
        }
    };

    sqlx::query("UPDATE purchases SET authority = ?, updated_at = ? WHERE id = ?")
        .bind(&session.authority)
        .bind(db::now())
        .bind(&id)
        .execute(db)
        .await?;

    let purchase = sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE id = ?")
        .bind(&id)
        .fetch_one(db)
        .await?;

    tracing::info!(
        purchase_id = %purchase.id,
        user_id = %user.id,
        kind = %item.kind().as_str(),
        amount = purchase.amount,
        "Payment started"
    );

    Ok(StartedPayment {
        purchase,
        payment_url: session.payment_url,
    })
}

/// Handle the gateway callback for `authority`
pub async fn settle_payment(
    db: &DbPool,
    gateway: &dyn PaymentGateway,
    authority: &str,
    gateway_status_ok: bool,
) -> Result<Settlement, PaymentError> {
    let purchase = sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE authority = ?")
        .bind(authority)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound)?;

    match purchase.status.as_str() {
        "paid" => return Ok(Settlement::AlreadyPaid),
        "failed" => return Ok(Settlement::Failed),
        _ => {}
    }

    if !gateway_status_ok {
        mark_failed(db, &purchase.id).await?;
        tracing::info!(purchase_id = %purchase.id, "Payment cancelled by customer");
        return Ok(Settlement::Failed);
    }

    let ref_id = match gateway.verify(authority, purchase.amount).await {
        Ok(ref_id) => ref_id,
        Err(PaymentError::Gateway { code, message }) => {
            mark_failed(db, &purchase.id).await?;
            tracing::warn!(purchase_id = %purchase.id, code = code, error = %message, "Payment verification rejected");
            return Ok(Settlement::Failed);
        }
        Err(e) => return Err(e),
    };

    if apply_purchase(db, &purchase, &ref_id, Utc::now()).await? {
        tracing::info!(purchase_id = %purchase.id, ref_id = %ref_id, "Payment settled");
        Ok(Settlement::Paid { ref_id })
    } else {
        Ok(Settlement::AlreadyPaid)
    }
}

async fn mark_failed(db: &DbPool, purchase_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE purchases SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(db::now())
    .bind(purchase_id)
    .execute(db)
    .await?;
    Ok(())
}

/// New plan expiry: `duration_days` after the later of `now` and the current expiry
pub fn extend_expiry(current: Option<&str>, now: DateTime<Utc>, duration_days: i64) -> DateTime<Utc> {
    let base = current
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| *dt > now)
        .unwrap_or(now);
    base + Duration::days(duration_days)
}

/// Flip the purchase to `paid` and credit the owner in one transaction.
/// Returns false when another callback already settled it.
pub async fn apply_purchase(
    db: &DbPool,
    purchase: &Purchase,
    ref_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, PaymentError> {
    let now_str = db::timestamp(now);
    let mut tx = db.begin().await?;

    let flipped = sqlx::query(
        "UPDATE purchases SET status = 'paid', ref_id = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(ref_id)
    .bind(&now_str)
    .bind(&purchase.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if flipped == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let kind: PurchaseKind = purchase
        .kind
        .parse()
        .map_err(PaymentError::InvalidResponse)?;

    match kind {
        PurchaseKind::Plan => {
            let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
                .bind(&purchase.item_id)
                .fetch_one(&mut *tx)
                .await?;
            let current: Option<String> =
                sqlx::query_scalar("SELECT plan_expires_at FROM users WHERE id = ?")
                    .bind(&purchase.user_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let expires_at = extend_expiry(current.as_deref(), now, plan.duration_days);

            sqlx::query(
                r#"
                UPDATE users
                SET plan_id = ?, plan_expires_at = ?, sms_balance = sms_balance + ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&plan.id)
            .bind(db::timestamp(expires_at))
            .bind(plan.monthly_sms)
            .bind(&now_str)
            .bind(&purchase.user_id)
            .execute(&mut *tx)
            .await?;
        }
        PurchaseKind::SmsPack => {
            let pack = sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs WHERE id = ?")
                .bind(&purchase.item_id)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query("UPDATE users SET sms_balance = sms_balance + ?, updated_at = ? WHERE id = ?")
                .bind(pack.sms_count)
                .bind(&now_str)
                .bind(&purchase.user_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGateway {
        verify_ok: bool,
        verifications: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn request(&self, _req: &PaymentRequest) -> Result<PaymentSession, PaymentError> {
            let authority = format!("A{}", uuid::Uuid::new_v4().simple());
            Ok(PaymentSession {
                payment_url: format!("https://pay.example/{}", authority),
                authority,
            })
        }

        async fn verify(&self, _authority: &str, _amount: i64) -> Result<String, PaymentError> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            if self.verify_ok {
                Ok("REF-1".to_string())
            } else {
                Err(PaymentError::Gateway {
                    code: -51,
                    message: "payment not completed".to_string(),
                })
            }
        }
    }

    fn gateway(verify_ok: bool) -> FakeGateway {
        FakeGateway {
            verify_ok,
            verifications: AtomicUsize::new(0),
        }
    }

    async fn setup() -> (DbPool, User) {
        let db = crate::db::init_in_memory().await.unwrap();
        crate::db::seed_catalog(&db).await.unwrap();
        sqlx::query("INSERT INTO users (id, phone, slug, sms_balance) VALUES ('u1', '09120000000', 'salon', 5)")
            .execute(&db)
            .await
            .unwrap();
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = 'u1'")
            .fetch_one(&db)
            .await
            .unwrap();
        (db, user)
    }

    async fn balance(db: &DbPool) -> i64 {
        sqlx::query_scalar("SELECT sms_balance FROM users WHERE id = 'u1'")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[test]
    fn test_extend_expiry_from_later_of_now_and_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(
            extend_expiry(None, now, 30),
            Utc.with_ymd_and_hms(2026, 10, 31, 0, 0, 0).unwrap()
        );
        assert_eq!(
            extend_expiry(Some("2026-10-11T00:00:00Z"), now, 30),
            Utc.with_ymd_and_hms(2026, 11, 10, 0, 0, 0).unwrap()
        );
        // Expired subscriptions restart from now
        assert_eq!(
            extend_expiry(Some("2026-09-01T00:00:00Z"), now, 30),
            Utc.with_ymd_and_hms(2026, 10, 31, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_sms_pack_is_credited_once() {
        let (db, user) = setup().await;
        let gw = gateway(true);
        let pack = sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs WHERE sms_count = 100")
            .fetch_one(&db)
            .await
            .unwrap();

        let started = start_payment(&db, &gw, &user, &PurchaseItem::SmsPack(pack))
            .await
            .unwrap();
        assert_eq!(started.purchase.status, "pending");
        let authority = started.purchase.authority.clone().unwrap();
        assert!(started.payment_url.ends_with(&authority));

        let first = settle_payment(&db, &gw, &authority, true).await.unwrap();
        assert_eq!(first, Settlement::Paid { ref_id: "REF-1".to_string() });
        assert_eq!(balance(&db).await, 105);

        let second = settle_payment(&db, &gw, &authority, true).await.unwrap();
        assert_eq!(second, Settlement::AlreadyPaid);
        assert_eq!(balance(&db).await, 105);
        assert_eq!(gw.verifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plan_sets_expiry_and_quota() {
        let (db, user) = setup().await;
        let gw = gateway(true);
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE name = 'Basic'")
            .fetch_one(&db)
            .await
            .unwrap();

        let started = start_payment(&db, &gw, &user, &PurchaseItem::Plan(plan.clone()))
            .await
            .unwrap();
        let authority = started.purchase.authority.unwrap();
        settle_payment(&db, &gw, &authority, true).await.unwrap();

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = 'u1'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(user.plan_id.as_deref(), Some(plan.id.as_str()));
        assert_eq!(user.sms_balance, 5 + plan.monthly_sms);
        assert!(user.has_active_plan(&db::now()));
    }

    #[tokio::test]
    async fn test_cancelled_and_rejected_payments_fail() {
        let (db, user) = setup().await;
        let pack = sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs LIMIT 1")
            .fetch_one(&db)
            .await
            .unwrap();

        let gw = gateway(true);
        let started = start_payment(&db, &gw, &user, &PurchaseItem::SmsPack(pack.clone()))
            .await
            .unwrap();
        let authority = started.purchase.authority.unwrap();
        assert_eq!(
            settle_payment(&db, &gw, &authority, false).await.unwrap(),
            Settlement::Failed
        );
        // A late OK for a failed purchase does not credit
        assert_eq!(
            settle_payment(&db, &gw, &authority, true).await.unwrap(),
            Settlement::Failed
        );

        let rejecting = gateway(false);
        let started = start_payment(&db, &rejecting, &user, &PurchaseItem::SmsPack(pack))
            .await
            .unwrap();
        let authority = started.purchase.authority.unwrap();
        assert_eq!(
            settle_payment(&db, &rejecting, &authority, true).await.unwrap(),
            Settlement::Failed
        );
        assert_eq!(balance(&db).await, 5);
    }

    #[tokio::test]
    async fn test_unknown_authority() {
        let (db, _) = setup().await;
        let result = settle_payment(&db, &gateway(true), "missing", true).await;
        assert!(matches!(result, Err(PaymentError::NotFound)));
    }
}
