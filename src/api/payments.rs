use axum::{
    extract::{Query, State},
    response::Redirect,
    Json,
};
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use crate::db::{
    BuyPlanRequest, BuySmsPackRequest, PaymentCallbackQuery, PaymentStartResponse, Plan, Purchase,
    SmsPack,
};
use crate::payments::{settle_payment, start_payment, PaymentError, PurchaseItem};
use crate::AppState;

/// GET /api/plans - active subscription plans
pub async fn list_plans(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Plan>>, ApiError> {
    let plans = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE is_active = 1 ORDER BY price")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(plans))
}

/// GET /api/sms-packs
pub async fn list_sms_packs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SmsPack>>, ApiError> {
    let packs =
        sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs WHERE is_active = 1 ORDER BY price")
            .fetch_all(&state.db)
            .await?;
    Ok(Json(packs))
}

async fn start(
    state: &AppState,
    user: &crate::db::User,
    item: PurchaseItem,
) -> Result<Json<PaymentStartResponse>, ApiError> {
    let started = start_payment(&state.db, state.payments.as_ref(), user, &item).await?;
    Ok(Json(PaymentStartResponse {
        purchase_id: started.purchase.id,
        payment_url: started.payment_url,
    }))
}

/// POST /api/payments/plan
pub async fn buy_plan(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<BuyPlanRequest>,
) -> Result<Json<PaymentStartResponse>, ApiError> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ? AND is_active = 1")
        .bind(&req.plan_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Plan not found"))?;

    start(&state, &user, PurchaseItem::Plan(plan)).await
}

/// POST /api/payments/sms-pack
pub async fn buy_sms_pack(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<BuySmsPackRequest>,
) -> Result<Json<PaymentStartResponse>, ApiError> {
    let pack = sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs WHERE id = ? AND is_active = 1")
        .bind(&req.pack_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("SMS pack not found"))?;

    start(&state, &user, PurchaseItem::SmsPack(pack)).await
}

/// GET /api/payments/callback - the gateway sends the customer back here
pub async fn payment_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PaymentCallbackQuery>,
) -> Redirect {
    let status_ok = query.status.eq_ignore_ascii_case("OK");
    let status = match settle_payment(
        &state.db,
        state.payments.as_ref(),
        &query.authority,
        status_ok,
    )
    .await
    {
        Ok(settlement) => settlement.as_str(),
        Err(PaymentError::NotFound) => {
            tracing::warn!(authority = %query.authority, "Callback for unknown payment");
            "failed"
        }
        Err(e) => {
            // Left pending; a repeated callback retries verification
            tracing::error!(authority = %query.authority, error = %e, "Payment verification failed");
            "error"
        }
    };

    let separator = if state.config.payment.result_url.contains('?') {
        '&'
    } else {
        '?'
    };
    Redirect::to(&format!(
        "{}{}status={}",
        state.config.payment.result_url, separator, status
    ))
}

/// GET /api/payments - the owner's purchase history
pub async fn list_purchases(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<Purchase>>, ApiError> {
    let purchases = sqlx::query_as::<_, Purchase>(
        "SELECT * FROM purchases WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(purchases))
}
