//! Platform administration: statistics, owner accounts and the catalogue.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AdminUser;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_name, validate_positive, validate_price};
use crate::db::{
    self, AdminStats, AdminUpdateUserRequest, AdminUserQuery, CreatePlanRequest,
    CreateSmsPackRequest, Plan, SmsPack, UpdatePlanRequest, UpdateSmsPackRequest, User,
    UserResponse,
};
use crate::AppState;

/// GET /api/admin/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<AdminStats>, ApiError> {
    Ok(Json(AdminStats::collect(&state.db, &db::now()).await?))
}

/// GET /api/admin/users?search=
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<AdminUserQuery>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));

    let users = sqlx::query_as::<_, User>(
        r#"
        SELECT * FROM users
        WHERE ? IS NULL OR phone LIKE ? OR name LIKE ? OR business_name LIKE ? OR slug LIKE ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(&search)
    .bind(&search)
    .bind(&search)
    .bind(&search)
    .bind(&search)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

/// PUT /api/admin/users/:id - activate/deactivate, adjust SMS credit
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<AdminUpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let result = sqlx::query(
        r#"
        UPDATE users SET
            is_active = COALESCE(?, is_active),
            sms_balance = MAX(0, sms_balance + ?),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.is_active.map(i32::from))
    .bind(req.sms_balance_delta.unwrap_or(0))
    .bind(db::now())
    .bind(&id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("User not found"));
    }

    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;

    tracing::info!(
        admin = %admin.username,
        user_id = %id,
        is_active = ?req.is_active,
        balance_delta = ?req.sms_balance_delta,
        sms_balance = user.sms_balance,
        "User updated by admin"
    );
    Ok(Json(user.into()))
}

/// GET /api/admin/plans - including inactive ones
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<Plan>>, ApiError> {
    let plans = sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY price")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(plans))
}

async fn find_plan(state: &AppState, id: &str) -> Result<Plan, ApiError> {
    sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Plan not found"))
}

pub async fn create_plan(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<Plan>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("name", validate_name(&req.name))
        .check("price", validate_price(req.price))
        .check("duration_days", validate_positive(req.duration_days, "Duration"))
        .check("monthly_sms", validate_price(req.monthly_sms));
    errors.finish()?;

    let id = Uuid::new_v4().to_string();
    let now = db::now();
    sqlx::query(
        r#"
        INSERT INTO plans (id, name, price, duration_days, monthly_sms, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.name.trim())
    .bind(req.price)
    .bind(req.duration_days)
    .bind(req.monthly_sms)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(find_plan(&state, &id).await?)))
}

pub async fn update_plan(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<Json<Plan>, ApiError> {
    find_plan(&state, &id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(price) = req.price {
        errors.check("price", validate_price(price));
    }
    if let Some(days) = req.duration_days {
        errors.check("duration_days", validate_positive(days, "Duration"));
    }
    if let Some(sms) = req.monthly_sms {
        errors.check("monthly_sms", validate_price(sms));
    }
    errors.finish()?;

    sqlx::query(
        r#"
        UPDATE plans SET
            name = COALESCE(?, name),
            price = COALESCE(?, price),
            duration_days = COALESCE(?, duration_days),
            monthly_sms = COALESCE(?, monthly_sms),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.price)
    .bind(req.duration_days)
    .bind(req.monthly_sms)
    .bind(req.is_active.map(i32::from))
    .bind(db::now())
    .bind(&id)
    .execute(&state.db)
    .await?;

    Ok(Json(find_plan(&state, &id).await?))
}

/// GET /api/admin/sms-packs - including inactive ones
pub async fn list_sms_packs(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<SmsPack>>, ApiError> {
    let packs = sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs ORDER BY price")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(packs))
}

async fn find_pack(state: &AppState, id: &str) -> Result<SmsPack, ApiError> {
    sqlx::query_as::<_, SmsPack>("SELECT * FROM sms_packs WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("SMS pack not found"))
}

pub async fn create_sms_pack(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateSmsPackRequest>,
) -> Result<(StatusCode, Json<SmsPack>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("name", validate_name(&req.name))
        .check("price", validate_price(req.price))
        .check("sms_count", validate_positive(req.sms_count, "SMS count"));
    errors.finish()?;

    let id = Uuid::new_v4().to_string();
    let now = db::now();
    sqlx::query(
        r#"
        INSERT INTO sms_packs (id, name, price, sms_count, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.name.trim())
    .bind(req.price)
    .bind(req.sms_count)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(find_pack(&state, &id).await?)))
}

pub async fn update_sms_pack(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateSmsPackRequest>,
) -> Result<Json<SmsPack>, ApiError> {
    find_pack(&state, &id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(price) = req.price {
        errors.check("price", validate_price(price));
    }
    if let Some(count) = req.sms_count {
        errors.check("sms_count", validate_positive(count, "SMS count"));
    }
    errors.finish()?;

    sqlx::query(
        r#"
        UPDATE sms_packs SET
            name = COALESCE(?, name),
            price = COALESCE(?, price),
            sms_count = COALESCE(?, sms_count),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.price)
    .bind(req.sms_count)
    .bind(req.is_active.map(i32::from))
    .bind(db::now())
    .bind(&id)
    .execute(&state.db)
    .await?;

    Ok(Json(find_pack(&state, &id).await?))
}
