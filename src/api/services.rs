use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AuthUser;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_duration, validate_name, validate_price};
use crate::db::{self, CreateServiceRequest, Service, ServiceResponse, UpdateServiceRequest};
use crate::{AppState, DbPool};

/// Service owned by `user_id`; other tenants' rows are reported as missing
pub(crate) async fn find_service(db: &DbPool, user_id: &str, id: &str) -> Result<Service, ApiError> {
    sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Service not found"))
}

/// List the owner's services, active first
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ServiceResponse>>, ApiError> {
    let services = sqlx::query_as::<_, Service>(
        "SELECT * FROM services WHERE user_id = ? ORDER BY is_active DESC, name",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(services.into_iter().map(ServiceResponse::from).collect()))
}

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<ServiceResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("name", validate_name(&req.name))
        .check("duration_minutes", validate_duration(req.duration_minutes))
        .check("price", validate_price(req.price));
    errors.finish()?;

    let id = Uuid::new_v4().to_string();
    let now = db::now();

    sqlx::query(
        r#"
        INSERT INTO services (id, user_id, name, duration_minutes, price, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(req.name.trim())
    .bind(req.duration_minutes)
    .bind(req.price)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let service = find_service(&state.db, &user.id, &id).await?;
    Ok((StatusCode::CREATED, Json(service.into())))
}

pub async fn update_service(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateServiceRequest>,
) -> Result<Json<ServiceResponse>, ApiError> {
    find_service(&state.db, &user.id, &id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(duration) = req.duration_minutes {
        errors.check("duration_minutes", validate_duration(duration));
    }
    if let Some(price) = req.price {
        errors.check("price", validate_price(price));
    }
    errors.finish()?;

    sqlx::query(
        r#"
        UPDATE services SET
            name = COALESCE(?, name),
            duration_minutes = COALESCE(?, duration_minutes),
            price = COALESCE(?, price),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.duration_minutes)
    .bind(req.price)
    .bind(req.is_active.map(i32::from))
    .bind(db::now())
    .bind(&id)
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    let service = find_service(&state.db, &user.id, &id).await?;
    Ok(Json(service.into()))
}

/// Delete a service, or deactivate it when bookings still reference it
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    find_service(&state.db, &user.id, &id).await?;

    let pattern = format!("%\"{}\"%", id);
    let referenced: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM bookings WHERE user_id = ? AND service_ids LIKE ?")
            .bind(&user.id)
            .bind(&pattern)
            .fetch_one(&state.db)
            .await?;

    if referenced > 0 {
        sqlx::query("UPDATE services SET is_active = 0, updated_at = ? WHERE id = ? AND user_id = ?")
            .bind(db::now())
            .bind(&id)
            .bind(&user.id)
            .execute(&state.db)
            .await?;
        tracing::info!(service_id = %id, bookings = referenced, "Service deactivated instead of deleted");
    } else {
        sqlx::query("DELETE FROM services WHERE id = ? AND user_id = ?")
            .bind(&id)
            .bind(&user.id)
            .execute(&state.db)
            .await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
