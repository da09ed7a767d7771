use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AuthUser;
use super::bookings::{list_bookings_where, BookingFilter};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_name, validate_notes};
use crate::db::{
    self, BookingResponse, Client, ClientListQuery, CreateClientRequest, UpdateClientRequest,
};
use crate::sms::normalize_phone;
use crate::{AppState, DbPool};

pub(crate) async fn find_client(db: &DbPool, user_id: &str, id: &str) -> Result<Client, ApiError> {
    sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Client not found"))
}

async fn ensure_phone_free(
    db: &DbPool,
    user_id: &str,
    phone: &str,
    except_id: Option<&str>,
) -> Result<(), ApiError> {
    let taken: Option<String> =
        sqlx::query_scalar("SELECT id FROM clients WHERE user_id = ? AND phone = ?")
            .bind(user_id)
            .bind(phone)
            .fetch_optional(db)
            .await?;
    match taken {
        Some(id) if Some(id.as_str()) != except_id => {
            Err(ApiError::conflict("A client with this phone number already exists"))
        }
        _ => Ok(()),
    }
}

/// Find the owner's client by phone or create one. Used by booking creation.
pub(crate) async fn find_or_create_client(
    db: &DbPool,
    user_id: &str,
    name: &str,
    phone: &str,
) -> Result<Client, ApiError> {
    let existing = sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE user_id = ? AND phone = ?")
        .bind(user_id)
        .bind(phone)
        .fetch_optional(db)
        .await?;
    if let Some(client) = existing {
        return Ok(client);
    }

    let id = Uuid::new_v4().to_string();
    let now = db::now();
    sqlx::query(
        "INSERT INTO clients (id, user_id, name, phone, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(name.trim())
    .bind(phone)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    find_client(db, user_id, &id).await
}

/// List clients, optionally filtered by name or phone
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<ClientListQuery>,
) -> Result<Json<Vec<Client>>, ApiError> {
    let clients = match query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(search) => {
            // Searching by a phone typed in any supported format
            let phone = normalize_phone(search, &state.config.sms.country_code)
                .unwrap_or_else(|_| search.to_string());
            sqlx::query_as::<_, Client>(
                r#"
                SELECT * FROM clients
                WHERE user_id = ? AND (name LIKE ? OR phone LIKE ?)
                ORDER BY name
                "#,
            )
            .bind(&user.id)
            .bind(format!("%{}%", search))
            .bind(format!("%{}%", phone))
            .fetch_all(&state.db)
            .await?
        }
        None => {
            sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE user_id = ? ORDER BY name")
                .bind(&user.id)
                .fetch_all(&state.db)
                .await?
        }
    };

    Ok(Json(clients))
}

pub async fn get_client(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Client>, ApiError> {
    Ok(Json(find_client(&state.db, &user.id, &id).await?))
}

pub async fn create_client(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<Client>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors.check("name", validate_name(&req.name));
    if let Some(ref notes) = req.notes {
        errors.check("notes", validate_notes(notes));
    }
    let phone = normalize_phone(&req.phone, &state.config.sms.country_code);
    if let Err(ref e) = phone {
        errors.add("phone", e.to_string());
    }
    errors.finish()?;
    let phone = phone?;

    ensure_phone_free(&state.db, &user.id, &phone, None).await?;

    let id = Uuid::new_v4().to_string();
    let now = db::now();
    sqlx::query(
        r#"
        INSERT INTO clients (id, user_id, name, phone, notes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(req.name.trim())
    .bind(&phone)
    .bind(&req.notes)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let client = find_client(&state.db, &user.id, &id).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

pub async fn update_client(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateClientRequest>,
) -> Result<Json<Client>, ApiError> {
    find_client(&state.db, &user.id, &id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(ref notes) = req.notes {
        errors.check("notes", validate_notes(notes));
    }
    let phone = req
        .phone
        .as_deref()
        .map(|p| normalize_phone(p, &state.config.sms.country_code))
        .transpose();
    if let Err(ref e) = phone {
        errors.add("phone", e.to_string());
    }
    errors.finish()?;
    let phone = phone?;

    if let Some(ref phone) = phone {
        ensure_phone_free(&state.db, &user.id, phone, Some(&id)).await?;
    }

    sqlx::query(
        r#"
        UPDATE clients SET
            name = COALESCE(?, name),
            phone = COALESCE(?, phone),
            notes = COALESCE(?, notes),
            updated_at = ?
        WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(&phone)
    .bind(&req.notes)
    .bind(db::now())
    .bind(&id)
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    Ok(Json(find_client(&state.db, &user.id, &id).await?))
}

/// Delete a client together with their bookings
pub async fn delete_client(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    find_client(&state.db, &user.id, &id).await?;

    let booking_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM bookings WHERE client_id = ? AND status = 'active'")
            .bind(&id)
            .fetch_all(&state.db)
            .await?;
    for booking_id in &booking_ids {
        state.sms.cancel_for_booking(booking_id, None).await?;
    }

    sqlx::query("DELETE FROM clients WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?;

    tracing::info!(client_id = %id, bookings = booking_ids.len(), "Client deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/clients/:id/bookings
pub async fn client_bookings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<BookingResponse>>, ApiError> {
    find_client(&state.db, &user.id, &id).await?;
    let filter = BookingFilter {
        client_id: Some(id),
        ..Default::default()
    };
    Ok(Json(list_bookings_where(&state.db, &user.id, &filter).await?))
}
