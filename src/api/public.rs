//! Unauthenticated routes: the business booking page behind a slug and the
//! customer's own booking behind its token.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use super::auth::generate_token;
use super::bookings::{
    available_credit, booking_services, close_booking, enqueue_notices, ensure_balance,
    insert_booking, BookingNotices, NewBooking,
};
use super::clients::find_or_create_client;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_name;
use crate::db::{
    AvailableTimesQuery, AvailableTimesResponse, Booking, BookingStatus, CustomerBookingView,
    PublicBookingRequest, PublicBookingResponse, PublicProfile, Service, SmsKind, User,
};
use crate::scheduling::{parse_date, parse_hhmm, BusinessClock, Scheduler};
use crate::sms::{normalize_phone, DEFAULT_CONFIRMATION_TEMPLATE, DEFAULT_REMINDER_TEMPLATE};
use crate::{AppState, DbPool};

async fn find_business(db: &DbPool, slug: &str) -> Result<User, ApiError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE slug = ? AND is_active = 1")
        .bind(slug.trim().to_lowercase())
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Business not found"))
}

async fn find_by_token(db: &DbPool, token: &str) -> Result<Booking, ApiError> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE customer_token = ?")
        .bind(token)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Booking not found"))
}

fn display_name(user: &User) -> String {
    if user.business_name.is_empty() {
        user.name.clone()
    } else {
        user.business_name.clone()
    }
}

/// GET /api/public/:slug
pub async fn business_profile(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<PublicProfile>, ApiError> {
    let user = find_business(&state.db, &slug).await?;
    let services = sqlx::query_as::<_, Service>(
        "SELECT * FROM services WHERE user_id = ? AND is_active = 1 ORDER BY name",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(PublicProfile {
        business_name: display_name(&user),
        slug: user.slug,
        services: services.into_iter().map(Into::into).collect(),
    }))
}

/// GET /api/public/:slug/available-times
pub async fn public_available_times(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<AvailableTimesQuery>,
) -> Result<Json<AvailableTimesResponse>, ApiError> {
    let user = find_business(&state.db, &slug).await?;
    let day = Scheduler::new(&state.db, &state.config.scheduling)
        .available(&user.id, &query.date, &query.service_id_list())
        .await?;

    Ok(Json(AvailableTimesResponse {
        date: day.date.format("%Y-%m-%d").to_string(),
        duration_minutes: day.duration as i64,
        times: day.formatted_times(),
    }))
}

/// POST /api/public/:slug/bookings
pub async fn create_public_booking(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(req): Json<PublicBookingRequest>,
) -> Result<(StatusCode, Json<PublicBookingResponse>), ApiError> {
    let user = find_business(&state.db, &slug).await?;

    let mut errors = ValidationErrorBuilder::new();
    errors.check("name", validate_name(&req.name));
    let phone = normalize_phone(&req.phone, &state.config.sms.country_code);
    if let Err(ref e) = phone {
        errors.add("phone", e.to_string());
    }
    errors.finish()?;
    let phone = phone?;

    let scheduler = Scheduler::new(&state.db, &state.config.scheduling);
    let services = scheduler.load_services(&user.id, &req.service_ids).await?;
    let duration = scheduler.duration_of(&services);
    let slot = scheduler
        .check_booking(&user.id, &req.date, &req.start_time, duration, None, true)
        .await?;

    let client = find_or_create_client(&state.db, &user.id, &req.name, &phone).await?;
    let token = generate_token();
    let service_ids: Vec<String> = services.iter().map(|s| s.id.clone()).collect();
    let booking = insert_booking(
        &state.db,
        NewBooking {
            user_id: &user.id,
            client_id: &client.id,
            slot: &slot,
            service_ids: &service_ids,
            token: &token,
            confirmation_template_id: None,
            reminder_template_id: None,
            notes: None,
        },
    )
    .await?;

    // Customer messages are sent only while the owner has credit for them
    let messages = BookingNotices {
        user: &user,
        client_name: &client.name,
        date: slot.date,
        start: slot.start,
        services: &services,
        token: &token,
    };
    let mut notices = vec![messages.immediate(&state, SmsKind::Confirmation, DEFAULT_CONFIRMATION_TEMPLATE)];
    if user.reminder_minutes > 0 {
        notices.extend(messages.reminder(&state, DEFAULT_REMINDER_TEMPLATE));
    }
    let available = available_credit(&state, &user).await?;
    while !notices.is_empty() && ensure_balance(available, &notices).is_err() {
        notices.pop();
    }
    let sent = notices.len();
    enqueue_notices(&state, &user.id, &booking.id, &client.phone, notices).await?;

    tracing::info!(
        booking_id = %booking.id,
        user_id = %user.id,
        date = %booking.date,
        start_time = %booking.start_time,
        messages = sent,
        "Public booking created"
    );

    Ok((
        StatusCode::CREATED,
        Json(PublicBookingResponse {
            customer_token: booking.customer_token,
            date: booking.date,
            start_time: booking.start_time,
            duration_minutes: booking.duration_minutes,
        }),
    ))
}

async fn customer_view(state: &AppState, booking: Booking) -> Result<CustomerBookingView, ApiError> {
    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&booking.user_id)
        .fetch_one(&state.db)
        .await?;
    let client_name: String = sqlx::query_scalar("SELECT name FROM clients WHERE id = ?")
        .bind(&booking.client_id)
        .fetch_one(&state.db)
        .await?;
    let services = booking_services(&state.db, &user.id, &booking.get_service_ids()).await?;

    Ok(CustomerBookingView {
        business_name: display_name(&user),
        business_slug: user.slug,
        client_name,
        status: booking.get_status(),
        date: booking.date,
        start_time: booking.start_time,
        duration_minutes: booking.duration_minutes,
        services: services.into_iter().map(|s| s.name).collect(),
        customer_token: booking.customer_token,
    })
}

/// GET /api/customer/bookings/:token
pub async fn customer_booking(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<CustomerBookingView>, ApiError> {
    let booking = find_by_token(&state.db, &token).await?;
    Ok(Json(customer_view(&state, booking).await?))
}

/// POST /api/customer/bookings/:token/cancel
pub async fn customer_cancel(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<CustomerBookingView>, ApiError> {
    let booking = find_by_token(&state.db, &token).await?;
    match booking.get_status() {
        BookingStatus::Active => {}
        BookingStatus::Cancelled => return Err(ApiError::conflict("Booking is already cancelled")),
        BookingStatus::Done => return Err(ApiError::conflict("Booking is already done")),
    }

    let clock = BusinessClock::new(state.config.scheduling.utc_offset_minutes);
    let starts_at = clock.to_utc(parse_date(&booking.date)?, parse_hhmm(&booking.start_time)?);
    if starts_at <= Utc::now() {
        return Err(ApiError::conflict("Past bookings cannot be cancelled"));
    }

    close_booking(&state, &booking.id, BookingStatus::Cancelled).await?;
    tracing::info!(booking_id = %booking.id, "Booking cancelled by customer");

    let booking = find_by_token(&state.db, &token).await?;
    Ok(Json(customer_view(&state, booking).await?))
}
