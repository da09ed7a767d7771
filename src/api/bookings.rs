//! Owner booking management and the booking notification helpers shared with
//! the public booking routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::auth::{generate_token, AuthUser};
use super::clients::{find_client, find_or_create_client};
use super::error::{ApiError, ErrorDetails, ValidationErrorBuilder};
use super::sms::find_template;
use super::validation::{validate_duration, validate_name, validate_notes};
use crate::db::{
    self, AvailableTimesQuery, AvailableTimesResponse, Booking, BookingListQuery, BookingResponse,
    BookingStatus, BookingWithClient, CancelBookingQuery, CreateBookingRequest, Service, SmsKind,
    UpdateBookingRequest, User,
};
use crate::scheduling::{
    format_hhmm, parse_date, parse_hhmm, BookingSlot, BusinessClock, Scheduler,
};
use crate::sms::{
    booking_variables, count_parts, normalize_phone, render_template, BookingMessage, OutgoingSms,
    SmsContent, DEFAULT_CANCELLATION_TEMPLATE, DEFAULT_REMINDER_TEMPLATE,
};
use crate::{AppState, DbPool};

const BOOKING_SELECT: &str = r#"
    SELECT b.*, c.name AS client_name, c.phone AS client_phone
    FROM bookings b
    JOIN clients c ON c.id = b.client_id
"#;

/// Optional filters for booking lists
#[derive(Debug, Default)]
pub(crate) struct BookingFilter {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
    pub client_id: Option<String>,
}

pub(crate) async fn list_bookings_where(
    db: &DbPool,
    user_id: &str,
    filter: &BookingFilter,
) -> Result<Vec<BookingResponse>, ApiError> {
    let sql = format!(
        r#"{}
        WHERE b.user_id = ?
          AND (? IS NULL OR b.date = ?)
          AND (? IS NULL OR b.date >= ?)
          AND (? IS NULL OR b.date <= ?)
          AND (? IS NULL OR b.status = ?)
          AND (? IS NULL OR b.client_id = ?)
        ORDER BY b.date, b.start_time
        "#,
        BOOKING_SELECT
    );

    let rows = sqlx::query_as::<_, BookingWithClient>(&sql)
        .bind(user_id)
        .bind(&filter.date)
        .bind(&filter.date)
        .bind(&filter.from)
        .bind(&filter.from)
        .bind(&filter.to)
        .bind(&filter.to)
        .bind(&filter.status)
        .bind(&filter.status)
        .bind(&filter.client_id)
        .bind(&filter.client_id)
        .fetch_all(db)
        .await?;

    Ok(rows.into_iter().map(BookingResponse::from).collect())
}

pub(crate) async fn find_booking(
    db: &DbPool,
    user_id: &str,
    id: &str,
) -> Result<BookingWithClient, ApiError> {
    let sql = format!("{} WHERE b.id = ? AND b.user_id = ?", BOOKING_SELECT);
    sqlx::query_as::<_, BookingWithClient>(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Booking not found"))
}

/// Customer-facing link for a booking token
pub(crate) fn booking_link(state: &AppState, token: &str) -> String {
    format!(
        "{}/b/{}",
        state.config.server.public_base_url.trim_end_matches('/'),
        token
    )
}

/// A booking message ready to enqueue
#[derive(Debug, Clone)]
pub(crate) struct Notice {
    pub kind: SmsKind,
    pub body: String,
    pub delay: Duration,
}

impl Notice {
    pub fn parts(&self) -> i64 {
        count_parts(&self.body)
    }
}

/// Inputs for rendering the messages of one booking
pub(crate) struct BookingNotices<'a> {
    pub user: &'a User,
    pub client_name: &'a str,
    pub date: NaiveDate,
    pub start: u32,
    pub services: &'a [Service],
    pub token: &'a str,
}

impl BookingNotices<'_> {
    fn variables(&self, state: &AppState) -> HashMap<&'static str, String> {
        let names: Vec<String> = self.services.iter().map(|s| s.name.clone()).collect();
        let business = if self.user.business_name.is_empty() {
            self.user.name.as_str()
        } else {
            self.user.business_name.as_str()
        };
        booking_variables(&BookingMessage {
            client_name: self.client_name,
            business_name: business,
            date: &self.date.format("%Y-%m-%d").to_string(),
            start_time: &format_hhmm(self.start),
            services: &names,
            link: &booking_link(state, self.token),
        })
    }

    /// Message sent right away
    pub fn immediate(&self, state: &AppState, kind: SmsKind, template: &str) -> Notice {
        Notice {
            kind,
            body: render_template(template, &self.variables(state)),
            delay: Duration::zero(),
        }
    }

    /// Reminder `reminder_minutes` before the start; `None` when that moment has passed
    pub fn reminder(&self, state: &AppState, template: &str) -> Option<Notice> {
        let clock = BusinessClock::new(state.config.scheduling.utc_offset_minutes);
        let starts_at = clock.to_utc(self.date, self.start);
        let send_at = starts_at - Duration::minutes(self.user.reminder_minutes.max(0));
        let delay = send_at - Utc::now();
        if delay <= Duration::zero() {
            return None;
        }
        Some(Notice {
            kind: SmsKind::Reminder,
            body: render_template(template, &self.variables(state)),
            delay,
        })
    }
}

/// Balance not already promised to queued messages
pub(crate) async fn available_credit(state: &AppState, user: &User) -> Result<i64, ApiError> {
    let reserved = state.sms.reserved_parts(&user.id).await?;
    Ok(user.sms_balance - reserved)
}

/// 402 unless `available` credit pays for every notice
pub(crate) fn ensure_balance(available: i64, notices: &[Notice]) -> Result<(), ApiError> {
    let required: i64 = notices.iter().map(Notice::parts).sum();
    if required > available {
        return Err(
            ApiError::payment_required("Not enough SMS credit").with_details(ErrorDetails::Generic(
                HashMap::from([
                    ("required".to_string(), required.into()),
                    ("available".to_string(), available.max(0).into()),
                ]),
            )),
        );
    }
    Ok(())
}

pub(crate) async fn enqueue_notices(
    state: &AppState,
    user_id: &str,
    booking_id: &str,
    phone: &str,
    notices: Vec<Notice>,
) -> Result<(), ApiError> {
    for notice in notices {
        state
            .sms
            .enqueue(
                OutgoingSms {
                    user_id: Some(user_id.to_string()),
                    booking_id: Some(booking_id.to_string()),
                    phone: phone.to_string(),
                    content: SmsContent::text(notice.body),
                    kind: notice.kind,
                },
                notice.delay,
            )
            .await?;
    }
    Ok(())
}

/// Row values of a booking about to be inserted
pub(crate) struct NewBooking<'a> {
    pub user_id: &'a str,
    pub client_id: &'a str,
    pub slot: &'a BookingSlot,
    pub service_ids: &'a [String],
    pub token: &'a str,
    pub confirmation_template_id: Option<&'a str>,
    pub reminder_template_id: Option<&'a str>,
    pub notes: Option<&'a str>,
}

/// Insert an active booking for a validated slot
pub(crate) async fn insert_booking(db: &DbPool, new: NewBooking<'_>) -> Result<Booking, ApiError> {
    let id = Uuid::new_v4().to_string();
    let now = db::now();
    let service_json = serde_json::to_string(new.service_ids)
        .map_err(|e| ApiError::internal(format!("Failed to encode services: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO bookings (
            id, user_id, client_id, date, start_time, duration_minutes, service_ids, status,
            customer_token, confirmation_template_id, reminder_template_id, notes, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.user_id)
    .bind(new.client_id)
    .bind(new.slot.date.format("%Y-%m-%d").to_string())
    .bind(format_hhmm(new.slot.start))
    .bind(new.slot.duration as i64)
    .bind(&service_json)
    .bind(new.token)
    .bind(new.confirmation_template_id)
    .bind(new.reminder_template_id)
    .bind(new.notes)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    Ok(sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
        .bind(&id)
        .fetch_one(db)
        .await?)
}

/// GET /api/bookings
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<BookingListQuery>,
) -> Result<Json<Vec<BookingResponse>>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    for (field, value) in [("date", &query.date), ("from", &query.from), ("to", &query.to)] {
        if let Some(value) = value {
            if parse_date(value).is_err() {
                errors.add(field, "Expected YYYY-MM-DD");
            }
        }
    }
    let status = match query.status.as_deref() {
        Some(s) => match s.parse::<BookingStatus>() {
            Ok(status) => Some(status.as_str().to_string()),
            Err(e) => {
                errors.add("status", e);
                None
            }
        },
        None => None,
    };
    errors.finish()?;

    let filter = BookingFilter {
        date: query.date,
        from: query.from,
        to: query.to,
        status,
        client_id: None,
    };
    Ok(Json(list_bookings_where(&state.db, &user.id, &filter).await?))
}

/// GET /api/bookings/available-times
pub async fn available_times(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<AvailableTimesQuery>,
) -> Result<Json<AvailableTimesResponse>, ApiError> {
    let scheduler = Scheduler::new(&state.db, &state.config.scheduling);
    let day = scheduler
        .available(&user.id, &query.date, &query.service_id_list())
        .await?;

    Ok(Json(AvailableTimesResponse {
        date: day.date.format("%Y-%m-%d").to_string(),
        duration_minutes: day.duration as i64,
        times: day.formatted_times(),
    }))
}

/// POST /api/bookings
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref notes) = req.notes {
        errors.check("notes", validate_notes(notes));
    }
    if let Some(duration) = req.duration_minutes {
        errors.check("duration_minutes", validate_duration(duration));
    }

    // Existing client, or name and phone of a new one
    let (existing_client, new_client) = match (&req.client_id, &req.client) {
        (Some(client_id), _) => (Some(find_client(&state.db, &user.id, client_id).await?), None),
        (None, Some(new)) => {
            errors.check("client.name", validate_name(&new.name));
            match normalize_phone(&new.phone, &state.config.sms.country_code) {
                Ok(phone) => (None, Some((new.name.trim().to_string(), phone))),
                Err(e) => {
                    errors.add("client.phone", e.to_string());
                    (None, None)
                }
            }
        }
        (None, None) => {
            errors.add("client_id", "Either client_id or client is required");
            (None, None)
        }
    };
    errors.finish()?;

    let (client_name, client_phone) = match (&existing_client, &new_client) {
        (Some(client), _) => (client.name.clone(), client.phone.clone()),
        (None, Some((name, phone))) => (name.clone(), phone.clone()),
        (None, None) => return Err(ApiError::bad_request("Client is required")),
    };

    let scheduler = Scheduler::new(&state.db, &state.config.scheduling);
    let services = scheduler.load_services(&user.id, &req.service_ids).await?;
    let duration = match req.duration_minutes {
        Some(minutes) => minutes as u32,
        None => scheduler.duration_of(&services),
    };
    let slot = scheduler
        .check_booking(&user.id, &req.date, &req.start_time, duration, None, false)
        .await?;

    let confirmation = match req.confirmation_template_id.as_deref() {
        Some(id) => Some(find_template(&state.db, &user.id, id).await?),
        None => None,
    };
    let reminder = match req.reminder_template_id.as_deref() {
        Some(id) => Some(find_template(&state.db, &user.id, id).await?),
        None => None,
    };

    let token = generate_token();
    let messages = BookingNotices {
        user: &user,
        client_name: &client_name,
        date: slot.date,
        start: slot.start,
        services: &services,
        token: &token,
    };
    let mut notices = Vec::new();
    if let Some(ref template) = confirmation {
        notices.push(messages.immediate(&state, SmsKind::Confirmation, &template.body));
    }
    if let Some(ref template) = reminder {
        notices.extend(messages.reminder(&state, &template.body));
    }
    ensure_balance(available_credit(&state, &user).await?, &notices)?;

    let client = match existing_client {
        Some(client) => client,
        None => find_or_create_client(&state.db, &user.id, &client_name, &client_phone).await?,
    };

    let service_ids: Vec<String> = services.iter().map(|s| s.id.clone()).collect();
    let booking = insert_booking(
        &state.db,
        NewBooking {
            user_id: &user.id,
            client_id: &client.id,
            slot: &slot,
            service_ids: &service_ids,
            token: &token,
            confirmation_template_id: confirmation.as_ref().map(|t| t.id.as_str()),
            reminder_template_id: reminder.as_ref().map(|t| t.id.as_str()),
            notes: req.notes.as_deref(),
        },
    )
    .await?;

    enqueue_notices(&state, &user.id, &booking.id, &client.phone, notices).await?;

    tracing::info!(
        booking_id = %booking.id,
        user_id = %user.id,
        date = %booking.date,
        start_time = %booking.start_time,
        "Booking created"
    );

    let booking = find_booking(&state.db, &user.id, &booking.id).await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

/// GET /api/bookings/:id
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<BookingResponse>, ApiError> {
    Ok(Json(find_booking(&state.db, &user.id, &id).await?.into()))
}

/// PUT /api/bookings/:id - reschedule or edit an active booking
pub async fn update_booking(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateBookingRequest>,
) -> Result<Json<BookingResponse>, ApiError> {
    let current = find_booking(&state.db, &user.id, &id).await?;
    if current.booking.get_status() != BookingStatus::Active {
        return Err(ApiError::conflict("Only active bookings can be changed"));
    }

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref notes) = req.notes {
        errors.check("notes", validate_notes(notes));
    }
    if let Some(duration) = req.duration_minutes {
        errors.check("duration_minutes", validate_duration(duration));
    }
    errors.finish()?;

    let scheduler = Scheduler::new(&state.db, &state.config.scheduling);
    let service_ids = req
        .service_ids
        .clone()
        .unwrap_or_else(|| current.booking.get_service_ids());
    let services = if req.service_ids.is_some() {
        scheduler.load_services(&user.id, &service_ids).await?
    } else {
        Vec::new()
    };

    let duration = match (req.duration_minutes, req.service_ids.is_some()) {
        (Some(minutes), _) => minutes as u32,
        (None, true) => scheduler.duration_of(&services),
        (None, false) => current.booking.duration_minutes.max(0) as u32,
    };
    let date = req.date.clone().unwrap_or_else(|| current.booking.date.clone());
    let start_time = req
        .start_time
        .clone()
        .unwrap_or_else(|| current.booking.start_time.clone());

    let moved = date != current.booking.date
        || parse_hhmm(&start_time)? != parse_hhmm(&current.booking.start_time)?;
    let resized = duration as i64 != current.booking.duration_minutes;

    let slot = if moved || resized {
        Some(
            scheduler
                .check_booking(&user.id, &date, &start_time, duration, Some(&id), false)
                .await?,
        )
    } else {
        None
    };

    let service_json = serde_json::to_string(&service_ids)
        .map_err(|e| ApiError::internal(format!("Failed to encode services: {}", e)))?;

    sqlx::query(
        r#"
        UPDATE bookings SET
            date = ?, start_time = ?, duration_minutes = ?, service_ids = ?,
            notes = COALESCE(?, notes), updated_at = ?
        WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(slot.as_ref().map(|s| s.date.format("%Y-%m-%d").to_string()).unwrap_or(date))
    .bind(slot.as_ref().map(|s| format_hhmm(s.start)).unwrap_or(start_time))
    .bind(duration as i64)
    .bind(&service_json)
    .bind(&req.notes)
    .bind(db::now())
    .bind(&id)
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    // The reminder follows the booking to its new time
    if let Some(slot) = slot.filter(|_| moved) {
        let dropped = state.sms.cancel_for_booking(&id, Some(SmsKind::Reminder)).await?;
        let template = match current.booking.reminder_template_id.as_deref() {
            Some(template_id) => Some(find_template(&state.db, &user.id, template_id).await?.body),
            // Bookings made from the public page use the default reminder text
            None if dropped > 0 => Some(DEFAULT_REMINDER_TEMPLATE.to_string()),
            None => None,
        };
        if let Some(template) = template {
            let services = if services.is_empty() {
                booking_services(&state.db, &user.id, &service_ids).await?
            } else {
                services
            };
            let messages = BookingNotices {
                user: &user,
                client_name: &current.client_name,
                date: slot.date,
                start: slot.start,
                services: &services,
                token: &current.booking.customer_token,
            };
            let notices: Vec<Notice> = messages.reminder(&state, &template).into_iter().collect();
            enqueue_notices(&state, &user.id, &id, &current.client_phone, notices).await?;
        }
        tracing::info!(booking_id = %id, date = %slot.date, start = %format_hhmm(slot.start), "Booking rescheduled");
    }

    Ok(Json(find_booking(&state.db, &user.id, &id).await?.into()))
}

/// Flip an active booking to `status` and drop its queued messages
pub(crate) async fn close_booking(
    state: &AppState,
    booking_id: &str,
    status: BookingStatus,
) -> Result<(), ApiError> {
    let changed = sqlx::query(
        "UPDATE bookings SET status = ?, updated_at = ? WHERE id = ? AND status = 'active'",
    )
    .bind(status.as_str())
    .bind(db::now())
    .bind(booking_id)
    .execute(&state.db)
    .await?
    .rows_affected();

    if changed == 0 {
        return Err(ApiError::conflict(format!(
            "Booking cannot be marked {}",
            status
        )));
    }

    state.sms.cancel_for_booking(booking_id, None).await?;
    tracing::info!(booking_id = %booking_id, status = %status, "Booking closed");
    Ok(())
}

/// Services of a booking by id, including deactivated ones, in booking order
pub(crate) async fn booking_services(
    db: &DbPool,
    user_id: &str,
    service_ids: &[String],
) -> Result<Vec<Service>, ApiError> {
    let mut services = Vec::with_capacity(service_ids.len());
    for id in service_ids {
        let service: Option<Service> =
            sqlx::query_as("SELECT * FROM services WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .fetch_optional(db)
                .await?;
        services.extend(service);
    }
    Ok(services)
}

/// POST /api/bookings/:id/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<CancelBookingQuery>,
) -> Result<Json<BookingResponse>, ApiError> {
    let current = find_booking(&state.db, &user.id, &id).await?;
    match current.booking.get_status() {
        BookingStatus::Cancelled => return Err(ApiError::conflict("Booking is already cancelled")),
        BookingStatus::Done => return Err(ApiError::conflict("Booking is already done")),
        BookingStatus::Active => {}
    }

    let mut notices = Vec::new();
    if query.notify {
        let services =
            booking_services(&state.db, &user.id, &current.booking.get_service_ids()).await?;
        let messages = BookingNotices {
            user: &user,
            client_name: &current.client_name,
            date: parse_date(&current.booking.date)?,
            start: parse_hhmm(&current.booking.start_time)?,
            services: &services,
            token: &current.booking.customer_token,
        };
        notices.push(messages.immediate(&state, SmsKind::Cancellation, DEFAULT_CANCELLATION_TEMPLATE));
        ensure_balance(available_credit(&state, &user).await?, &notices)?;
    }

    close_booking(&state, &id, BookingStatus::Cancelled).await?;
    enqueue_notices(&state, &user.id, &id, &current.client_phone, notices).await?;
    Ok(Json(find_booking(&state.db, &user.id, &id).await?.into()))
}

/// POST /api/bookings/:id/done
pub async fn complete_booking(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<BookingResponse>, ApiError> {
    let booking = find_booking(&state.db, &user.id, &id).await?;
    if booking.booking.get_status() != BookingStatus::Active {
        return Err(ApiError::conflict("Only active bookings can be marked done"));
    }

    close_booking(&state, &id, BookingStatus::Done).await?;
    Ok(Json(find_booking(&state.db, &user.id, &id).await?.into()))
}
