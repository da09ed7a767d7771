//! Manual messaging, delivery history, credit balance and message templates.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AuthUser;
use super::bookings::{available_credit, ensure_balance, Notice};
use super::clients::find_client;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_message, validate_name};
use crate::db::{
    self, CreateSmsTemplateRequest, SendSmsRequest, SendSmsResponse, SmsBalanceResponse, SmsKind,
    SmsLog, SmsLogPage, SmsLogQuery, SmsLogStatus, SmsTemplate, UpdateSmsTemplateRequest,
};
use crate::sms::{normalize_phone, render_template, OutgoingSms, SmsContent};
use crate::{AppState, DbPool};

const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 100;
const MAX_RECIPIENTS: usize = 500;

pub(crate) async fn find_template(
    db: &DbPool,
    user_id: &str,
    id: &str,
) -> Result<SmsTemplate, ApiError> {
    sqlx::query_as::<_, SmsTemplate>("SELECT * FROM sms_templates WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Template not found"))
}

/// POST /api/sms/send
pub async fn send_sms(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<SendSmsRequest>,
) -> Result<Json<SendSmsResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();

    let body = match (&req.template_id, &req.message) {
        (Some(id), _) => Some(find_template(&state.db, &user.id, id).await?.body),
        (None, Some(message)) => {
            errors.check("message", validate_message(message));
            Some(message.trim().to_string())
        }
        (None, None) => {
            errors.add("message", "Either message or template_id is required");
            None
        }
    };

    // (name, phone) per recipient; raw numbers have no name
    let mut recipients: Vec<(String, String)> = Vec::new();
    for id in &req.client_ids {
        let client = find_client(&state.db, &user.id, id).await?;
        recipients.push((client.name, client.phone));
    }
    for (i, raw) in req.phones.iter().enumerate() {
        match normalize_phone(raw, &state.config.sms.country_code) {
            Ok(phone) => recipients.push((String::new(), phone)),
            Err(e) => {
                errors.add(format!("phones[{}]", i), e.to_string());
            }
        }
    }
    let mut seen = HashSet::new();
    recipients.retain(|(_, phone)| seen.insert(phone.clone()));

    if recipients.is_empty() && errors.is_empty() {
        errors.add("client_ids", "At least one recipient is required");
    }
    if recipients.len() > MAX_RECIPIENTS {
        errors.add(
            "client_ids",
            format!("At most {} recipients per send", MAX_RECIPIENTS),
        );
    }
    errors.finish()?;
    let body = body.ok_or_else(|| ApiError::bad_request("Message is required"))?;

    let business = if user.business_name.is_empty() {
        user.name.clone()
    } else {
        user.business_name.clone()
    };
    let (phones, notices): (Vec<String>, Vec<Notice>) = recipients
        .into_iter()
        .map(|(name, phone)| {
            let vars = HashMap::from([("name", name), ("business", business.clone())]);
            let notice = Notice {
                kind: SmsKind::Manual,
                body: render_template(&body, &vars),
                delay: chrono::Duration::zero(),
            };
            (phone, notice)
        })
        .unzip();

    ensure_balance(available_credit(&state, &user).await?, &notices)?;
    let parts: i64 = notices.iter().map(Notice::parts).sum();

    let queued = notices.len();
    for (phone, notice) in phones.into_iter().zip(notices) {
        state
            .sms
            .enqueue(
                OutgoingSms {
                    user_id: Some(user.id.clone()),
                    booking_id: None,
                    phone,
                    content: SmsContent::text(notice.body),
                    kind: notice.kind,
                },
                notice.delay,
            )
            .await?;
    }

    tracing::info!(user_id = %user.id, recipients = queued, parts, "Manual SMS queued");

    Ok(Json(SendSmsResponse {
        queued,
        parts,
        balance: user.sms_balance,
    }))
}

/// GET /api/sms/logs
pub async fn list_sms_logs(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<SmsLogQuery>,
) -> Result<Json<SmsLogPage>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let offset = (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| ApiError::validation_field("page", "Page is out of range"))?;
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<SmsLogStatus>())
        .transpose()
        .map_err(|e| ApiError::validation_field("status", e))?
        .map(|s| s.as_str());

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sms_logs WHERE user_id = ? AND (? IS NULL OR status = ?)",
    )
    .bind(&user.id)
    .bind(status)
    .bind(status)
    .fetch_one(&state.db)
    .await?;

    let items = sqlx::query_as::<_, SmsLog>(
        r#"
        SELECT * FROM sms_logs
        WHERE user_id = ? AND (? IS NULL OR status = ?)
        ORDER BY created_at DESC, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(&user.id)
    .bind(status)
    .bind(status)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(SmsLogPage {
        items,
        page,
        per_page,
        total,
    }))
}

/// GET /api/sms/balance
pub async fn sms_balance(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<SmsBalanceResponse>, ApiError> {
    let queued = state.sms.pending_for_user(&user.id).await?;
    Ok(Json(SmsBalanceResponse {
        sms_balance: user.sms_balance,
        queued,
    }))
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<SmsTemplate>>, ApiError> {
    let templates = sqlx::query_as::<_, SmsTemplate>(
        "SELECT * FROM sms_templates WHERE user_id = ? ORDER BY name",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(templates))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateSmsTemplateRequest>,
) -> Result<(StatusCode, Json<SmsTemplate>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("name", validate_name(&req.name))
        .check("body", validate_message(&req.body));
    errors.finish()?;

    let id = Uuid::new_v4().to_string();
    let now = db::now();
    sqlx::query(
        "INSERT INTO sms_templates (id, user_id, name, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(req.name.trim())
    .bind(&req.body)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let template = find_template(&state.db, &user.id, &id).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateSmsTemplateRequest>,
) -> Result<Json<SmsTemplate>, ApiError> {
    find_template(&state.db, &user.id, &id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(ref body) = req.body {
        errors.check("body", validate_message(body));
    }
    errors.finish()?;

    sqlx::query(
        r#"
        UPDATE sms_templates SET
            name = COALESCE(?, name),
            body = COALESCE(?, body),
            updated_at = ?
        WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.body)
    .bind(db::now())
    .bind(&id)
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    Ok(Json(find_template(&state.db, &user.id, &id).await?))
}

/// Bookings keep working without the template; their reference is cleared
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    find_template(&state.db, &user.id, &id).await?;
    sqlx::query("DELETE FROM sms_templates WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
