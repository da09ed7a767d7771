//! Weekly working hours and business settings.

use axum::{extract::State, Json};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AuthUser;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_name, validate_reminder_minutes, validate_slug};
use crate::db::{
    self, ReplaceWorkShiftsRequest, UpdateSettingsRequest, User, UserResponse, WorkShift,
    WorkShiftInput,
};
use crate::scheduling::{overlaps, Shift};
use crate::AppState;

async fn load_shifts(state: &AppState, user_id: &str) -> Result<Vec<WorkShift>, ApiError> {
    Ok(sqlx::query_as::<_, WorkShift>(
        "SELECT * FROM work_shifts WHERE user_id = ? ORDER BY weekday, start_time",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await?)
}

/// Check every shift is well formed and no two shifts of a weekday overlap
fn validate_shifts(inputs: &[WorkShiftInput]) -> Result<Vec<(i64, Shift)>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    let mut parsed: Vec<(i64, Shift)> = Vec::with_capacity(inputs.len());

    for (i, input) in inputs.iter().enumerate() {
        let field = format!("shifts[{}]", i);
        if !(0..=6).contains(&input.weekday) {
            errors.add(&field, "Weekday must be between 0 (Monday) and 6 (Sunday)");
            continue;
        }
        let shift = match Shift::parse(&input.start_time, &input.end_time) {
            Ok(shift) => shift,
            Err(e) => {
                errors.add(&field, e.to_string());
                continue;
            }
        };
        if shift.start >= shift.end {
            errors.add(&field, "Shift must end after it starts");
            continue;
        }
        if let Some((j, _)) = parsed.iter().enumerate().find(|(_, (weekday, other))| {
            *weekday == input.weekday
                && overlaps(shift.start, shift.end - shift.start, other.start, other.end - other.start)
        }) {
            errors.add(&field, format!("Overlaps shift {}", j));
            continue;
        }
        parsed.push((input.weekday, shift));
    }

    errors.finish()?;
    Ok(parsed)
}

/// GET /api/work-shifts
pub async fn list_work_shifts(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<WorkShift>>, ApiError> {
    Ok(Json(load_shifts(&state, &user.id).await?))
}

/// PUT /api/work-shifts - replace the whole weekly schedule
pub async fn replace_work_shifts(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<ReplaceWorkShiftsRequest>,
) -> Result<Json<Vec<WorkShift>>, ApiError> {
    validate_shifts(&req.shifts)?;

    let mut tx = state.db.begin().await?;
    sqlx::query("DELETE FROM work_shifts WHERE user_id = ?")
        .bind(&user.id)
        .execute(&mut *tx)
        .await?;
    for shift in &req.shifts {
        sqlx::query(
            "INSERT INTO work_shifts (id, user_id, weekday, start_time, end_time) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&user.id)
        .bind(shift.weekday)
        .bind(shift.start_time.trim())
        .bind(shift.end_time.trim())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(user_id = %user.id, shifts = req.shifts.len(), "Working hours updated");
    Ok(Json(load_shifts(&state, &user.id).await?))
}

/// GET /api/settings
pub async fn get_settings(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(user.into())
}

/// PUT /api/settings
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let slug = req.slug.as_deref().map(|s| s.trim().to_lowercase());

    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        errors.check("name", validate_name(name));
    }
    if let Some(ref business_name) = req.business_name {
        errors.check("business_name", validate_name(business_name));
    }
    if let Some(ref slug) = slug {
        errors.check("slug", validate_slug(slug));
    }
    if let Some(minutes) = req.reminder_minutes {
        errors.check("reminder_minutes", validate_reminder_minutes(minutes));
    }
    errors.finish()?;

    if let Some(ref slug) = slug {
        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE slug = ? AND id != ?")
            .bind(slug)
            .bind(&user.id)
            .fetch_one(&state.db)
            .await?;
        if taken > 0 {
            return Err(ApiError::conflict("This booking link is already taken"));
        }
    }

    sqlx::query(
        r#"
        UPDATE users SET
            name = COALESCE(?, name),
            business_name = COALESCE(?, business_name),
            slug = COALESCE(?, slug),
            reminder_minutes = COALESCE(?, reminder_minutes),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.business_name.as_deref().map(str::trim))
    .bind(&slug)
    .bind(req.reminder_minutes)
    .bind(db::now())
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&user.id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(user.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(weekday: i64, start: &str, end: &str) -> WorkShiftInput {
        WorkShiftInput {
            weekday,
            start_time: start.to_string(),
            end_time: end.to_string(),
        }
    }

    #[test]
    fn test_split_shifts_are_allowed() {
        let shifts = [
            input(0, "09:00", "13:00"),
            input(0, "16:00", "20:00"),
            input(1, "09:00", "13:00"),
        ];
        assert_eq!(validate_shifts(&shifts).unwrap().len(), 3);
    }

    #[test]
    fn test_touching_shifts_do_not_overlap() {
        let shifts = [input(2, "09:00", "12:00"), input(2, "12:00", "15:00")];
        assert!(validate_shifts(&shifts).is_ok());
    }

    #[test]
    fn test_invalid_shifts_are_rejected() {
        assert!(validate_shifts(&[input(0, "12:00", "09:00")]).is_err());
        assert!(validate_shifts(&[input(0, "10:00", "10:00")]).is_err());
        assert!(validate_shifts(&[input(7, "09:00", "10:00")]).is_err());
        assert!(validate_shifts(&[input(0, "9am", "10:00")]).is_err());
        assert!(validate_shifts(&[input(0, "09:00", "12:00"), input(0, "11:00", "13:00")]).is_err());
    }
}
