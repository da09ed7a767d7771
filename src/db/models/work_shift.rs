//! Weekly working hours.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One working interval on a weekday (0 = Monday .. 6 = Sunday)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkShift {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkShiftInput {
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
}

/// Replaces the whole weekly schedule
#[derive(Debug, Deserialize)]
pub struct ReplaceWorkShiftsRequest {
    pub shifts: Vec<WorkShiftInput>,
}
