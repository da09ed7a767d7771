//! Booking models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::ServiceResponse;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Active,
    Cancelled,
    Done,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "done" => Ok(Self::Done),
            _ => Err(format!("Unknown booking status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Booking {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    /// Local date, `YYYY-MM-DD`
    pub date: String,
    /// Local start time, `HH:MM`
    pub start_time: String,
    pub duration_minutes: i64,
    /// JSON array of service ids
    pub service_ids: String,
    pub status: String,
    pub customer_token: String,
    pub confirmation_template_id: Option<String>,
    pub reminder_template_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Booking {
    pub fn get_status(&self) -> BookingStatus {
        self.status.parse().unwrap_or(BookingStatus::Active)
    }

    pub fn get_service_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.service_ids).unwrap_or_default()
    }
}

/// Booking joined with its client, as returned to the owner
#[derive(Debug, Clone, FromRow)]
pub struct BookingWithClient {
    #[sqlx(flatten)]
    pub booking: Booking,
    pub client_name: String,
    pub client_phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingResponse {
    pub id: String,
    pub client_id: String,
    pub client_name: String,
    pub client_phone: String,
    pub date: String,
    pub start_time: String,
    pub duration_minutes: i64,
    pub service_ids: Vec<String>,
    pub status: BookingStatus,
    pub customer_token: String,
    pub confirmation_template_id: Option<String>,
    pub reminder_template_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<BookingWithClient> for BookingResponse {
    fn from(row: BookingWithClient) -> Self {
        let status = row.booking.get_status();
        let service_ids = row.booking.get_service_ids();
        let b = row.booking;
        Self {
            id: b.id,
            client_id: b.client_id,
            client_name: row.client_name,
            client_phone: row.client_phone,
            date: b.date,
            start_time: b.start_time,
            duration_minutes: b.duration_minutes,
            service_ids,
            status,
            customer_token: b.customer_token,
            confirmation_template_id: b.confirmation_template_id,
            reminder_template_id: b.reminder_template_id,
            notes: b.notes,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

/// New customer details when booking for someone not yet in the client list
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub client_id: Option<String>,
    pub client: Option<NewClient>,
    pub date: String,
    pub start_time: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
    /// Overrides the duration derived from the services
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
    /// Send this template right away
    pub confirmation_template_id: Option<String>,
    /// Send this template `reminder_minutes` before the appointment
    pub reminder_template_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBookingRequest {
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub service_ids: Option<Vec<String>>,
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookingListQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableTimesQuery {
    pub date: String,
    /// Comma separated service ids
    pub service_ids: Option<String>,
}

impl AvailableTimesQuery {
    pub fn service_id_list(&self) -> Vec<String> {
        self.service_ids
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct AvailableTimesResponse {
    pub date: String,
    pub duration_minutes: i64,
    pub times: Vec<String>,
}

/// Booking created by a customer through the public link
#[derive(Debug, Deserialize)]
pub struct PublicBookingRequest {
    pub name: String,
    pub phone: String,
    pub date: String,
    pub start_time: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PublicBookingResponse {
    pub customer_token: String,
    pub date: String,
    pub start_time: String,
    pub duration_minutes: i64,
}

/// Business page behind the public booking link
#[derive(Debug, Serialize)]
pub struct PublicProfile {
    pub business_name: String,
    pub slug: String,
    pub services: Vec<ServiceResponse>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBookingQuery {
    /// Text the customer a cancellation notice
    #[serde(default)]
    pub notify: bool,
}

/// What a customer sees through their booking token
#[derive(Debug, Serialize)]
pub struct CustomerBookingView {
    pub business_name: String,
    pub business_slug: String,
    pub client_name: String,
    pub date: String,
    pub start_time: String,
    pub duration_minutes: i64,
    pub services: Vec<String>,
    pub status: BookingStatus,
    pub customer_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booking_status_parsing() {
        assert_eq!("active".parse::<BookingStatus>(), Ok(BookingStatus::Active));
        assert_eq!("Canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::Done.to_string(), "done");
        assert!("pending".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_service_id_list_skips_blanks() {
        let query = AvailableTimesQuery {
            date: "2026-01-01".to_string(),
            service_ids: Some("a, b,,c ".to_string()),
        };
        assert_eq!(query.service_id_list(), vec!["a", "b", "c"]);
    }
}
