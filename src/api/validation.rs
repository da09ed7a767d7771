//! Input validation for API requests.
//!
//! Each validator returns `Err(message)` for the offending field; collect them
//! with `ValidationErrorBuilder::check` to report several fields at once.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Lowercase letters, digits and inner dashes, 3-40 chars
    static ref SLUG_REGEX: Regex = Regex::new(r"^[a-z0-9]([a-z0-9-]{1,38})[a-z0-9]$").unwrap();
}

/// Slugs that would shadow frontend routes
const RESERVED_SLUGS: &[&str] = &["admin", "api", "dashboard", "login", "public", "customer"];

pub const MAX_NAME_LENGTH: usize = 100;
pub const MAX_NOTES_LENGTH: usize = 1000;
pub const MAX_SMS_LENGTH: usize = 1000;
/// Longest single booking or service, in minutes
pub const MAX_DURATION_MINUTES: i64 = 12 * 60;
pub const MAX_REMINDER_MINUTES: i64 = 7 * 24 * 60;

/// Validate a display name (business, client, service, plan)
pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name is required".to_string());
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(format!(
            "Name is too long (max {} characters)",
            MAX_NAME_LENGTH
        ));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err("Name contains invalid characters".to_string());
    }
    Ok(())
}

pub fn validate_slug(slug: &str) -> Result<(), String> {
    if !SLUG_REGEX.is_match(slug) || slug.contains("--") {
        return Err(
            "Slug must be 3-40 lowercase letters, digits or single dashes".to_string(),
        );
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err("This slug is reserved".to_string());
    }
    Ok(())
}

/// Service or booking length
pub fn validate_duration(minutes: i64) -> Result<(), String> {
    if minutes < 5 {
        return Err("Duration must be at least 5 minutes".to_string());
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(format!(
            "Duration must be at most {} minutes",
            MAX_DURATION_MINUTES
        ));
    }
    Ok(())
}

pub fn validate_price(price: i64) -> Result<(), String> {
    if price < 0 {
        return Err("Price cannot be negative".to_string());
    }
    Ok(())
}

pub fn validate_positive(value: i64, what: &str) -> Result<(), String> {
    if value <= 0 {
        return Err(format!("{} must be greater than zero", what));
    }
    Ok(())
}

pub fn validate_reminder_minutes(minutes: i64) -> Result<(), String> {
    if !(0..=MAX_REMINDER_MINUTES).contains(&minutes) {
        return Err(format!(
            "Reminder must be between 0 and {} minutes",
            MAX_REMINDER_MINUTES
        ));
    }
    Ok(())
}

pub fn validate_notes(notes: &str) -> Result<(), String> {
    if notes.chars().count() > MAX_NOTES_LENGTH {
        return Err(format!(
            "Notes are too long (max {} characters)",
            MAX_NOTES_LENGTH
        ));
    }
    Ok(())
}

/// Free-text SMS body or template
pub fn validate_message(body: &str) -> Result<(), String> {
    if body.trim().is_empty() {
        return Err("Message is required".to_string());
    }
    if body.chars().count() > MAX_SMS_LENGTH {
        return Err(format!(
            "Message is too long (max {} characters)",
            MAX_SMS_LENGTH
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Salon Rose").is_ok());
        assert!(validate_name("سالن رز").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"a".repeat(101)).is_err());
        assert!(validate_name("bad\u{0007}name").is_err());
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("salon-rose").is_ok());
        assert!(validate_slug("b1234abcd").is_ok());
        assert!(validate_slug("ab").is_err());
        assert!(validate_slug("-salon").is_err());
        assert!(validate_slug("salon-").is_err());
        assert!(validate_slug("Salon").is_err());
        assert!(validate_slug("salon--rose").is_err());
        assert!(validate_slug("admin").is_err());
    }

    #[test]
    fn test_validate_numbers() {
        assert!(validate_duration(30).is_ok());
        assert!(validate_duration(0).is_err());
        assert!(validate_duration(721).is_err());
        assert!(validate_price(0).is_ok());
        assert!(validate_price(-1).is_err());
        assert!(validate_positive(0, "SMS count").is_err());
        assert!(validate_reminder_minutes(0).is_ok());
        assert!(validate_reminder_minutes(-5).is_err());
    }

    #[test]
    fn test_validate_message() {
        assert!(validate_message("Hello").is_ok());
        assert!(validate_message(" ").is_err());
        assert!(validate_message(&"x".repeat(1001)).is_err());
        assert!(validate_notes(&"x".repeat(1000)).is_ok());
    }
}
