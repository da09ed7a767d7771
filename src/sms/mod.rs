//! SMS delivery: phone normalisation, part counting, templates, the gateway
//! abstraction and the durable delivery queue with its worker.

mod gateway;
mod queue;
mod worker;

pub use gateway::*;
pub use queue::*;
pub use worker::*;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use thiserror::Error;

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// GSM 03.38 default alphabet
const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// Characters sent through the escape table; each takes two septets
const GSM_EXTENDED: &str = "^{}\\[~]|€\u{000C}";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid mobile number: {0}")]
pub struct InvalidPhone(pub String);

/// Normalise a mobile number to national `09XXXXXXXXX` form.
///
/// Accepts Persian and Arabic-Indic digits, spaces, dashes, dots and
/// parentheses, and international `+CC` / `00CC` / `CC` prefixes.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<String, InvalidPhone> {
    let mut digits = String::with_capacity(raw.len());
    for (i, c) in raw.trim().chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '\u{06F0}'..='\u{06F9}' => digits.push(shift_digit(c, '\u{06F0}')),
            '\u{0660}'..='\u{0669}' => digits.push(shift_digit(c, '\u{0660}')),
            '+' if i == 0 => digits.push('+'),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return Err(InvalidPhone(raw.to_string())),
        }
    }

    let national = if let Some(rest) = digits.strip_prefix('+') {
        rest.strip_prefix(country_code)
            .map(|n| format!("0{}", n))
            .ok_or_else(|| InvalidPhone(raw.to_string()))?
    } else if let Some(rest) = digits
        .strip_prefix("00")
        .and_then(|d| d.strip_prefix(country_code))
    {
        format!("0{}", rest)
    } else if digits.len() == country_code.len() + 10 && digits.starts_with(country_code) {
        format!("0{}", &digits[country_code.len()..])
    } else if digits.len() == 10 && digits.starts_with('9') {
        format!("0{}", digits)
    } else {
        digits
    };

    if national.len() == 11 && national.starts_with("09") {
        Ok(national)
    } else {
        Err(InvalidPhone(raw.to_string()))
    }
}

fn shift_digit(c: char, zero: char) -> char {
    char::from(b'0' + (c as u32 - zero as u32) as u8)
}

pub fn is_gsm7(text: &str) -> bool {
    text.chars()
        .all(|c| GSM_BASIC.contains(c) || GSM_EXTENDED.contains(c))
}

/// Number of billable parts for `text`
pub fn count_parts(text: &str) -> i64 {
    let (length, single, multi) = if is_gsm7(text) {
        let septets: usize = text
            .chars()
            .map(|c| if GSM_EXTENDED.contains(c) { 2 } else { 1 })
            .sum();
        (septets, 160, 153)
    } else {
        (text.encode_utf16().count(), 70, 67)
    };

    if length <= single {
        1
    } else {
        length.div_ceil(multi) as i64
    }
}

/// Replace `{key}` placeholders; unknown placeholders are kept as written
pub fn render_template(body: &str, vars: &HashMap<&str, String>) -> String {
    PLACEHOLDER_REGEX
        .replace_all(body, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Values available to booking message templates
pub struct BookingMessage<'a> {
    pub client_name: &'a str,
    pub business_name: &'a str,
    pub date: &'a str,
    pub start_time: &'a str,
    pub services: &'a [String],
    pub link: &'a str,
}

pub fn booking_variables(msg: &BookingMessage<'_>) -> HashMap<&'static str, String> {
    HashMap::from([
        ("name", msg.client_name.to_string()),
        ("business", msg.business_name.to_string()),
        ("date", msg.date.to_string()),
        ("time", msg.start_time.to_string()),
        ("services", msg.services.join("، ")),
        ("link", msg.link.to_string()),
    ])
}

pub const DEFAULT_CONFIRMATION_TEMPLATE: &str =
    "{name} عزیز، نوبت شما در {business} برای {date} ساعت {time} ثبت شد.\n{link}";
pub const DEFAULT_REMINDER_TEMPLATE: &str =
    "{name} عزیز، یادآوری نوبت شما در {business} امروز {date} ساعت {time}.\n{link}";
pub const DEFAULT_CANCELLATION_TEMPLATE: &str =
    "{name} عزیز، نوبت شما در {business} برای {date} ساعت {time} لغو شد.";
