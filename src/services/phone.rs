// services/phone.rs
use crate::errors::{AppError, Result};

const COUNTRY_CODE: &str = "254";
const SUBSCRIBER_DIGITS: usize = 9;
const MOBILE_PREFIXES: [char; 2] = ['7', '1'];

/// Canonicalizes a Kenyan mobile number to `2547XXXXXXXX` / `2541XXXXXXXX`.
///
/// Accepts `07..`/`01..` local numbers, `254..` and `+254..`. Whitespace and the usual
/// separators are ignored. Landline-shaped and otherwise malformed input is rejected before it
/// can reach the provider.
pub fn normalize(raw: &str) -> Result<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();

    let subscriber = if let Some(rest) = compact.strip_prefix('+') {
        rest.strip_prefix(COUNTRY_CODE)
    } else if let Some(rest) = compact.strip_prefix(COUNTRY_CODE) {
        Some(rest)
    } else {
        compact.strip_prefix('0')
    }
    .ok_or_else(|| invalid(raw))?;

    if subscriber.len() != SUBSCRIBER_DIGITS || !subscriber.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(raw));
    }

    if !subscriber.starts_with(MOBILE_PREFIXES) {
        return Err(AppError::invalid_data(format!(
            "{} is not a mobile number",
            raw.trim()
        )));
    }

    Ok(format!("{}{}", COUNTRY_CODE, subscriber))
}

fn invalid(raw: &str) -> AppError {
    AppError::invalid_data(format!("Invalid phone number: {}", raw.trim()))
}
