//! Small helpers shared by services and handlers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::Money;

/// Deterministic key for an outbound disbursement, so a timed-out initiation
/// can be retried without paying out twice.
pub fn disbursement_idempotency_key(loan_id: Uuid, amount: Money, msisdn: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("disbursement|{}|{}|{}", loan_id, amount.cents(), msisdn).as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a phone number to international form without `+`, e.g. `254712345678`.
///
/// Local forms (`0712...`, `712...`) get `country_code` prepended.
pub fn normalize_msisdn(raw: &str, country_code: &str) -> Result<String, LedgerError> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '+' && *c != '-')
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(LedgerError::Validation(format!(
            "'{}' is not a phone number",
            raw
        )));
    }

    let normalized = if let Some(local) = digits.strip_prefix('0') {
        format!("{}{}", country_code, local)
    } else if digits.starts_with('7') || digits.starts_with('1') {
        format!("{}{}", country_code, digits)
    } else {
        digits
    };

    if !(10..=15).contains(&normalized.len()) {
        return Err(LedgerError::Validation(format!(
            "'{}' has an invalid length for a phone number",
            raw
        )));
    }

    Ok(normalized)
}
