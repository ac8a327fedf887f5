//! Format rules for the subscriber credential mirrored to the external
//! tenant system.
//!
//! The external system enforces these rules server-side; validating locally
//! lets callers fail fast without a network round trip. The rules apply to
//! the mirrored credential only, not to the local login password.

use thiserror::Error;

pub const MIN_LENGTH: usize = 8;
pub const MAX_LENGTH: usize = 30;

/// Special characters the external system accepts.
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PasswordPolicyError {
    #[error("password must be between 8 and 30 characters")]
    Length,
    #[error("password must contain at least one digit")]
    MissingDigit,
    #[error("password must contain at least one uppercase letter")]
    MissingUppercase,
    #[error("password must contain at least one lowercase letter")]
    MissingLowercase,
    #[error("password must contain at least one special character")]
    MissingSpecial,
}

/// Validate a candidate subscriber credential. Pure; no I/O.
pub fn validate_subscriber_password(candidate: &str) -> Result<(), PasswordPolicyError> {
    let length = candidate.chars().count();
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return Err(PasswordPolicyError::Length);
    }
    if !candidate.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordPolicyError::MissingDigit);
    }
    if !candidate.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PasswordPolicyError::MissingUppercase);
    }
    if !candidate.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PasswordPolicyError::MissingLowercase);
    }
    if !candidate.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        return Err(PasswordPolicyError::MissingSpecial);
    }
    Ok(())
}

pub fn is_valid_subscriber_password(candidate: &str) -> bool {
    validate_subscriber_password(candidate).is_ok()
}
