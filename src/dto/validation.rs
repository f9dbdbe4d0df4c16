//! Validation helpers for DTOs.

use validator::ValidationError;

/// Rejects names that are empty once surrounding whitespace is removed.
///
/// ```ignore
/// validate_display_name("ada")  // Ok
/// validate_display_name("   ")  // Err
/// ```
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name must contain a visible character".into());
        return Err(err);
    }
    if name.chars().any(char::is_control) {
        let mut err = ValidationError::new("display_name_control");
        err.message = Some("Display name must not contain control characters".into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a join code is 4 to 12 ASCII digits.
pub fn validate_session_code(code: &str) -> Result<(), ValidationError> {
    if !(4..=12).contains(&code.len()) {
        let mut err = ValidationError::new("session_code_length");
        err.message = Some(
            format!(
                "Session code must be between 4 and 12 characters (got {})",
                code.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.chars().all(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("session_code_format");
        err.message = Some("Session code must contain only digits".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("ada").is_ok());
        assert!(validate_display_name(" ada ").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name(" \t").is_err());
        assert!(validate_display_name("a\u{0007}").is_err());
    }

    #[test]
    fn test_validate_session_code() {
        assert!(validate_session_code("123456").is_ok());
        assert!(validate_session_code("0042").is_ok());
        assert!(validate_session_code("123").is_err()); // too short
        assert!(validate_session_code("12345a").is_err()); // not a digit
        assert!(validate_session_code("1234567890123").is_err()); // too long
    }
}
