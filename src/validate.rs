//! Input validation and sanitization for request payloads.

use crate::error::{AppError, Result};

/// Longest accepted title.
pub const MAX_TITLE_LEN: usize = 255;
/// Longest accepted description.
pub const MAX_DESCRIPTION_LEN: usize = 5000;
/// Longest accepted comment.
pub const MAX_COMMENT_LEN: usize = 2000;
/// Longest accepted short text field (author, category, language...).
pub const MAX_SHORT_LEN: usize = 128;

/// Trim, drop HTML tags and control characters, collapse nothing else.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;

    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out.trim().to_string()
}

/// Sanitize an optional field, mapping blank values to `None`.
pub fn sanitize_opt(input: Option<String>) -> Option<String> {
    input
        .map(|s| sanitize_text(&s))
        .filter(|s| !s.is_empty())
}

/// Collects field errors and reports them together.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<String>,
}

impl Validator {
    /// Create an empty validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-empty, at most `max` characters.
    pub fn required(&mut self, field: &str, value: &str, max: usize) -> &mut Self {
        if value.trim().is_empty() {
            self.errors.push(format!("'{}' is required", field));
        } else {
            self.max_len(field, Some(value), max);
        }
        self
    }

    /// At most `max` characters when present.
    pub fn max_len(&mut self, field: &str, value: Option<&str>, max: usize) -> &mut Self {
        if let Some(v) = value
            && v.chars().count() > max
        {
            self.errors
                .push(format!("'{}' must be at most {} characters", field, max));
        }
        self
    }

    /// Rating between 1 and 5 when present.
    pub fn rating(&mut self, field: &str, value: Option<i64>) -> &mut Self {
        if let Some(r) = value
            && !(1..=5).contains(&r)
        {
            self.errors
                .push(format!("'{}' must be between 1 and 5", field));
        }
        self
    }

    /// Percentage between 0 and 100 when present.
    pub fn percentage(&mut self, field: &str, value: Option<f64>) -> &mut Self {
        if let Some(p) = value
            && !(p.is_finite() && (0.0..=100.0).contains(&p))
        {
            self.errors
                .push(format!("'{}' must be between 0 and 100", field));
        }
        self
    }

    /// Publication year in a plausible range when present.
    pub fn year(&mut self, field: &str, value: Option<i32>) -> &mut Self {
        if let Some(y) = value
            && !(0..=9999).contains(&y)
        {
            self.errors.push(format!("'{}' is not a valid year", field));
        }
        self
    }

    /// Email shape check when present.
    pub fn email(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value
            && !is_valid_email(v)
        {
            self.errors
                .push(format!("'{}' must be a valid email address", field));
        }
        self
    }

    /// Fail with every collected message.
    pub fn finish(&mut self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(std::mem::take(&mut self.errors).join("; ")))
        }
    }
}

/// Minimal `local@domain.tld` check.
pub fn is_valid_email(value: &str) -> bool {
    if value.len() > 254 || value.chars().any(char::is_whitespace) {
        return false;
    }
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(head, tail)| !head.is_empty() && !tail.is_empty())
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// 1-64 characters of letters, digits, `_` and `-`.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 64 {
        return Err(AppError::Validation(
            "Username must be 1-64 characters".to_string(),
        ));
    }

    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "Username can only contain letters, numbers, _ and -".to_string(),
        ));
    }

    Ok(())
}

/// At least 8 characters, at most 128.
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    if password.len() > 128 {
        return Err(AppError::Validation(
            "Password must be at most 128 characters".to_string(),
        ));
    }
    Ok(())
}
