use crate::audit::{AuditLogger, AuditOutcome};
use crate::config::ValidationConfig;
use agentrail_core::ValidationError;
use serde_json::Value;
use std::sync::Arc;

/// Smallest and largest accepted external reference (e.g. an issue number).
pub const MIN_REFERENCE: i64 = 1;
pub const MAX_REFERENCE: i64 = 999_999;

/// Validates externally supplied identifiers, messages and references.
///
/// Nothing is stripped or rewritten: input either passes unchanged or is
/// rejected with a [`ValidationError`].
pub struct InputValidator {
    config: Arc<ValidationConfig>,
    audit: Arc<AuditLogger>,
}

impl InputValidator {
    pub fn new(config: Arc<ValidationConfig>, audit: Arc<AuditLogger>) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Agent names and other identifiers: 1..=max length, `[A-Za-z0-9_-]`,
    /// and in production mode a member of the allow-list when one is set.
    pub fn validate_identifier(&self, name: &str) -> Result<(), ValidationError> {
        let result = self.check_identifier(name);
        self.record("identifier", &result);
        result
    }

    /// Like [`validate_identifier`](Self::validate_identifier) for untyped input.
    pub fn validate_identifier_value(&self, value: &Value) -> Result<String, ValidationError> {
        let name = expect_text(value, "agent name")?;
        self.validate_identifier(name)?;
        Ok(name.to_string())
    }

    /// Free text: at most `max_message_bytes` bytes, no control characters
    /// other than tab, newline and carriage return.
    pub fn validate_message(&self, text: &str) -> Result<(), ValidationError> {
        let result = self.check_message(text);
        self.record("message", &result);
        result
    }

    /// Like [`validate_message`](Self::validate_message) for untyped input.
    pub fn validate_message_value(&self, value: &Value) -> Result<String, ValidationError> {
        let text = expect_text(value, "message")?;
        self.validate_message(text)?;
        Ok(text.to_string())
    }

    /// Numeric reference in `1..=999_999`.
    pub fn validate_reference(&self, n: i64) -> Result<u32, ValidationError> {
        let result = check_reference(n);
        self.record("reference", &result);
        result
    }

    /// Untyped reference. Only JSON integers pass: booleans, floats (even
    /// `5.0`) and numeric strings are rejected.
    pub fn validate_reference_value(&self, value: &Value) -> Result<u32, ValidationError> {
        let result = match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => match n.as_i64() {
                Some(n) => check_reference(n),
                None => Err(reference_error(&n.to_string())),
            },
            other => Err(ValidationError::new(
                "reference",
                "an integer",
                &describe(other),
                "pass the number itself, not a string, float or boolean",
            )),
        };
        self.record("reference", &result);
        result
    }

    fn check_identifier(&self, name: &str) -> Result<(), ValidationError> {
        let max = self.config.max_identifier_len();
        let expected = format!("1-{max} characters of letters, digits, '-' or '_'");

        if name.is_empty() {
            return Err(ValidationError::new(
                "agent name",
                expected,
                name,
                "provide a non-empty agent name",
            ));
        }
        if name.len() > max {
            return Err(ValidationError::new(
                "agent name",
                expected,
                name,
                format!("shorten the name to at most {max} characters"),
            ));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ValidationError::new(
                "agent name",
                expected,
                name,
                format!("remove the character {bad:?}"),
            ));
        }

        let allowed = self.config.allowed_agents();
        if !self.config.mode().is_relaxed() && !allowed.is_empty() && !allowed.contains(name) {
            let known: Vec<&str> = allowed.iter().map(String::as_str).collect();
            return Err(ValidationError::new(
                "agent name",
                "a known pipeline agent",
                name,
                format!("use one of: {}", known.join(", ")),
            ));
        }
        Ok(())
    }

    fn check_message(&self, text: &str) -> Result<(), ValidationError> {
        let max = self.config.max_message_bytes();
        if text.len() > max {
            return Err(ValidationError::new(
                "message",
                format!("at most {max} bytes of text"),
                text,
                format!("shorten the message by {} bytes", text.len() - max),
            ));
        }
        if let Some(bad) = text
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
        {
            return Err(ValidationError::new(
                "message",
                "text without control characters (tab, newline and carriage return allowed)",
                text,
                format!("remove the control character {bad:?}"),
            ));
        }
        Ok(())
    }

    fn record<T>(&self, kind: &str, result: &Result<T, ValidationError>) {
        match result {
            Ok(_) => self.audit.log_event(
                "input_validation",
                AuditOutcome::Success,
                serde_json::json!({ "kind": kind }),
            ),
            Err(e) => self.audit.log_event(
                "input_validation",
                AuditOutcome::Denied,
                serde_json::json!({
                    "kind": kind,
                    "field": e.field,
                    "received": e.received,
                    "expected": e.expected,
                }),
            ),
        }
    }
}

impl std::fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputValidator")
            .field("mode", &self.config.mode())
            .finish()
    }
}

fn check_reference(n: i64) -> Result<u32, ValidationError> {
    if !(MIN_REFERENCE..=MAX_REFERENCE).contains(&n) {
        return Err(reference_error(&n.to_string()));
    }
    u32::try_from(n).map_err(|_| reference_error(&n.to_string()))
}

fn reference_error(received: &str) -> ValidationError {
    ValidationError::new(
        "reference",
        format!("an integer between {MIN_REFERENCE} and {MAX_REFERENCE}"),
        received,
        "pass the issue or ticket number as a positive integer",
    )
}

fn expect_text<'a>(value: &'a Value, field: &str) -> Result<&'a str, ValidationError> {
    value.as_str().ok_or_else(|| {
        ValidationError::new(
            field,
            "text",
            &describe(value),
            format!("pass the {field} as a string"),
        )
    })
}

fn describe(value: &Value) -> String {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("{kind} {value}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ValidationMode;
    use serde_json::json;

    fn validator(mode: ValidationMode) -> InputValidator {
        let config = ValidationConfig::builder("/work/project")
            .mode(mode)
            .build()
            .unwrap();
        InputValidator::new(Arc::new(config), Arc::new(AuditLogger::disabled()))
    }

    #[test]
    fn test_known_agent_accepted() {
        let v = validator(ValidationMode::Production);
        assert!(v.validate_identifier("researcher").is_ok());
        assert!(v.validate_identifier("test-master").is_ok());
    }

    #[test]
    fn test_unknown_agent_depends_on_mode() {
        let strict = validator(ValidationMode::Production);
        let err = strict.validate_identifier("custom_agent").unwrap_err();
        assert!(err.hint.contains("researcher"));

        let relaxed = validator(ValidationMode::Relaxed);
        assert!(relaxed.validate_identifier("custom_agent").is_ok());
    }

    #[test]
    fn test_relaxed_mode_keeps_character_rules() {
        let v = validator(ValidationMode::Relaxed);
        assert!(v.validate_identifier("a;b").is_err());
        assert!(v.validate_identifier("a/b").is_err());
        assert!(v.validate_identifier("").is_err());
        assert!(v.validate_identifier(&"a".repeat(256)).is_err());
        assert!(v.validate_identifier(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_message_control_characters() {
        let v = validator(ValidationMode::Production);
        assert!(v.validate_message("line one\nline two\tcol\r\n").is_ok());
        assert!(v.validate_message("colour \x1b[31mred").is_err());
        assert!(v.validate_message("nul\0byte").is_err());
    }

    #[test]
    fn test_message_size_limit_counts_bytes() {
        let v = validator(ValidationMode::Production);
        assert!(v.validate_message(&"a".repeat(10_000)).is_ok());
        let err = v.validate_message(&"a".repeat(10_001)).unwrap_err();
        assert!(err.received.contains("10001 bytes"));
        // 5_001 two-byte characters exceed the byte limit
        assert!(v.validate_message(&"é".repeat(5_001)).is_err());
    }

    #[test]
    fn test_reference_range() {
        let v = validator(ValidationMode::Production);
        assert_eq!(v.validate_reference(1).unwrap(), 1);
        assert_eq!(v.validate_reference(999_999).unwrap(), 999_999);
        assert!(v.validate_reference(0).is_err());
        assert!(v.validate_reference(1_000_000).is_err());
        assert!(v.validate_reference(-5).is_err());
    }

    #[test]
    fn test_reference_value_types() {
        let v = validator(ValidationMode::Production);
        assert_eq!(v.validate_reference_value(&json!(42)).unwrap(), 42);
        assert!(v.validate_reference_value(&json!(true)).is_err());
        assert!(v.validate_reference_value(&json!(42.0)).is_err());
        assert!(v.validate_reference_value(&json!("42")).is_err());
        assert!(v.validate_reference_value(&json!(u64::MAX)).is_err());
    }

    #[test]
    fn test_text_values_must_be_strings() {
        let v = validator(ValidationMode::Production);
        let err = v.validate_identifier_value(&json!(7)).unwrap_err();
        assert_eq!(err.expected, "text");
        assert_eq!(
            v.validate_message_value(&json!("done")).unwrap(),
            "done".to_string()
        );
    }
}
