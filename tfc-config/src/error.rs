//! Errors raised while loading or checking emulator settings.

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested settings file does not exist.
    #[error("tfc settings file not found: {0}")]
    FileNotFound(PathBuf),

    /// One or more fields are out of range.
    #[error("invalid tfc settings:\n{}", describe(.0))]
    Validation(#[source] ValidationErrors),

    /// figment could not merge or deserialize a source.
    #[error("cannot read tfc settings: {0}")]
    Parsing(#[from] figment::Error),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

/// One line per failed rule, `field: reason`, sorted so output is stable.
fn describe(errors: &ValidationErrors) -> String {
    let mut lines: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, failures)| {
            failures.iter().map(move |failure| {
                let reason = failure
                    .message
                    .as_deref()
                    .unwrap_or_else(|| failure.code.as_ref());
                format!("{field}: {reason}")
            })
        })
        .collect();
    lines.sort();

    let mut out = String::new();
    for line in lines {
        let _ = writeln!(out, "  {line}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::ValidationError;

    #[test]
    fn validation_message_lists_fields_in_order() {
        let mut errors = ValidationErrors::new();
        errors.add("stack_size", ValidationError::new("range"));
        errors.add(
            "max_threads",
            ValidationError::new("range").with_message("must be positive".into()),
        );
        let text = ConfigError::from(errors).to_string();
        let max = text.find("max_threads: must be positive").unwrap();
        let stack = text.find("stack_size: range").unwrap();
        assert!(max < stack);
    }
}
