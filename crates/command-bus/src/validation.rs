//! Payload validation interceptor.

use std::collections::HashMap;
use std::fmt;

use domain::Command;
use serde_json::Value;

use crate::error::{DispatchError, Violation};
use crate::interceptor::Interceptor;

/// A constraint on one payload field.
///
/// Apart from `Required` and `NotBlank`, constraints only apply to fields
/// that are present.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Present and not null.
    Required,
    /// A string with at least one non-whitespace character.
    NotBlank,
    /// A number greater than zero.
    Positive,
    /// A number greater than or equal to the bound.
    Min(f64),
    /// A string of at most this many characters.
    MaxLength(usize),
    /// A string equal to one of the listed values.
    OneOf(Vec<String>),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Required => f.write_str("is required"),
            Constraint::NotBlank => f.write_str("must not be blank"),
            Constraint::Positive => f.write_str("must be greater than 0"),
            Constraint::Min(min) => write!(f, "must be at least {min}"),
            Constraint::MaxLength(max) => write!(f, "must be at most {max} characters"),
            Constraint::OneOf(values) => write!(f, "must be one of [{}]", values.join(", ")),
        }
    }
}

impl Constraint {
    fn check(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match (self, value) {
            (Constraint::Required, value) => value.is_some(),
            (Constraint::NotBlank, value) => value
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty()),
            (_, None) => true,
            (Constraint::Positive, Some(v)) => v.as_f64().is_some_and(|n| n > 0.0),
            (Constraint::Min(min), Some(v)) => v.as_f64().is_some_and(|n| n >= *min),
            (Constraint::MaxLength(max), Some(v)) => {
                v.as_str().is_some_and(|s| s.chars().count() <= *max)
            }
            (Constraint::OneOf(values), Some(v)) => v
                .as_str()
                .is_some_and(|s| values.iter().any(|allowed| allowed == s)),
        }
    }
}

/// Checks payload fields against per-command-type constraints.
///
/// Every failing constraint is collected into a single `ValidationFailed`.
/// Command types without rules pass untouched.
#[derive(Debug, Clone, Default)]
pub struct ValidationInterceptor {
    rules: HashMap<String, Vec<(String, Constraint)>>,
}

impl ValidationInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint on `field` for commands of `command_type`.
    pub fn rule(
        mut self,
        command_type: impl Into<String>,
        field: impl Into<String>,
        constraint: Constraint,
    ) -> Self {
        self.rules
            .entry(command_type.into())
            .or_default()
            .push((field.into(), constraint));
        self
    }

    /// Returns every violation of `command`.
    pub fn violations(&self, command: &Command) -> Vec<Violation> {
        let Some(rules) = self.rules.get(&command.command_type) else {
            return Vec::new();
        };
        rules
            .iter()
            .filter(|(field, constraint)| !constraint.check(command.field(field)))
            .map(|(field, constraint)| Violation::new(field.clone(), constraint.to_string()))
            .collect()
    }
}

impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &str {
        "validation"
    }

    fn intercept(&self, command: Command) -> Result<Command, DispatchError> {
        let violations = self.violations(&command);
        if violations.is_empty() {
            Ok(command)
        } else {
            metrics::counter!("commands_rejected_by_validation_total").increment(1);
            Err(DispatchError::ValidationFailed(violations))
        }
    }
}
