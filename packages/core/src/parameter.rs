//! Typed plan parameters and text coercion.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Failure to turn edited text into a parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("Invalid value for '{parameter}': expected {expected}, got '{text}'")]
    Invalid {
        parameter: String,
        expected: &'static str,
        text: String,
    },

    #[error("Parameter '{parameter}' is required")]
    Required { parameter: String },
}

/// The value type a parameter's text is parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    Any,
}

impl ParamType {
    /// Map a loose type annotation to a parameter type.
    pub fn from_type_name(type_name: &str) -> Self {
        let lowered = type_name.to_ascii_lowercase();
        if lowered.contains("bool") {
            Self::Bool
        } else if lowered.contains("int") {
            Self::Int
        } else if ["float", "number", "double"].iter().any(|t| lowered.contains(t)) {
            Self::Float
        } else if lowered.contains("str") {
            Self::Str
        } else {
            Self::Any
        }
    }

    /// Infer the type from a default value.
    pub fn infer(default: &Value) -> Self {
        match default {
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Int,
            Value::Number(_) => Self::Float,
            Value::Null | Value::String(_) => Self::Str,
            Value::Array(_) | Value::Object(_) => Self::Any,
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Bool => "a boolean",
            Self::Int => "an integer",
            Self::Float => "a number",
            Self::Str => "text",
            Self::Any => "a value",
        }
    }
}

/// One declared parameter of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanParameter {
    pub name: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlanParameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
            type_name: None,
            required: false,
            description: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The type edited text is coerced to: the annotation wins, then the
    /// default's JSON type.
    pub fn param_type(&self) -> ParamType {
        match &self.type_name {
            Some(type_name) if !type_name.trim().is_empty() => ParamType::from_type_name(type_name),
            _ => ParamType::infer(&self.default),
        }
    }

    /// Parse edited text into a typed value.
    pub fn coerce(&self, text: &str) -> Result<Value, CoercionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            if self.required {
                return Err(CoercionError::Required {
                    parameter: self.name.clone(),
                });
            }
            return Ok(Value::Null);
        }

        let kind = self.param_type();
        let invalid = || CoercionError::Invalid {
            parameter: self.name.clone(),
            expected: kind.expected(),
            text: text.to_string(),
        };

        match kind {
            ParamType::Bool => parse_bool(trimmed).map(Value::Bool).ok_or_else(invalid),
            ParamType::Int => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid()),
            ParamType::Float => trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            ParamType::Str => Ok(Value::String(text.to_string())),
            ParamType::Any => Ok(serde_json::from_str(trimmed)
                .unwrap_or_else(|_| Value::String(text.to_string()))),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Whether a definition describes a plan or an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    #[default]
    Plan,
    Instruction,
}

impl PlanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Instruction => "instruction",
        }
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan (or instruction) the queue server allows, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: PlanKind,
    #[serde(default)]
    pub parameters: Vec<PlanParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlanDefinition {
    pub fn new(name: impl Into<String>, kind: PlanKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters: Vec::new(),
            description: None,
        }
    }

    pub fn with_parameter(mut self, parameter: PlanParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&PlanParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Coerce text for `key`; undeclared keys keep the text as a string.
    pub fn coerce_for_key(&self, key: &str, text: &str) -> Result<Value, CoercionError> {
        match self.parameter(key) {
            Some(parameter) => parameter.coerce(text),
            None => Ok(Value::String(text.to_string())),
        }
    }
}
