//! Error types for `mcp-openapi-bridge-core`.

use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Main error type for the bridge.
///
/// Variants split into two groups: startup errors, which abort the process before any tool is
/// offered, and per-invocation errors, which are reported to the caller of a single tool call.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid configuration (bad base URL, empty identity material).
    #[error("Configuration error: {0}")]
    Config(String),

    /// No credential could be obtained from the login endpoint.
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Spec fetch error: failed to fetch spec from '{url}': {message}")]
    SpecFetch { url: String, message: String },

    #[error("Spec parse error: invalid API description from '{location}': {message}")]
    SpecParse { location: String, message: String },

    /// Two operations still share a tool name after disambiguation.
    #[error("Catalog conflict: {0}")]
    CatalogConflict(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {}", join_violations(.violations))]
    InvalidArguments {
        tool: String,
        violations: Vec<ArgumentViolation>,
    },

    /// A 401/403 survived one credential renewal.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// The upstream API answered with a non-2xx status other than 401/403.
    #[error("Upstream error: API returned {status} {reason}: {body}")]
    Upstream {
        status: u16,
        reason: String,
        body: Value,
    },

    /// Network-level failure (timeout, refused connection, TLS).
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    /// Stable machine-readable kind, used in structured error payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Authentication(_) => "authentication",
            BridgeError::SpecFetch { .. } => "spec_fetch",
            BridgeError::SpecParse { .. } => "spec_parse",
            BridgeError::CatalogConflict(_) => "catalog_conflict",
            BridgeError::UnknownTool(_) => "unknown_tool",
            BridgeError::InvalidArguments { .. } => "invalid_arguments",
            BridgeError::Authorization(_) => "authorization",
            BridgeError::Upstream { .. } => "upstream",
            BridgeError::Transport(_) => "transport",
        }
    }

    /// Whether this error must abort startup rather than be reported to a caller.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Config(_)
                | BridgeError::Authentication(_)
                | BridgeError::SpecFetch { .. }
                | BridgeError::SpecParse { .. }
                | BridgeError::CatalogConflict(_)
        )
    }

    /// Structured payload for MCP error results: `{"kind", "message", ...details}`.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        match self {
            BridgeError::InvalidArguments { tool, violations } => {
                payload["tool"] = json!(tool);
                payload["violations"] =
                    Value::Array(violations.iter().map(ArgumentViolation::to_json).collect());
            }
            BridgeError::Upstream { status, body, .. } => {
                payload["status"] = json!(status);
                payload["body"] = body.clone();
            }
            BridgeError::UnknownTool(name) => {
                payload["tool"] = json!(name);
            }
            _ => {}
        }
        payload
    }
}

/// One problem found while validating tool-call arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentViolation {
    /// The arguments themselves were not a JSON object.
    NotAnObject { actual: &'static str },
    Missing {
        name: String,
    },
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl ArgumentViolation {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            ArgumentViolation::NotAnObject { .. } => None,
            ArgumentViolation::Missing { name } | ArgumentViolation::TypeMismatch { name, .. } => {
                Some(name)
            }
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ArgumentViolation::NotAnObject { actual } => json!({
                "violation": "not_an_object",
                "actual": actual,
            }),
            ArgumentViolation::Missing { name } => json!({
                "violation": "missing",
                "name": name,
            }),
            ArgumentViolation::TypeMismatch {
                name,
                expected,
                actual,
            } => json!({
                "violation": "type_mismatch",
                "name": name,
                "expected": expected,
                "actual": actual,
            }),
        }
    }
}

impl fmt::Display for ArgumentViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentViolation::NotAnObject { actual } => {
                write!(f, "arguments must be an object, got {actual}")
            }
            ArgumentViolation::Missing { name } => write!(f, "missing required parameter '{name}'"),
            ArgumentViolation::TypeMismatch {
                name,
                expected,
                actual,
            } => write!(f, "parameter '{name}' must be {expected}, got {actual}"),
        }
    }
}

fn join_violations(violations: &[ArgumentViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
