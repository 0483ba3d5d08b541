//! Normalized operation model produced by the spec loader.

use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("placeholder regex"));

/// Where an argument goes in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    /// A JSON request body value; see [`BodyMode`].
    Body,
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
            ParamLocation::Body => "body",
        })
    }
}

/// How body arguments become the JSON request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Each body argument is one property of a JSON object body.
    Fields,
    /// A single `body` argument is the whole JSON body.
    Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    /// Declared schema with every `$ref` inlined.
    pub schema: Value,
    pub description: Option<String>,
}

/// One remote operation, as declared by the API description.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub operation_id: Option<String>,
    pub method: Method,
    /// Path template, e.g. `/hosts/{id}`.
    pub path: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub parameters: Vec<ParameterDescriptor>,
    pub body_mode: Option<BodyMode>,
    /// Schema of the first JSON 2xx response, informational only.
    pub response_shape: Option<Value>,
}

impl OperationDescriptor {
    /// `"GET /hosts/{id}"`, used in logs and conflict messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Names of the `{placeholders}` in a path template, in order.
#[must_use]
pub fn path_placeholders(path: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(path)
        .map(|c| c[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_in_order() {
        assert_eq!(
            path_placeholders("/hosts/{hostId}/beacons/{bid}"),
            vec!["hostId".to_string(), "bid".to_string()]
        );
        assert!(path_placeholders("/hosts").is_empty());
    }
}
