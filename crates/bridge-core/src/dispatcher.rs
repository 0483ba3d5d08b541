//! Tool invocation: validate arguments, build the HTTP request, send it with the current
//! credential, and map the outcome.

use crate::config::BridgeConfig;
use crate::credentials::{Credential, CredentialManager};
use crate::descriptor::{BodyMode, ParamLocation};
use crate::error::{ArgumentViolation, BridgeError, Result};
use crate::http::{
    content_type, decode_body, excerpt, is_image_content_type, redact_url, sanitize_reqwest_error,
};
use crate::loader::{BODY_ARG, is_auth_failure};
use crate::synthesizer::{SharedCatalog, ToolDefinition};
use base64::Engine as _;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use rmcp::model::{CallToolResult, Content};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use url::Url;

/// Successful outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutput {
    /// Parsed body: JSON when it parses, text otherwise.
    Body(Value),
    Image { data: Vec<u8>, mime_type: String },
}

/// Concrete request produced from a template and validated arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<Value>,
}

/// Per-invocation retry state: at most one renewal, never a third attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Renewed,
}

pub struct Dispatcher {
    client: reqwest::Client,
    base_url: Url,
    credentials: Arc<CredentialManager>,
    catalog: SharedCatalog,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the base URL is invalid.
    pub fn new(
        config: &BridgeConfig,
        client: reqwest::Client,
        credentials: Arc<CredentialManager>,
        catalog: SharedCatalog,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: config.parsed_base_url()?,
            credentials,
            catalog,
        })
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::UnknownTool`] if no tool has this name
    /// - [`BridgeError::InvalidArguments`] listing every violation (no request is sent)
    /// - [`BridgeError::Authorization`] if a 401/403 survives one credential renewal
    /// - [`BridgeError::Upstream`] for any other non-2xx status
    /// - [`BridgeError::Transport`] for network failures and timeouts
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<InvocationOutput> {
        let tool = self
            .catalog
            .snapshot()
            .get(name)
            .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;

        let arguments = validate_arguments(&tool, arguments)?;
        let request = resolve(&self.base_url, &tool, &arguments)?;
        tracing::debug!(
            "Dispatching '{}' to {} {}",
            tool.name,
            request.method,
            redact_url(&request.url)
        );

        let mut credential = self.credential().await?;
        let mut attempt = Attempt::First;
        loop {
            let response = self.send(&request, &credential).await?;
            let status = response.status();
            if !is_auth_failure(status) {
                return read_outcome(response).await;
            }

            match attempt {
                Attempt::First => {
                    tracing::info!(
                        "'{}' rejected with {status}; renewing credential and retrying once",
                        tool.name
                    );
                    credential = self
                        .credentials
                        .renew_after(&credential)
                        .await
                        .map_err(|e| {
                            BridgeError::Authorization(format!("credential renewal failed: {e}"))
                        })?;
                    attempt = Attempt::Renewed;
                }
                Attempt::Renewed => {
                    let bytes = response.bytes().await.unwrap_or_default();
                    return Err(BridgeError::Authorization(format!(
                        "'{}' was rejected with {status} after renewing the credential: {}",
                        tool.name,
                        excerpt(&bytes)
                    )));
                }
            }
        }
    }

    /// [`Self::invoke`] mapped onto an MCP result. Failures become error results carrying
    /// `{"error": {"kind", "message", ...}}` as structured content.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        match self.invoke(name, arguments).await {
            Ok(InvocationOutput::Image { data, mime_type }) => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(data);
                CallToolResult::success(vec![Content::image(b64, mime_type)])
            }
            Ok(InvocationOutput::Body(body)) => {
                let text = match &body {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other)
                        .unwrap_or_else(|_| other.to_string()),
                };
                CallToolResult::success(vec![Content::text(text)])
            }
            Err(e) => {
                tracing::debug!("Tool '{name}' failed: {e}");
                CallToolResult {
                    content: vec![Content::text(format!("Error: {e}"))],
                    structured_content: Some(json!({ "error": e.to_payload() })),
                    is_error: Some(true),
                    meta: None,
                }
            }
        }
    }

    async fn credential(&self) -> Result<Arc<Credential>> {
        self.credentials
            .current()
            .await
            .map_err(|e| BridgeError::Authorization(format!("no credential available: {e}")))
    }

    async fn send(
        &self,
        request: &ResolvedRequest,
        credential: &Credential,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .bearer_auth(credential.token());
        for (name, value) in &request.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|e| BridgeError::Transport(sanitize_reqwest_error(&e)))
    }
}

async fn read_outcome(response: reqwest::Response) -> Result<InvocationOutput> {
    let status = response.status();
    let content_type = content_type(&response);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| BridgeError::Transport(sanitize_reqwest_error(&e)))?;

    if status.is_success() {
        if is_image_content_type(content_type.as_deref()) {
            return Ok(InvocationOutput::Image {
                data: bytes.to_vec(),
                mime_type: content_type.unwrap_or_else(|| "image/*".to_string()),
            });
        }
        return Ok(InvocationOutput::Body(decode_body(
            &bytes,
            content_type.as_deref(),
        )));
    }

    Err(BridgeError::Upstream {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        body: decode_body(&bytes, content_type.as_deref()),
    })
}

/// Check arguments against the tool's declared parameters, collecting every violation.
///
/// `null` (or absent) arguments count as an empty object; `null` values count as not supplied.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidArguments`] if anything is missing or mistyped.
pub fn validate_arguments(tool: &ToolDefinition, arguments: Value) -> Result<Map<String, Value>> {
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(BridgeError::InvalidArguments {
                tool: tool.name.clone(),
                violations: vec![ArgumentViolation::NotAnObject {
                    actual: json_type_name(&other),
                }],
            });
        }
    };

    let mut violations = Vec::new();
    for arg in &tool.template.arguments {
        match args.get(&arg.name) {
            None | Some(Value::Null) => {
                if arg.required {
                    violations.push(ArgumentViolation::Missing {
                        name: arg.name.clone(),
                    });
                }
            }
            Some(value) if !arg.ty.accepts(value) => {
                violations.push(ArgumentViolation::TypeMismatch {
                    name: arg.name.clone(),
                    expected: arg.ty.name(),
                    actual: json_type_name(value),
                });
            }
            Some(_) => {}
        }
    }

    if violations.is_empty() {
        Ok(args)
    } else {
        Err(BridgeError::InvalidArguments {
            tool: tool.name.clone(),
            violations,
        })
    }
}

/// Build the concrete request for a tool's template and validated arguments.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidArguments`] if a header argument cannot be sent as a header
/// value.
pub fn resolve(
    base_url: &Url,
    tool: &ToolDefinition,
    args: &Map<String, Value>,
) -> Result<ResolvedRequest> {
    let template = &tool.template;
    let mut path = template.path.clone();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut headers = Vec::new();
    let mut body_fields = Map::new();
    let mut body_payload: Option<Value> = None;
    let mut violations = Vec::new();

    for arg in &template.arguments {
        let Some(value) = args.get(&arg.name).filter(|v| !v.is_null()) else {
            continue;
        };
        match arg.location {
            ParamLocation::Path => {
                let placeholder = format!("{{{}}}", arg.name);
                path = path.replace(&placeholder, &encode_path_segment(&value_to_string(value)));
            }
            ParamLocation::Query => match value {
                Value::Array(items) => {
                    for item in items.iter().filter(|v| !v.is_null()) {
                        query.push((arg.name.clone(), value_to_string(item)));
                    }
                }
                other => query.push((arg.name.clone(), value_to_string(other))),
            },
            ParamLocation::Header => {
                let name = HeaderName::from_bytes(arg.name.as_bytes());
                let header_value = HeaderValue::from_str(&value_to_string(value));
                match (name, header_value) {
                    (Ok(n), Ok(v)) => headers.push((n, v)),
                    _ => violations.push(ArgumentViolation::TypeMismatch {
                        name: arg.name.clone(),
                        expected: "header-safe string",
                        actual: json_type_name(value),
                    }),
                }
            }
            ParamLocation::Body => match template.body_mode {
                Some(BodyMode::Payload) if arg.name == BODY_ARG => {
                    body_payload = Some(value.clone());
                }
                _ => {
                    body_fields.insert(arg.name.clone(), value.clone());
                }
            },
        }
    }

    if !violations.is_empty() {
        return Err(BridgeError::InvalidArguments {
            tool: tool.name.clone(),
            violations,
        });
    }

    let mut url = build_url(base_url, &path)?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &query {
            pairs.append_pair(k, v);
        }
    }

    let body = body_payload.or_else(|| {
        (template.body_mode == Some(BodyMode::Fields) && !body_fields.is_empty())
            .then_some(Value::Object(body_fields))
    });

    Ok(ResolvedRequest {
        method: template.method.clone(),
        url,
        headers,
        body,
    })
}

fn build_url(base_url: &Url, path: &str) -> Result<Url> {
    let joined = format!("{}{}", base_url.as_str().trim_end_matches('/'), path);
    Url::parse(&joined)
        .map_err(|e| BridgeError::Transport(format!("invalid request URL '{joined}': {e}")))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Percent-encode everything except RFC 3986 unreserved characters.
fn encode_path_segment(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}
