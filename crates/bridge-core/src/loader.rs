//! Fetching and normalizing the remote API description.
//!
//! The document is parsed leniently: the envelope (`openapi`, `paths`) must be valid, but each
//! operation is deserialized on its own, so a malformed entry is skipped with a warning instead
//! of failing the whole load.

use crate::config::{AutoDiscoverConfig, BridgeConfig, HashPolicy};
use crate::credentials::CredentialManager;
use crate::descriptor::{
    BodyMode, OperationDescriptor, ParamLocation, ParameterDescriptor, path_placeholders,
};
use crate::error::{BridgeError, Result};
use crate::http::{excerpt, redact_url, sanitize_reqwest_error};
use crate::resolver::RefResolver;
use openapiv3::{
    Info, Operation, Parameter, ParameterSchemaOrContent, ReferenceOr, RequestBody, Schema,
};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Methods in the order they are read from each path item.
const METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Argument name used when the request body is passed through whole.
pub const BODY_ARG: &str = "body";

/// Headers the HTTP layer owns; declaring them as parameters has no effect.
const RESERVED_HEADERS: [&str; 3] = ["accept", "content-type", "authorization"];

/// An operation (or whole path item) that was skipped while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Upper-case HTTP method, or `None` when the whole path item was skipped.
    pub method: Option<String>,
    pub path: String,
    pub reason: String,
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(m) => write!(f, "{m} {}: {}", self.path, self.reason),
            None => write!(f, "{}: {}", self.path, self.reason),
        }
    }
}

/// Result of one spec load.
#[derive(Debug, Clone, Default)]
pub struct LoadedSpec {
    pub title: Option<String>,
    pub version: Option<String>,
    /// Document order: paths as declared, then [`METHODS`] order within a path.
    pub operations: Vec<OperationDescriptor>,
    pub warnings: Vec<LoadWarning>,
}

/// Loads the API description through the authorized spec endpoint.
pub struct SpecLoader {
    client: reqwest::Client,
    credentials: Arc<CredentialManager>,
    spec_url: Url,
    auto_discover: AutoDiscoverConfig,
    spec_hash: Option<String>,
    spec_hash_policy: HashPolicy,
}

impl SpecLoader {
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the spec URL cannot be built from the config.
    pub fn new(
        config: &BridgeConfig,
        client: reqwest::Client,
        credentials: Arc<CredentialManager>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            credentials,
            spec_url: config.endpoint_url(&config.spec_path)?,
            auto_discover: config.auto_discover.clone(),
            spec_hash: config.spec_hash.clone(),
            spec_hash_policy: config.spec_hash_policy,
        })
    }

    /// Fetch, verify and parse the API description.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Authentication`] if no credential can be obtained
    /// - [`BridgeError::SpecFetch`] on transport failure or a non-2xx status
    /// - [`BridgeError::SpecParse`] if the document envelope is invalid or the hash check fails
    pub async fn load(&self) -> Result<LoadedSpec> {
        let location = redact_url(&self.spec_url);
        tracing::info!("Fetching API description from {location}");

        let body = self.fetch(&location).await?;
        self.verify_hash(&location, &body)?;

        let mut spec = parse_document(&location, &body)?;
        let declared = spec.operations.len();
        spec.operations
            .retain(|op| self.auto_discover.allows(op.method.as_str(), &op.path));
        if spec.operations.len() != declared {
            tracing::debug!(
                "Auto-discovery filters excluded {} of {} operations",
                declared - spec.operations.len(),
                declared
            );
        }

        tracing::info!(
            "Loaded API description '{}' (version {}): {} operations, {} skipped",
            spec.title.as_deref().unwrap_or("untitled"),
            spec.version.as_deref().unwrap_or("unknown"),
            spec.operations.len(),
            spec.warnings.len()
        );
        Ok(spec)
    }

    async fn fetch(&self, location: &str) -> Result<String> {
        let mut credential = self.credentials.current().await?;
        let mut renewed = false;

        loop {
            let response = self
                .client
                .get(self.spec_url.clone())
                .bearer_auth(credential.token())
                .send()
                .await
                .map_err(|e| BridgeError::SpecFetch {
                    url: location.to_string(),
                    message: sanitize_reqwest_error(&e),
                })?;

            let status = response.status();
            if is_auth_failure(status) && !renewed {
                tracing::info!("Spec fetch rejected with {status}; renewing credential");
                credential = self.credentials.renew_after(&credential).await?;
                renewed = true;
                continue;
            }

            let bytes = response.bytes().await.map_err(|e| BridgeError::SpecFetch {
                url: location.to_string(),
                message: sanitize_reqwest_error(&e),
            })?;

            if !status.is_success() {
                return Err(BridgeError::SpecFetch {
                    url: location.to_string(),
                    message: format!("server returned {status}: {}", excerpt(&bytes)),
                });
            }

            return String::from_utf8(bytes.to_vec()).map_err(|_| BridgeError::SpecParse {
                location: location.to_string(),
                message: "document is not valid UTF-8".to_string(),
            });
        }
    }

    fn verify_hash(&self, location: &str, body: &str) -> Result<()> {
        let Some(expected_hash) = &self.spec_hash else {
            return Ok(());
        };
        let actual_hash = format!("sha256:{}", hex::encode(Sha256::digest(body.as_bytes())));
        if actual_hash == *expected_hash {
            return Ok(());
        }
        match self.spec_hash_policy {
            HashPolicy::Fail => Err(BridgeError::SpecParse {
                location: location.to_string(),
                message: format!("spec hash mismatch. Expected: {expected_hash}, Got: {actual_hash}"),
            }),
            HashPolicy::Warn => {
                tracing::warn!(
                    "Spec hash mismatch for '{}'. Expected: {}, Got: {}",
                    location,
                    expected_hash,
                    actual_hash
                );
                Ok(())
            }
            HashPolicy::Ignore => Ok(()),
        }
    }
}

pub(crate) fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Parse an API description body (JSON, or YAML as a fallback) into operation descriptors.
///
/// # Errors
///
/// Returns [`BridgeError::SpecParse`] if the body is not a document, is not `OpenAPI` 3.x, or
/// has no `paths` object. Problems inside individual operations are reported as warnings.
pub fn parse_document(location: &str, body: &str) -> Result<LoadedSpec> {
    let parse_err = |message: String| BridgeError::SpecParse {
        location: location.to_string(),
        message,
    };

    let doc: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(json_err) => serde_yaml::from_str(body).map_err(|yaml_err| {
            parse_err(format!(
                "not JSON ({json_err}) and not YAML ({yaml_err})"
            ))
        })?,
    };

    let Some(root) = doc.as_object() else {
        return Err(parse_err("document is not an object".to_string()));
    };

    match root.get("openapi") {
        Some(Value::String(v)) if v.starts_with("3.") => {}
        Some(Value::String(v)) => {
            return Err(parse_err(format!("unsupported OpenAPI version '{v}'")));
        }
        Some(_) => return Err(parse_err("'openapi' must be a version string".to_string())),
        None if root.contains_key("swagger") => {
            return Err(parse_err(
                "Swagger 2.0 documents are not supported".to_string(),
            ));
        }
        None => return Err(parse_err("missing 'openapi' version field".to_string())),
    }

    let Some(paths) = root.get("paths").and_then(Value::as_object) else {
        return Err(parse_err("missing 'paths' object".to_string()));
    };

    let info: Option<Info> = root
        .get("info")
        .and_then(|i| serde_json::from_value(i.clone()).ok());

    let resolver = RefResolver::new(&doc);
    let mut operations = Vec::new();
    let mut warnings = Vec::new();

    for (path, item) in paths {
        let item = match resolver.resolve_value(item) {
            Ok(v) => v,
            Err(e) => {
                warnings.push(skip(location, None, path, e.to_string()));
                continue;
            }
        };
        let Some(item) = item.as_object() else {
            warnings.push(skip(location, None, path, "path item is not an object".into()));
            continue;
        };

        let shared: Vec<ReferenceOr<Parameter>> = match item.get("parameters") {
            None => Vec::new(),
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(p) => p,
                Err(e) => {
                    warnings.push(skip(
                        location,
                        None,
                        path,
                        format!("invalid path-level parameters: {e}"),
                    ));
                    continue;
                }
            },
        };

        for method in METHODS {
            let Some(op_value) = item.get(method) else {
                continue;
            };
            match build_descriptor(&resolver, method, path, &shared, op_value) {
                Ok(descriptor) => operations.push(descriptor),
                Err(reason) => warnings.push(skip(location, Some(method), path, reason)),
            }
        }
    }

    Ok(LoadedSpec {
        title: info.as_ref().map(|i| i.title.clone()),
        version: info.map(|i| i.version),
        operations,
        warnings,
    })
}

fn skip(location: &str, method: Option<&str>, path: &str, reason: String) -> LoadWarning {
    let method = method.map(str::to_uppercase);
    tracing::warn!(
        "Skipping {} {} in '{}': {}",
        method.as_deref().unwrap_or("*"),
        path,
        location,
        reason
    );
    LoadWarning {
        method,
        path: path.to_string(),
        reason,
    }
}

fn build_descriptor(
    resolver: &RefResolver<'_>,
    method: &str,
    path: &str,
    shared: &[ReferenceOr<Parameter>],
    op_value: &Value,
) -> std::result::Result<OperationDescriptor, String> {
    let operation: Operation = serde_json::from_value(op_value.clone())
        .map_err(|e| format!("invalid operation object: {e}"))?;
    let http_method =
        Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|e| e.to_string())?;

    let mut parameters = Vec::new();
    for param in merge_parameters(resolver, shared, &operation.parameters)? {
        if let Some(p) = extract_parameter(resolver, &param)? {
            parameters.push(p);
        }
    }
    check_path_template(path, &parameters)?;
    check_unique_names(&parameters)?;

    let body_mode = match &operation.request_body {
        Some(body) => extract_body(resolver, body, &mut parameters)?,
        None => None,
    };

    Ok(OperationDescriptor {
        operation_id: non_empty(operation.operation_id),
        method: http_method,
        path: path.to_string(),
        summary: non_empty(operation.summary),
        description: non_empty(operation.description),
        parameters,
        body_mode,
        response_shape: response_shape(resolver, op_value),
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

/// Path-item parameters first, then operation parameters overriding by (location, name).
fn merge_parameters(
    resolver: &RefResolver<'_>,
    shared: &[ReferenceOr<Parameter>],
    own: &[ReferenceOr<Parameter>],
) -> std::result::Result<Vec<Parameter>, String> {
    fn key_for(p: &Parameter) -> (u8, String) {
        let loc = match p {
            Parameter::Query { .. } => 0,
            Parameter::Header { .. } => 1,
            Parameter::Path { .. } => 2,
            Parameter::Cookie { .. } => 3,
        };
        (loc, p.parameter_data_ref().name.clone())
    }

    let mut merged: Vec<Parameter> = Vec::new();
    for r in shared.iter().chain(own) {
        let param = resolver.resolve_reference_or(r).map_err(|e| e.to_string())?;
        let key = key_for(&param);
        match merged.iter_mut().find(|m| key_for(m) == key) {
            Some(slot) => *slot = param,
            None => merged.push(param),
        }
    }
    Ok(merged)
}

fn extract_parameter(
    resolver: &RefResolver<'_>,
    param: &Parameter,
) -> std::result::Result<Option<ParameterDescriptor>, String> {
    let (location, data) = match param {
        Parameter::Query { parameter_data, .. } => (ParamLocation::Query, parameter_data),
        Parameter::Header { parameter_data, .. } => (ParamLocation::Header, parameter_data),
        Parameter::Path { parameter_data, .. } => (ParamLocation::Path, parameter_data),
        Parameter::Cookie { parameter_data, .. } => {
            return Err(format!(
                "cookie parameter '{}' is not supported",
                parameter_data.name
            ));
        }
    };

    if data.name.trim().is_empty() {
        return Err(format!("{location} parameter without a name"));
    }
    if location == ParamLocation::Header
        && RESERVED_HEADERS.contains(&data.name.to_ascii_lowercase().as_str())
    {
        return Ok(None);
    }

    let schema = match &data.format {
        ParameterSchemaOrContent::Schema(s) => schema_value(resolver, s)?,
        ParameterSchemaOrContent::Content(content) => {
            match content.values().next().and_then(|m| m.schema.as_ref()) {
                Some(s) => schema_value(resolver, s)?,
                None => json!({}),
            }
        }
    };

    Ok(Some(ParameterDescriptor {
        name: data.name.clone(),
        location,
        // Path parameters are always required.
        required: data.required || location == ParamLocation::Path,
        schema,
        description: non_empty(data.description.clone()),
    }))
}

fn schema_value(
    resolver: &RefResolver<'_>,
    schema: &ReferenceOr<Schema>,
) -> std::result::Result<Value, String> {
    let raw = serde_json::to_value(schema).map_err(|e| format!("invalid schema: {e}"))?;
    resolver.inline_schema(&raw).map_err(|e| e.to_string())
}

fn check_path_template(
    path: &str,
    parameters: &[ParameterDescriptor],
) -> std::result::Result<(), String> {
    let placeholders = path_placeholders(path);
    for ph in &placeholders {
        if !parameters
            .iter()
            .any(|p| p.location == ParamLocation::Path && p.name == *ph)
        {
            return Err(format!(
                "path placeholder '{{{ph}}}' has no matching path parameter"
            ));
        }
    }
    for p in parameters.iter().filter(|p| p.location == ParamLocation::Path) {
        if !placeholders.contains(&p.name) {
            return Err(format!(
                "path parameter '{}' does not appear in the path template",
                p.name
            ));
        }
    }
    Ok(())
}

fn check_unique_names(parameters: &[ParameterDescriptor]) -> std::result::Result<(), String> {
    let mut seen: HashMap<&str, ParamLocation> = HashMap::new();
    for p in parameters {
        if let Some(previous) = seen.insert(p.name.as_str(), p.location) {
            return Err(format!(
                "parameter name '{}' is declared in both {previous} and {}",
                p.name, p.location
            ));
        }
    }
    Ok(())
}

/// Add the request body to `parameters`, flattening object properties when their names do not
/// clash with declared parameters.
fn extract_body(
    resolver: &RefResolver<'_>,
    body: &ReferenceOr<RequestBody>,
    parameters: &mut Vec<ParameterDescriptor>,
) -> std::result::Result<Option<BodyMode>, String> {
    let body: RequestBody = resolver.resolve_reference_or(body).map_err(|e| e.to_string())?;
    if body.content.is_empty() {
        return Ok(None);
    }

    let media = body
        .content
        .get("application/json")
        .or_else(|| {
            body.content
                .iter()
                .find(|(ct, _)| ct.ends_with("+json"))
                .map(|(_, m)| m)
        })
        .or_else(|| body.content.values().next());
    let schema = match media.and_then(|m| m.schema.as_ref()) {
        Some(s) => schema_value(resolver, s)?,
        None => json!({}),
    };

    if let Some(fields) = flatten_fields(&schema, body.required)
        && !fields
            .iter()
            .any(|f| parameters.iter().any(|p| p.name == f.name))
    {
        parameters.extend(fields);
        return Ok(Some(BodyMode::Fields));
    }

    if let Some(clash) = parameters.iter().find(|p| p.name == BODY_ARG) {
        return Err(format!(
            "request body argument '{BODY_ARG}' clashes with {} parameter '{}'",
            clash.location, clash.name
        ));
    }
    parameters.push(ParameterDescriptor {
        name: BODY_ARG.to_string(),
        location: ParamLocation::Body,
        required: body.required,
        schema,
        description: non_empty(body.description),
    });
    Ok(Some(BodyMode::Payload))
}

fn flatten_fields(schema: &Value, body_required: bool) -> Option<Vec<ParameterDescriptor>> {
    let is_object = match schema.get("type") {
        Some(Value::String(t)) => t == "object",
        None => true,
        Some(_) => false,
    };
    let composed = ["allOf", "oneOf", "anyOf"]
        .iter()
        .any(|k| schema.get(k).is_some());
    if !is_object || composed {
        return None;
    }
    let properties = schema.get("properties")?.as_object()?;
    if properties.is_empty() {
        return None;
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    Some(
        properties
            .iter()
            .map(|(name, prop)| ParameterDescriptor {
                name: name.clone(),
                location: ParamLocation::Body,
                required: body_required && required.contains(&name.as_str()),
                schema: prop.clone(),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect(),
    )
}

fn response_shape(resolver: &RefResolver<'_>, op_value: &Value) -> Option<Value> {
    let responses = op_value.get("responses")?.as_object()?;
    let (_, response) = responses.iter().find(|(code, _)| code.starts_with('2'))?;
    let response = resolver.resolve_value(response).ok()?;
    let content = response.get("content")?.as_object()?;
    let media = content
        .get("application/json")
        .or_else(|| content.values().next())?;
    resolver.inline_schema(media.get("schema")?).ok()
}
