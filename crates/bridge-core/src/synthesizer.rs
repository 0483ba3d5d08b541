//! Operation descriptors → MCP tool definitions.
//!
//! Synthesis is a pure function of the descriptor list. The resulting [`ToolCatalog`] is never
//! modified; a refresh builds a new catalog and swaps it into the [`SharedCatalog`] whole.

use crate::descriptor::{BodyMode, OperationDescriptor, ParamLocation};
use crate::error::{BridgeError, Result};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::Method;
use rmcp::model::{JsonObject, Tool, ToolAnnotations};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

const MAX_TOOL_NAME_LEN: usize = 64;

static NAME_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("name regex"));
static PATH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("path param regex"));
static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("alnum regex"));

/// General-purpose schema primitive a declared type maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// Unknown or undeclared type; any JSON value is accepted and passed through.
    Any,
}

impl SchemaType {
    /// Map a declared JSON schema to its primitive.
    #[must_use]
    pub fn of(schema: &Value) -> Self {
        match schema.get("type") {
            Some(Value::String(t)) => Self::from_name(t),
            // OpenAPI 3.1 style `type: [string, "null"]`
            Some(Value::Array(types)) => types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null")
                .map_or(Self::Any, Self::from_name),
            Some(_) => Self::Any,
            None if schema.get("properties").is_some() => Self::Object,
            None if schema.get("items").is_some() => Self::Array,
            None => Self::Any,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            _ => Self::Any,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    /// Whether `value` is acceptable for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// One argument of a synthesized tool and where it goes in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArgument {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub ty: SchemaType,
}

/// How to turn validated arguments into an HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationTemplate {
    pub method: Method,
    pub path: String,
    pub arguments: Vec<ToolArgument>,
    pub body_mode: Option<BodyMode>,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub operation_id: Option<String>,
    pub description: String,
    pub input_schema: Arc<JsonObject>,
    pub annotations: ToolAnnotations,
    pub response_shape: Option<Value>,
    pub template: InvocationTemplate,
}

impl ToolDefinition {
    /// The MCP `Tool` advertised to the host.
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        let mut tool = Tool::new(
            self.name.clone(),
            self.description.clone(),
            self.input_schema.clone(),
        );
        tool.annotations = Some(self.annotations.clone());
        tool
    }
}

/// Immutable set of tools keyed by unique name, in document order.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: Vec<Arc<ToolDefinition>>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.index.get(name).map(|&i| self.tools[i].clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDefinition>> {
        self.tools.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    #[must_use]
    pub fn to_tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.to_tool()).collect()
    }
}

/// Handle to the current catalog. Readers take a snapshot; refreshes swap in a new catalog.
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<ToolCatalog>>>,
}

impl SharedCatalog {
    #[must_use]
    pub fn new(catalog: ToolCatalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<ToolCatalog> {
        self.inner.read().clone()
    }

    /// Replace the catalog, returning the previous one.
    pub fn replace(&self, catalog: ToolCatalog) -> Arc<ToolCatalog> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(catalog))
    }
}

/// Build the tool catalog for a list of operation descriptors.
///
/// Names come from the operation id (or method + path when absent). Names shared by several
/// operations get the lower-case HTTP method appended to every member of the group. Distinct
/// operations that still collide (ids equal only after sanitizing or truncation) get a numeric
/// suffix in document order.
///
/// # Errors
///
/// Returns [`BridgeError::CatalogConflict`] if the same operation id is declared twice for the
/// same method.
pub fn synthesize(descriptors: &[OperationDescriptor]) -> Result<ToolCatalog> {
    let bases: Vec<String> = descriptors.iter().map(base_tool_name).collect();
    let mut base_counts: HashMap<&str, usize> = HashMap::new();
    for base in &bases {
        *base_counts.entry(base.as_str()).or_insert(0) += 1;
    }

    let mut tools: Vec<Arc<ToolDefinition>> = Vec::with_capacity(descriptors.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(descriptors.len());

    for (descriptor, base) in descriptors.iter().zip(&bases) {
        let name = if base_counts[base.as_str()] > 1 {
            with_suffix(base, &descriptor.method.as_str().to_lowercase())
        } else {
            base.clone()
        };

        let name = match index.get(&name) {
            None => name,
            Some(&existing) if same_operation(&tools[existing], descriptor) => {
                let other = &tools[existing];
                return Err(BridgeError::CatalogConflict(format!(
                    "tool name '{name}' is derived from both {} {} and {}",
                    other.template.method,
                    other.template.path,
                    descriptor.label()
                )));
            }
            Some(_) => reserve_numbered(&index, &name),
        };

        index.insert(name.clone(), tools.len());
        tools.push(Arc::new(build_tool(name, descriptor)));
    }

    Ok(ToolCatalog { tools, index })
}

// Same raw id on the same method (or, without ids, the same method and path): nothing left
// to tell the two apart.
fn same_operation(existing: &ToolDefinition, descriptor: &OperationDescriptor) -> bool {
    existing.template.method == descriptor.method
        && existing.operation_id == descriptor.operation_id
        && (descriptor.operation_id.is_some() || existing.template.path == descriptor.path)
}

/// `name_1`, `name_2`, ... in document order, for distinct operations whose names only collide
/// after sanitizing or truncation.
fn reserve_numbered(index: &HashMap<String, usize>, name: &str) -> String {
    let mut counter = 1usize;
    loop {
        let candidate = with_suffix(name, &counter.to_string());
        if !index.contains_key(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn build_tool(name: String, descriptor: &OperationDescriptor) -> ToolDefinition {
    let arguments = descriptor
        .parameters
        .iter()
        .map(|p| ToolArgument {
            name: p.name.clone(),
            location: p.location,
            required: p.required,
            ty: SchemaType::of(&p.schema),
        })
        .collect();

    let mut annotations = annotations_for_method(&descriptor.method);
    annotations.title.clone_from(&descriptor.summary);

    ToolDefinition {
        input_schema: Arc::new(build_input_schema(descriptor)),
        description: tool_description(descriptor),
        annotations,
        response_shape: descriptor.response_shape.clone(),
        operation_id: descriptor.operation_id.clone(),
        template: InvocationTemplate {
            method: descriptor.method.clone(),
            path: descriptor.path.clone(),
            arguments,
            body_mode: descriptor.body_mode,
        },
        name,
    }
}

fn base_tool_name(descriptor: &OperationDescriptor) -> String {
    descriptor
        .operation_id
        .as_deref()
        .map(sanitize_tool_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| generate_canonical_name(descriptor.method.as_str(), &descriptor.path))
}

fn sanitize_tool_name(raw: &str) -> String {
    let name = NAME_UNSAFE.replace_all(raw, "_");
    let name = name.trim_matches('_');
    // ASCII only at this point, so byte slicing is safe.
    name[..name.len().min(MAX_TOOL_NAME_LEN)].to_string()
}

/// `get` + `/hosts/{id}/beacons` → `get_hosts_id_beacons`.
fn generate_canonical_name(method: &str, path: &str) -> String {
    let name = format!("{}_{}", method.to_lowercase(), path);
    let name = PATH_PARAM.replace_all(&name, "_$1");
    let name = NON_ALNUM.replace_all(&name, "_");
    let name = name.trim_matches('_');
    name[..name.len().min(MAX_TOOL_NAME_LEN)].to_string()
}

fn with_suffix(base: &str, suffix: &str) -> String {
    let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len() + 1);
    format!("{}_{suffix}", &base[..base.len().min(keep)])
}

fn tool_description(descriptor: &OperationDescriptor) -> String {
    let method = descriptor.method.as_str();
    let path = &descriptor.path;
    let headline = descriptor
        .summary
        .clone()
        .or_else(|| descriptor.description.clone())
        .unwrap_or_else(|| format!("Calls {method} {path}"));

    let mut text = format!("{headline}\n\nPath: {method} {path}");
    if let (Some(summary), Some(description)) = (&descriptor.summary, &descriptor.description)
        && summary != description
    {
        text.push('\n');
        text.push_str(description);
    }
    text
}

fn build_input_schema(descriptor: &OperationDescriptor) -> JsonObject {
    let mut properties = JsonObject::new();
    let mut required: Vec<Value> = Vec::new();

    for param in &descriptor.parameters {
        let mut prop = schema_to_json(&param.schema);
        if let Some(desc) = &param.description
            && prop.get("description").is_none()
        {
            prop["description"] = json!(desc);
        }
        properties.insert(param.name.clone(), prop);
        if param.required {
            required.push(json!(param.name));
        }
    }

    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    schema
}

/// Reduce a declared schema to the primitives MCP clients understand.
fn schema_to_json(schema: &Value) -> Value {
    let ty = SchemaType::of(schema);
    let mut result = json!({});

    if let Some(desc) = schema.get("description").and_then(Value::as_str) {
        result["description"] = json!(desc);
    }
    if ty != SchemaType::Any {
        result["type"] = json!(ty.name());
    }
    if let Some(default) = schema.get("default") {
        result["default"] = default.clone();
    }

    match ty {
        SchemaType::String => {
            if let Some(values) = schema.get("enum").and_then(Value::as_array) {
                let values: Vec<Value> = values.iter().filter(|v| v.is_string()).cloned().collect();
                if !values.is_empty() {
                    result["enum"] = json!(values);
                }
            }
            if let Some(format) = schema.get("format").and_then(Value::as_str) {
                result["format"] = json!(format);
            }
        }
        SchemaType::Array => {
            if let Some(items) = schema.get("items") {
                result["items"] = schema_to_json(items);
            }
        }
        SchemaType::Object => {
            if let Some(props) = schema.get("properties").and_then(Value::as_object)
                && !props.is_empty()
            {
                let mapped: JsonObject = props
                    .iter()
                    .map(|(k, v)| (k.clone(), schema_to_json(v)))
                    .collect();
                result["properties"] = Value::Object(mapped);
            }
            if let Some(req) = schema.get("required").and_then(Value::as_array)
                && !req.is_empty()
            {
                result["required"] = json!(req);
            }
        }
        _ => {}
    }

    result
}

/// MCP tool annotations from HTTP method semantics.
///
/// `openWorldHint` is always `true`. Unknown methods only get `openWorldHint`; PATCH leaves
/// idempotence unset.
#[must_use]
pub fn annotations_for_method(method: &Method) -> ToolAnnotations {
    let (read_only, destructive, idempotent) = match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => (Some(true), Some(false), Some(true)),
        Method::POST => (Some(false), Some(false), Some(false)),
        Method::PUT | Method::DELETE => (Some(false), Some(true), Some(true)),
        Method::PATCH => (Some(false), Some(true), None),
        _ => (None, None, None),
    };
    ToolAnnotations {
        title: None,
        read_only_hint: read_only,
        destructive_hint: destructive,
        idempotent_hint: idempotent,
        open_world_hint: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParameterDescriptor;

    fn op(id: Option<&str>, method: Method, path: &str) -> OperationDescriptor {
        OperationDescriptor {
            operation_id: id.map(str::to_string),
            method,
            path: path.to_string(),
            summary: None,
            description: None,
            parameters: Vec::new(),
            body_mode: None,
            response_shape: None,
        }
    }

    fn param(name: &str, location: ParamLocation, required: bool, schema: Value) -> ParameterDescriptor {
        ParameterDescriptor {
            name: name.to_string(),
            location,
            required,
            schema,
            description: None,
        }
    }

    #[test]
    fn test_generate_canonical_name() {
        assert_eq!(generate_canonical_name("get", "/hosts/{id}"), "get_hosts_id");
        assert_eq!(generate_canonical_name("post", "/api/v1/beacons"), "post_api_v1_beacons");
        assert_eq!(
            generate_canonical_name("GET", "/user/{user-name}/repos"),
            "get_user_user_name_repos"
        );
        assert_eq!(generate_canonical_name("get", &format!("/{}", "a".repeat(100))).len(), 64);
    }

    #[test]
    fn distinct_operation_ids_give_unique_names() {
        let catalog = synthesize(&[
            op(Some("listHosts"), Method::GET, "/hosts"),
            op(Some("createHost"), Method::POST, "/hosts"),
            op(Some("get host!"), Method::GET, "/hosts/{id}"),
            op(None, Method::DELETE, "/hosts/{id}"),
        ])
        .expect("synthesize");
        assert_eq!(
            catalog.names(),
            vec!["listHosts", "createHost", "get_host", "delete_hosts_id"]
        );
    }

    #[test]
    fn colliding_names_get_method_suffix() {
        let catalog = synthesize(&[
            op(Some("hosts"), Method::GET, "/hosts"),
            op(Some("hosts"), Method::POST, "/hosts"),
            op(Some("other"), Method::GET, "/other"),
        ])
        .expect("synthesize");
        assert_eq!(catalog.names(), vec!["hosts_get", "hosts_post", "other"]);
        assert_eq!(catalog.get("hosts_post").expect("tool").template.method, Method::POST);
    }

    #[test]
    fn unresolvable_collision_is_catalog_conflict() {
        // Same id and method on two paths: the suffix cannot separate them.
        let err = synthesize(&[
            op(Some("hosts"), Method::GET, "/hosts"),
            op(Some("hosts"), Method::GET, "/v2/hosts"),
        ])
        .expect_err("conflict");
        assert!(matches!(err, BridgeError::CatalogConflict(_)), "{err}");

        assert!(err.to_string().contains("/v2/hosts"), "{err}");
    }

    #[test]
    fn names_equal_after_sanitizing_are_numbered() {
        let catalog = synthesize(&[
            op(Some("hosts.list"), Method::GET, "/a"),
            op(Some("hosts_list"), Method::GET, "/b"),
        ])
        .expect("synthesize");
        assert_eq!(catalog.names(), vec!["hosts_list_get", "hosts_list_get_1"]);
        assert_eq!(catalog.get("hosts_list_get_1").expect("tool").template.path, "/b");

        let long_a = format!("{}a", "x".repeat(70));
        let long_b = format!("{}b", "x".repeat(70));
        let catalog = synthesize(&[
            op(Some(&long_a), Method::GET, "/a"),
            op(Some(&long_b), Method::GET, "/b"),
        ])
        .expect("synthesize");
        let names = catalog.names();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names.iter().all(|n| n.len() <= MAX_TOOL_NAME_LEN), "{names:?}");
        assert!(names[1].ends_with("_1"), "{names:?}");

        // A method-suffixed name landing on another id's name is numbered too.
        let catalog = synthesize(&[
            op(Some("hosts"), Method::GET, "/hosts"),
            op(Some("hosts"), Method::POST, "/hosts"),
            op(Some("hosts_get"), Method::GET, "/legacy"),
        ])
        .expect("synthesize");
        assert_eq!(catalog.names(), vec!["hosts_get", "hosts_post", "hosts_get_1"]);
    }

    #[test]
    fn maps_declared_types_and_degrades_unknown_ones() {
        assert_eq!(SchemaType::of(&json!({"type": "integer"})), SchemaType::Integer);
        assert_eq!(SchemaType::of(&json!({"type": ["null", "number"]})), SchemaType::Number);
        assert_eq!(SchemaType::of(&json!({"properties": {}})), SchemaType::Object);
        assert_eq!(SchemaType::of(&json!({"type": "file"})), SchemaType::Any);
        assert_eq!(SchemaType::of(&json!({})), SchemaType::Any);

        assert!(SchemaType::Integer.accepts(&json!(42)));
        assert!(SchemaType::Integer.accepts(&json!(42.0)));
        assert!(!SchemaType::Integer.accepts(&json!(4.2)));
        assert!(!SchemaType::String.accepts(&json!(42)));
        assert!(SchemaType::Any.accepts(&json!([1, "x"])));
    }

    #[test]
    fn input_schema_mirrors_parameters() {
        let mut descriptor = op(Some("createHost"), Method::POST, "/hosts/{group}");
        descriptor.summary = Some("Create a host".to_string());
        descriptor.body_mode = Some(BodyMode::Fields);
        descriptor.parameters = vec![
            param("group", ParamLocation::Path, true, json!({"type": "string"})),
            param(
                "os",
                ParamLocation::Query,
                false,
                json!({"type": "string", "enum": ["linux", "windows"]}),
            ),
            param("tags", ParamLocation::Body, false, json!({"type": "array", "items": {"type": "string"}})),
            param("blob", ParamLocation::Body, false, json!({"type": "binary-ish"})),
        ];

        let catalog = synthesize(&[descriptor]).expect("synthesize");
        let tool = catalog.get("createHost").expect("tool");
        let schema = Value::Object((*tool.input_schema).clone());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["group"]));
        assert_eq!(schema["properties"]["os"]["enum"], json!(["linux", "windows"]));
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(schema["properties"]["blob"], json!({}));
        assert!(tool.description.starts_with("Create a host\n\nPath: POST /hosts/{group}"));

        let mcp_tool = tool.to_tool();
        let annotations = mcp_tool.annotations.expect("annotations");
        assert_eq!(annotations.title.as_deref(), Some("Create a host"));
        assert_eq!(annotations.destructive_hint, Some(false));
    }

    #[test]
    fn shared_catalog_swaps_whole_catalog() {
        let shared = SharedCatalog::new(synthesize(&[op(Some("a"), Method::GET, "/a")]).expect("a"));
        let before = shared.snapshot();
        let old = shared.replace(synthesize(&[op(Some("b"), Method::GET, "/b")]).expect("b"));
        assert!(Arc::ptr_eq(&before, &old));
        assert_eq!(before.names(), vec!["a"]);
        assert_eq!(shared.snapshot().names(), vec!["b"]);
    }

    #[test]
    fn annotations_follow_method_semantics() {
        let get = annotations_for_method(&Method::GET);
        assert_eq!(get.read_only_hint, Some(true));
        assert_eq!(get.idempotent_hint, Some(true));

        let patch = annotations_for_method(&Method::PATCH);
        assert_eq!(patch.destructive_hint, Some(true));
        assert_eq!(patch.idempotent_hint, None);

        let custom: Method = "PROPFIND".parse().expect("valid method token");
        let a = annotations_for_method(&custom);
        assert_eq!(a.read_only_hint, None);
        assert_eq!(a.open_world_hint, Some(true));
    }
}
