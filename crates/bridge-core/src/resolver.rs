//! Local `$ref` resolution over the fetched API description.
//!
//! The `openapiv3` crate models `$ref`s using `ReferenceOr<T>` but does not resolve them. The
//! remote document is a single JSON/YAML body, so only same-document refs (`#/...`) are
//! supported; anything else makes the referencing operation malformed.

use openapiv3::ReferenceOr;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefError {
    #[error("external reference '{0}' is not supported")]
    External(String),
    #[error("unresolvable reference '{0}'")]
    Missing(String),
    #[error("reference loop through '{0}'")]
    Loop(String),
    #[error("reference '{reference}' does not point to a valid object: {message}")]
    Invalid { reference: String, message: String },
}

/// Resolves `#/...` JSON pointers against the root document.
#[derive(Debug, Clone, Copy)]
pub struct RefResolver<'a> {
    root: &'a Value,
}

impl<'a> RefResolver<'a> {
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Follow a chain of `$ref`s until it reaches a non-reference value.
    ///
    /// # Errors
    ///
    /// Returns an error for external refs, dangling pointers, or a chain that loops.
    pub fn follow(&self, reference: &str) -> Result<&'a Value, RefError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current: &str = reference;
        loop {
            if !seen.insert(current) {
                return Err(RefError::Loop(reference.to_string()));
            }
            let Some(pointer) = current.strip_prefix('#') else {
                return Err(RefError::External(current.to_string()));
            };
            let target = self
                .root
                .pointer(pointer)
                .ok_or_else(|| RefError::Missing(current.to_string()))?;
            match ref_of(target) {
                Some(next) => current = next,
                None => return Ok(target),
            }
        }
    }

    /// Resolve a value that may itself be a `$ref` object.
    ///
    /// # Errors
    ///
    /// See [`Self::follow`].
    pub fn resolve_value<'v>(&self, value: &'v Value) -> Result<&'v Value, RefError>
    where
        'a: 'v,
    {
        match ref_of(value) {
            Some(reference) => self.follow(reference),
            None => Ok(value),
        }
    }

    /// Resolve an `openapiv3` `ReferenceOr<T>` into an owned `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be followed or the target does not deserialize
    /// as `T`.
    pub fn resolve_reference_or<T>(&self, r: &ReferenceOr<T>) -> Result<T, RefError>
    where
        T: Clone + DeserializeOwned,
    {
        match r {
            ReferenceOr::Item(item) => Ok(item.clone()),
            ReferenceOr::Reference { reference } => {
                let target = self.follow(reference)?;
                serde_json::from_value(target.clone()).map_err(|e| RefError::Invalid {
                    reference: reference.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Copy a schema with every `$ref` replaced by its target.
    ///
    /// A ref that recurses into a schema already being inlined is cut and replaced by an
    /// untyped schema (`{}`).
    ///
    /// # Errors
    ///
    /// Returns an error for external or dangling refs anywhere in the schema tree.
    pub fn inline_schema(&self, schema: &Value) -> Result<Value, RefError> {
        let mut stack: Vec<String> = Vec::new();
        self.inline_inner(schema, &mut stack)
    }

    fn inline_inner(&self, schema: &Value, stack: &mut Vec<String>) -> Result<Value, RefError> {
        if let Some(reference) = ref_of(schema) {
            if stack.iter().any(|r| r == reference) {
                return Ok(Value::Object(Map::new()));
            }
            let target = self.follow(reference)?;
            stack.push(reference.to_string());
            let out = self.inline_inner(target, stack);
            stack.pop();
            return out;
        }

        match schema {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let inlined = match key.as_str() {
                        // Keys whose values are schemas or maps/lists of schemas.
                        "items" | "additionalProperties" | "not" => {
                            self.inline_inner(value, stack)?
                        }
                        "properties" => match value {
                            Value::Object(props) => {
                                let mut inlined_props = Map::with_capacity(props.len());
                                for (name, prop) in props {
                                    inlined_props
                                        .insert(name.clone(), self.inline_inner(prop, stack)?);
                                }
                                Value::Object(inlined_props)
                            }
                            other => other.clone(),
                        },
                        "allOf" | "oneOf" | "anyOf" => match value {
                            Value::Array(items) => Value::Array(
                                items
                                    .iter()
                                    .map(|s| self.inline_inner(s, stack))
                                    .collect::<Result<Vec<_>, _>>()?,
                            ),
                            other => other.clone(),
                        },
                        _ => value.clone(),
                    };
                    out.insert(key.clone(), inlined);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn ref_of(value: &Value) -> Option<&str> {
    value.get("$ref").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openapiv3::Parameter;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "components": {
                "parameters": {
                    "HostId": { "name": "id", "in": "path", "required": true, "schema": { "type": "string" } },
                    "Alias": { "$ref": "#/components/parameters/HostId" }
                },
                "schemas": {
                    "Node": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "children": { "type": "array", "items": { "$ref": "#/components/schemas/Node" } }
                        }
                    },
                    "Ping": { "$ref": "#/components/schemas/Pong" },
                    "Pong": { "$ref": "#/components/schemas/Ping" }
                }
            }
        })
    }

    #[test]
    fn resolves_parameter_through_alias_chain() {
        let root = doc();
        let resolver = RefResolver::new(&root);
        let r: ReferenceOr<Parameter> = ReferenceOr::Reference {
            reference: "#/components/parameters/Alias".to_string(),
        };
        let param = resolver.resolve_reference_or(&r).expect("resolve");
        assert_eq!(param.parameter_data_ref().name, "id");
    }

    #[test]
    fn reports_missing_external_and_looping_refs() {
        let root = doc();
        let resolver = RefResolver::new(&root);
        assert!(matches!(
            resolver.follow("#/components/schemas/Nope"),
            Err(RefError::Missing(_))
        ));
        assert!(matches!(
            resolver.follow("common.yaml#/components/schemas/X"),
            Err(RefError::External(_))
        ));
        assert!(matches!(
            resolver.follow("#/components/schemas/Ping"),
            Err(RefError::Loop(_))
        ));
    }

    #[test]
    fn inline_schema_cuts_recursion_with_untyped_schema() {
        let root = doc();
        let resolver = RefResolver::new(&root);
        let inlined = resolver
            .inline_schema(&json!({ "$ref": "#/components/schemas/Node" }))
            .expect("inline");
        assert_eq!(inlined["properties"]["name"]["type"], "string");
        assert_eq!(inlined["properties"]["children"]["type"], "array");
        assert_eq!(inlined["properties"]["children"]["items"], json!({}));
    }

    #[test]
    fn inline_schema_fails_on_dangling_nested_ref() {
        let root = doc();
        let resolver = RefResolver::new(&root);
        let err = resolver
            .inline_schema(&json!({
                "type": "object",
                "properties": { "x": { "$ref": "#/components/schemas/Missing" } }
            }))
            .expect_err("dangling");
        assert!(matches!(err, RefError::Missing(_)));
    }
}
