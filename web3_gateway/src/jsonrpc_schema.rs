//! Optional shape-checking of requests and responses against an OpenRPC
//! document. Each method's params/result schemas are compiled once at
//! startup; methods missing from the document are never checked.

use anyhow::Context;
use itertools::Itertools;
use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::jsonrpc::RawRpc;

const SCHEMA_DOC_URL: &str =
    "https://playground.open-rpc.org/?schemaUrl=https://raw.githubusercontent.com/ethereum/execution-apis/assembled-spec/openrpc.json";

#[derive(Deserialize)]
struct OpenRpcDocument {
    #[serde(default)]
    methods: Vec<OpenRpcMethod>,
}

#[derive(Deserialize)]
struct OpenRpcMethod {
    name: String,
    #[serde(default)]
    params: Vec<OpenRpcParam>,
    result: Option<OpenRpcResult>,
}

#[derive(Deserialize)]
struct OpenRpcParam {
    #[serde(default)]
    schema: Value,
}

#[derive(Deserialize)]
struct OpenRpcResult {
    #[serde(default)]
    schema: Value,
}

struct SchemaViolation {
    path: String,
    description: String,
    invalid_type: bool,
}

pub struct JsonRpcSchema {
    requests: hashbrown::HashMap<String, JSONSchema>,
    responses: hashbrown::HashMap<String, JSONSchema>,
    /// uncompiled response schemas, consulted by the revise pass
    response_docs: hashbrown::HashMap<String, Value>,
    revise: bool,
}

impl JsonRpcSchema {
    pub fn new(document: &[u8], revise: bool) -> anyhow::Result<Self> {
        let mut schema = Self {
            requests: Default::default(),
            responses: Default::default(),
            response_docs: Default::default(),
            revise,
        };

        if document.is_empty() {
            return Ok(schema);
        }

        let document: OpenRpcDocument =
            serde_json::from_slice(document).context("parsing OpenRPC document")?;

        for method in document.methods {
            let params: Vec<Value> = method.params.iter().map(|p| p.schema.clone()).collect();

            let request = json!({
                "type": "object",
                "properties": {
                    "jsonrpc": {"type": "string", "enum": ["2.0"]},
                    "method": {"type": "string", "enum": [method.name]},
                    "params": {"type": "array", "items": params},
                    "id": {"type": ["integer", "string"]},
                },
                "required": ["jsonrpc", "method", "params", "id"],
            });

            let error = json!({
                "type": "object",
                "properties": {
                    "code": {"type": "integer"},
                    "message": {"type": "string"},
                    "data": {"type": "object"},
                },
                "required": ["code", "message"],
            });

            let response = json!({
                "type": "object",
                "properties": {
                    "jsonrpc": {"type": "string", "enum": ["2.0"]},
                    "result": method.result.as_ref().map(|r| r.schema.clone()).unwrap_or(json!({})),
                    "error": error,
                    "id": {"type": ["integer", "string", "null"]},
                },
                "oneOf": [
                    {"required": ["jsonrpc", "id", "result"]},
                    {"required": ["error"]},
                ],
            });

            if let Ok(compiled) = JSONSchema::compile(&request) {
                schema.requests.insert(method.name.clone(), compiled);
            }
            if let Ok(compiled) = JSONSchema::compile(&response) {
                schema.responses.insert(method.name.clone(), compiled);
            }
            schema.response_docs.insert(method.name.clone(), response);
        }

        Ok(schema)
    }

    pub fn validate_request(&self, method: &str, raw: &RawRpc) -> Result<(), String> {
        let Some(schema) = self.requests.get(method) else {
            return Ok(());
        };

        let violations = collect_violations(schema, &Value::Object(raw.clone()));
        if violations.is_empty() {
            return Ok(());
        }

        let descriptions = violations
            .iter()
            .map(|v| format!("'{}' {}", v.path, v.description))
            .join("; ");

        Err(format!(
            "{}: {}. please read the schema document: {}",
            method, descriptions, SCHEMA_DOC_URL
        ))
    }

    pub fn validate_response(&self, method: &str, raw: &mut RawRpc) -> Result<(), String> {
        let Some(schema) = self.responses.get(method) else {
            return Ok(());
        };

        let violations = collect_violations(schema, &Value::Object(raw.clone()));
        if violations.is_empty() {
            return Ok(());
        }

        let remaining: Vec<&SchemaViolation> = if self.revise {
            violations
                .iter()
                .filter(|v| !self.try_coerce(method, v, raw))
                .collect()
        } else {
            violations.iter().collect()
        };

        if remaining.is_empty() {
            return Ok(());
        }

        let descriptions = remaining
            .iter()
            .map(|v| format!("'{}' {}", v.path, v.description))
            .join("; ");

        Err(format!("{} result validate failed: {}", method, descriptions))
    }

    /// Revise mode: rewrite a mistyped top-level scalar field to its declared
    /// type. Only `invalid_type` violations are touched.
    fn try_coerce(&self, method: &str, violation: &SchemaViolation, raw: &mut RawRpc) -> bool {
        if !violation.invalid_type {
            return false;
        }

        let Some(field) = violation
            .path
            .strip_prefix('/')
            .filter(|f| !f.is_empty() && !f.contains('/'))
        else {
            return false;
        };

        let Some(expected) = self
            .response_docs
            .get(method)
            .and_then(|doc| doc.get("properties"))
            .and_then(|props| props.get(field))
            .and_then(|schema| schema.get("type"))
            .and_then(Value::as_str)
        else {
            return false;
        };

        let Some(current) = raw.get(field) else {
            return false;
        };

        let coerced = match expected {
            "string" => match current {
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            "integer" => match current {
                Value::Number(_) => None,
                Value::String(s) => s.parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            "null" => Some(Value::Null),
            _ => None,
        };

        match coerced {
            Some(value) => {
                raw.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }
}

fn collect_violations(schema: &JSONSchema, instance: &Value) -> Vec<SchemaViolation> {
    match schema.validate(instance) {
        Ok(()) => vec![],
        Err(errors) => errors
            .map(|err| SchemaViolation {
                path: err.instance_path.to_string(),
                description: err.to_string(),
                invalid_type: matches!(err.kind, ValidationErrorKind::Type { .. }),
            })
            .collect(),
    }
}
