use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::model::{BuildFormat, Operation, TransformedFile, API_TYPE_REST};

fn file_name(slug: &str, format: BuildFormat) -> String {
    format!("{}.{}", slug, format.as_str())
}

fn rest_document(title: &str, version: &str, operations: &[&Operation]) -> Value {
    let mut paths: Map<String, Value> = Map::new();
    for op in operations {
        let path = op.path.clone().unwrap_or_else(|| "/".to_string());
        let method = op.method.clone().unwrap_or_else(|| "get".to_string()).to_lowercase();
        let mut body = match &op.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert("operationId".to_string(), json!(op.operation_id));
        if !op.title.is_empty() {
            body.entry("summary").or_insert_with(|| json!(op.title));
        }
        if !op.tags.is_empty() {
            body.entry("tags").or_insert_with(|| json!(op.tags));
        }
        if op.deprecated {
            body.insert("deprecated".to_string(), json!(true));
        }
        if let Value::Object(methods) = paths.entry(path).or_insert_with(|| json!({})) {
            methods.insert(method, Value::Object(body));
        }
    }
    json!({
        "openapi": "3.0.0",
        "info": { "title": title, "version": version },
        "paths": paths,
    })
}

fn graphql_document(title: &str, version: &str, operations: &[&Operation]) -> Value {
    let definitions: Vec<Value> = operations
        .iter()
        .map(|op| {
            json!({
                "operationId": op.operation_id,
                "type": op.op_type,
                "definition": op.data,
            })
        })
        .collect();
    json!({
        "graphql": "1.0",
        "info": { "title": title, "version": version },
        "operations": definitions,
    })
}

fn document_for(api_type: &str, title: &str, version: &str, operations: &[&Operation]) -> Value {
    if api_type == API_TYPE_REST {
        rest_document(title, version, operations)
    } else {
        graphql_document(title, version, operations)
    }
}

/// Slugs for reduced documents, one per operation and unique within the
/// set. An operation id shared by several packages of a dashboard group is
/// qualified with its package id, then numbered if it still repeats.
fn reduced_slugs(operations: &[Operation]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for op in operations {
        *counts.entry(op.operation_id.as_str()).or_default() += 1;
    }
    let mut taken: HashSet<String> = HashSet::new();
    operations
        .iter()
        .map(|op| {
            let base = if counts[op.operation_id.as_str()] > 1 {
                format!("{}-{}", op.operation_id, op.package_id.replace('.', "-"))
            } else {
                op.operation_id.clone()
            };
            let mut slug = base.clone();
            let mut n = 1;
            while !taken.insert(slug.clone()) {
                n += 1;
                slug = format!("{}-{}", base, n);
            }
            slug
        })
        .collect()
}

/// One reduced document per operation, holding only that operation.
pub fn reduced_documents(version: &str, operations: &[Operation], format: BuildFormat) -> Result<Vec<TransformedFile>> {
    operations
        .iter()
        .zip(reduced_slugs(operations))
        .map(|(op, slug)| {
            let title = if op.title.is_empty() {
                op.operation_id.clone()
            } else {
                op.title.clone()
            };
            let value = document_for(&op.api_type, &title, version, &[op]);
            Ok(TransformedFile {
                file_id: file_name(&slug, format),
                slug,
                title,
                format: format.as_str().to_string(),
                operation_ids: vec![op.operation_id.clone()],
                data: render(&value, format)?,
            })
        })
        .collect()
}

/// All operations merged into a single document named after the group.
pub fn merged_document(
    group_name: &str,
    api_type: &str,
    version: &str,
    operations: &[Operation],
    format: BuildFormat,
) -> Result<TransformedFile> {
    let refs: Vec<&Operation> = operations.iter().collect();
    let value = document_for(api_type, group_name, version, &refs);
    Ok(TransformedFile {
        file_id: file_name(group_name, format),
        slug: group_name.to_string(),
        title: group_name.to_string(),
        format: format.as_str().to_string(),
        operation_ids: operations.iter().map(|op| op.operation_id.clone()).collect(),
        data: render(&value, format)?,
    })
}

pub fn render(value: &Value, format: BuildFormat) -> Result<Vec<u8>> {
    match format {
        BuildFormat::Json => serde_json::to_vec_pretty(value).context("Failed to render JSON"),
        BuildFormat::Yaml => serde_yaml::to_string(value)
            .map(String::into_bytes)
            .context("Failed to render YAML"),
        BuildFormat::Html => {
            let body = serde_json::to_string_pretty(value).context("Failed to render HTML body")?;
            let title = value
                .pointer("/info/title")
                .and_then(Value::as_str)
                .unwrap_or("API");
            Ok(format!(
                "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n<pre>{}</pre>\n</body>\n</html>\n",
                escape_html(title),
                escape_html(&body)
            )
            .into_bytes())
        }
    }
}

/// Re-render a stored document in another format. Content that cannot be
/// parsed as JSON or YAML is returned unchanged.
pub fn convert_document(data: &[u8], format: BuildFormat) -> Result<Vec<u8>> {
    let parsed: Option<Value> = serde_json::from_slice(data)
        .ok()
        .or_else(|| serde_yaml::from_slice(data).ok())
        .filter(|v: &Value| v.is_object() || v.is_array());
    match parsed {
        Some(value) => render(&value, format),
        None => Ok(data.to_vec()),
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewOperation;

    fn op(id: &str, method: &str, path: &str) -> Operation {
        serde_json::from_value::<NewOperation>(json!({
            "operationId": id,
            "title": id,
            "method": method,
            "path": path,
            "data": { "responses": { "200": { "description": "ok" } } }
        }))
        .unwrap()
        .into_operation("acme.pay.gw", "2025.1", 1)
    }

    #[test]
    fn test_reduced_documents_hold_one_operation_each() {
        let ops = vec![op("get-users", "GET", "/users"), op("post-users", "post", "/users")];
        let files = reduced_documents("2025.1@1", &ops, BuildFormat::Json).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_id, "get-users.json");
        let doc: Value = serde_json::from_slice(&files[0].data).unwrap();
        assert_eq!(doc["paths"]["/users"]["get"]["operationId"], "get-users");
        assert!(doc["paths"]["/users"].get("post").is_none());
    }

    #[test]
    fn test_reduced_documents_keep_shared_operation_ids_apart() {
        let mut users = op("get-users", "get", "/users");
        users.package_id = "acme.pay.users".to_string();
        let mut legacy = op("get-users", "get", "/v1/users");
        legacy.package_id = "acme.pay.legacy".to_string();
        let mut legacy_next = legacy.clone();
        legacy_next.version = "2025.2".to_string();
        let ops = vec![users, legacy, legacy_next, op("post-users", "post", "/users")];

        let files = reduced_documents("2025.1@1", &ops, BuildFormat::Yaml).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "get-users-acme-pay-users.yaml",
                "get-users-acme-pay-legacy.yaml",
                "get-users-acme-pay-legacy-2.yaml",
                "post-users.yaml",
            ]
        );
        let doc: Value = serde_yaml::from_slice(&files[1].data).unwrap();
        assert_eq!(doc["paths"]["/v1/users"]["get"]["operationId"], "get-users");
    }

    #[test]
    fn test_merged_document_in_yaml() {
        let ops = vec![op("get-users", "get", "/users"), op("post-users", "post", "/users")];
        let file = merged_document("users", "rest", "2025.1@1", &ops, BuildFormat::Yaml).unwrap();
        assert_eq!(file.file_id, "users.yaml");
        assert_eq!(file.operation_ids, vec!["get-users", "post-users"]);
        let doc: Value = serde_yaml::from_slice(&file.data).unwrap();
        assert_eq!(doc["paths"]["/users"]["post"]["operationId"], "post-users");
    }

    #[test]
    fn test_convert_document() {
        let yaml = convert_document(br#"{"openapi":"3.0.0"}"#, BuildFormat::Yaml).unwrap();
        assert!(String::from_utf8(yaml).unwrap().contains("openapi:"));
        let html = convert_document(br#"{"info":{"title":"<Pay>"}}"#, BuildFormat::Html).unwrap();
        assert!(String::from_utf8(html).unwrap().contains("<title>&lt;Pay&gt;</title>"));
        assert_eq!(convert_document(b"plain text", BuildFormat::Json).unwrap(), b"plain text".to_vec());
    }
}
