//! The `ResourceList` wire format exchanged with functions.
//!
//! Input: one YAML document wrapping the in-scope resources and an optional
//! `functionConfig`. Source identity (`path`, `index`, `id`) is injected as
//! `config.kubernetes.io/*` annotations on the way out and stripped again
//! on the way in. Output may additionally carry `results`, including two
//! legacy shapes: a `results.items` wrapper, and `resourceRef` with nested
//! `metadata` instead of flat fields.

use serde_yaml::{Mapping, Sequence, Value};

use crate::error::{Error, Result};
use crate::resource::{
    self, ResourceNode, ID_ANNOTATION, INDEX_ANNOTATION, PATH_ANNOTATION,
};
use crate::results::{PathRef, ResourceRef, ResultItem, Severity};

pub const API_VERSION: &str = "config.kubernetes.io/v1";
pub const KIND: &str = "ResourceList";

/// Parsed function output.
#[derive(Debug, Default)]
pub struct FnOutput {
    pub items: Vec<ResourceNode>,
    pub results: Vec<ResultItem>,
}

/// Serialise the input document for one invocation.
pub fn wrap(items: &[ResourceNode], fn_config: Option<&Mapping>) -> Result<String> {
    let mut wire_items = Sequence::with_capacity(items.len());
    for node in items {
        let mut value = node.mapping().clone();
        let metadata = resource::ensure_map(&mut value, "metadata");
        let annotations = resource::ensure_map(metadata, "annotations");
        annotations.insert(
            Value::String(PATH_ANNOTATION.to_string()),
            Value::String(node.path.clone()),
        );
        annotations.insert(
            Value::String(INDEX_ANNOTATION.to_string()),
            Value::String(node.index.to_string()),
        );
        if let Some(id) = node.id {
            annotations.insert(
                Value::String(ID_ANNOTATION.to_string()),
                Value::String(id.to_string()),
            );
        }
        wire_items.push(Value::Mapping(value));
    }

    let mut root = Mapping::new();
    root.insert(
        Value::String("apiVersion".to_string()),
        Value::String(API_VERSION.to_string()),
    );
    root.insert(
        Value::String("kind".to_string()),
        Value::String(KIND.to_string()),
    );
    root.insert(
        Value::String("items".to_string()),
        Value::Sequence(wire_items),
    );
    if let Some(config) = fn_config {
        root.insert(
            Value::String("functionConfig".to_string()),
            Value::Mapping(config.clone()),
        );
    }
    Ok(serde_yaml::to_string(&root)?)
}

/// Parse the output document of one invocation. `function` tags protocol
/// errors with the function's identity.
pub fn unwrap(text: &str, function: &str) -> Result<FnOutput> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| {
        Error::protocol(function, format!("output is not valid YAML: {}", e))
    })?;
    let root = match value {
        Value::Mapping(m) => m,
        _ => {
            return Err(Error::protocol(
                function,
                "output is not a ResourceList document",
            ))
        }
    };

    if let Some(kind) = resource::get_str(&root, "kind") {
        if kind != KIND {
            return Err(Error::protocol(
                function,
                format!("output kind is {:?}, expected {:?}", kind, KIND),
            ));
        }
    }

    let mut items = Vec::new();
    if let Some(Value::Sequence(seq)) = resource::get(&root, "items") {
        for item in seq {
            let mut node = ResourceNode::from_value(item.clone())
                .map_err(|e| Error::protocol(function, e.to_string()))?;
            node.path = node
                .annotation(PATH_ANNOTATION)
                .unwrap_or_default()
                .to_string();
            node.index = match node.annotation(INDEX_ANNOTATION) {
                Some(raw) => raw.parse().map_err(|_| {
                    Error::protocol(function, format!("invalid index annotation {:?}", raw))
                })?,
                None => 0,
            };
            node.id = match node.annotation(ID_ANNOTATION) {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    Error::protocol(function, format!("invalid id annotation {:?}", raw))
                })?),
                None => None,
            };
            node.remove_annotation(PATH_ANNOTATION);
            node.remove_annotation(INDEX_ANNOTATION);
            node.remove_annotation(ID_ANNOTATION);
            items.push(node);
        }
    }

    Ok(FnOutput {
        items,
        results: parse_results(&root),
    })
}

fn parse_results(root: &Mapping) -> Vec<ResultItem> {
    let raw = match resource::get(root, "results") {
        Some(Value::Sequence(seq)) => seq.clone(),
        // Legacy: results wrapped in an object with an `items` list.
        Some(Value::Mapping(m)) => match resource::get(m, "items") {
            Some(Value::Sequence(seq)) => seq.clone(),
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    raw.iter()
        .filter_map(|item| match item {
            Value::Mapping(m) => Some(parse_result_item(m)),
            _ => None,
        })
        .collect()
}

fn parse_result_item(m: &Mapping) -> ResultItem {
    ResultItem {
        message: resource::get_str(m, "message").unwrap_or_default().to_string(),
        severity: Severity::from_wire(resource::get_str(m, "severity").unwrap_or_default()),
        resource_ref: resource::get_map(m, "resourceRef").map(parse_resource_ref),
        field: resource::get_map(m, "field").map(parse_path_ref),
        file: resource::get_map(m, "file").map(parse_path_ref),
    }
}

/// Accept both the flat shape and the legacy nested-`metadata` shape.
fn parse_resource_ref(m: &Mapping) -> ResourceRef {
    let (name, namespace) = match resource::get_map(m, "metadata") {
        Some(metadata) => (
            resource::get_str(metadata, "name").unwrap_or_default(),
            resource::get_str(metadata, "namespace").unwrap_or_default(),
        ),
        None => (
            resource::get_str(m, "name").unwrap_or_default(),
            resource::get_str(m, "namespace").unwrap_or_default(),
        ),
    };
    ResourceRef {
        api_version: resource::get_str(m, "apiVersion").unwrap_or_default().to_string(),
        kind: resource::get_str(m, "kind").unwrap_or_default().to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

fn parse_path_ref(m: &Mapping) -> PathRef {
    PathRef {
        path: resource::get_str(m, "path").unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(yaml: &str, path: &str, index: usize, id: u64) -> ResourceNode {
        let mut n = ResourceNode::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap();
        n.path = path.to_string();
        n.index = index;
        n.id = Some(id);
        n
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let nodes = vec![
            node("kind: ConfigMap\nmetadata:\n  name: a\n", "cm.yaml", 0, 0),
            node("kind: Service\nmetadata:\n  name: b\n", "svc.yaml", 1, 1),
        ];
        let wire = wrap(&nodes, None).unwrap();
        assert!(wire.contains("kind: ResourceList"));
        assert!(wire.contains(PATH_ANNOTATION));

        let out = unwrap(&wire, "test-fn").unwrap();
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[0].path, "cm.yaml");
        assert_eq!(out.items[1].index, 1);
        assert_eq!(out.items[1].id, Some(1));
        // Wire annotations must not leak into the parsed node.
        assert_eq!(out.items[0].annotation(PATH_ANNOTATION), None);
        assert_eq!(out.items[0].annotation(ID_ANNOTATION), None);
    }

    #[test]
    fn test_function_config_included() {
        let config: Mapping =
            serde_yaml::from_str("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: function-input\n")
                .unwrap();
        let wire = wrap(&[], Some(&config)).unwrap();
        assert!(wire.contains("functionConfig:"));
        assert!(wire.contains("function-input"));
    }

    #[test]
    fn test_results_parsed() {
        let text = r#"
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items: []
results:
  - message: field is deprecated
    severity: warning
    resourceRef:
      apiVersion: apps/v1
      kind: Deployment
      name: web
      namespace: prod
    field:
      path: spec.template
    file:
      path: deploy.yaml
"#;
        let out = unwrap(text, "test-fn").unwrap();
        assert_eq!(out.results.len(), 1);
        let item = &out.results[0];
        assert_eq!(item.severity, Severity::Warning);
        assert_eq!(item.resource_ref.as_ref().unwrap().name, "web");
        assert_eq!(item.field.as_ref().unwrap().path, "spec.template");
    }

    #[test]
    fn test_legacy_results_wrapper_and_nested_ref() {
        let text = r#"
kind: ResourceList
items: []
results:
  items:
    - message: bad name
      severity: error
      resourceRef:
        apiVersion: v1
        kind: Service
        metadata:
          name: web
          namespace: prod
"#;
        let out = unwrap(text, "test-fn").unwrap();
        assert_eq!(out.results.len(), 1);
        let r = out.results[0].resource_ref.as_ref().unwrap();
        assert_eq!(r.name, "web");
        assert_eq!(r.namespace, "prod");
        assert_eq!(r.kind, "Service");
    }

    #[test]
    fn test_unparseable_output_is_protocol_error() {
        let err = unwrap(": not yaml {", "my-fn").unwrap_err();
        assert!(err.to_string().contains("my-fn"));

        let err = unwrap("kind: Deployment\n", "my-fn").unwrap_err();
        assert!(err.to_string().contains("expected"));
    }
}
