//! In-memory KRM resource nodes.
//!
//! A [`ResourceNode`] is one parsed YAML document plus its source identity:
//! the package-relative file path, the index within that file, and the
//! comment block that preceded it. The YAML mapping itself is
//! insertion-ordered, so field order survives a parse/serialise round trip.
//!
//! Source identity travels as `config.kubernetes.io/*` annotations only on
//! the function wire format; in memory it lives in plain struct fields so
//! value comparisons and comment re-association stay exact.

pub mod reader;
pub mod writer;

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Annotation carrying the package-relative source file path.
pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";
/// Annotation carrying the zero-based index within the source file.
pub const INDEX_ANNOTATION: &str = "config.kubernetes.io/index";
/// Transient annotation used for comment re-association across a function
/// invocation; never written to disk.
pub const ID_ANNOTATION: &str = "config.kubernetes.io/id";

/// One KRM resource with preserved source identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    value: Mapping,
    /// Slash-separated file path, relative to the package root.
    pub path: String,
    /// Zero-based position within the file (multi-document YAML).
    pub index: usize,
    /// Comment block preceding the document in its source file.
    pub head_comment: String,
    /// Stable per-invocation identifier, set while a function runs.
    pub id: Option<u64>,
    /// Exact source text, kept while the node is untouched so unmodified
    /// resources write back bit-identical.
    raw: Option<String>,
}

impl ResourceNode {
    pub fn new(value: Mapping) -> Self {
        ResourceNode {
            value,
            path: String::new(),
            index: 0,
            head_comment: String::new(),
            id: None,
            raw: None,
        }
    }

    /// Build a node from an arbitrary YAML value; non-mapping documents are
    /// a configuration error.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Mapping(m) => Ok(ResourceNode::new(m)),
            other => Err(Error::Config(format!(
                "expected a YAML mapping, got {}",
                value_kind(&other)
            ))),
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.value
    }

    /// Mutable access to the YAML mapping. Drops the retained source text,
    /// since the node can no longer be assumed byte-identical to its file.
    pub fn mapping_mut(&mut self) -> &mut Mapping {
        self.raw = None;
        &mut self.value
    }

    pub fn kind(&self) -> Option<&str> {
        get_str(&self.value, "kind")
    }

    pub fn api_version(&self) -> Option<&str> {
        get_str(&self.value, "apiVersion")
    }

    pub fn name(&self) -> Option<&str> {
        get_map(&self.value, "metadata").and_then(|m| get_str(m, "name"))
    }

    pub fn namespace(&self) -> Option<&str> {
        get_map(&self.value, "metadata").and_then(|m| get_str(m, "namespace"))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        get_map(&self.value, "metadata")
            .and_then(|m| get_map(m, "annotations"))
            .and_then(|a| get_str(a, key))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        get_map(&self.value, "metadata")
            .and_then(|m| get_map(m, "labels"))
            .and_then(|l| get_str(l, key))
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.raw = None;
        let metadata = ensure_map(&mut self.value, "metadata");
        let annotations = ensure_map(metadata, "annotations");
        annotations.insert(
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        );
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.raw = None;
        let metadata = ensure_map(&mut self.value, "metadata");
        let labels = ensure_map(metadata, "labels");
        labels.insert(
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        );
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.raw = None;
        let metadata = ensure_map(&mut self.value, "metadata");
        metadata.insert(
            Value::String("namespace".to_string()),
            Value::String(namespace.to_string()),
        );
    }

    pub fn remove_annotation(&mut self, key: &str) {
        self.raw = None;
        let metadata = match get_map_mut(&mut self.value, "metadata") {
            Some(m) => m,
            None => return,
        };
        let annotations = match get_map_mut(metadata, "annotations") {
            Some(a) => a,
            None => return,
        };
        annotations.remove(&Value::String(key.to_string()));
        if annotations.is_empty() {
            metadata.remove(&Value::String("annotations".to_string()));
        }
    }

    /// Short human-readable identity, e.g. `v1/ConfigMap/default/app-config`.
    pub fn display_id(&self) -> String {
        [
            self.api_version().unwrap_or(""),
            self.kind().unwrap_or(""),
            self.namespace().unwrap_or(""),
            self.name().unwrap_or(""),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/")
    }

    /// JSON view of the resource content, used by the conditional gate.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.value)
            .map_err(|e| Error::Config(format!("resource is not JSON-representable: {}", e)))
    }

    /// True when another node carries identical YAML content.
    pub fn same_content(&self, other: &ResourceNode) -> bool {
        self.value == other.value
    }

    pub fn source_text(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub(crate) fn set_source_text(&mut self, raw: String) {
        self.raw = Some(raw);
    }

    pub(crate) fn carry_source_text(&mut self, from: &ResourceNode) {
        self.raw = from.raw.clone();
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

pub(crate) fn get<'a>(m: &'a Mapping, key: &str) -> Option<&'a Value> {
    m.get(&Value::String(key.to_string()))
}

pub(crate) fn get_str<'a>(m: &'a Mapping, key: &str) -> Option<&'a str> {
    match get(m, key) {
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

pub(crate) fn get_map<'a>(m: &'a Mapping, key: &str) -> Option<&'a Mapping> {
    match get(m, key) {
        Some(Value::Mapping(inner)) => Some(inner),
        _ => None,
    }
}

pub(crate) fn get_map_mut<'a>(m: &'a mut Mapping, key: &str) -> Option<&'a mut Mapping> {
    match m.get_mut(&Value::String(key.to_string())) {
        Some(Value::Mapping(inner)) => Some(inner),
        _ => None,
    }
}

pub(crate) fn ensure_map<'a>(m: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let k = Value::String(key.to_string());
    if !matches!(m.get(&k), Some(Value::Mapping(_))) {
        m.insert(k.clone(), Value::Mapping(Mapping::new()));
    }
    match m.get_mut(&k) {
        Some(Value::Mapping(inner)) => inner,
        _ => unreachable!(),
    }
}

/// Canonicalise a slash-separated path: resolve `.` and `..` segments
/// without touching the filesystem. `..` segments that cannot be resolved
/// are kept at the front, which is how escapes are detected.
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(&s) if s != "..") {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

/// A resource path must stay inside the package after canonicalisation,
/// must be relative, and must be non-empty.
///
/// Returns the cleaned path, or a plain message so callers can tag the
/// failure with their own error kind (configuration vs. protocol).
pub fn validate_path(path: &str) -> std::result::Result<String, String> {
    if path.starts_with('/') {
        return Err(format!("resource path {:?} is absolute", path));
    }
    let cleaned = clean_path(path);
    if cleaned.is_empty() {
        return Err(format!("resource path {:?} is empty", path));
    }
    if cleaned == ".." || cleaned.starts_with("../") {
        return Err(format!("resource path {:?} escapes the package", path));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(yaml: &str) -> ResourceNode {
        ResourceNode::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_accessors() {
        let n = node(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
  labels:
    app: web
  annotations:
    team: platform
"#,
        );
        assert_eq!(n.kind(), Some("Deployment"));
        assert_eq!(n.api_version(), Some("apps/v1"));
        assert_eq!(n.name(), Some("web"));
        assert_eq!(n.namespace(), Some("prod"));
        assert_eq!(n.label("app"), Some("web"));
        assert_eq!(n.annotation("team"), Some("platform"));
        assert_eq!(n.display_id(), "apps/v1/Deployment/prod/web");
    }

    #[test]
    fn test_set_annotation_creates_missing_maps() {
        let mut n = node("kind: ConfigMap\nmetadata:\n  name: app-config\n");
        n.set_annotation("ran", "true");
        assert_eq!(n.annotation("ran"), Some("true"));
    }

    #[test]
    fn test_remove_annotation_drops_empty_map() {
        let mut n = node("kind: ConfigMap\nmetadata:\n  name: c\n");
        n.set_annotation("x", "1");
        n.remove_annotation("x");
        let metadata = get_map(n.mapping(), "metadata").unwrap();
        assert!(get(metadata, "annotations").is_none());
    }

    #[test]
    fn test_mutation_drops_source_text() {
        let mut n = node("kind: ConfigMap\nmetadata:\n  name: c\n");
        n.set_source_text("kind: ConfigMap\nmetadata:\n  name: c\n".to_string());
        assert!(n.source_text().is_some());
        n.set_label("a", "b");
        assert!(n.source_text().is_none());
    }

    #[test]
    fn test_field_order_preserved() {
        let n = node("zeta: 1\nalpha: 2\nmid: 3\n");
        let out = serde_yaml::to_string(n.mapping()).unwrap();
        let zeta = out.find("zeta").unwrap();
        let alpha = out.find("alpha").unwrap();
        assert!(zeta < alpha, "insertion order must survive serialisation");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/./b//c"), "a/b/c");
        assert_eq!(clean_path("a/../b"), "b");
        assert_eq!(clean_path("../x"), "../x");
        assert_eq!(clean_path("a/../../x"), "../x");
    }

    #[test]
    fn test_validate_path_rejects_escape() {
        assert!(validate_path("x/y.yaml").is_ok());
        assert!(validate_path("sub/../y.yaml").is_ok());
        let err = validate_path("../../escape.yaml").unwrap_err();
        assert!(err.contains("escapes"));
        assert!(validate_path("/abs.yaml").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn test_non_mapping_document_rejected() {
        let v: Value = serde_yaml::from_str("- a\n- b\n").unwrap();
        assert!(ResourceNode::from_value(v).is_err());
    }
}
