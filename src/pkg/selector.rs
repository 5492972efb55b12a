//! Selector and exclusion predicates scoping which resources a function
//! sees.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::ResourceNode;

/// A predicate over a resource: every specified field must match.
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Selector {
    pub fn matches(&self, node: &ResourceNode) -> bool {
        if let Some(v) = &self.api_version {
            if node.api_version() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.kind {
            if node.kind() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.name {
            if node.name() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.namespace {
            if node.namespace() != Some(v.as_str()) {
                return false;
            }
        }
        for (k, v) in &self.labels {
            if node.label(k) != Some(v.as_str()) {
                return false;
            }
        }
        for (k, v) in &self.annotations {
            if node.annotation(k) != Some(v.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A resource is in scope when it matches at least one selector (or no
/// selectors are given) and matches no exclusion.
pub fn in_scope(node: &ResourceNode, selectors: &[Selector], exclusions: &[Selector]) -> bool {
    let selected = selectors.is_empty() || selectors.iter().any(|s| s.matches(node));
    selected && !exclusions.iter().any(|e| e.matches(node))
}
