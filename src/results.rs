//! Aggregated function results for one hydration run.
//!
//! Every function invocation appends one [`FnResult`]; the list is written
//! to the caller-supplied results directory as `results.yaml` at the end of
//! the run (and on cancellation, with whatever accumulated so far).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Severity of one structured result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Lenient parse for function output; anything unrecognised is `Info`.
    pub fn from_wire(s: &str) -> Severity {
        match s {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Reference to the resource a result item is about, always in the flat
/// shape (nested `metadata` shapes are normalised at parse time).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// A file or field path attached to a result item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathRef {
    pub path: String,
}

/// One structured result emitted by a function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<PathRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathRef>,
}

impl ResultItem {
    pub fn info(message: impl Into<String>) -> Self {
        ResultItem {
            message: message.into(),
            severity: Severity::Info,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ResultItem {
            message: message.into(),
            severity: Severity::Error,
            ..Default::default()
        }
    }
}

/// Per-invocation record: which function ran, how it exited, and what it
/// reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnResult {
    /// Function identity (image reference or exec command line).
    pub function: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultItem>,
}

/// Aggregate of all function results from one hydration run.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultList {
    #[serde(default)]
    pub items: Vec<FnResult>,
}

/// The shared handle appended to by runners and flushed by the caller.
pub type SharedResults = Arc<Mutex<ResultList>>;

pub fn shared() -> SharedResults {
    Arc::new(Mutex::new(ResultList::default()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultListDoc<'a> {
    api_version: &'static str,
    kind: &'static str,
    items: &'a [FnResult],
}

impl ResultList {
    pub fn push(&mut self, result: FnResult) {
        self.items.push(result);
    }

    /// Write the aggregate to `<dir>/results.yaml`, creating the directory
    /// if needed. Returns the path written.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("results.yaml");
        let doc = ResultListDoc {
            api_version: "config.kubernetes.io/v1",
            kind: "FunctionResultList",
            items: &self.items,
        };
        std::fs::write(&path, serde_yaml::to_string(&doc)?)?;
        Ok(path)
    }
}
