//! Writes a hydrated resource stream back to disk.
//!
//! Resources are grouped by their `path` field, ordered by `index` within
//! each file, and written with their original separators. Nodes still
//! carrying their exact source text are emitted verbatim, so untouched
//! resources (and an empty pipeline) are bit-stable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::resource::{ResourceNode, INDEX_ANNOTATION, PATH_ANNOTATION};

/// Write the stream under `root`. Returns the set of files written,
/// root-relative with `/` separators.
pub fn write_package(root: &Path, nodes: &[ResourceNode]) -> Result<BTreeSet<String>> {
    let mut by_file: BTreeMap<String, Vec<&ResourceNode>> = BTreeMap::new();
    for node in nodes {
        let cleaned = super::validate_path(&node.path).map_err(Error::Config)?;
        by_file.entry(cleaned).or_default().push(node);
    }

    for (rel, docs) in &mut by_file {
        docs.sort_by_key(|n| n.index);
        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, render_file(docs)?)?;
    }

    Ok(by_file.into_keys().collect())
}

/// Remove files that were part of the input but have no resources left in
/// the output (a function deleted everything they held).
pub fn remove_stale(root: &Path, read: &BTreeSet<String>, written: &BTreeSet<String>) -> Result<()> {
    for rel in read.difference(written) {
        let path = root.join(rel);
        if path.is_file() {
            tracing::debug!(file = %rel, "removing file with no remaining resources");
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Render the whole stream as one multi-document string with source
/// annotations attached, for `--output stdout`.
pub fn render_stream(nodes: &[ResourceNode]) -> Result<String> {
    let mut docs = Vec::with_capacity(nodes.len());
    for node in nodes {
        let mut value = node.mapping().clone();
        let metadata = super::ensure_map(&mut value, "metadata");
        let annotations = super::ensure_map(metadata, "annotations");
        annotations.insert(
            Value::String(PATH_ANNOTATION.to_string()),
            Value::String(node.path.clone()),
        );
        annotations.insert(
            Value::String(INDEX_ANNOTATION.to_string()),
            Value::String(node.index.to_string()),
        );
        let mut doc = node.head_comment.clone();
        doc.push_str(&serde_yaml::to_string(&value)?);
        docs.push(doc);
    }
    Ok(docs.join("---\n"))
}

fn render_file(docs: &[&ResourceNode]) -> Result<String> {
    let mut out = String::new();
    for (i, node) in docs.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        match node.source_text() {
            Some(raw) => out.push_str(raw),
            None => {
                out.push_str(&node.head_comment);
                out.push_str(&serde_yaml::to_string(node.mapping())?);
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}
