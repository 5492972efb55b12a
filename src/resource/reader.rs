//! Reads a package directory into an ordered resource stream.
//!
//! Walks the directory tree rooted at the package, skipping sub-package
//! directories (they hydrate on their own), hidden entries, the package
//! manifest, and any function-config files named by the manifest. Each YAML
//! file is split into documents; every document becomes a [`ResourceNode`]
//! carrying its file path, index, head comment, and exact source text.

use std::collections::BTreeSet;
use std::path::Path;

use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::pkg::manifest::Kptfile;
use crate::resource::ResourceNode;

const YAML_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Read all resources belonging to one package, in directory-walk order.
///
/// `excluded` holds cleaned package-relative paths that must not appear in
/// the stream (function-config files).
pub fn read_package(dir: &Path, excluded: &BTreeSet<String>) -> Result<Vec<ResourceNode>> {
    let mut nodes = Vec::new();
    read_dir(dir, dir, excluded, &mut nodes)?;
    Ok(nodes)
}

fn read_dir(
    root: &Path,
    dir: &Path,
    excluded: &BTreeSet<String>,
    nodes: &mut Vec<ResourceNode>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            // A subdirectory with its own manifest is a sub-package; its
            // resources are read when that package hydrates.
            if Kptfile::exists(&path) {
                continue;
            }
            read_dir(root, &path, excluded, nodes)?;
            continue;
        }

        if name == Kptfile::FILE_NAME {
            continue;
        }
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| YAML_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        let rel = relative_slash_path(root, &path);
        if excluded.contains(&rel) {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        read_documents(&rel, &content, nodes)?;
    }
    Ok(())
}

/// Parse one file's content into nodes, assigning document indices.
pub fn read_documents(rel_path: &str, content: &str, nodes: &mut Vec<ResourceNode>) -> Result<()> {
    let mut index = 0;
    for chunk in split_documents(content) {
        let (head_comment, body) = split_head_comment(&chunk);
        if body.trim().is_empty() {
            continue;
        }
        let value: Value = serde_yaml::from_str(body)
            .map_err(|e| Error::Config(format!("{}: {}", rel_path, e)))?;
        if value.is_null() {
            continue;
        }
        let mut node = ResourceNode::from_value(value)
            .map_err(|e| Error::Config(format!("{}: {}", rel_path, e)))?;
        node.path = rel_path.to_string();
        node.index = index;
        node.head_comment = head_comment.to_string();
        node.set_source_text(chunk.clone());
        nodes.push(node);
        index += 1;
    }
    Ok(())
}

/// Split multi-document YAML on `---` markers at column zero. The markers
/// themselves are not part of any chunk; block scalars in KRM manifests are
/// always indented, so a column-zero `---` is a document boundary.
fn split_documents(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || line.starts_with("--- ") {
            chunks.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
    }
    chunks.push(current);
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

/// Split a document chunk into its leading comment block and the body.
fn split_head_comment(chunk: &str) -> (&str, &str) {
    let mut offset = 0;
    for line in chunk.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            offset += line.len();
        } else {
            break;
        }
    }
    chunk.split_at(offset)
}

/// Package-relative path with `/` separators regardless of platform.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
