//! Package identity and discovery.
//!
//! A package is a directory containing a `Kptfile`. Identity is the
//! canonical absolute path; the display path (relative to the hydration
//! root) is what users see in progress lines and errors.

pub mod manifest;
pub mod selector;

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::resource::reader::relative_slash_path;

pub use manifest::{Function, Kptfile, Pipeline};
pub use selector::Selector;

/// One discovered package.
#[derive(Debug, Clone)]
pub struct Package {
    /// Canonical absolute path; the package's unique identity.
    pub abs_path: PathBuf,
    /// Path relative to the hydration root, for display.
    pub display_path: String,
    pub manifest: Kptfile,
}

impl Package {
    /// Open the package at `path`. `root` is the hydration root used for
    /// display paths; it may equal `path`.
    pub fn open(path: &Path, root: &Path) -> Result<Package> {
        let abs_path = path
            .canonicalize()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        if !Kptfile::exists(&abs_path) {
            return Err(Error::Config(format!(
                "{} is not a package: no {} found",
                path.display(),
                Kptfile::FILE_NAME
            )));
        }
        let manifest = Kptfile::load(&abs_path)?;

        let mut display_path = relative_slash_path(root, &abs_path);
        if display_path.is_empty() {
            display_path = abs_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string());
        }

        Ok(Package {
            abs_path,
            display_path,
            manifest,
        })
    }

    /// Path of this package relative to the hydration root, slash
    /// separated; empty for the root package itself.
    pub fn rel_to(&self, root: &Path) -> String {
        relative_slash_path(root, &self.abs_path)
    }

    /// Direct sub-packages: descendant directories carrying a manifest,
    /// stopping at the first manifest on each branch (deeper nesting is the
    /// child's responsibility).
    pub fn direct_subpackages(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        collect_subpackages(&self.abs_path, &mut found)?;
        Ok(found)
    }
}

fn collect_subpackages(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        // is_dir() follows symlinks: a symlinked sub-package is still a
        // sub-package (and the hydrator's state map catches cycles).
        if !path.is_dir() {
            continue;
        }
        if Kptfile::exists(&path) {
            found.push(path);
        } else {
            collect_subpackages(&path, found)?;
        }
    }
    Ok(())
}
