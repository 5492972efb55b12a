//! The package manifest (`Kptfile`): pipeline declaration, hooks, and the
//! function spec schema.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

use crate::error::{Error, Result};
use crate::image::ImageName;
use crate::resource::validate_path;

/// Conditions longer than this are rejected at load time.
pub const MAX_CONDITION_LEN: usize = 10_000;

/// Parsed package manifest. Fields the engine does not consume are
/// tolerated and ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kptfile {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<Function>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Pipeline {
    #[serde(default)]
    pub mutators: Vec<Function>,
    #[serde(default)]
    pub validators: Vec<Function>,
}

/// One function declaration: exactly one runtime target, at most one
/// configuration form.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub exec: Option<String>,

    #[serde(default)]
    pub config_map: Option<Mapping>,
    #[serde(default)]
    pub config: Option<Mapping>,
    #[serde(default)]
    pub config_path: Option<String>,

    /// CEL expression gating whether this function runs.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub selectors: Vec<super::selector::Selector>,
    #[serde(default)]
    pub exclusions: Vec<super::selector::Selector>,
    /// Downgrade a failure of this function to a recorded result.
    #[serde(default)]
    pub defer_failure: bool,
    /// The function needs network access (requires caller permission).
    #[serde(default)]
    pub network: bool,
    /// `KEY=VALUE` entries, or bare `KEY` to pass through from the engine's
    /// environment.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Function {
    /// Display identity: the image reference or exec command line.
    pub fn identity(&self) -> String {
        self.image
            .clone()
            .or_else(|| self.exec.clone())
            .unwrap_or_else(|| "<unspecified>".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.image, &self.exec) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "function {:?} declares both image and exec",
                    self.identity()
                )))
            }
            (None, None) => {
                return Err(Error::Config(
                    "function declares neither image nor exec".to_string(),
                ))
            }
            _ => {}
        }

        let config_forms = [
            self.config_map.is_some(),
            self.config.is_some(),
            self.config_path.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if config_forms > 1 {
            return Err(Error::Config(format!(
                "function {:?} declares more than one of configMap, config, configPath",
                self.identity()
            )));
        }

        if let Some(image) = &self.image {
            ImageName::parse(image)?;
        }
        if let Some(exec) = &self.exec {
            let tokens = shell_words::split(exec)
                .map_err(|e| Error::Config(format!("exec {:?}: {}", exec, e)))?;
            if tokens.is_empty() {
                return Err(Error::Config("exec command line is empty".to_string()));
            }
        }
        if let Some(condition) = &self.condition {
            if condition.len() > MAX_CONDITION_LEN {
                return Err(Error::Config(format!(
                    "function {:?}: condition exceeds {} characters",
                    self.identity(),
                    MAX_CONDITION_LEN
                )));
            }
        }
        if let Some(config_path) = &self.config_path {
            validate_path(config_path)
                .map_err(|e| Error::Config(format!("configPath: {}", e)))?;
        }
        for entry in &self.env {
            let key = entry.split('=').next().unwrap_or("");
            if key.is_empty() {
                return Err(Error::Config(format!("invalid env entry {:?}", entry)));
            }
        }
        Ok(())
    }
}

impl Kptfile {
    pub const FILE_NAME: &'static str = "Kptfile";

    pub fn exists(dir: &Path) -> bool {
        dir.join(Self::FILE_NAME).is_file()
    }

    /// Load and validate the manifest of the package rooted at `dir`.
    pub fn load(dir: &Path) -> Result<Kptfile> {
        let path = dir.join(Self::FILE_NAME);
        let content = std::fs::read_to_string(&path)?;
        let manifest: Kptfile = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if let Some(kind) = &manifest.kind {
            if kind != "Kptfile" {
                return Err(Error::Config(format!(
                    "{}: unexpected kind {:?}",
                    path.display(),
                    kind
                )));
            }
        }
        for function in manifest.all_functions() {
            function.validate()?;
        }
        Ok(manifest)
    }

    /// Every function the manifest declares, pipeline and hooks alike.
    pub fn all_functions(&self) -> impl Iterator<Item = &Function> {
        self.pipeline
            .mutators
            .iter()
            .chain(self.pipeline.validators.iter())
            .chain(self.hooks.values().flatten())
    }

    /// Cleaned package-relative paths of every function-config file. These
    /// are inputs to functions, not members of the config to hydrate.
    pub fn fn_config_paths(&self) -> BTreeSet<String> {
        self.all_functions()
            .filter_map(|f| f.config_path.as_deref())
            .filter_map(|p| validate_path(p).ok())
            .collect()
    }
}
