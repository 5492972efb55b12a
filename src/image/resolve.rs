//! Resolves a version constraint in an image's tag slot to a concrete tag.
//!
//! Exact tags (semver or otherwise) pass through untouched with no network
//! call. Constraints are matched against the remote tag list: non-semver
//! tags are filtered out, the rest parsed leniently (leading `v`, partial
//! versions), sorted descending, and the greatest match wins.

use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::image::ImageName;

/// Lists the tags a repository currently serves.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn list_tags(&self, image: &ImageName) -> Result<Vec<String>>;
}

/// Production lister speaking the registry v2 tags endpoint.
pub struct RegistryTagLister {
    client: reqwest::Client,
}

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

impl RegistryTagLister {
    pub fn new() -> Self {
        RegistryTagLister {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RegistryTagLister {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

#[async_trait]
impl TagLister for RegistryTagLister {
    async fn list_tags(&self, image: &ImageName) -> Result<Vec<String>> {
        let domain = image.domain.as_deref().unwrap_or(DEFAULT_REGISTRY);
        let path = if image.domain.is_none() && !image.path.contains('/') {
            format!("library/{}", image.path)
        } else {
            image.path.clone()
        };
        let url = format!("https://{}/v2/{}/tags/list", domain, path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Runtime(format!("listing tags for {}: {}", image.repo(), e)))?;
        if !response.status().is_success() {
            return Err(Error::Runtime(format!(
                "listing tags for {}: registry returned {}",
                image.repo(),
                response.status()
            )));
        }
        let body: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::Runtime(format!("listing tags for {}: {}", image.repo(), e)))?;
        Ok(body.tags)
    }
}

/// Turns constraint-tagged image references into concrete ones.
pub struct TagResolver {
    lister: Box<dyn TagLister>,
}

impl TagResolver {
    pub fn new(lister: Box<dyn TagLister>) -> Self {
        TagResolver { lister }
    }

    pub fn registry() -> Self {
        TagResolver::new(Box::new(RegistryTagLister::new()))
    }

    /// Resolve one image reference. References without a constraint are
    /// returned unchanged and never touch the network; a digest suffix is
    /// stripped when a constraint is present (the constraint wins).
    pub async fn resolve(&self, image_str: &str) -> Result<String> {
        let image = ImageName::parse(image_str)?;
        let tag = match &image.tag {
            Some(t) => t.clone(),
            None => return Ok(image_str.to_string()),
        };
        if !is_constraint(&tag) {
            return Ok(image_str.to_string());
        }

        let repo = ImageName {
            digest: None,
            tag: None,
            ..image.clone()
        };
        let tags = self.lister.list_tags(&repo).await?;
        let resolved = resolve_constraint(&tag, &tags)?;
        tracing::debug!(image = %repo.repo(), constraint = %tag, tag = %resolved, "resolved image tag");
        Ok(repo.with_tag(&resolved).to_string())
    }
}

/// True when a tag is a version constraint rather than a literal tag.
pub fn is_constraint(tag: &str) -> bool {
    if tag.chars().any(|c| "~^<>=*|,".contains(c)) {
        return true;
    }
    if tag.contains(" - ") {
        return true;
    }
    let core = tag.strip_prefix('v').unwrap_or(tag);
    core.split('.').any(|seg| seg == "x" || seg == "X")
}

/// Pick the greatest remote tag satisfying the constraint.
fn resolve_constraint(constraint: &str, tags: &[String]) -> Result<String> {
    let req = parse_constraint(constraint)?;

    let mut candidates: Vec<(Version, &str)> = tags
        .iter()
        .filter(|t| !is_non_semver(t))
        .filter_map(|t| lenient_version(t).map(|v| (v, t.as_str())))
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    candidates
        .iter()
        .find(|(v, _)| req.matches(v))
        .map(|(_, t)| t.to_string())
        .ok_or_else(|| {
            Error::Config(format!(
                "no remote tag matched the version constraint {:?}",
                constraint
            ))
        })
}

fn parse_constraint(constraint: &str) -> Result<VersionReq> {
    // Hyphen ranges ("0.2 - 0.2.2") are not comparator syntax; rewrite them.
    let normalised = match constraint.split_once(" - ") {
        Some((lo, hi)) => format!(">={}, <={}", lo.trim(), hi.trim()),
        None => constraint.to_string(),
    };
    VersionReq::parse(&normalised)
        .map_err(|e| Error::Config(format!("invalid version constraint {:?}: {}", constraint, e)))
}

/// Tags that are recognisably not versions: content digests, CI build tags,
/// attestation artifacts.
fn is_non_semver(tag: &str) -> bool {
    if tag.starts_with("master-git-") || tag.ends_with(".sbom") {
        return true;
    }
    tag.len() >= 7 && tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Parse a tag as semver, tolerating a leading `v` and missing minor/patch
/// components (`v0.1` reads as 0.1.0).
fn lenient_version(tag: &str) -> Option<Version> {
    let s = tag.strip_prefix('v').unwrap_or(tag);
    if !s.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let suffix_at = s.find(|c| c == '-' || c == '+');
    let (core, suffix) = match suffix_at {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{}.0.0{}", core, suffix),
        1 => format!("{}.0{}", core, suffix),
        _ => s.to_string(),
    };
    Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubLister {
        tags: Vec<String>,
    }

    #[async_trait]
    impl TagLister for StubLister {
        async fn list_tags(&self, _image: &ImageName) -> Result<Vec<String>> {
            Ok(self.tags.clone())
        }
    }

    struct FailingLister;

    #[async_trait]
    impl TagLister for FailingLister {
        async fn list_tags(&self, image: &ImageName) -> Result<Vec<String>> {
            Err(Error::Runtime(format!("unreachable registry for {}", image.repo())))
        }
    }

    fn resolver(tags: &[&str]) -> TagResolver {
        TagResolver::new(Box::new(StubLister {
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }))
    }

    const REMOTE: [&str; 8] = [
        "v0.1", "v0.2.3", "v0.1.2", "v0", "v0.2", "v0.1.1", "v0.2.1", "v0.2.2",
    ];

    #[tokio::test]
    async fn test_tilde_constraint_resolves_greatest_patch() {
        let r = resolver(&REMOTE);
        let out = r.resolve("example.com/app:~0.1").await.unwrap();
        assert_eq!(out, "example.com/app:v0.1.2");
    }

    #[tokio::test]
    async fn test_hyphen_range_resolves_upper_bound() {
        let r = resolver(&REMOTE);
        let out = r.resolve("example.com/app:0.2 - 0.2.2").await.unwrap();
        assert_eq!(out, "example.com/app:v0.2.2");
    }

    #[tokio::test]
    async fn test_unmatched_constraint_errors() {
        let r = resolver(&REMOTE);
        let err = r.resolve("example.com/app:0.3.x").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("no remote tag matched the version constraint"));
    }

    #[tokio::test]
    async fn test_exact_tag_skips_network() {
        let r = TagResolver::new(Box::new(FailingLister));
        let out = r.resolve("example.com/app:v1.2.3").await.unwrap();
        assert_eq!(out, "example.com/app:v1.2.3");

        let out = r.resolve("example.com/app:master-git-abc").await.unwrap();
        assert_eq!(out, "example.com/app:master-git-abc");
    }

    #[tokio::test]
    async fn test_list_failure_with_constraint_propagates() {
        let r = TagResolver::new(Box::new(FailingLister));
        assert!(r.resolve("example.com/app:~0.1").await.is_err());
    }

    #[tokio::test]
    async fn test_digest_stripped_when_constraint_present() {
        let r = resolver(&REMOTE);
        let image = format!("example.com/app:~0.2@sha256:{}", "b".repeat(64));
        let out = r.resolve(&image).await.unwrap();
        assert_eq!(out, "example.com/app:v0.2.3");
    }

    #[test]
    fn test_non_semver_filter() {
        assert!(is_non_semver("deadbeef01"));
        assert!(is_non_semver("master-git-abc123"));
        assert!(is_non_semver("v1.0.0.sbom"));
        assert!(!is_non_semver("v1.0.0"));
    }

    #[test]
    fn test_lenient_version_padding() {
        assert_eq!(lenient_version("v0.1"), Some(Version::new(0, 1, 0)));
        assert_eq!(lenient_version("v0"), Some(Version::new(0, 0, 0)));
        assert_eq!(lenient_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(lenient_version("latest"), None);
    }
}
