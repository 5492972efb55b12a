//! Image reference grammar:
//! `[domain/]path-component[/path-component]*[:tag|@digest]`.
//!
//! Invalid names are a configuration error at manifest load. A tag slot may
//! also hold a semver constraint (`~0.1`, `0.2 - 0.2.2`), which the tag
//! resolver turns into a concrete tag before the container runtime runs.

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry host, with optional `:port`.
    pub domain: Option<String>,
    /// Slash-separated repository path.
    pub path: String,
    /// Tag, or a semver constraint destined for the tag resolver.
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageName {
    pub fn parse(input: &str) -> Result<ImageName> {
        if input.is_empty() {
            return Err(Error::Config("image reference is empty".to_string()));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((r, d)) => {
                if !digest_re().is_match(d) {
                    return Err(Error::Config(format!(
                        "invalid digest in image reference {:?}",
                        input
                    )));
                }
                (r, Some(d.to_string()))
            }
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; a ':' before it can
        // only be a registry port.
        let (rest, tag) = match rest.rsplit_once(':') {
            Some((r, t)) if !t.contains('/') => {
                if !tag_re().is_match(t) && !resolve_charset_ok(t) {
                    return Err(Error::Config(format!(
                        "invalid tag {:?} in image reference {:?}",
                        t, input
                    )));
                }
                (r, Some(t.to_string()))
            }
            _ => (rest, None),
        };

        let (domain, path) = match rest.split_once('/') {
            Some((first, remainder)) if looks_like_domain(first) => {
                if !domain_re().is_match(first) {
                    return Err(Error::Config(format!(
                        "invalid registry domain {:?} in image reference {:?}",
                        first, input
                    )));
                }
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, rest.to_string()),
        };

        if path.is_empty() {
            return Err(Error::Config(format!(
                "image reference {:?} has no repository path",
                input
            )));
        }
        let component = component_re();
        for part in path.split('/') {
            if !component.is_match(part) {
                return Err(Error::Config(format!(
                    "invalid path component {:?} in image reference {:?}",
                    part, input
                )));
            }
        }

        Ok(ImageName {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// The repository portion: domain and path, no tag or digest.
    pub fn repo(&self) -> String {
        match &self.domain {
            Some(d) => format!("{}/{}", d, self.path),
            None => self.path.clone(),
        }
    }

    /// Final path component, used to match in-process built-ins.
    pub fn last_component(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn with_tag(&self, tag: &str) -> ImageName {
        ImageName {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(d) = &self.domain {
            write!(f, "{}/", d)?;
        }
        write!(f, "{}", self.path)?;
        if let Some(t) = &self.tag {
            write!(f, ":{}", t)?;
        }
        if let Some(d) = &self.digest {
            write!(f, "@{}", d)?;
        }
        Ok(())
    }
}

// Docker convention: the first component is a registry domain only when it
// contains a dot or port, or is literally "localhost".
fn looks_like_domain(s: &str) -> bool {
    s == "localhost" || s.contains('.') || s.contains(':')
}

fn tag_re() -> Regex {
    Regex::new(r"^[\w][\w.-]{0,127}$").unwrap()
}

fn digest_re() -> Regex {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[0-9a-fA-F]{32,}$").unwrap()
}

fn component_re() -> Regex {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap()
}

fn domain_re() -> Regex {
    Regex::new(
        r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$",
    )
    .unwrap()
}

// Constraint tags ("~0.1", "0.2 - 0.2.2") break the tag grammar but must
// load; the resolver replaces them before anything runs.
fn resolve_charset_ok(tag: &str) -> bool {
    super::resolve::is_constraint(tag)
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || " .,-~^<>=*|_".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let img = ImageName::parse("gcr.io/kpt-fn/set-labels:v0.2.0").unwrap();
        assert_eq!(img.domain.as_deref(), Some("gcr.io"));
        assert_eq!(img.path, "kpt-fn/set-labels");
        assert_eq!(img.tag.as_deref(), Some("v0.2.0"));
        assert_eq!(img.last_component(), "set-labels");
        assert_eq!(img.to_string(), "gcr.io/kpt-fn/set-labels:v0.2.0");
    }

    #[test]
    fn test_parse_bare_name() {
        let img = ImageName::parse("set-labels").unwrap();
        assert_eq!(img.domain, None);
        assert_eq!(img.path, "set-labels");
        assert_eq!(img.tag, None);
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let img = ImageName::parse("localhost:5000/fns/annotate").unwrap();
        assert_eq!(img.domain.as_deref(), Some("localhost:5000"));
        assert_eq!(img.path, "fns/annotate");
        assert_eq!(img.tag, None);
    }

    #[test]
    fn test_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let img = ImageName::parse(&format!("example.com/app@{}", digest)).unwrap();
        assert_eq!(img.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(img.repo(), "example.com/app");
    }

    #[test]
    fn test_constraint_tag_allowed() {
        let img = ImageName::parse("example.com/app:~0.1").unwrap();
        assert_eq!(img.tag.as_deref(), Some("~0.1"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(ImageName::parse("").is_err());
        assert!(ImageName::parse("UPPER/case").is_err());
        assert!(ImageName::parse("foo:!bad!tag").is_err());
        assert!(ImageName::parse("example.com/app@sha256:short").is_err());
    }
}
