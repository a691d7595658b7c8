//! Image references
//!
//! Registry-qualified pointers to built container images, e.g.
//! `registry.gitlab.com/acme/shop/frontend:latest`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tag used when a reference carries none. Always points at the most recent push.
pub const LATEST_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq)]
pub enum ImageRefError {
    #[error("image reference is empty")]
    Empty,

    #[error("image reference '{0}' contains whitespace")]
    Whitespace(String),

    #[error("image reference '{0}' has an empty repository")]
    EmptyRepository(String),

    #[error("image reference '{0}' has an empty tag")]
    EmptyTag(String),
}

/// A container image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    /// Registry host (with optional port). `None` means the default registry.
    pub registry: Option<String>,
    /// Repository path below the registry
    pub repository: String,
    /// Mutable tag
    pub tag: String,
}

impl ImageReference {
    pub fn new(registry: Option<String>, repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            registry,
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parse `[registry/]repository[:tag]`
    ///
    /// The first path segment is treated as a registry when it looks like a
    /// host: it contains a `.` or a `:` (port), or is `localhost`.
    pub fn parse(raw: &str) -> Result<Self, ImageRefError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImageRefError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ImageRefError::Whitespace(raw.to_string()));
        }

        let (registry, remainder) = match raw.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (Some(first.to_string()), rest),
            _ => (None, raw),
        };

        // A ':' only separates the tag when it follows the last '/'
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&remainder[..split], &remainder[split + 1..])
            }
            None => (remainder, LATEST_TAG),
        };

        if repository.is_empty() || repository.ends_with('/') || repository.starts_with('/') {
            return Err(ImageRefError::EmptyRepository(raw.to_string()));
        }
        if tag.is_empty() {
            return Err(ImageRefError::EmptyTag(raw.to_string()));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// `<registry_image>/<component>:latest`
    ///
    /// `registry_image` is the project image prefix, e.g. `CI_REGISTRY_IMAGE`.
    pub fn latest(registry_image: &str, component: &str) -> Result<Self, ImageRefError> {
        let prefix = registry_image.trim_end_matches('/');
        let raw = if prefix.is_empty() {
            format!("{}:{}", component, LATEST_TAG)
        } else {
            format!("{}/{}:{}", prefix, component, LATEST_TAG)
        };
        Self::parse(&raw)
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{}/{}:{}", registry, self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = ImageRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let image = ImageReference::parse("registry.gitlab.com/acme/shop/frontend:latest").unwrap();
        assert_eq!(image.registry.as_deref(), Some("registry.gitlab.com"));
        assert_eq!(image.repository, "acme/shop/frontend");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn test_parse_defaults_tag_to_latest() {
        let image = ImageReference::parse("acme/backend").unwrap();
        assert_eq!(image.registry, None);
        assert_eq!(image.repository, "acme/backend");
        assert_eq!(image.tag, LATEST_TAG);
    }

    #[test]
    fn test_parse_registry_with_port() {
        let image = ImageReference::parse("localhost:5000/backend").unwrap();
        assert_eq!(image.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(image.repository, "backend");
        assert_eq!(image.tag, "latest");

        let image = ImageReference::parse("10.0.0.5:5000/team/backend:abc123").unwrap();
        assert_eq!(image.registry.as_deref(), Some("10.0.0.5:5000"));
        assert_eq!(image.tag, "abc123");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert_eq!(ImageReference::parse(""), Err(ImageRefError::Empty));
        assert!(matches!(
            ImageReference::parse("acme/backend:"),
            Err(ImageRefError::EmptyTag(_))
        ));
        assert!(matches!(
            ImageReference::parse("registry.io/"),
            Err(ImageRefError::EmptyRepository(_))
        ));
        assert!(matches!(
            ImageReference::parse("acme backend"),
            Err(ImageRefError::Whitespace(_))
        ));
    }

    #[test]
    fn test_display_matches_input() {
        for raw in [
            "registry.gitlab.com/acme/shop/frontend:latest",
            "backend:latest",
            "localhost:5000/backend:v2",
        ] {
            assert_eq!(ImageReference::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_latest_builder() {
        let image = ImageReference::latest("registry.gitlab.com/acme/shop/", "backend").unwrap();
        assert_eq!(image.to_string(), "registry.gitlab.com/acme/shop/backend:latest");

        let bare = ImageReference::latest("", "frontend").unwrap();
        assert_eq!(bare.to_string(), "frontend:latest");
    }
}
