//! Common types shared by the check engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::check::rate_limiter::normalize_registry;

/// Operator-configured ceiling on acceptable automatic updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only x.y.Z bumps
    #[default]
    Patch,
    /// x.Y.z and x.y.Z bumps
    Minor,
    /// Any newer version
    Major,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Patch => "patch",
            Scope::Minor => "minor",
            Scope::Major => "major",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "patch" => Ok(Scope::Patch),
            "minor" => Ok(Scope::Minor),
            "major" => Ok(Scope::Major),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// Magnitude of a semantic version change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Major,
    Minor,
    Patch,
}

/// How an update was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// A newer tag exists
    Tag,
    /// The floating tag now points at a different digest
    Digest,
}

/// Dedup grouping key and run cache key
///
/// Two containers with equal keys always receive the same fetch result
/// within one check run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageCheckKey {
    pub registry: String,
    pub image: String,
    pub current_tag: String,
    pub scope: Scope,
    pub include_prereleases: bool,
}

impl ImageCheckKey {
    /// Builds a key, normalizing the registry host to its canonical name
    pub fn new(
        registry: &str,
        image: &str,
        current_tag: &str,
        scope: Scope,
        include_prereleases: bool,
    ) -> Self {
        Self {
            registry: normalize_registry(registry),
            image: image.to_string(),
            current_tag: current_tag.to_string(),
            scope,
            include_prereleases,
        }
    }
}

impl fmt::Display for ImageCheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{} ({}{})",
            self.registry,
            self.image,
            self.current_tag,
            self.scope,
            if self.include_prereleases { ", prereleases" } else { "" }
        )
    }
}

/// Parsed `[registry/]repository[:tag][@digest]` image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host as written (`docker.io` when omitted)
    pub registry: String,
    /// Repository path, with `library/` added for official Docker Hub images
    pub image: String,
    /// Tag (`latest` when omitted)
    pub tag: String,
    /// Pinned digest, if the reference carried one
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }

        let (name_and_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a host port
        let last_slash = name_and_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => (
                &name_and_tag[..last_slash + i],
                &name_and_tag[last_slash + i + 1..],
            ),
            None => (name_and_tag, "latest"),
        };
        if name.is_empty() || tag.is_empty() {
            return None;
        }

        let (registry, image) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => ("docker.io".to_string(), name.to_string()),
        };

        let image = if normalize_registry(&registry) == "dockerhub" && !image.contains('/') {
            format!("library/{}", image)
        } else {
            image
        };

        Some(Self {
            registry,
            image,
            tag: tag.to_string(),
            digest,
        })
    }
}

/// A container tracked for updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContainer {
    pub id: String,
    pub name: String,
    /// Registry host or canonical registry name
    pub registry: String,
    pub image: String,
    pub current_tag: String,
    pub scope: Scope,
    /// Container-level override; `None` falls back to the global default
    pub include_prereleases: Option<bool>,
    /// Last known digest of the current tag (floating tags only)
    pub current_digest: Option<String>,
}

impl TrackedContainer {
    /// Builds a container from an image reference such as `ghcr.io/org/app:1.2.0`
    pub fn from_reference(id: &str, reference: &str, scope: Scope) -> Option<Self> {
        let parsed = ImageReference::parse(reference)?;
        Some(Self {
            id: id.to_string(),
            name: id.to_string(),
            registry: parsed.registry,
            image: parsed.image,
            current_tag: parsed.tag,
            scope,
            include_prereleases: None,
            current_digest: parsed.digest,
        })
    }

    pub fn with_prereleases(mut self, include: bool) -> Self {
        self.include_prereleases = Some(include);
        self
    }

    pub fn with_digest(mut self, digest: &str) -> Self {
        self.current_digest = Some(digest.to_string());
        self
    }
}

/// Registry metadata for a single tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMetadata {
    pub digest: Option<String>,
    pub last_updated: Option<String>,
}

/// Result of fetching tag information for one [`ImageCheckKey`]
///
/// Cached per run behind an `Arc` and never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagFetchResult {
    /// All tags known for the image (may be empty when not collected)
    pub tags: Vec<String>,
    /// Best tag within scope
    pub latest_tag: Option<String>,
    /// Best tag ignoring scope
    pub latest_major_tag: Option<String>,
    pub metadata: Option<TagMetadata>,
    /// The registry client treated the current tag as floating
    pub floating_tag: bool,
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TagFetchResult {
    pub fn success(
        tags: Vec<String>,
        latest_tag: Option<String>,
        latest_major_tag: Option<String>,
        metadata: Option<TagMetadata>,
    ) -> Self {
        Self {
            tags,
            latest_tag,
            latest_major_tag,
            metadata,
            floating_tag: false,
            fetched_at: Utc::now(),
            error: None,
        }
    }

    /// Digest-only result for a floating tag
    pub fn floating(metadata: TagMetadata) -> Self {
        Self {
            floating_tag: true,
            ..Self::success(Vec::new(), None, None, Some(metadata))
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            tags: Vec::new(),
            latest_tag: None,
            latest_major_tag: None,
            metadata: None,
            floating_tag: false,
            fetched_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn digest(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.digest.as_deref())
    }
}
