//! Tag version parsing and scope-aware tag selection
//!
//! Container tags are looser than semver: `1`, `1.25`, `v2.0.3`,
//! `1.25.3-alpine`, `3.0.0-rc.1` and `latest` all show up in the wild.
//! Tags are parsed into a [`TagVersion`] whose numeric part is padded to
//! three components so `semver` ordering can be reused.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use semver::{Prerelease, Version};

use crate::check::types::{ChangeType, Scope};

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([vV])?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-(.+))?$").expect("tag pattern is valid")
});

/// Tags that are moved between builds instead of being replaced
const FLOATING_TAGS: &[&str] = &[
    "latest", "lts", "stable", "edge", "nightly", "rolling", "current", "mainline", "main",
    "master", "develop", "dev", "beta", "alpha", "next", "insiders",
];

const PRERELEASE_MARKERS: &[&str] = &[
    "alpha", "beta", "rc", "pre", "dev", "preview", "snapshot", "nightly",
];

/// A version parsed from an image tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVersion {
    pub version: Version,
    /// Number of numeric components written in the tag (1 to 3)
    pub components: usize,
    /// Whether the tag carried a `v` prefix
    pub prefixed: bool,
    /// Variant suffix such as `alpine` (not a prerelease)
    pub suffix: Option<String>,
    /// Purely numeric packaging revision (`1.2.3-2`)
    pub revision: Option<u64>,
}

impl TagVersion {
    pub fn is_prerelease(&self) -> bool {
        !self.version.pre.is_empty()
    }

    fn cmp_version(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

/// Parse an image tag into a [`TagVersion`]
///
/// Examples:
/// - "1" -> 1.0.0
/// - "v1.2" -> 1.2.0 (prefixed)
/// - "1.25.3-alpine" -> 1.25.3 with suffix "alpine"
/// - "2.0.0-rc.1" -> 2.0.0-rc.1
/// - "latest" -> None
pub fn parse_tag(tag: &str) -> Option<TagVersion> {
    let caps = TAG_PATTERN.captures(tag)?;

    let number = |i: usize| -> Option<Option<u64>> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok().map(Some),
            None => Some(None),
        }
    };
    let major = number(2)??;
    let minor = number(3)?;
    let patch = number(4)?;
    let components = 1 + usize::from(minor.is_some()) + usize::from(patch.is_some());

    let mut version = Version::new(major, minor.unwrap_or(0), patch.unwrap_or(0));
    let mut suffix = None;
    let mut revision = None;

    if let Some(rest) = caps.get(5).map(|m| m.as_str()) {
        if let Ok(n) = rest.parse::<u64>() {
            revision = Some(n);
        } else if is_prerelease_marker(rest) {
            match Prerelease::new(rest) {
                Ok(pre) => version.pre = pre,
                Err(_) => suffix = Some(rest.to_string()),
            }
        } else {
            suffix = Some(rest.to_string());
        }
    }

    Some(TagVersion {
        version,
        components,
        prefixed: caps.get(1).is_some(),
        suffix,
        revision,
    })
}

fn is_prerelease_marker(rest: &str) -> bool {
    let lower = rest.to_ascii_lowercase();
    PRERELEASE_MARKERS.iter().any(|marker| {
        lower.strip_prefix(marker).is_some_and(|after| {
            after.is_empty()
                || after.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '-')
        })
    })
}

/// Text after the first `-` of a tag, unless it is purely numeric
pub fn tag_suffix(tag: &str) -> Option<String> {
    let (_, rest) = tag.split_once('-')?;
    if rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit()) {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Whether a tag is non-semantic and must be tracked by digest
pub fn is_floating_tag(tag: &str) -> bool {
    let lower = tag.to_ascii_lowercase();
    FLOATING_TAGS.contains(&lower.as_str()) || parse_tag(tag).is_none()
}

/// Magnitude of the change from `current` to `latest`
///
/// Returns None when `latest` is not newer than `current`.
pub fn change_type(current: &TagVersion, latest: &TagVersion) -> Option<ChangeType> {
    if latest.cmp_version(current) != Ordering::Greater {
        return None;
    }
    let (c, l) = (&current.version, &latest.version);
    if l.major != c.major {
        Some(ChangeType::Major)
    } else if l.minor != c.minor {
        Some(ChangeType::Minor)
    } else {
        Some(ChangeType::Patch)
    }
}

/// Find the newest tag within `scope` that is strictly newer than `current_tag`
///
/// Only tags with the same shape as the current tag are candidates: the same
/// number of numeric components and the same variant suffix. Prereleases are
/// skipped unless requested or the current tag is itself a prerelease.
/// Ties prefer the tag whose `v` prefix matches the current tag.
pub fn find_latest_in_scope(
    current_tag: &str,
    available_tags: &[String],
    scope: Scope,
    include_prereleases: bool,
) -> Option<String> {
    let current = parse_tag(current_tag)?;
    let allow_pre = include_prereleases || current.is_prerelease();

    available_tags
        .iter()
        .filter_map(|tag| parse_tag(tag).map(|v| (tag, v)))
        .filter(|(_, v)| v.components == current.components)
        .filter(|(_, v)| v.suffix == current.suffix)
        .filter(|(_, v)| allow_pre || !v.is_prerelease())
        .filter(|(_, v)| match scope {
            Scope::Patch => {
                v.version.major == current.version.major
                    && v.version.minor == current.version.minor
            }
            Scope::Minor => v.version.major == current.version.major,
            Scope::Major => true,
        })
        .filter(|(_, v)| v.cmp_version(&current) == Ordering::Greater)
        .max_by(|(_, a), (_, b)| {
            a.cmp_version(b).then_with(|| {
                (a.prefixed == current.prefixed).cmp(&(b.prefixed == current.prefixed))
            })
        })
        .map(|(tag, _)| tag.clone())
}

/// Find the newest tag ignoring scope
pub fn find_latest_major(
    current_tag: &str,
    available_tags: &[String],
    include_prereleases: bool,
) -> Option<String> {
    find_latest_in_scope(current_tag, available_tags, Scope::Major, include_prereleases)
}
