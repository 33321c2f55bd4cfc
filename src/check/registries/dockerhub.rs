//! Docker Hub repository API registry implementation

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::check::error::RegistryError;
use crate::check::registries::{check_status, http_client};
use crate::check::registry::RegistryClient;
use crate::check::semver::{find_latest_in_scope, find_latest_major, parse_tag};
use crate::check::types::{Scope, TagMetadata};
use crate::config::{MAX_TAG_PAGES, TAG_PAGE_SIZE};

/// One page of the tag listing endpoint
#[derive(Debug, Deserialize)]
struct TagPage {
    next: Option<String>,
    results: Vec<HubTag>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
    digest: Option<String>,
    last_updated: Option<String>,
}

/// Registry implementation for Docker Hub
///
/// Docker Hub can filter tags by name server-side, so "latest within scope"
/// is answered with a narrow query instead of listing every tag first.
pub struct DockerHubClient {
    client: reqwest::Client,
    base_url: String,
    max_tag_pages: usize,
}

impl DockerHubClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tag_pages: MAX_TAG_PAGES,
        })
    }

    pub fn with_max_tag_pages(mut self, pages: usize) -> Self {
        self.max_tag_pages = pages.max(1);
        self
    }

    /// Official images live under the `library` namespace
    fn repository(image: &str) -> String {
        if image.contains('/') {
            image.to_string()
        } else {
            format!("library/{}", image)
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        image: &str,
    ) -> Result<T, RegistryError> {
        debug!("Fetching Docker Hub URL: {}", url);
        let response = self.client.get(url).send().await?;
        let response = check_status(response, image)?;

        response.json().await.map_err(|e| {
            warn!("Failed to parse Docker Hub response: {}", e);
            RegistryError::InvalidResponse(e.to_string())
        })
    }

    async fn list_tags(
        &self,
        image: &str,
        name_filter: Option<&str>,
    ) -> Result<Vec<HubTag>, RegistryError> {
        let mut url = format!(
            "{}/v2/repositories/{}/tags?page_size={}",
            self.base_url,
            Self::repository(image),
            TAG_PAGE_SIZE
        );
        if let Some(filter) = name_filter {
            url.push_str("&name=");
            url.push_str(filter);
        }

        let mut tags = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;

        while let Some(url) = next {
            if pages == self.max_tag_pages {
                warn!(
                    "Stopped listing tags for {} after {} pages",
                    image, self.max_tag_pages
                );
                break;
            }
            let page: TagPage = self.get_json(&url, image).await?;
            tags.extend(page.results);
            next = page.next;
            pages += 1;
        }

        Ok(tags)
    }

    /// Server-side name filter narrowing the listing to the scope
    ///
    /// Examples:
    /// - "1.2.3", patch -> "1.2."
    /// - "v1.2", minor -> "v1."
    /// - "1.2.3", major -> None
    fn scope_filter(current_tag: &str, scope: Scope) -> Option<String> {
        let current = parse_tag(current_tag)?;
        let prefix = if current.prefixed { &current_tag[..1] } else { "" };
        let version = &current.version;
        match scope {
            Scope::Patch if current.components == 3 => {
                Some(format!("{}{}.{}.", prefix, version.major, version.minor))
            }
            Scope::Patch | Scope::Minor if current.components >= 2 => {
                Some(format!("{}{}.", prefix, version.major))
            }
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl RegistryClient for DockerHubClient {
    fn uses_tag_cache_for_latest(&self) -> bool {
        false
    }

    async fn get_latest_tag(
        &self,
        image: &str,
        current_tag: &str,
        scope: Scope,
        _current_digest: Option<String>,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError> {
        let filter = Self::scope_filter(current_tag, scope);
        let names: Vec<String> = self
            .list_tags(image, filter.as_deref())
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();

        Ok(find_latest_in_scope(
            current_tag,
            &names,
            scope,
            include_prereleases,
        ))
    }

    async fn get_latest_major_tag(
        &self,
        image: &str,
        current_tag: &str,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError> {
        let names = self.get_all_tags(image).await?;
        Ok(find_latest_major(current_tag, &names, include_prereleases))
    }

    async fn get_all_tags(&self, image: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .list_tags(image, None)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    async fn get_tag_metadata(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<Option<TagMetadata>, RegistryError> {
        let url = format!(
            "{}/v2/repositories/{}/tags/{}",
            self.base_url,
            Self::repository(image),
            tag
        );

        match self.get_json::<HubTag>(&url, image).await {
            Ok(hub_tag) => Ok(Some(TagMetadata {
                digest: hub_tag.digest,
                last_updated: hub_tag.last_updated,
            })),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        debug!("Closing Docker Hub client for {}", self.base_url);
    }
}
