//! Registry client abstraction used by the tag fetcher

#[cfg(test)]
use mockall::automock;

use crate::check::error::RegistryError;
use crate::check::semver;
use crate::check::types::{Scope, TagMetadata};

/// Trait for querying tags of a container image from one registry
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Whether "latest within scope" is answered from a tag list that
    /// [`RegistryClient::get_all_tags`] populates, so listing first is cheaper
    fn uses_tag_cache_for_latest(&self) -> bool;

    /// Whether `tag` is non-semantic and tracked by digest on this registry
    fn is_floating_tag(&self, tag: &str) -> bool {
        semver::is_floating_tag(tag)
    }

    /// Newest tag within `scope` that is newer than `current_tag`
    ///
    /// # Returns
    /// * `Ok(Some(tag))` - A newer tag exists within scope
    /// * `Ok(None)` - The current tag is the newest within scope
    /// * `Err(RegistryError)` - If the fetch fails
    async fn get_latest_tag(
        &self,
        image: &str,
        current_tag: &str,
        scope: Scope,
        current_digest: Option<String>,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError>;

    /// Newest tag ignoring scope
    async fn get_latest_major_tag(
        &self,
        image: &str,
        current_tag: &str,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError>;

    /// Every tag known for the image
    async fn get_all_tags(&self, image: &str) -> Result<Vec<String>, RegistryError>;

    /// Digest and timestamps for one tag, None if the tag does not exist
    async fn get_tag_metadata(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<Option<TagMetadata>, RegistryError>;

    /// Release connections and per-client caches
    async fn close(&self);
}

/// Creates registry clients by canonical registry name
pub trait RegistryClientFactory: Send + Sync {
    fn create_client(&self, registry: &str) -> Result<Box<dyn RegistryClient>, RegistryError>;
}
