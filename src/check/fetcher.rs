//! Tag fetch orchestration
//!
//! [`TagFetcher`] composes the run cache, the rate limiter and a registry
//! client into one call per image signature:
//!
//! ```text
//! fetch_tags ──▶ run cache hit? ──yes──▶ cached result
//!                     │ no
//!                     ▼
//!              rate limiter permit ──▶ client ──▶ result ──▶ run cache
//! ```
//!
//! Registry failures never escape as errors. They come back as a
//! [`TagFetchResult`] with `error` set, and are not cached.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::check::context::CheckRunContext;
use crate::check::error::RegistryError;
use crate::check::rate_limiter::RegistryRateLimiter;
use crate::check::registry::{RegistryClient, RegistryClientFactory};
use crate::check::types::{ImageCheckKey, Scope, TagFetchResult, TrackedContainer};
use crate::config::EngineConfig;

/// Everything needed to fetch tags for one image signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFetchRequest {
    pub registry: String,
    pub image: String,
    pub current_tag: String,
    pub scope: Scope,
    pub include_prereleases: bool,
    /// Last known digest, only meaningful for floating tags
    pub current_digest: Option<String>,
}

impl TagFetchRequest {
    pub fn from_key(key: &ImageCheckKey, current_digest: Option<&str>) -> Self {
        Self {
            registry: key.registry.clone(),
            image: key.image.clone(),
            current_tag: key.current_tag.clone(),
            scope: key.scope,
            include_prereleases: key.include_prereleases,
            current_digest: current_digest.map(str::to_string),
        }
    }

    pub fn key(&self) -> ImageCheckKey {
        ImageCheckKey::new(
            &self.registry,
            &self.image,
            &self.current_tag,
            self.scope,
            self.include_prereleases,
        )
    }
}

/// Outcome of [`TagFetcher::fetch_tags`]
#[derive(Debug, Clone)]
pub struct TagFetchResponse {
    pub result: Arc<TagFetchResult>,
    /// Served from the run cache without touching the registry
    pub cache_hit: bool,
    /// Time spent waiting on the rate limiter window
    pub rate_limit_wait: Duration,
}

impl TagFetchResponse {
    pub fn error(&self) -> Option<&str> {
        self.result.error.as_deref()
    }
}

pub struct TagFetcher {
    limiter: Arc<RegistryRateLimiter>,
    factory: Arc<dyn RegistryClientFactory>,
    /// Global default for containers without a prerelease override
    include_prereleases: bool,
    collect_all_tags: bool,
}

impl TagFetcher {
    pub fn new(limiter: Arc<RegistryRateLimiter>, factory: Arc<dyn RegistryClientFactory>) -> Self {
        Self {
            limiter,
            factory,
            include_prereleases: false,
            collect_all_tags: false,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        limiter: Arc<RegistryRateLimiter>,
        factory: Arc<dyn RegistryClientFactory>,
    ) -> Self {
        Self::new(limiter, factory)
            .with_default_prereleases(config.include_prereleases)
            .with_collect_all_tags(config.collect_all_tags)
    }

    pub fn with_default_prereleases(mut self, include: bool) -> Self {
        self.include_prereleases = include;
        self
    }

    /// Also list every tag on registries that answer "latest" directly
    pub fn with_collect_all_tags(mut self, collect: bool) -> Self {
        self.collect_all_tags = collect;
        self
    }

    pub fn limiter(&self) -> &Arc<RegistryRateLimiter> {
        &self.limiter
    }

    /// Container override if present, otherwise the global default
    pub fn effective_prereleases(&self, container: &TrackedContainer) -> bool {
        container
            .include_prereleases
            .unwrap_or(self.include_prereleases)
    }

    /// Fetch tags for a container, resolving its effective prerelease setting
    pub async fn fetch_for_container(
        &self,
        container: &TrackedContainer,
        context: Option<&CheckRunContext>,
    ) -> TagFetchResponse {
        let request = TagFetchRequest {
            registry: container.registry.clone(),
            image: container.image.clone(),
            current_tag: container.current_tag.clone(),
            scope: container.scope,
            include_prereleases: self.effective_prereleases(container),
            current_digest: container.current_digest.clone(),
        };
        self.fetch_tags(&request, context).await
    }

    /// Fetch tags for a pre-built key
    pub async fn fetch_for_key(
        &self,
        key: &ImageCheckKey,
        current_digest: Option<&str>,
        context: Option<&CheckRunContext>,
    ) -> TagFetchResponse {
        self.fetch_tags(&TagFetchRequest::from_key(key, current_digest), context)
            .await
    }

    pub async fn fetch_tags(
        &self,
        request: &TagFetchRequest,
        context: Option<&CheckRunContext>,
    ) -> TagFetchResponse {
        let key = request.key();

        if let Some(cached) = context.and_then(|ctx| ctx.get_cached_result(&key)) {
            return TagFetchResponse {
                result: cached,
                cache_hit: true,
                rate_limit_wait: Duration::ZERO,
            };
        }

        let permit = self.limiter.acquire(&key.registry).await;
        let rate_limit_wait = permit.wait();

        let outcome = match self.factory.create_client(&key.registry) {
            Ok(client) => {
                let outcome = self.fetch_with_client(client.as_ref(), &key, request).await;
                client.close().await;
                outcome
            }
            Err(e) => Err(e),
        };
        permit.release();

        match outcome {
            Ok(result) => {
                info!(
                    "Fetched {}: latest={:?} latest_major={:?} ({} tags)",
                    key,
                    result.latest_tag,
                    result.latest_major_tag,
                    result.tags.len()
                );
                let result = Arc::new(result);
                if let Some(ctx) = context {
                    ctx.set_cached_result(key, result.clone());
                }
                TagFetchResponse {
                    result,
                    cache_hit: false,
                    rate_limit_wait,
                }
            }
            Err(e) => {
                error!("Failed to fetch tags for {}: {}", key, e);
                TagFetchResponse {
                    result: Arc::new(TagFetchResult::failed(e.to_string())),
                    cache_hit: false,
                    rate_limit_wait,
                }
            }
        }
    }

    async fn fetch_with_client(
        &self,
        client: &dyn RegistryClient,
        key: &ImageCheckKey,
        request: &TagFetchRequest,
    ) -> Result<TagFetchResult, RegistryError> {
        let image = request.image.as_str();
        let current_tag = request.current_tag.as_str();

        if client.is_floating_tag(current_tag) {
            debug!("{} is a floating tag, fetching digest only", key);
            let metadata = client
                .get_tag_metadata(image, current_tag)
                .await?
                .ok_or_else(|| RegistryError::NotFound(format!("{}:{}", image, current_tag)))?;
            return Ok(TagFetchResult::floating(metadata));
        }

        let (tags, latest_tag) = if client.uses_tag_cache_for_latest() {
            debug!("Listing tags before latest lookup for {}", key);
            let tags = client.get_all_tags(image).await?;
            let latest = client
                .get_latest_tag(
                    image,
                    current_tag,
                    request.scope,
                    request.current_digest.clone(),
                    request.include_prereleases,
                )
                .await?;
            (tags, latest)
        } else {
            let latest = client
                .get_latest_tag(
                    image,
                    current_tag,
                    request.scope,
                    request.current_digest.clone(),
                    request.include_prereleases,
                )
                .await?;
            let tags = if self.collect_all_tags {
                client.get_all_tags(image).await?
            } else {
                Vec::new()
            };
            (tags, latest)
        };

        let latest_major_tag = if request.scope == Scope::Major {
            latest_tag.clone()
        } else {
            client
                .get_latest_major_tag(image, current_tag, request.include_prereleases)
                .await
                .inspect_err(|e| warn!("Failed to fetch latest major tag for {}: {}", key, e))
                .unwrap_or(None)
        };

        Ok(TagFetchResult::success(
            tags,
            latest_tag,
            latest_major_tag,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::rate_limiter::RateLimitConfig;
    use crate::check::registry::MockRegistryClient;
    use crate::check::types::TagMetadata;
    use mockall::Sequence;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out pre-configured mock clients in order
    struct QueueFactory {
        clients: Mutex<VecDeque<MockRegistryClient>>,
        created: AtomicUsize,
    }

    impl QueueFactory {
        fn new(clients: Vec<MockRegistryClient>) -> Arc<Self> {
            Arc::new(Self {
                clients: Mutex::new(clients.into()),
                created: AtomicUsize::new(0),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl RegistryClientFactory for QueueFactory {
        fn create_client(&self, registry: &str) -> Result<Box<dyn RegistryClient>, RegistryError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.clients
                .lock()
                .unwrap()
                .pop_front()
                .map(|client| Box::new(client) as Box<dyn RegistryClient>)
                .ok_or_else(|| RegistryError::UnsupportedRegistry(registry.to_string()))
        }
    }

    fn fetcher(factory: Arc<QueueFactory>) -> TagFetcher {
        let limits = HashMap::from([("ghcr".to_string(), RateLimitConfig::new(100, 5, 5))]);
        TagFetcher::new(Arc::new(RegistryRateLimiter::new(limits, 10)), factory)
    }

    fn request(tag: &str, scope: Scope) -> TagFetchRequest {
        TagFetchRequest {
            registry: "ghcr.io".to_string(),
            image: "org/app".to_string(),
            current_tag: tag.to_string(),
            scope,
            include_prereleases: false,
            current_digest: None,
        }
    }

    fn semantic_client(uses_tag_cache: bool) -> MockRegistryClient {
        let mut client = MockRegistryClient::new();
        client.expect_is_floating_tag().returning(|_| false);
        client
            .expect_uses_tag_cache_for_latest()
            .return_const(uses_tag_cache);
        client.expect_close().times(1).returning(|| ());
        client
    }

    #[tokio::test]
    async fn fetch_tags_lists_tags_before_latest_when_client_uses_tag_cache() {
        let mut client = semantic_client(true);
        let mut seq = Sequence::new();
        client
            .expect_get_all_tags()
            .withf(|image| image == "org/app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec!["1.0.0".to_string(), "1.0.1".to_string()]));
        client
            .expect_get_latest_tag()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Ok(Some("1.0.1".to_string())));
        client
            .expect_get_latest_major_tag()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(Some("2.0.0".to_string())));

        let factory = QueueFactory::new(vec![client]);
        let response = fetcher(factory.clone())
            .fetch_tags(&request("1.0.0", Scope::Patch), None)
            .await;

        assert!(!response.cache_hit);
        assert_eq!(response.error(), None);
        assert_eq!(response.result.tags, vec!["1.0.0", "1.0.1"]);
        assert_eq!(response.result.latest_tag.as_deref(), Some("1.0.1"));
        assert_eq!(response.result.latest_major_tag.as_deref(), Some("2.0.0"));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn fetch_tags_queries_latest_directly_without_listing() {
        let mut client = semantic_client(false);
        client
            .expect_get_latest_tag()
            .withf(|image, tag, scope, digest, pre| {
                image == "org/app"
                    && tag == "1.0.0"
                    && *scope == Scope::Minor
                    && digest.is_none()
                    && !*pre
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(Some("1.2.0".to_string())));
        client.expect_get_all_tags().times(0);
        client
            .expect_get_latest_major_tag()
            .times(1)
            .returning(|_, _, _| Ok(None));

        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_tags(&request("1.0.0", Scope::Minor), None)
            .await;

        assert!(response.result.tags.is_empty());
        assert_eq!(response.result.latest_tag.as_deref(), Some("1.2.0"));
        assert_eq!(response.result.latest_major_tag, None);
    }

    #[tokio::test]
    async fn fetch_tags_lists_tags_after_latest_when_collecting_all_tags() {
        let mut client = semantic_client(false);
        let mut seq = Sequence::new();
        client
            .expect_get_latest_tag()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Ok(None));
        client
            .expect_get_all_tags()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec!["1.0.0".to_string()]));
        client
            .expect_get_latest_major_tag()
            .returning(|_, _, _| Ok(None));

        let response = fetcher(QueueFactory::new(vec![client]))
            .with_collect_all_tags(true)
            .fetch_tags(&request("1.0.0", Scope::Patch), None)
            .await;

        assert_eq!(response.result.tags, vec!["1.0.0"]);
    }

    #[tokio::test]
    async fn fetch_tags_reads_digest_only_for_floating_tags() {
        let mut client = MockRegistryClient::new();
        client
            .expect_is_floating_tag()
            .withf(|tag| tag == "latest")
            .returning(|_| true);
        client
            .expect_get_tag_metadata()
            .withf(|image, tag| image == "org/app" && tag == "latest")
            .times(1)
            .returning(|_, _| {
                Ok(Some(TagMetadata {
                    digest: Some("sha256:abc".to_string()),
                    last_updated: None,
                }))
            });
        client.expect_get_all_tags().times(0);
        client.expect_get_latest_tag().times(0);
        client.expect_get_latest_major_tag().times(0);
        client.expect_close().times(1).returning(|| ());

        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_tags(&request("latest", Scope::Patch), None)
            .await;

        assert_eq!(response.error(), None);
        assert_eq!(response.result.digest(), Some("sha256:abc"));
        assert!(response.result.floating_tag);
        assert!(response.result.tags.is_empty());
        assert_eq!(response.result.latest_tag, None);
    }

    #[tokio::test]
    async fn fetch_tags_reports_missing_floating_tag_as_error() {
        let mut client = MockRegistryClient::new();
        client.expect_is_floating_tag().returning(|_| true);
        client
            .expect_get_tag_metadata()
            .returning(|_, _| Ok(None));
        client.expect_close().times(1).returning(|| ());

        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_tags(&request("edge", Scope::Patch), None)
            .await;

        assert_eq!(response.error(), Some("Image not found: org/app:edge"));
    }

    #[tokio::test]
    async fn fetch_tags_skips_major_lookup_for_major_scope() {
        let mut client = semantic_client(true);
        client
            .expect_get_all_tags()
            .returning(|_| Ok(vec!["1.0.0".to_string(), "3.0.0".to_string()]));
        client
            .expect_get_latest_tag()
            .returning(|_, _, _, _, _| Ok(Some("3.0.0".to_string())));
        client.expect_get_latest_major_tag().times(0);

        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_tags(&request("1.0.0", Scope::Major), None)
            .await;

        assert_eq!(response.result.latest_tag.as_deref(), Some("3.0.0"));
        assert_eq!(response.result.latest_major_tag.as_deref(), Some("3.0.0"));
    }

    #[tokio::test]
    async fn fetch_tags_treats_major_lookup_failure_as_absent() {
        let mut client = semantic_client(false);
        client
            .expect_get_latest_tag()
            .returning(|_, _, _, _, _| Ok(Some("1.0.1".to_string())));
        client
            .expect_get_latest_major_tag()
            .returning(|_, _, _| Err(RegistryError::InvalidResponse("boom".to_string())));

        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_tags(&request("1.0.0", Scope::Patch), None)
            .await;

        assert_eq!(response.error(), None);
        assert_eq!(response.result.latest_tag.as_deref(), Some("1.0.1"));
        assert_eq!(response.result.latest_major_tag, None);
    }

    #[tokio::test]
    async fn fetch_tags_returns_cached_result_on_second_call() {
        let mut client = semantic_client(false);
        client
            .expect_get_latest_tag()
            .times(1)
            .returning(|_, _, _, _, _| Ok(Some("1.0.1".to_string())));
        client
            .expect_get_latest_major_tag()
            .times(1)
            .returning(|_, _, _| Ok(None));

        let factory = QueueFactory::new(vec![client]);
        let fetcher = fetcher(factory.clone());
        let context = CheckRunContext::new();

        let first = fetcher
            .fetch_tags(&request("1.0.0", Scope::Patch), Some(&context))
            .await;
        let second = fetcher
            .fetch_tags(&request("1.0.0", Scope::Patch), Some(&context))
            .await;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert!(Arc::ptr_eq(&first.result, &second.result));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn fetch_tags_does_not_cache_errors() {
        let mut failing = semantic_client(false);
        failing
            .expect_get_latest_tag()
            .returning(|_, _, _, _, _| {
                Err(RegistryError::RateLimited {
                    retry_after_secs: Some(30),
                })
            });
        let mut succeeding = semantic_client(false);
        succeeding
            .expect_get_latest_tag()
            .returning(|_, _, _, _, _| Ok(None));
        succeeding
            .expect_get_latest_major_tag()
            .returning(|_, _, _| Ok(None));

        let factory = QueueFactory::new(vec![failing, succeeding]);
        let fetcher = fetcher(factory.clone());
        let context = CheckRunContext::new();

        let first = fetcher
            .fetch_tags(&request("1.0.0", Scope::Patch), Some(&context))
            .await;
        assert_eq!(first.error(), Some("Rate limited: retry after 30 seconds"));
        assert!(first.result.tags.is_empty());
        assert_eq!(context.cached_count(), 0);

        let second = fetcher
            .fetch_tags(&request("1.0.0", Scope::Patch), Some(&context))
            .await;
        assert!(!second.cache_hit);
        assert_eq!(second.error(), None);
        assert_eq!(factory.created(), 2);
        assert_eq!(context.cached_count(), 1);
    }

    #[tokio::test]
    async fn fetch_tags_converts_client_construction_failure_to_error_result() {
        let factory = QueueFactory::new(vec![]);

        let response = fetcher(factory)
            .fetch_tags(&request("1.0.0", Scope::Patch), None)
            .await;

        assert_eq!(response.error(), Some("Unsupported registry: ghcr"));
        assert!(!response.cache_hit);
    }

    #[tokio::test]
    async fn fetch_tags_releases_rate_limit_slot_after_failure() {
        let mut failing = semantic_client(false);
        failing
            .expect_get_latest_tag()
            .returning(|_, _, _, _, _| Err(RegistryError::NotFound("org/app".to_string())));

        let limits = HashMap::from([("ghcr".to_string(), RateLimitConfig::new(100, 1, 1))]);
        let limiter = Arc::new(RegistryRateLimiter::new(limits, 1));
        let fetcher = TagFetcher::new(limiter.clone(), QueueFactory::new(vec![failing]));

        fetcher
            .fetch_tags(&request("1.0.0", Scope::Patch), None)
            .await;

        let permit = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("ghcr")).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn fetch_for_container_prefers_container_prerelease_override() {
        let mut client = semantic_client(false);
        client
            .expect_get_latest_tag()
            .withf(|_, _, _, _, pre| *pre)
            .times(1)
            .returning(|_, _, _, _, _| Ok(None));
        client
            .expect_get_latest_major_tag()
            .withf(|_, _, pre| *pre)
            .returning(|_, _, _| Ok(None));

        let fetcher = fetcher(QueueFactory::new(vec![client])).with_default_prereleases(false);
        let container =
            TrackedContainer::from_reference("app", "ghcr.io/org/app:1.0.0", Scope::Patch)
                .unwrap()
                .with_prereleases(true);

        let response = fetcher.fetch_for_container(&container, None).await;

        assert_eq!(response.error(), None);
    }

    #[test]
    fn effective_prereleases_falls_back_to_global_default() {
        let fetcher = fetcher(QueueFactory::new(vec![])).with_default_prereleases(true);
        let container =
            TrackedContainer::from_reference("app", "ghcr.io/org/app:1.0.0", Scope::Patch).unwrap();

        assert!(fetcher.effective_prereleases(&container));
        assert!(!fetcher.effective_prereleases(&container.clone().with_prereleases(false)));
    }

    #[tokio::test]
    async fn fetch_for_key_passes_current_digest_to_client() {
        let mut client = semantic_client(false);
        client
            .expect_get_latest_tag()
            .withf(|_, _, _, digest, _| digest.as_deref() == Some("sha256:old"))
            .times(1)
            .returning(|_, _, _, _, _| Ok(None));
        client
            .expect_get_latest_major_tag()
            .returning(|_, _, _| Ok(None));

        let key = ImageCheckKey::new("ghcr.io", "org/app", "1.0.0", Scope::Patch, false);
        let response = fetcher(QueueFactory::new(vec![client]))
            .fetch_for_key(&key, Some("sha256:old"), None)
            .await;

        assert_eq!(response.error(), None);
    }
}
