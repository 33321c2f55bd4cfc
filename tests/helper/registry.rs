//! In-memory registry for check run tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tagscope::check::error::RegistryError;
use tagscope::check::fetcher::TagFetcher;
use tagscope::check::rate_limiter::{RateLimitConfig, RegistryRateLimiter};
use tagscope::check::registry::{RegistryClient, RegistryClientFactory};
use tagscope::check::semver::{find_latest_in_scope, find_latest_major};
use tagscope::check::types::{Scope, TagMetadata};

#[derive(Default)]
struct RegistryState {
    tags: HashMap<String, Vec<String>>,
    digests: HashMap<String, String>,
    failing: HashMap<String, String>,
}

/// Call counters shared by every client the factory hands out
#[derive(Default)]
pub struct CallCounts {
    pub clients: AtomicUsize,
    pub tag_listings: AtomicUsize,
    pub metadata_lookups: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Mock registry serving fixed tags and digests
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
    counts: Arc<CallCounts>,
    latency: Duration,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            counts: Arc::new(CallCounts::default()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_tags(self, image: &str, tags: &[&str]) -> Self {
        self.state.lock().unwrap().tags.insert(
            image.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn with_digest(self, image: &str, tag: &str, digest: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .digests
            .insert(format!("{}:{}", image, tag), digest.to_string());
        self
    }

    /// Every call for `image` fails with an invalid response
    pub fn failing(self, image: &str, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(image.to_string(), message.to_string());
        self
    }

    /// Simulated time spent per registry call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn counts(&self) -> Arc<CallCounts> {
        self.counts.clone()
    }
}

impl RegistryClientFactory for FakeRegistry {
    fn create_client(&self, _registry: &str) -> Result<Box<dyn RegistryClient>, RegistryError> {
        self.counts.clients.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeClient {
            state: self.state.clone(),
            counts: self.counts.clone(),
            latency: self.latency,
        }))
    }
}

struct FakeClient {
    state: Arc<Mutex<RegistryState>>,
    counts: Arc<CallCounts>,
    latency: Duration,
}

impl FakeClient {
    async fn call<T>(
        &self,
        image: &str,
        f: impl FnOnce(&RegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let now = self.counts.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = {
            let state = self.state.lock().unwrap();
            match state.failing.get(image) {
                Some(message) => Err(RegistryError::InvalidResponse(message.clone())),
                None => f(&state),
            }
        };

        self.counts.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn tags(state: &RegistryState, image: &str) -> Result<Vec<String>, RegistryError> {
        state
            .tags
            .get(image)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))
    }
}

#[async_trait]
impl RegistryClient for FakeClient {
    fn uses_tag_cache_for_latest(&self) -> bool {
        true
    }

    async fn get_latest_tag(
        &self,
        image: &str,
        current_tag: &str,
        scope: Scope,
        _current_digest: Option<String>,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError> {
        self.call(image, |state| {
            let tags = Self::tags(state, image)?;
            Ok(find_latest_in_scope(
                current_tag,
                &tags,
                scope,
                include_prereleases,
            ))
        })
        .await
    }

    async fn get_latest_major_tag(
        &self,
        image: &str,
        current_tag: &str,
        include_prereleases: bool,
    ) -> Result<Option<String>, RegistryError> {
        self.call(image, |state| {
            let tags = Self::tags(state, image)?;
            Ok(find_latest_major(current_tag, &tags, include_prereleases))
        })
        .await
    }

    async fn get_all_tags(&self, image: &str) -> Result<Vec<String>, RegistryError> {
        self.counts.tag_listings.fetch_add(1, Ordering::SeqCst);
        self.call(image, |state| Self::tags(state, image)).await
    }

    async fn get_tag_metadata(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<Option<TagMetadata>, RegistryError> {
        self.counts.metadata_lookups.fetch_add(1, Ordering::SeqCst);
        self.call(image, |state| {
            Ok(state
                .digests
                .get(&format!("{}:{}", image, tag))
                .map(|digest| TagMetadata {
                    digest: Some(digest.clone()),
                    last_updated: None,
                }))
        })
        .await
    }

    async fn close(&self) {}
}

/// Fetcher over `registry` with generous limits unless overridden
pub fn create_test_fetcher(registry: FakeRegistry, global_concurrency: usize) -> TagFetcher {
    let limits = ["dockerhub", "ghcr", "quay"]
        .into_iter()
        .map(|name| (name.to_string(), RateLimitConfig::new(1000, 10, 10)))
        .collect();
    let limiter = RegistryRateLimiter::new(limits, global_concurrency);
    TagFetcher::new(Arc::new(limiter), Arc::new(registry))
}
