//! Run-scoped deduplication cache and metrics
//!
//! A [`CheckRunContext`] lives for exactly one check run. Containers that
//! share an [`ImageCheckKey`] are grouped so each image signature is fetched
//! once; results are cached for the rest of the run and discarded with the
//! context.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::check::rate_limiter::normalize_registry;
use crate::check::types::{ImageCheckKey, TagFetchResult, TrackedContainer};

/// Per-registry call counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRunStats {
    pub api_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Counters accumulated over one check run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRunMetrics {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_containers: usize,
    pub checked_containers: usize,
    pub deduplicated_containers: usize,
    pub unique_images: usize,
    pub updates_found: usize,
    pub errors: usize,
    /// Seconds spent per container check
    pub latencies: Vec<f64>,
    pub registries: BTreeMap<String, RegistryRunStats>,
}

impl CheckRunMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            total_containers: 0,
            checked_containers: 0,
            deduplicated_containers: 0,
            unique_images: 0,
            updates_found: 0,
            errors: 0,
            latencies: Vec::new(),
            registries: BTreeMap::new(),
        }
    }

    pub fn average_latency(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            None
        } else {
            Some(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
        }
    }

    /// Registry calls saved by grouping, as a fraction of all containers
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_containers == 0 {
            0.0
        } else {
            self.deduplicated_containers as f64 / self.total_containers as f64
        }
    }

    pub fn total_api_calls(&self) -> u64 {
        self.registries.values().map(|s| s.api_calls).sum()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

struct RunState {
    cache: HashMap<ImageCheckKey, Arc<TagFetchResult>>,
    metrics: CheckRunMetrics,
}

/// Cache and metrics for a single check run
///
/// All state sits behind one mutex. Critical sections are single map or
/// counter operations and never span I/O, so fetches for different keys can
/// share a context freely.
pub struct CheckRunContext {
    state: Mutex<RunState>,
}

impl CheckRunContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState {
                cache: HashMap::new(),
                metrics: CheckRunMetrics::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Group containers by image signature
    ///
    /// The effective prerelease flag of each container is taken from
    /// `prerelease_lookup` (by container id); containers absent from the
    /// lookup resolve to `false`. Groups keep first-seen order.
    pub fn group_containers<'a>(
        &self,
        containers: &'a [TrackedContainer],
        prerelease_lookup: &HashMap<String, bool>,
    ) -> IndexMap<ImageCheckKey, Vec<&'a TrackedContainer>> {
        let mut groups: IndexMap<ImageCheckKey, Vec<&'a TrackedContainer>> = IndexMap::new();

        for container in containers {
            let include_prereleases = prerelease_lookup
                .get(&container.id)
                .copied()
                .unwrap_or(false);
            let key = ImageCheckKey::new(
                &container.registry,
                &container.image,
                &container.current_tag,
                container.scope,
                include_prereleases,
            );
            groups.entry(key).or_default().push(container);
        }

        let mut state = self.lock_state();
        let metrics = &mut state.metrics;
        metrics.total_containers = containers.len();
        metrics.unique_images = groups.len();
        metrics.deduplicated_containers = containers.len() - groups.len();

        info!(
            "Grouped {} containers into {} unique images ({} deduplicated)",
            metrics.total_containers, metrics.unique_images, metrics.deduplicated_containers
        );

        groups
    }

    pub fn get_cached_result(&self, key: &ImageCheckKey) -> Option<Arc<TagFetchResult>> {
        let hit = self.lock_state().cache.get(key).cloned();
        if hit.is_some() {
            debug!("Run cache hit for {}", key);
        }
        hit
    }

    pub fn set_cached_result(&self, key: ImageCheckKey, result: Arc<TagFetchResult>) {
        debug!("Caching fetch result for {}", key);
        self.lock_state().cache.insert(key, result);
    }

    /// Number of image signatures cached so far
    pub fn cached_count(&self) -> usize {
        self.lock_state().cache.len()
    }

    pub fn record_container_check(&self, registry: &str, latency: Duration, cache_hit: bool) {
        let registry = normalize_registry(registry);
        let mut state = self.lock_state();
        let metrics = &mut state.metrics;

        metrics.checked_containers += 1;
        metrics.latencies.push(latency.as_secs_f64());

        let stats = metrics.registries.entry(registry).or_default();
        if cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
            stats.api_calls += 1;
        }
    }

    pub fn record_update_found(&self) {
        self.lock_state().metrics.updates_found += 1;
    }

    pub fn record_error(&self) {
        self.lock_state().metrics.errors += 1;
    }

    /// Stamp completion time and return the metrics
    ///
    /// Call exactly once, at the end of the run.
    pub fn finalize(&self) -> CheckRunMetrics {
        let mut state = self.lock_state();
        state.metrics.completed_at = Some(Utc::now());
        let metrics = state.metrics.clone();

        info!(
            "Check run finished: {} checked, {} unique images, {} API calls, {} updates, {} errors",
            metrics.checked_containers,
            metrics.unique_images,
            metrics.total_api_calls(),
            metrics.updates_found,
            metrics.errors
        );

        metrics
    }
}

impl Default for CheckRunContext {
    fn default() -> Self {
        Self::new()
    }
}
