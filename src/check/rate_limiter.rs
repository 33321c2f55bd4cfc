//! Per-registry sliding-window rate limiting with bounded concurrency
//!
//! Every registry gets its own 60 second request window and concurrency
//! semaphore, so load on one registry never delays another. A single global
//! semaphore caps outbound calls across all registries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::config::{DEFAULT_GLOBAL_CONCURRENCY, EngineConfig, RATE_WINDOW};

/// Rate limits for one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub requests_per_minute: usize,
    pub concurrent_limit: usize,
    /// Reported only; the window and the concurrency cap are what is enforced
    pub burst_limit: usize,
}

impl RateLimitConfig {
    pub const fn new(
        requests_per_minute: usize,
        concurrent_limit: usize,
        burst_limit: usize,
    ) -> Self {
        Self {
            requests_per_minute,
            concurrent_limit,
            burst_limit,
        }
    }
}

/// Applied to registries missing from the table
pub const DEFAULT_RATE_LIMIT: RateLimitConfig = RateLimitConfig::new(30, 2, 5);

/// Built-in limits keyed by canonical registry name
pub fn default_rate_limits() -> HashMap<String, RateLimitConfig> {
    [
        ("dockerhub", RateLimitConfig::new(30, 3, 5)),
        ("ghcr", RateLimitConfig::new(60, 5, 10)),
        ("quay", RateLimitConfig::new(60, 5, 10)),
        ("gcr", RateLimitConfig::new(60, 5, 10)),
        ("lscr", RateLimitConfig::new(60, 5, 10)),
        ("gitlab", RateLimitConfig::new(60, 3, 5)),
        ("ecr", RateLimitConfig::new(60, 5, 10)),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}

/// Map a registry hostname to its canonical registry name
///
/// Examples:
/// - "docker.io", "registry.hub.docker.com", "" -> "dockerhub"
/// - "ghcr.io" -> "ghcr"
/// - "eu.gcr.io" -> "gcr"
/// - "registry.example.com:5000" -> "registry.example.com:5000"
pub fn normalize_registry(registry: &str) -> String {
    let host = registry.trim().trim_end_matches('/').to_ascii_lowercase();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(&host);

    match host {
        ""
        | "docker.io"
        | "index.docker.io"
        | "registry-1.docker.io"
        | "registry.hub.docker.com"
        | "hub.docker.com"
        | "dockerhub" => "dockerhub".to_string(),
        "ghcr.io" | "ghcr" => "ghcr".to_string(),
        "quay.io" | "quay" => "quay".to_string(),
        "lscr.io" | "lscr" => "lscr".to_string(),
        "registry.gitlab.com" | "gitlab" => "gitlab".to_string(),
        "public.ecr.aws" | "ecr" => "ecr".to_string(),
        "gcr.io" | "gcr" => "gcr".to_string(),
        h if h.ends_with(".gcr.io") => "gcr".to_string(),
        h => h.to_string(),
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while window
        .front()
        .is_some_and(|ts| now.saturating_duration_since(*ts) >= RATE_WINDOW)
    {
        window.pop_front();
    }
}

/// Limiter counters for one registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryLimiterMetrics {
    pub total_requests: u64,
    /// Acquisitions that had to sleep for window room
    pub wait_count: u64,
}

struct RegistryState {
    config: RateLimitConfig,
    slots: Arc<Semaphore>,
    window: AsyncMutex<VecDeque<Instant>>,
    total_requests: AtomicU64,
    wait_count: AtomicU64,
}

impl RegistryState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            slots: Arc::new(Semaphore::new(config.concurrent_limit.max(1))),
            window: AsyncMutex::new(VecDeque::new()),
            total_requests: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
        }
    }
}

/// Capacity granted by [`RegistryRateLimiter::acquire`]
///
/// Both concurrency slots are returned when the permit is dropped, including
/// when the owning task is cancelled.
#[derive(Debug)]
pub struct RateLimitPermit {
    registry: String,
    wait: Duration,
    _registry_slot: OwnedSemaphorePermit,
    _global_slot: OwnedSemaphorePermit,
}

impl RateLimitPermit {
    /// Canonical name of the registry this permit was granted for
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Time spent waiting for room in the request window
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Return both slots now instead of at end of scope
    pub fn release(self) {}
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        debug!("Released rate limit slots for {}", self.registry);
    }
}

/// Long-lived limiter shared by every fetch across check runs
pub struct RegistryRateLimiter {
    limits: HashMap<String, RateLimitConfig>,
    global: Arc<Semaphore>,
    registries: Mutex<HashMap<String, Arc<RegistryState>>>,
}

impl RegistryRateLimiter {
    pub fn new(limits: HashMap<String, RateLimitConfig>, global_concurrency: usize) -> Self {
        Self {
            limits,
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            registries: Mutex::new(HashMap::new()),
        }
    }

    /// Built-in limits with the configured overrides applied on top
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut limits = default_rate_limits();
        for (registry, limit) in &config.rate_limits {
            limits.insert(normalize_registry(registry), *limit);
        }
        Self::new(limits, config.global_concurrency)
    }

    /// Limits applied to a registry (the default for unknown registries)
    pub fn config_for(&self, registry: &str) -> RateLimitConfig {
        self.limits
            .get(&normalize_registry(registry))
            .copied()
            .unwrap_or(DEFAULT_RATE_LIMIT)
    }

    fn state_for(&self, registry: &str) -> Arc<RegistryState> {
        let mut registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registries
            .entry(registry.to_string())
            .or_insert_with(|| {
                let config = self
                    .limits
                    .get(registry)
                    .copied()
                    .unwrap_or(DEFAULT_RATE_LIMIT);
                Arc::new(RegistryState::new(config))
            })
            .clone()
    }

    /// Wait until the registry has a free slot and window room, then the global pool
    ///
    /// The window wait happens before taking a global slot so a throttled
    /// registry never holds capacity other registries could use. The request
    /// is only counted in the window once the global slot is granted.
    pub async fn acquire(&self, registry: &str) -> RateLimitPermit {
        let registry = normalize_registry(registry);
        let state = self.state_for(&registry);

        let registry_slot = state
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("registry semaphore is never closed");

        let (wait, global_slot) = self.admit(&registry, &state).await;

        state.total_requests.fetch_add(1, Ordering::Relaxed);

        RateLimitPermit {
            registry,
            wait,
            _registry_slot: registry_slot,
            _global_slot: global_slot,
        }
    }

    /// Wait for window room, take a global slot, then record the request
    ///
    /// The window lock is held throughout, so no other request of this
    /// registry can be recorded between the room check and the append.
    async fn admit(
        &self,
        registry: &str,
        state: &RegistryState,
    ) -> (Duration, OwnedSemaphorePermit) {
        let limit = state.config.requests_per_minute.max(1);
        let mut window = state.window.lock().await;
        let mut waited = Duration::ZERO;

        loop {
            prune_window(&mut window, Instant::now());
            if window.len() < limit {
                break;
            }
            let Some(oldest) = window.front().copied() else {
                break;
            };
            let delay = (oldest + RATE_WINDOW).saturating_duration_since(Instant::now());

            if waited.is_zero() {
                state.wait_count.fetch_add(1, Ordering::Relaxed);
            }
            debug!(
                "Rate limit reached for {} ({}/min), waiting {:.2}s",
                registry,
                limit,
                delay.as_secs_f64()
            );
            sleep(delay).await;
            waited += delay;
        }

        let global_slot = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("global semaphore is never closed");

        // Pruning only shrinks the window, so the room found above is still there
        let now = Instant::now();
        prune_window(&mut window, now);
        window.push_back(now);

        (waited, global_slot)
    }

    /// Per-registry counters since the last reset
    pub fn metrics(&self) -> BTreeMap<String, RegistryLimiterMetrics> {
        let registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registries
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    RegistryLimiterMetrics {
                        total_requests: state.total_requests.load(Ordering::Relaxed),
                        wait_count: state.wait_count.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Zero the counters; window state and slots are kept
    pub fn reset_metrics(&self) {
        let registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for state in registries.values() {
            state.total_requests.store(0, Ordering::Relaxed);
            state.wait_count.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for RegistryRateLimiter {
    fn default() -> Self {
        Self::new(default_rate_limits(), DEFAULT_GLOBAL_CONCURRENCY)
    }
}
