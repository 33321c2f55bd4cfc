//! Update check engine for container images
//!
//! Decides, for a batch of tracked containers, whether a newer image is
//! available within each container's update scope.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Check run  │────▶│   Context   │◀────│ TagFetcher  │
//! │  (group)    │     │(cache,stats)│     │  (fetch)    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Decision   │     │ RateLimiter │◀────│ Registries  │
//! │   maker     │     │(window,cap) │     │(hub, oci)   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`context`]: Run-scoped dedup, result cache and metrics
//! - [`rate_limiter`]: Per-registry sliding window plus global concurrency cap
//! - [`fetcher`]: Cache, limiter and client composed into one fetch call
//! - [`decision`]: Pure tag, digest and scope-violation logic
//! - [`run`]: One full check run over a batch of containers
//! - [`registry`]: Registry client trait and factory
//! - [`registries`]: Docker Hub and OCI distribution clients
//! - [`semver`]: Tag version parsing and scope filtering
//! - [`error`]: Error types for registry and config operations
//! - [`types`]: Shared types like `ImageCheckKey` and `TagFetchResult`

pub mod context;
pub mod decision;
pub mod error;
pub mod fetcher;
pub mod rate_limiter;
pub mod registries;
pub mod registry;
pub mod run;
pub mod semver;
pub mod types;
