//! Registry client implementations and the default factory

pub mod dockerhub;
pub mod oci;

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::check::error::RegistryError;
use crate::check::rate_limiter::normalize_registry;
use crate::check::registry::{RegistryClient, RegistryClientFactory};
use crate::config::{EngineConfig, MAX_TAG_PAGES};

pub use dockerhub::DockerHubClient;
pub use oci::OciRegistryClient;

const USER_AGENT: &str = concat!("tagscope/", env!("CARGO_PKG_VERSION"));

fn http_client(timeout: Duration) -> Result<reqwest::Client, RegistryError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

/// Map error statuses to [`RegistryError`], passing successful responses through
fn check_status(
    response: reqwest::Response,
    image: &str,
) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RegistryError::NotFound(image.to_string()));
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(RegistryError::Unauthorized(format!("{} ({})", image, status)));
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(RegistryError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !status.is_success() {
        warn!("Registry returned status {}: {}", status, response.url());
        return Err(RegistryError::InvalidResponse(format!(
            "Unexpected status: {}",
            status
        )));
    }

    Ok(response)
}

/// Default API endpoint for a canonical registry name
fn default_base_url(registry: &str) -> Option<String> {
    let url = match registry {
        "dockerhub" => "https://hub.docker.com",
        "ghcr" => "https://ghcr.io",
        "quay" => "https://quay.io",
        "lscr" => "https://lscr.io",
        "gcr" => "https://gcr.io",
        "gitlab" => "https://registry.gitlab.com",
        "ecr" => "https://public.ecr.aws",
        // Self-hosted registries are kept as their host name
        host if host.contains('.') || host.contains(':') => {
            return Some(format!("https://{}", host));
        }
        _ => return None,
    };
    Some(url.to_string())
}

/// Builds a [`DockerHubClient`] for Docker Hub and an [`OciRegistryClient`]
/// for everything else that speaks the OCI distribution API
pub struct DefaultClientFactory {
    timeout: Duration,
    max_tag_pages: usize,
    base_urls: HashMap<String, String>,
}

impl DefaultClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_tag_pages: MAX_TAG_PAGES,
            base_urls: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.request_timeout()).with_max_tag_pages(config.max_tag_pages)
    }

    /// Upper bound on pages followed when listing tags
    pub fn with_max_tag_pages(mut self, pages: usize) -> Self {
        self.max_tag_pages = pages;
        self
    }

    /// Point a registry at a different endpoint (mirrors, tests)
    pub fn with_base_url(mut self, registry: &str, base_url: &str) -> Self {
        self.base_urls
            .insert(normalize_registry(registry), base_url.to_string());
        self
    }
}

impl RegistryClientFactory for DefaultClientFactory {
    fn create_client(&self, registry: &str) -> Result<Box<dyn RegistryClient>, RegistryError> {
        let registry = normalize_registry(registry);
        let base_url = self
            .base_urls
            .get(&registry)
            .cloned()
            .or_else(|| default_base_url(&registry))
            .ok_or_else(|| RegistryError::UnsupportedRegistry(registry.clone()))?;

        if registry == "dockerhub" {
            Ok(Box::new(
                DockerHubClient::new(&base_url, self.timeout)?
                    .with_max_tag_pages(self.max_tag_pages),
            ))
        } else {
            Ok(Box::new(
                OciRegistryClient::new(&registry, &base_url, self.timeout)?
                    .with_max_tag_pages(self.max_tag_pages),
            ))
        }
    }
}
