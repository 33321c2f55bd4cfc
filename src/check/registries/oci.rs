//! OCI distribution API registry implementation (GHCR, Quay, LSCR, GCR, ...)

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use reqwest::header::{ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::check::error::RegistryError;
use crate::check::registries::{check_status, http_client};
use crate::check::registry::RegistryClient;
use crate::check::semver::{find_latest_in_scope, find_latest_major};
use crate::check::types::{Scope, TagMetadata};
use crate::config::{MAX_TAG_PAGES, TAG_PAGE_SIZE};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern is valid"));

/// Response from `/v2/{image}/tags/list`
#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

/// Response from the token endpoint named in the auth challenge
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="..."` header
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    for caps in CHALLENGE_PARAM.captures_iter(params) {
        match &caps[1] {
            "realm" => realm = Some(caps[2].to_string()),
            "service" => service = Some(caps[2].to_string()),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}

/// Extract the `rel="next"` target from a `Link` header
fn next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find(|part| part.contains(r#"rel="next""#))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            (start < end).then(|| part[start..end].to_string())
        })
}

/// Registry implementation for registries speaking the OCI distribution API
///
/// Answers "latest" queries from a tag list filled by
/// [`RegistryClient::get_all_tags`], so the fetcher lists tags first.
pub struct OciRegistryClient {
    registry: String,
    client: reqwest::Client,
    base_url: String,
    max_tag_pages: usize,
    tokens: Mutex<HashMap<String, String>>,
    tag_cache: Mutex<HashMap<String, Vec<String>>>,
}

impl OciRegistryClient {
    pub fn new(registry: &str, base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        Ok(Self {
            registry: registry.to_string(),
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tag_pages: MAX_TAG_PAGES,
            tokens: Mutex::new(HashMap::new()),
            tag_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Page cap for tag listings; tags arrive in lexical order, so large
    /// repositories need a higher cap to reach their newest versions
    pub fn with_max_tag_pages(mut self, pages: usize) -> Self {
        self.max_tag_pages = pages.max(1);
        self
    }

    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tag_cache(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.tag_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        accept: &str,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url).header(ACCEPT, accept);
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, negotiating an anonymous pull token on a bearer challenge
    async fn send(
        &self,
        method: Method,
        url: &str,
        accept: &str,
        image: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let token = self.lock_tokens().get(image).cloned();
        let response = self
            .request(method.clone(), url, accept, token.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, image).await?;
        self.lock_tokens().insert(image.to_string(), token.clone());

        Ok(self
            .request(method, url, accept, Some(&token))
            .send()
            .await?)
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        image: &str,
    ) -> Result<String, RegistryError> {
        let separator = if challenge.realm.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}scope=repository:{}:pull",
            challenge.realm, separator, image
        );
        if let Some(service) = &challenge.service {
            url.push_str("&service=");
            url.push_str(service);
        }

        debug!("Requesting pull token for {} from {}", image, challenge.realm);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response, image)?;

        let body: TokenResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse token response from {}: {}", challenge.realm, e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Unauthorized(format!("no token issued for {}", image)))
    }

    /// Tags from the per-client cache, listing them on first use
    async fn cached_tags(&self, image: &str) -> Result<Vec<String>, RegistryError> {
        let cached = self.lock_tag_cache().get(image).cloned();
        if let Some(tags) = cached {
            debug!("Using cached tag list for {}/{}", self.registry, image);
            return Ok(tags);
        }
        self.get_all_tags(image).await
    }
}

#[async_trait::async_trait]
impl RegistryClient for OciRegistryClient {
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
        let tags = self.cached_tags(image).await?;
        Ok(find_latest_in_scope(
            current_tag,
            &tags,
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
        let tags = self.cached_tags(image).await?;
        Ok(find_latest_major(current_tag, &tags, include_prereleases))
    }

    async fn get_all_tags(&self, image: &str) -> Result<Vec<String>, RegistryError> {
        let mut url = format!("{}/v2/{}/tags/list?n={}", self.base_url, image, TAG_PAGE_SIZE);
        let mut tags = Vec::new();

        for page in 0.. {
            if page == self.max_tag_pages {
                warn!(
                    "Stopped listing tags for {}/{} after {} pages ({} tags)",
                    self.registry,
                    image,
                    self.max_tag_pages,
                    tags.len()
                );
                break;
            }

            debug!("Fetching {} tags: {}", self.registry, url);
            let response = self.send(Method::GET, &url, "application/json", image).await?;
            let response = check_status(response, image)?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);

            let list: TagList = response.json().await.map_err(|e| {
                warn!("Failed to parse {} tag list: {}", self.registry, e);
                RegistryError::InvalidResponse(e.to_string())
            })?;
            tags.extend(list.tags.unwrap_or_default());

            match next {
                Some(link) if link.starts_with("http") => url = link,
                Some(link) => url = format!("{}{}", self.base_url, link),
                None => break,
            }
        }

        self.lock_tag_cache().insert(image.to_string(), tags.clone());
        Ok(tags)
    }

    async fn get_tag_metadata(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<Option<TagMetadata>, RegistryError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, image, tag);
        let response = self.send(Method::HEAD, &url, MANIFEST_ACCEPT, image).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, image)?;

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if digest.is_none() {
            warn!("{} returned no digest for {}:{}", self.registry, image, tag);
        }

        Ok(Some(TagMetadata {
            digest,
            last_updated: None,
        }))
    }

    async fn close(&self) {
        self.lock_tag_cache().clear();
        self.lock_tokens().clear();
        debug!("Closed {} client", self.registry);
    }
}
