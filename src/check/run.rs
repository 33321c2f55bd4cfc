//! One check run over a batch of containers

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info};

use crate::check::context::{CheckRunContext, CheckRunMetrics};
use crate::check::decision::{ContainerState, UpdateDecision, UpdateDecisionMaker};
use crate::check::fetcher::{TagFetchResponse, TagFetcher};
use crate::check::types::{ImageCheckKey, TrackedContainer};

/// Decision for one container of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCheck {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub current_tag: String,
    /// Result came from the run cache instead of a registry call
    pub cache_hit: bool,
    pub decision: UpdateDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRunReport {
    /// Same order as the input containers
    pub checks: Vec<ContainerCheck>,
    pub metrics: CheckRunMetrics,
}

impl CheckRunReport {
    pub fn updates(&self) -> impl Iterator<Item = &ContainerCheck> {
        self.checks.iter().filter(|c| c.decision.has_update)
    }
}

/// Check every container once
///
/// Containers sharing an image signature are fetched once; groups are
/// fetched concurrently and throttled by the fetcher's rate limiter. A
/// failed fetch only marks the containers of its own group as errored.
pub async fn check_containers(
    fetcher: &TagFetcher,
    containers: &[TrackedContainer],
) -> CheckRunReport {
    let context = CheckRunContext::new();
    let prerelease_lookup: HashMap<String, bool> = containers
        .iter()
        .map(|c| (c.id.clone(), fetcher.effective_prereleases(c)))
        .collect();

    let groups = context.group_containers(containers, &prerelease_lookup);

    let futures = groups.iter().map(|(key, members)| {
        let context = &context;
        let current_digest = members.first().and_then(|c| c.current_digest.as_deref());
        async move {
            let started = Instant::now();
            let response = fetcher
                .fetch_for_key(key, current_digest, Some(context))
                .await;
            (key.clone(), (response, started.elapsed()))
        }
    });
    let responses: HashMap<ImageCheckKey, (TagFetchResponse, Duration)> =
        join_all(futures).await.into_iter().collect();

    let maker = UpdateDecisionMaker;
    let mut fetched: HashSet<&ImageCheckKey> = HashSet::new();
    let mut checks = Vec::with_capacity(containers.len());

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
        let Some((key, (response, latency))) = responses.get_key_value(&key) else {
            continue;
        };

        // Only the first container of a group paid for the fetch; failed
        // fetches are never cached, so their followers are not hits either
        let first = fetched.insert(key);
        let cache_hit = response.cache_hit || (!first && response.result.error.is_none());
        let latency = if first { *latency } else { Duration::ZERO };
        context.record_container_check(&key.registry, latency, cache_hit);

        let state = ContainerState::from_container(container, include_prereleases);
        let decision = maker.decide(&state, &response.result);

        if decision.trace.error.is_some() {
            context.record_error();
        } else if decision.has_update {
            context.record_update_found();
            info!(
                "Update for {} ({}): {} -> {:?}",
                container.name, key, container.current_tag, decision.latest_tag
            );
        } else {
            debug!("No update for {} ({})", container.name, key);
        }

        checks.push(ContainerCheck {
            container_id: container.id.clone(),
            container_name: container.name.clone(),
            image: container.image.clone(),
            current_tag: container.current_tag.clone(),
            cache_hit,
            decision,
        });
    }

    CheckRunReport {
        checks,
        metrics: context.finalize(),
    }
}
