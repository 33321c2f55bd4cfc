//! Update decisions from fetched tag data
//!
//! [`UpdateDecisionMaker::decide`] is pure: it turns a [`TagFetchResult`] and
//! the container's current state into an [`UpdateDecision`]. Semantic tags
//! are compared by version; floating tags (`latest`, `lts`, ...) are compared
//! by digest. Every intermediate fact is kept in a [`DecisionTrace`].

use serde::Serialize;
use tracing::debug;

use crate::check::semver::{change_type, parse_tag, tag_suffix};
use crate::check::types::{ChangeType, Scope, TagFetchResult, TrackedContainer, UpdateKind};

/// What the decision maker needs to know about a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub current_tag: String,
    /// Stored digest of the current tag, None if never observed
    pub current_digest: Option<String>,
    pub scope: Scope,
    pub registry: String,
    pub include_prereleases: bool,
}

impl ContainerState {
    pub fn from_container(container: &TrackedContainer, include_prereleases: bool) -> Self {
        Self {
            current_tag: container.current_tag.clone(),
            current_digest: container.current_digest.clone(),
            scope: container.scope,
            registry: container.registry.clone(),
            include_prereleases,
        }
    }
}

/// Digest comparison for a floating tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestComparison {
    pub previous: Option<String>,
    pub current: String,
    pub changed: bool,
}

/// Explanation of how a verdict was reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionTrace {
    pub registry: String,
    pub current_tag: String,
    pub current_digest: Option<String>,
    pub scope: Scope,
    pub include_prereleases: bool,
    pub suffix: Option<String>,
    pub floating_tag: bool,
    pub tag_count: usize,
    pub latest_tag: Option<String>,
    pub latest_major_tag: Option<String>,
    pub change_type: Option<ChangeType>,
    pub digest: Option<DigestComparison>,
    pub scope_blocking_reason: Option<String>,
    pub error: Option<String>,
    pub anomalies: Vec<String>,
}

/// Verdict for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDecision {
    pub has_update: bool,
    pub update_kind: Option<UpdateKind>,
    pub latest_tag: Option<String>,
    pub latest_major_tag: Option<String>,
    pub change_type: Option<ChangeType>,
    pub is_scope_violation: bool,
    pub digest_changed: bool,
    pub new_digest: Option<String>,
    /// First observation of a floating tag; persist `new_digest` as the baseline
    pub digest_baseline_needed: bool,
    pub trace: DecisionTrace,
}

impl UpdateDecision {
    fn no_update(trace: DecisionTrace) -> Self {
        Self {
            has_update: false,
            update_kind: None,
            latest_tag: None,
            latest_major_tag: None,
            change_type: None,
            is_scope_violation: false,
            digest_changed: false,
            new_digest: None,
            digest_baseline_needed: false,
            trace,
        }
    }
}

pub struct UpdateDecisionMaker;

impl UpdateDecisionMaker {
    pub fn decide(&self, state: &ContainerState, fetch: &TagFetchResult) -> UpdateDecision {
        let current_tag = state.current_tag.as_str();
        let mut trace = DecisionTrace {
            registry: state.registry.clone(),
            current_tag: current_tag.to_string(),
            current_digest: state.current_digest.clone(),
            scope: state.scope,
            include_prereleases: state.include_prereleases,
            ..Default::default()
        };

        if let Some(error) = &fetch.error {
            trace.error = Some(error.clone());
            debug!("No decision for {}: fetch failed: {}", current_tag, error);
            return UpdateDecision::no_update(trace);
        }

        let current_version = parse_tag(current_tag);
        trace.suffix = tag_suffix(current_tag);
        // The client may treat parseable tags such as `2024` as floating too
        let floating = fetch.floating_tag || current_version.is_none();
        trace.floating_tag = floating;
        trace.tag_count = fetch.tags.len();
        trace.latest_tag = fetch.latest_tag.clone();
        trace.latest_major_tag = fetch.latest_major_tag.clone();

        let mut decision = UpdateDecision::no_update(DecisionTrace::default());
        decision.latest_tag = fetch.latest_tag.clone();
        decision.latest_major_tag = fetch.latest_major_tag.clone();

        // Tag-based update
        if let Some(latest) = fetch.latest_tag.as_deref().filter(|t| *t != current_tag) {
            match (current_version.as_ref(), parse_tag(latest)) {
                (Some(current), Some(candidate)) => match change_type(current, &candidate) {
                    Some(change) => {
                        decision.has_update = true;
                        decision.update_kind = Some(UpdateKind::Tag);
                        decision.change_type = Some(change);
                        trace.change_type = Some(change);
                    }
                    None => trace.anomalies.push(format!(
                        "latest tag {} is not newer than {}",
                        latest, current_tag
                    )),
                },
                _ => trace.anomalies.push(format!(
                    "cannot compare {} with {}: unparseable version",
                    current_tag, latest
                )),
            }
        }

        // Digest-based update, floating tags only
        match (floating, fetch.digest()) {
            (true, Some(new_digest)) => {
                decision.new_digest = Some(new_digest.to_string());
                match state.current_digest.as_deref() {
                    Some(previous) => {
                        let changed = previous != new_digest;
                        decision.digest_changed = changed;
                        if changed && !decision.has_update {
                            decision.has_update = true;
                            decision.update_kind = Some(UpdateKind::Digest);
                        }
                        trace.digest = Some(DigestComparison {
                            previous: Some(previous.to_string()),
                            current: new_digest.to_string(),
                            changed,
                        });
                    }
                    None => {
                        decision.digest_baseline_needed = true;
                        trace.digest = Some(DigestComparison {
                            previous: None,
                            current: new_digest.to_string(),
                            changed: false,
                        });
                    }
                }
            }
            (true, None) => trace
                .anomalies
                .push(format!("no digest reported for floating tag {}", current_tag)),
            (false, Some(_)) => trace
                .anomalies
                .push("digest ignored for semantic version tag".to_string()),
            (false, None) => {}
        }

        // Scope violation
        if let Some(major) = fetch.latest_major_tag.as_deref() {
            if major != current_tag && fetch.latest_tag.as_deref() != Some(major) {
                let newer = match (current_version.as_ref(), parse_tag(major)) {
                    (Some(current), Some(candidate)) => {
                        change_type(current, &candidate).is_some()
                    }
                    _ => true,
                };
                if newer {
                    decision.is_scope_violation = true;
                    trace.scope_blocking_reason = Some(format!(
                        "{} is available but outside the '{}' update scope",
                        major, state.scope
                    ));
                } else {
                    trace.anomalies.push(format!(
                        "latest major tag {} is not newer than {}",
                        major, current_tag
                    ));
                }
            }
        }

        debug!(
            "Decision for {}: has_update={} kind={:?} scope_violation={}",
            current_tag, decision.has_update, decision.update_kind, decision.is_scope_violation
        );

        decision.trace = trace;
        decision
    }
}
