use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use tagscope::check::fetcher::TagFetcher;
use tagscope::check::rate_limiter::RegistryRateLimiter;
use tagscope::check::registries::DefaultClientFactory;
use tagscope::check::run::{CheckRunReport, check_containers};
use tagscope::check::types::{Scope, TrackedContainer};
use tagscope::config::EngineConfig;
use tagscope::logging;

#[derive(Parser)]
#[command(name = "tagscope")]
#[command(version, about = "Check container images for newer tags and digests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check image references for available updates
    Check(CheckArgs),
}

#[derive(Args)]
struct CheckArgs {
    /// Config file (defaults to $XDG_CONFIG_HOME/tagscope/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Update scope applied to every image
    #[arg(long, default_value_t = Scope::Patch)]
    scope: Scope,

    /// Consider prerelease tags
    #[arg(long)]
    prereleases: bool,

    /// Last known digest for a floating tag, as IMAGE=DIGEST
    #[arg(long = "digest", value_name = "IMAGE=DIGEST", value_parser = parse_digest)]
    digests: Vec<(String, String)>,

    /// Print decisions and metrics as JSON
    #[arg(long)]
    json: bool,

    /// Image references such as nginx:1.25 or ghcr.io/org/app:v1.2.0
    #[arg(required = true)]
    images: Vec<String>,
}

fn parse_digest(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((image, digest)) if !image.is_empty() && !digest.is_empty() => {
            Ok((image.to_string(), digest.to_string()))
        }
        _ => Err(format!("expected IMAGE=DIGEST, got '{}'", value)),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check(args) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_check(args)),
    }
}

async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let mut config =
        EngineConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    if args.prereleases {
        config.include_prereleases = true;
    }
    let _guard = logging::init(&config.log)?;

    let digests: HashMap<String, String> = args.digests.into_iter().collect();
    let containers = args
        .images
        .iter()
        .map(|reference| {
            let container = TrackedContainer::from_reference(reference, reference, args.scope)
                .with_context(|| format!("Invalid image reference: {}", reference))?;
            Ok(match digests.get(reference) {
                Some(digest) => container.with_digest(digest),
                None => container,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let limiter = Arc::new(RegistryRateLimiter::from_config(&config));
    let factory = Arc::new(DefaultClientFactory::from_config(&config));
    let fetcher = TagFetcher::from_config(&config, limiter, factory);

    let report = check_containers(&fetcher, &containers).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    Ok(())
}

fn print_summary(report: &CheckRunReport) {
    for check in &report.checks {
        let decision = &check.decision;
        let status = if let Some(error) = &decision.trace.error {
            format!("error: {}", error)
        } else if decision.has_update {
            match (&decision.latest_tag, decision.digest_changed) {
                (Some(latest), _) => format!("update available: {}", latest),
                (None, true) => "new digest available".to_string(),
                (None, false) => "update available".to_string(),
            }
        } else if decision.digest_baseline_needed {
            format!(
                "digest recorded: {}",
                decision.new_digest.as_deref().unwrap_or("-")
            )
        } else {
            "up to date".to_string()
        };

        println!("{}  {}", check.container_name, status);
        if let Some(reason) = &decision.trace.scope_blocking_reason {
            println!("    note: {}", reason);
        }
    }

    let metrics = &report.metrics;
    println!();
    println!(
        "{} checked, {} unique images, {} API calls, {} updates, {} errors",
        metrics.checked_containers,
        metrics.unique_images,
        metrics.total_api_calls(),
        metrics.updates_found,
        metrics.errors
    );
}
