//! Install command

use std::sync::Arc;

use anyhow::{Context as _, Result};
use mash_core::{Executor, Outcome, Reporter, SourceFetcher};
use mash_schema::PackageName;
use tokio_util::sync::CancellationToken;

use super::Context;
use crate::BuildArgs;
use crate::options::OptionFlag;

/// Resolve, build and link `names` and their dependencies.
pub async fn install(
    ctx: &Context,
    names: &[String],
    build: &BuildArgs,
    flags: &[OptionFlag],
) -> Result<Outcome> {
    let output = &ctx.output;
    output.section("Resolving");
    let plan = ctx.plan(names, build, flags)?;
    output.info(&format!("{} formulae to build or reuse", plan.len()));

    let client = reqwest::Client::builder()
        .user_agent(mash_core::USER_AGENT)
        .build()
        .context("Failed to create HTTP client")?;
    let fetcher = SourceFetcher::new(client, ctx.config.layout.download_cache());
    let executor = Executor::new(&ctx.config, Arc::new(fetcher), output.clone());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping builds");
            on_interrupt.cancel();
        }
    });

    let report = executor.execute(&plan, &cancel).await;

    for node in plan.nodes.iter().filter(|n| n.requested) {
        if let Some(keg) = report.kegs.get(node.name()) {
            output.success(&format!("{} {} -> {}", node.name(), node.version, keg.path.display()));
            if let Some(caveats) = &node.manifest.caveats {
                output.section("Caveats");
                for line in caveats.lines() {
                    output.info(line);
                }
            }
        }
    }

    let summary = format!(
        "{} built, {} from cache, {} already installed",
        report.built.len(),
        report.from_cache.len(),
        report.reused.len()
    );
    match report.outcome {
        Outcome::Success => output.info(&summary),
        Outcome::Partial => {
            output.warning(&format!(
                "{summary}; {} failed, {} skipped",
                report.failures.len(),
                report.skipped.len()
            ));
        }
        Outcome::Failed => {
            for failure in &report.failures {
                output.error(&failure.to_string());
            }
            if !report.not_started.is_empty() {
                let names: Vec<&str> = report.not_started.iter().map(PackageName::as_str).collect();
                output.info(&format!("not built: {}", names.join(", ")));
            }
            output.info(&format!(
                "build logs are kept in {}",
                ctx.config.layout.log_dir().display()
            ));
        }
        Outcome::Cancelled => output.warning("cancelled"),
    }
    Ok(report.outcome)
}
