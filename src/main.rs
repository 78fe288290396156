mod batch_runner;
mod classifier;
mod config;
mod gemini_engine;
mod ledger;
mod rate_limiter;
mod report;
mod source;
mod types;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use batch_runner::BatchRunner;
use config::{Config, RunnerConfig};
use gemini_engine::{GeminiClassifier, GeminiConfig};
use ledger::{CsvLedger, Ledger};
use rate_limiter::{RateLimiter, RateLimits};
use report::StyleSummary;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stylebatch=debug".into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config.validate()?;
    tracing::info!(
        target_dir = %config.target_dir.display(),
        ledger = %config.ledger.display(),
        per_minute = config.per_minute_ceiling,
        per_day = config.per_day_ceiling,
        safety_margin = config.safety_margin,
        on_failure = ?config.on_failure,
        workers = config.workers,
        model = %config.model,
        "Starting batch classification"
    );

    if let Some(address) = config.metrics_address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("failed to start metrics exporter")?;
        tracing::info!(%address, "Serving Prometheus metrics");
    }

    // The ledger must load cleanly before any API call is made.
    let ledger = CsvLedger::open(&config.ledger).context("cannot start with this ledger")?;
    let items = source::discover(&config.target_dir)?;

    let classifier = GeminiClassifier::new(GeminiConfig {
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        api_base: config.api_base.clone(),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
    })?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight items");
            on_signal.cancel();
        }
    });

    let limiter = RateLimiter::new(RateLimits::from(&config));
    let runner = BatchRunner::new(RunnerConfig::from(&config), classifier, ledger, limiter)
        .with_cancellation(cancel);
    let report = runner.run(items).await?;
    print!("{report}");

    let entries = runner.ledger().load()?;
    let summary = StyleSummary::from_entries(&entries);
    print!("{}", summary.display_top(config.summary_top));
    if let Some(path) = &config.analysis_output {
        summary
            .write_csv(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Style distribution written");
    }

    tracing::info!(ledger = %runner.ledger().path().display(), "Done");
    Ok(())
}
