mod config;
mod http;
mod metrics;
mod models;
mod normalize;
mod pipeline;
mod segment;
mod sink;
mod spapi;
mod state;

use chrono::Utc;
use config::ExtractorConfig;
use eyre::WrapErr;
use http::{ReqwestTransport, TokioSleeper};
use pipeline::{Pipeline, PipelineSettings};
use sink::CsvTableSink;
use spapi::auth::refresh_access_token;
use spapi::client::RateLimitedClient;
use state::RunState;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "extractor.main", "extraction aborted: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = ExtractorConfig::load().wrap_err("loading configuration")?;
    info!(
        target = "extractor.main",
        data_dir = %config.data_dir.display(),
        marketplaces = ?config.marketplaces,
        reports = ?config.reports,
        days = config.date_range_days,
        "configuration loaded"
    );

    let previous = RunState::load(&config.data_dir.join("in/state.json"));
    if let Some(last_run_at) = previous.last_run_at {
        info!(target = "extractor.main", %last_run_at, "previous run found");
    }

    let access_token = refresh_access_token(&config.credentials)
        .await
        .wrap_err("acquiring access token")?;

    let mut sink = CsvTableSink::new(config.data_dir.join("out/tables"))
        .wrap_err("preparing output tables")?;
    let pipeline = Pipeline::new(
        RateLimitedClient::new(ReqwestTransport::new(), TokioSleeper),
        PipelineSettings::from_config(&config),
    );
    let started_at = Utc::now();
    let report = pipeline.run(&access_token, &mut sink, started_at).await;

    for stage in &report.summary.stages {
        if stage.ok {
            info!(target = "extractor.summary", stage = %stage.name, elapsed_ms = stage.elapsed_ms as u64, output = %stage.output, "stage ok");
        } else {
            warn!(target = "extractor.summary", stage = %stage.name, elapsed_ms = stage.elapsed_ms as u64, output = %stage.output, "stage failed");
        }
    }

    let state = RunState {
        last_run_at: Some(started_at),
        run_id: Some(report.summary.run_id.clone()),
        tables: report.rows.clone(),
    };
    state
        .save(&config.data_dir.join("out/state.json"))
        .wrap_err("writing run state")?;

    info!(
        target = "extractor.main",
        run_id = %report.summary.run_id,
        failed_stages = report.summary.failed_stages(),
        duplicates = report.duplicates_dropped,
        tables = ?report.rows,
        "extraction complete"
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
