//! Shoplens extractor - Main entry point

use anyhow::Context;
use clap::Parser;
use shoplens_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use shoplens_extract::driver::{default_as_of, RunOptions};
use shoplens_extract::source::SourceProfile;
use shoplens_extract::{status, Cli, Commands, ExtractConfig, ExtractionDriver, LedgerStore};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Local .env overrides are optional
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("shoplens-extract")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // Keep the guard alive so file logs are flushed on exit
    let _guard = init_logging(&log_config).ok().flatten();

    if let Err(e) = execute_command(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Execute the CLI command
async fn execute_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = ExtractConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            mode,
            end_date,
            batch_size,
            last_n,
            campaign_id,
            ad_group_id,
            dimensions,
        } => {
            if campaign_id.is_some() {
                config.google_ads.campaign_id = campaign_id;
            }
            if ad_group_id.is_some() {
                config.google_ads.ad_group_id = ad_group_id;
            }

            let driver = ExtractionDriver::from_config(cli.source, &config)?;
            let options = RunOptions {
                mode,
                end_date,
                batch_size,
                last_n,
                dimensions,
            };
            let summary = driver.run_with(&options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },

        Commands::Status { as_of } => {
            let profile = SourceProfile::for_kind(cli.source);
            let store = LedgerStore::new(
                config.output_path(cli.source).join(profile.ledger_file),
                config.data_start(cli.source),
            );
            let ledger = store.load();
            let report = status::status(&ledger, &profile, as_of.unwrap_or_else(default_as_of));
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
    }

    Ok(())
}
