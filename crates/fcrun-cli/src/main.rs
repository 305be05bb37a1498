//! `fc-run`: boot a Firecracker microVM once and print its receipt.
//!
//! The run is configured through `FCRUN_*` environment variables (see
//! [`config::from_env`]). The receipt goes to stdout as JSON and logs go to
//! stderr.
//!
//! ## Exit codes
//!
//! - the receipt's exit code (124 if the guest did not finish)
//! - **2**: missing or unreadable configuration
//! - **1**: the run failed before the guest started

mod config;

use fcrun_core::{CoreError, Runner};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries the receipt.
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("fcrun=info".parse()?)
                .add_directive("fc_run=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Invalid configuration");
            return Ok(ExitCode::from(2));
        }
    };
    tracing::debug!(?config, "Configuration loaded");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let receipt = match Runner::new().run_with_cancel(config, cancel).await {
        Ok(receipt) => receipt,
        Err(CoreError::Validation(message)) => {
            tracing::error!(%message, "Required configuration missing (FCRUN_FIRECRACKER, FCRUN_KERNEL, FCRUN_ROOTFS)");
            return Ok(ExitCode::from(2));
        }
        Err(e) => {
            tracing::error!(error = %e, "Run failed");
            return Ok(ExitCode::from(1));
        }
    };

    println!("{}", serde_json::to_string_pretty(&receipt)?);

    if receipt.exit_code != 0 {
        return Ok(ExitCode::from(u8::try_from(receipt.exit_code).unwrap_or(1)));
    }
    Ok(ExitCode::SUCCESS)
}
