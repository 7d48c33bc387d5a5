//! Escrow CLI - runs one escrow through its lifecycle against a configured endpoint.
//!
//! ```text
//! main() -> setup::load_config() -> setup::connect() -> run_simulation()
//!          (core dumps off first)
//!                                          |
//!                                          v
//!            createEscrow -> report -> confirmFulfillment -> escrowStatus
//!                         -> confirmProductUsed -> escrowStatus
//! ```
//!
//! Only startup failures (config, descriptors, sessions, bindings) exit non-zero.
//! A failed lifecycle step is logged with its label and ends the run.

mod crash_hardening;
mod setup;

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use alloy::primitives::U256;
use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use escrow_core::{CreateEscrow, EscrowClient, EscrowError};
use escrow_types::EscrowId;

const LOG_FILE_ENV: &str = "ESCROW_LOG_FILE";
const ONE_ETH_WEI: u128 = 1_000_000_000_000_000_000;

const BUYER: &str = "buyer";
const SELLER: &str = "seller";
const MARKET: &str = "market";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warning) = open_log_file();
    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
        tracing::info!(path = %log_path.display(), "Logging initialized");
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    if let Some(warning) = init_warning {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Option<String>) {
    let Some(path) = env::var_os(LOG_FILE_ENV).map(PathBuf::from) else {
        return (None, None);
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return (
            None,
            Some(format!("Failed to create log dir {}: {e}", parent.display())),
        );
    }
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => (Some((path, file)), None),
        Err(e) => (
            None,
            Some(format!("Failed to open log file {}: {e}", path.display())),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let (path, config) = setup::load_config().context("failed to load escrow config")?;
    tracing::info!(path = %path.display(), "Config loaded");

    let client = setup::connect(&config)
        .await
        .context("failed to initialize escrow client")?;

    if let Err(err) = run_simulation(&client).await {
        tracing::error!(label = err.label(), "{err}");
    }
    Ok(())
}

/// One escrow from creation to execution: 1 ETH, default fee and timeout, receiver = buyer.
async fn run_simulation(client: &EscrowClient) -> Result<(), EscrowError> {
    let record = client
        .create_escrow(CreateEscrow::new(
            BUYER,
            SELLER,
            MARKET,
            U256::from(ONE_ETH_WEI),
        ))
        .await?;
    let id: EscrowId = record.id().clone();
    println!("{}", client.report().await);

    client.confirm_fulfillment(MARKET, &id).await?;
    let state = client.escrow_status(BUYER, &id).await?;
    println!("Escrow {id} is {state}");

    client.confirm_product_used(MARKET, &id).await?;
    let state = client.escrow_status(BUYER, &id).await?;
    println!("Escrow {id} is {state}");
    Ok(())
}
