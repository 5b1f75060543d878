//! quay deploys a compiled contract once per network and verifies its source.

mod cli;

use std::{path::PathBuf, sync::Arc};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command};
use quay_deploy::{
    CancelSignal, DeploymentLedger, DeploymentOutcome, EtherscanClient, HttpTransport,
    LocalKeySigner, NetworkRegistry, Orchestrator, QuayConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = QuayConfig::load(&config_path)?;

    let outcome = match &cli.command {
        Command::Ledger { network } => return print_ledger(&config, network),
        Command::Deploy(args) => {
            let (orchestrator, deployer) = build_orchestrator(&config)?;
            tracing::info!(
                contract = %args.target.contract,
                network = %args.target.network,
                deployer = %deployer,
                "Deploying contract with the account..."
            );
            orchestrator
                .run_deployment_with(
                    &args.target.contract,
                    &args.target.constructor_args(),
                    &args.target.network,
                    &args.options()?,
                )
                .await?
        }
        Command::Verify(target) => {
            let (orchestrator, _) = build_orchestrator(&config)?;
            orchestrator
                .verify_deployment(
                    &target.contract,
                    &target.constructor_args(),
                    &target.network,
                    target.salt()?,
                )
                .await?
        }
    };

    print_outcome(&outcome);
    Ok(())
}

/// Install the network registry and wire the HTTP backends, with Ctrl-C as the cancel signal.
fn build_orchestrator(config: &QuayConfig) -> Result<(Orchestrator, Address)> {
    let registry = NetworkRegistry::from_config(config)?.install()?;
    let transport = Arc::new(HttpTransport::new()?);
    let signer = Arc::new(
        LocalKeySigner::from_env(&config.signer.private_key_env, transport.clone())
            .context("Failed to load the deployer key")?,
    );
    let deployer = signer.address();
    let explorer = Arc::new(EtherscanClient::new()?);

    let (cancel_handle, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, stopping after the current step...");
            cancel_handle.cancel();
        }
    });

    let orchestrator = Orchestrator::from_config(
        config,
        registry.clone(),
        transport,
        signer,
        explorer,
        cancel,
    )?;
    Ok((orchestrator, deployer))
}

fn print_outcome(outcome: &DeploymentOutcome) {
    println!("Contract address: {}", outcome.address);
    if let Some(tx_hash) = outcome.transaction_hash {
        println!("Transaction: {tx_hash}");
    }
    println!("Verified: {}", outcome.verified);
}

fn print_ledger(config: &QuayConfig, network: &str) -> Result<()> {
    let ledger = DeploymentLedger::open(&config.paths.ledger)?;
    let records = ledger.list(network)?;

    if records.is_empty() {
        println!("No deployments recorded for {network}");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Contract",
        "Address",
        "Status",
        "Attempt",
        "Block",
        "Verification",
        "Intent",
    ]);
    for record in records {
        table.add_row(vec![
            record.contract_name.clone(),
            record.address.to_string(),
            record.status.to_string(),
            record.attempt.to_string(),
            record
                .block_number
                .map(|block| block.to_string())
                .unwrap_or_default(),
            record
                .verification
                .map(|status| status.to_string())
                .unwrap_or_default(),
            record.intent_key.chars().take(16).collect(),
        ]);
    }
    println!("{table}");
    Ok(())
}
