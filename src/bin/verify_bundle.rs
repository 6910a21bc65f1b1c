use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::Path;
use tracing::{error, info};

use audit_ledger::audit::{verify_bundle, ExportBundle, VerificationReport};
use audit_ledger::crypto::LedgerKeys;
use audit_ledger::LedgerConfig;

fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-bundle")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify an exported audit ledger bundle offline")
        .arg(
            Arg::new("bundle")
                .short('b')
                .long("bundle")
                .value_name("PATH")
                .help("Path to the exported bundle (JSON)")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Ledger config file holding the keys (environment overrides apply)")
                .default_value("audit-ledger"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let bundle_path = matches
        .get_one::<String>("bundle")
        .ok_or_else(|| anyhow!("--bundle is required"))?;
    let config_path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("--config is required"))?;

    match run(Path::new(bundle_path), Path::new(config_path), verbose) {
        Ok(report) if report.verified => {
            if !quiet {
                println!(
                    "✓ Bundle verified: {} {}..={} ({} events, {} checkpoints)",
                    report.tenant_id, report.from, report.to, report.checked, report.checkpoints_checked
                );
            }
            Ok(())
        }
        Ok(report) => {
            for finding in &report.findings {
                error!("{}", finding);
            }
            if let Some(failure) = &report.failure {
                eprintln!("✗ Bundle failed verification: {}", failure);
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!("Bundle verification failed: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run(bundle_path: &Path, config_path: &Path, verbose: bool) -> Result<VerificationReport> {
    info!("Verifying bundle: {}", bundle_path.display());

    let config = LedgerConfig::load_from(config_path).context("loading ledger keys")?;
    let keys = LedgerKeys::from_config(&config.keys)?;

    let bytes = std::fs::read(bundle_path)
        .with_context(|| format!("reading {}", bundle_path.display()))?;
    let bundle = ExportBundle::from_json_slice(&bytes)?;

    if verbose {
        println!("Bundle header:");
        println!("  Tenant: {}", bundle.header.tenant_id);
        println!("  Range: {}..={}", bundle.header.from_sequence, bundle.header.to_sequence);
        println!("  Events: {}", bundle.header.event_count);
        println!("  Checkpoints: {}", bundle.checkpoints.len());
        println!("  Exported at: {}", bundle.header.exported_at);
        println!("  Requester: {}", bundle.header.requester);
        println!("  Anchor: {}", bundle.header.anchor_hash);
    }

    Ok(verify_bundle(&bundle, &keys)?)
}
