//! init-firewall — builds the default-deny egress filter from scratch
//!
//! Safe to re-run: every run flushes and rebuilds the whole rule set.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use egress_firewall::lock::InstallLock;
use egress_firewall::logging::init_logging;
use egress_firewall::metadata::HttpMetadata;
use egress_firewall::netfilter::{CommandRunner, DryRunRunner, SystemRunner};
use egress_firewall::probe::HttpProbe;
use egress_firewall::resolver::SystemResolver;
use egress_firewall::{load_config, BootstrapReport, Engine, FirewallConfig};

#[derive(Parser)]
#[command(name = "init-firewall")]
#[command(version, about = "Install the default-deny egress firewall")]
struct Cli {
    /// Print progress
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log kernel commands instead of executing them
    #[arg(long)]
    dry_run: bool,

    /// Fail instead of waiting when another run holds the lock
    #[arg(long)]
    no_wait: bool,

    /// Skip the post-install reachability check
    #[arg(long)]
    skip_verify: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    let report = if cli.dry_run {
        // Nothing is installed, so a probe would only measure the open network.
        bootstrap(config, DryRunRunner, false).await?
    } else {
        let (path, no_wait) = (config.paths.lock_file.clone(), cli.no_wait);
        let _lock = tokio::task::spawn_blocking(move || InstallLock::take(&path, !no_wait))
            .await
            .context("Lock task failed")?
            .context("Failed to acquire install lock")?;
        let verify = config.verify.enabled && !cli.skip_verify;
        bootstrap(config, SystemRunner, verify).await?
    };

    info!(
        "{} allow-set entries, {} warnings",
        report.install.set_size,
        report.install.load.warnings.len()
    );
    Ok(())
}

async fn bootstrap<C: CommandRunner>(config: FirewallConfig, runner: C, verify: bool) -> Result<BootstrapReport> {
    let resolver = SystemResolver::from_system_conf(config.resolver.timeout())
        .context("Failed to set up DNS resolver")?;
    let metadata = if config.metadata.enabled {
        Some(HttpMetadata::new(&config.metadata).context("Failed to set up metadata client")?)
    } else {
        None
    };
    let probe = if verify {
        Some(HttpProbe::new(Duration::from_secs(config.verify.timeout_seconds))?)
    } else {
        None
    };

    let engine = Engine::new(config, resolver, metadata, probe, runner)?;
    let report = engine.bootstrap().await.context("Firewall bootstrap failed")?;
    Ok(report)
}
