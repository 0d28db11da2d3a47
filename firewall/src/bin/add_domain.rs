//! add-domain-to-firewall — approve one domain into the running firewall

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use egress_firewall::approval::Approval;
use egress_firewall::lock::InstallLock;
use egress_firewall::logging::init_logging;
use egress_firewall::metadata::HttpMetadata;
use egress_firewall::netfilter::{CommandRunner, DryRunRunner, SystemRunner};
use egress_firewall::probe::HttpProbe;
use egress_firewall::resolver::SystemResolver;
use egress_firewall::{load_config, Engine, FirewallConfig};

#[derive(Parser)]
#[command(name = "add-domain-to-firewall")]
#[command(version, about = "Allow outbound traffic to one more domain")]
struct Cli {
    /// Domain to allow, e.g. stackoverflow.com
    domain: String,

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
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(approval) => print_approval(&approval),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::exit(1);
        }
    }
}

fn print_approval(approval: &Approval) {
    if approval.added.is_empty() {
        println!(
            "{} already allowed ({} addresses)",
            approval.domain,
            approval.addresses.len()
        );
    }
    for entry in &approval.added {
        println!("Added {entry} for {}", approval.domain);
    }
}

async fn run(cli: Cli) -> Result<Approval> {
    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    if cli.dry_run {
        return approve(config, DryRunRunner, &cli.domain).await;
    }
    let (path, no_wait) = (config.paths.lock_file.clone(), cli.no_wait);
    let _lock = tokio::task::spawn_blocking(move || InstallLock::take(&path, !no_wait))
        .await
        .context("Lock task failed")?
        .context("Failed to acquire install lock")?;
    approve(config, SystemRunner, &cli.domain).await
}

async fn approve<C: CommandRunner>(config: FirewallConfig, runner: C, domain: &str) -> Result<Approval> {
    let resolver = SystemResolver::from_system_conf(config.resolver.timeout())
        .context("Failed to set up DNS resolver")?;
    // Approval never fetches metadata or probes.
    let engine: Engine<_, HttpMetadata, HttpProbe, _> = Engine::new(config, resolver, None, None, runner)?;
    let approval = engine.approve(domain).await?;
    Ok(approval)
}
