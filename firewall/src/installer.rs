//! Rule installer — the only owner of kernel filter state
//!
//! Every ACCEPT rule (baseline, allow-set contents, host network) is in place
//! before the built-in chains are switched to DROP.

use tracing::{debug, info, warn};

use crate::address::AllowEntry;
use crate::allowlist::AllowlistStore;
use crate::config::KernelConfig;
use crate::error::{FirewallError, Result};
use crate::loader::{LoadReport, PolicyLoader};
use crate::metadata::FetchMetadata;
use crate::netfilter::{Chain, CommandRunner, Netfilter, Policy, Rule, Target};
use crate::resolver::Resolve;

pub const REJECT_WITH: &str = "icmp-admin-prohibited";

/// What a bootstrap installed
#[derive(Debug)]
pub struct InstallReport {
    pub preserved_dns_rules: usize,
    pub load: LoadReport,
    pub set_size: usize,
    pub host_network: AllowEntry,
    pub ipv6_disabled: bool,
    /// OUTPUT was already DROP when the rebuild started (a re-run).
    pub rerun: bool,
}

/// DNS, SSH and loopback, allowed regardless of the allow-set.
pub fn baseline_rules() -> Vec<Rule> {
    vec![
        Rule::new(Chain::Output, Target::Accept).protocol("udp").dport(53),
        Rule::new(Chain::Input, Target::Accept).protocol("udp").sport(53),
        Rule::new(Chain::Output, Target::Accept).protocol("tcp").dport(22),
        Rule::new(Chain::Input, Target::Accept)
            .protocol("tcp")
            .sport(22)
            .state("ESTABLISHED"),
        Rule::new(Chain::Input, Target::Accept).in_iface("lo"),
        Rule::new(Chain::Output, Target::Accept).out_iface("lo"),
    ]
}

pub struct RuleInstaller<C> {
    netfilter: Netfilter<C>,
    internal_dns: String,
    host_prefix: u8,
    host_network: Option<AllowEntry>,
    disable_ipv6: bool,
}

impl<C: CommandRunner> RuleInstaller<C> {
    pub fn new(runner: C, config: &KernelConfig) -> Result<Self> {
        let host_network = config
            .host_network
            .as_deref()
            .map(|net| {
                net.parse::<AllowEntry>()
                    .map_err(|_| FirewallError::Config(format!("kernel.host_network {net:?} is not a CIDR block")))
            })
            .transpose()?;

        Ok(Self {
            netfilter: Netfilter::new(runner, &config.set_name),
            internal_dns: config.internal_dns.clone(),
            host_prefix: config.host_prefix,
            host_network,
            disable_ipv6: config.disable_ipv6,
        })
    }

    pub fn netfilter(&self) -> &Netfilter<C> {
        &self.netfilter
    }

    pub fn set_name(&self) -> &str {
        self.netfilter.set_name()
    }

    /// Rebuild the whole filter from scratch, populating `store` through `loader`.
    pub async fn bootstrap<R: Resolve, M: FetchMetadata>(
        &self,
        store: &AllowlistStore,
        loader: &PolicyLoader<'_, R, M, C>,
    ) -> Result<InstallReport> {
        let nf = &self.netfilter;

        // Flushing keeps chain policies, so a re-run loads its sources under DROP
        // with only the baseline rules in place.
        let rerun = match nf.policy(Chain::Output).await {
            Ok(Some(Policy::Drop)) => {
                warn!(
                    "OUTPUT policy is already DROP; sources outside the baseline rules \
                     (remote metadata) will be unreachable during this rebuild"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("Could not read OUTPUT policy: {e}");
                false
            }
        };

        // The container runtime's DNS forwarding lives in nat; keep it across the flush.
        let dns_rules = nf.save_nat_rules(&self.internal_dns).await?;

        info!("Flushing existing rules and allow-set");
        nf.flush_all().await?;

        if dns_rules.is_empty() {
            info!("No internal DNS rules to restore");
        } else {
            info!("Restoring {} internal DNS rules", dns_rules.len());
            nf.restore_nat_rules(&dns_rules).await?;
        }

        for rule in baseline_rules() {
            nf.append(&rule).await?;
        }

        nf.create_set().await?;
        store.reset();

        let load = loader.load().await?;
        let members = store.snapshot();
        for entry in &members {
            nf.add_to_set(entry).await?;
        }
        info!("Allow-set {} holds {} entries", nf.set_name(), members.len());

        let host_network = self.host_network().await?;
        info!("Host network detected as {host_network}");
        nf.append(&Rule::new(Chain::Input, Target::Accept).source(host_network))
            .await?;
        nf.append(&Rule::new(Chain::Output, Target::Accept).destination(host_network))
            .await?;

        for chain in [Chain::Input, Chain::Forward, Chain::Output] {
            nf.set_policy(chain, Policy::Drop).await?;
        }

        for chain in [Chain::Input, Chain::Output] {
            nf.append(&Rule::new(chain, Target::Accept).state("ESTABLISHED,RELATED"))
                .await?;
        }
        nf.append(&Rule::new(Chain::Output, Target::Accept).match_set(nf.set_name()))
            .await?;
        nf.append(&Rule::new(Chain::Output, Target::Reject(REJECT_WITH)))
            .await?;

        let ipv6_disabled = if self.disable_ipv6 {
            match nf.disable_ipv6().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to disable IPv6, IPv6 traffic is not filtered: {e}");
                    false
                }
            }
        } else {
            warn!("IPv6 left enabled by configuration; it is not filtered");
            false
        };

        Ok(InstallReport {
            preserved_dns_rules: dns_rules.len(),
            load,
            set_size: members.len(),
            host_network,
            ipv6_disabled,
            rerun,
        })
    }

    async fn host_network(&self) -> Result<AllowEntry> {
        if let Some(net) = self.host_network {
            return Ok(net);
        }
        let gateway = self
            .netfilter
            .default_gateway()
            .await?
            .ok_or_else(|| FirewallError::NoDefaultRoute("no default route".into()))?;
        AllowEntry::new(gateway, self.host_prefix)
    }

    /// Add one entry to the live allow-set without touching any rule.
    pub async fn extend(&self, entry: &AllowEntry) -> Result<()> {
        self.netfilter.add_to_set(entry).await
    }

    /// Take back an entry added by [`extend`](Self::extend).
    pub async fn retract(&self, entry: &AllowEntry) -> Result<()> {
        self.netfilter.remove_from_set(entry).await
    }

    /// Current members of the live allow-set.
    pub async fn live_members(&self) -> Result<Vec<AllowEntry>> {
        self.netfilter.set_members().await
    }
}
