//! Engine — the two entry points, bootstrap and single-domain approval
//!
//! Owns the store, the audit log, the resolver and the rule installer, and
//! builds the short-lived approver and loader that borrow them.

use tracing::info;

use crate::allowlist::AllowlistStore;
use crate::approval::{Approval, Approver};
use crate::audit::{AuditLog, EventKind};
use crate::config::FirewallConfig;
use crate::domain::validate_domain;
use crate::error::Result;
use crate::installer::{InstallReport, RuleInstaller};
use crate::loader::PolicyLoader;
use crate::metadata::FetchMetadata;
use crate::netfilter::CommandRunner;
use crate::probe::{self, Probe, ProbeReport};
use crate::resolver::{BatchResolver, Resolve};

#[derive(Debug)]
pub struct BootstrapReport {
    pub install: InstallReport,
    /// `None` when verification is disabled.
    pub probe: Option<ProbeReport>,
}

pub struct Engine<R, M, P, C> {
    config: FirewallConfig,
    store: AllowlistStore,
    audit: AuditLog,
    resolver: BatchResolver<R>,
    metadata: Option<M>,
    probe: Option<P>,
    installer: RuleInstaller<C>,
}

impl<R, M, P, C> Engine<R, M, P, C>
where
    R: Resolve,
    M: FetchMetadata,
    P: Probe,
    C: CommandRunner,
{
    /// `metadata` and `probe` are optional: `None` skips that source or step.
    pub fn new(
        config: FirewallConfig,
        resolver: R,
        metadata: Option<M>,
        probe: Option<P>,
        runner: C,
    ) -> Result<Self> {
        let installer = RuleInstaller::new(runner, &config.kernel)?;
        let resolver = BatchResolver::new(
            resolver,
            config.resolver.timeout(),
            config.resolver.retries,
        );
        let audit = AuditLog::new(&config.paths.audit_log);

        Ok(Self {
            config,
            store: AllowlistStore::new(),
            audit,
            resolver,
            metadata,
            probe,
            installer,
        })
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn store(&self) -> &AllowlistStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn installer(&self) -> &RuleInstaller<C> {
        &self.installer
    }

    fn approver(&self) -> Approver<'_, R, C> {
        Approver::new(&self.resolver, &self.store, &self.installer, &self.audit)
    }

    /// Rebuild the filter from every source, then verify it.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        self.audit.record(
            EventKind::FirewallInit,
            &format!("bootstrap started, allow-set {}", self.installer.set_name()),
        );

        let approver = self.approver();
        let loader = PolicyLoader::new(
            &approver,
            self.metadata.as_ref(),
            &self.config.metadata.fields,
            &self.config.paths.domains_file,
            &self.config.paths.approved_file,
        );
        let install = self.installer.bootstrap(&self.store, &loader).await?;

        let probe = match self.probe {
            Some(ref probe) => Some(
                probe::verify(probe, &self.config.verify.blocked_url, &self.config.verify.allowed_url)
                    .await?,
            ),
            None => {
                info!("Verification skipped");
                None
            }
        };

        self.audit.record(
            EventKind::FirewallReady,
            &format!(
                "{} entries in {}, host network {}, {} warnings",
                install.set_size,
                self.installer.set_name(),
                install.host_network,
                install.load.warnings.len()
            ),
        );
        info!("Firewall configuration complete");

        Ok(BootstrapReport { install, probe })
    }

    /// Admit one domain into the already-installed filter.
    pub async fn approve(&self, domain: &str) -> Result<Approval> {
        // Reject bad input before touching the kernel.
        validate_domain(domain)?;

        for entry in self.installer.live_members().await? {
            self.store.insert(entry);
        }
        self.approver().approve(domain).await
    }
}
