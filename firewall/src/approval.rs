//! Runtime approval of a single domain
//!
//! Extends the live allow-set in place after bootstrap. Unlike bootstrap,
//! every failure here is reported to the caller. Validation happens before
//! any state changes, and kernel additions of a failed approval are rolled
//! back, so the store, the kernel set and the audit log stay untouched.

use tracing::{error, info};

use crate::address::{validate_ip, AllowEntry};
use crate::allowlist::AllowlistStore;
use crate::audit::{AuditLog, EventKind};
use crate::domain::validate_domain;
use crate::error::{FirewallError, Result};
use crate::installer::RuleInstaller;
use crate::netfilter::CommandRunner;
use crate::resolver::{BatchResolver, Resolution, Resolve};

/// Result of a successful approval
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub domain: String,
    /// Every address the domain resolved to.
    pub addresses: Vec<AllowEntry>,
    /// The subset that was not already allowed.
    pub added: Vec<AllowEntry>,
}

pub struct Approver<'a, R, C> {
    resolver: &'a BatchResolver<R>,
    store: &'a AllowlistStore,
    installer: &'a RuleInstaller<C>,
    audit: &'a AuditLog,
}

impl<'a, R: Resolve, C: CommandRunner> Approver<'a, R, C> {
    pub fn new(
        resolver: &'a BatchResolver<R>,
        store: &'a AllowlistStore,
        installer: &'a RuleInstaller<C>,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            resolver,
            store,
            installer,
            audit,
        }
    }

    pub fn resolver(&self) -> &'a BatchResolver<R> {
        self.resolver
    }

    pub fn store(&self) -> &'a AllowlistStore {
        self.store
    }

    pub fn audit(&self) -> &'a AuditLog {
        self.audit
    }

    pub async fn approve(&self, raw: &str) -> Result<Approval> {
        let domain = validate_domain(raw)?;

        let addrs = match self.resolver.resolve_one(&domain).await {
            Resolution::Resolved(addrs) => addrs,
            Resolution::Unresolved(reason) => {
                return Err(FirewallError::Unresolved { domain, reason });
            }
        };

        let addresses = addrs
            .into_iter()
            .map(|ip| validate_ip(ip, &domain))
            .collect::<Result<Vec<_>>>()?;

        let fresh: Vec<AllowEntry> = addresses
            .iter()
            .filter(|entry| !self.store.contains(entry))
            .copied()
            .collect();

        // The kernel set is all-or-nothing per approval; the store follows it.
        let mut added = Vec::with_capacity(fresh.len());
        for entry in &fresh {
            if let Err(e) = self.installer.extend(entry).await {
                self.roll_back(&domain, &added).await;
                return Err(e);
            }
            added.push(*entry);
        }
        for entry in &added {
            self.store.insert(*entry);
        }

        self.audit
            .record(EventKind::DomainApproved, &format!("{domain}: {}", join(&addresses)));
        info!("Approved {domain} ({} new of {})", added.len(), addresses.len());

        Ok(Approval {
            domain,
            addresses,
            added,
        })
    }

    /// Remove the entries a failed approval already pushed into the kernel.
    /// Whatever cannot be removed stays allowed, so it is audited.
    async fn roll_back(&self, domain: &str, added: &[AllowEntry]) {
        let mut stuck = Vec::new();
        for entry in added {
            if let Err(e) = self.installer.retract(entry).await {
                error!("Failed to roll back {entry} for {domain}: {e}");
                stuck.push(*entry);
            }
        }
        if !stuck.is_empty() {
            for entry in &stuck {
                self.store.insert(*entry);
            }
            self.audit.record(
                EventKind::DomainApproved,
                &format!("{domain}: {} (partial, rollback failed)", join(&stuck)),
            );
        }
    }
}

fn join(entries: &[AllowEntry]) -> String {
    entries
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
