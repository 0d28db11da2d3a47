//! Assembles the initial allow-set from its three sources
//!
//! 1. published ranges of a trusted service (metadata document)
//! 2. the static domain file
//! 3. domains a human approved in earlier sessions
//!
//! Any source or domain that cannot be used is skipped with a warning. Only a
//! source that hands back something that is not an address aborts the load.

use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::address::{validate_ip, AllowEntry};
use crate::approval::Approver;
use crate::audit::EventKind;
use crate::domain::{is_valid_domain, read_domain_list};
use crate::error::{FirewallError, Result};
use crate::metadata::{self, FetchMetadata};
use crate::netfilter::CommandRunner;
use crate::resolver::{Resolution, Resolve};

/// Where a policy entry came from. Used for auditing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    RemoteMetadata,
    StaticFile,
    UserApproved,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provenance::RemoteMetadata => metadata::SOURCE_NAME,
            Provenance::StaticFile => "static-file",
            Provenance::UserApproved => "user-approved",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEntry {
    pub name: String,
    pub provenance: Provenance,
    pub addresses: Vec<AllowEntry>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub entries: Vec<PolicyEntry>,
    pub warnings: Vec<String>,
}

impl LoadReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    pub fn count(&self, provenance: Provenance) -> usize {
        self.entries
            .iter()
            .filter(|e| e.provenance == provenance)
            .count()
    }
}

pub struct PolicyLoader<'a, R, M, C> {
    approver: &'a Approver<'a, R, C>,
    metadata: Option<&'a M>,
    metadata_fields: &'a [String],
    domains_file: &'a Path,
    approved_file: &'a Path,
}

impl<'a, R: Resolve, M: FetchMetadata, C: CommandRunner> PolicyLoader<'a, R, M, C> {
    pub fn new(
        approver: &'a Approver<'a, R, C>,
        metadata: Option<&'a M>,
        metadata_fields: &'a [String],
        domains_file: &'a Path,
        approved_file: &'a Path,
    ) -> Self {
        Self {
            approver,
            metadata,
            metadata_fields,
            domains_file,
            approved_file,
        }
    }

    /// Populate the store. Returns once every lookup has settled.
    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        // Metadata fetch and static resolution are independent; run them together.
        let (fetched, resolved) = tokio::join!(self.fetch_metadata(), self.resolve_static());

        self.admit_metadata(fetched, &mut report)?;
        self.admit_static(resolved, &mut report)?;
        self.reapprove(&mut report).await?;

        info!(
            "Allowlist loaded: {} metadata, {} static, {} approved entries, {} warnings",
            report.count(Provenance::RemoteMetadata),
            report.count(Provenance::StaticFile),
            report.count(Provenance::UserApproved),
            report.warnings.len()
        );
        Ok(report)
    }

    async fn fetch_metadata(&self) -> Option<Result<serde_json::Value>> {
        match self.metadata {
            Some(source) => Some(source.fetch().await),
            None => None,
        }
    }

    fn admit_metadata(
        &self,
        fetched: Option<Result<serde_json::Value>>,
        report: &mut LoadReport,
    ) -> Result<()> {
        let doc = match fetched {
            None => {
                info!("Remote metadata source disabled");
                return Ok(());
            }
            Some(Ok(doc)) => doc,
            Some(Err(e)) => {
                report.warn(format!("Skipping remote metadata ranges: {e}"));
                return Ok(());
            }
        };

        let ranges = match metadata::extract_ranges(&doc, self.metadata_fields) {
            Ok(ranges) => ranges,
            Err(FirewallError::Metadata(reason)) => {
                report.warn(format!("Skipping remote metadata ranges: {reason}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let store = self.approver.store();
        for entry in &ranges.entries {
            store.insert(*entry);
        }
        if !ranges.entries.is_empty() {
            self.approver.audit().record(
                EventKind::AllowlistAdd,
                &format!(
                    "{}: {} ranges ({} IPv4 listed, {} IPv6 skipped)",
                    Provenance::RemoteMetadata,
                    ranges.entries.len(),
                    ranges.raw_ipv4,
                    ranges.skipped_ipv6
                ),
            );
        }
        info!("Added {} metadata ranges", ranges.entries.len());

        report.entries.push(PolicyEntry {
            name: metadata::SOURCE_NAME.to_string(),
            provenance: Provenance::RemoteMetadata,
            addresses: ranges.entries,
        });
        Ok(())
    }

    /// Read the static file and resolve every syntactically valid name.
    async fn resolve_static(&self) -> StaticResolution {
        let mut resolution = StaticResolution::default();
        let domains = match read_domain_list(self.domains_file) {
            Ok(Some(domains)) => domains,
            Ok(None) => {
                resolution.warnings.push(format!(
                    "Static domain file {} not found",
                    self.domains_file.display()
                ));
                return resolution;
            }
            Err(e) => {
                resolution.warnings.push(format!(
                    "Failed to read static domain file {}: {e}",
                    self.domains_file.display()
                ));
                return resolution;
            }
        };

        let (valid, invalid): (Vec<String>, Vec<String>) =
            domains.into_iter().partition(|d| is_valid_domain(d));
        for name in invalid {
            resolution
                .warnings
                .push(format!("Skipping invalid domain {name:?} in static file"));
        }

        resolution.results = self
            .approver
            .resolver()
            .resolve_all(&valid)
            .await
            .into_iter()
            .collect();
        // Keep file order for auditing.
        resolution
            .results
            .sort_by_key(|(name, _)| valid.iter().position(|v| v == name));
        resolution
    }

    fn admit_static(&self, resolved: StaticResolution, report: &mut LoadReport) -> Result<()> {
        for warning in resolved.warnings {
            report.warn(warning);
        }

        let store = self.approver.store();
        for (name, resolution) in resolved.results {
            let addrs = match resolution {
                Resolution::Resolved(addrs) => addrs,
                Resolution::Unresolved(reason) => {
                    report.warn(format!("Failed to resolve {name}, skipping: {reason}"));
                    continue;
                }
            };

            let addresses = addrs
                .into_iter()
                .map(|ip| validate_ip(ip, &name))
                .collect::<Result<Vec<_>>>()?;
            for entry in &addresses {
                store.insert(*entry);
            }

            let listed: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
            self.approver.audit().record(
                EventKind::AllowlistAdd,
                &format!("{name} ({}): {}", Provenance::StaticFile, listed.join(", ")),
            );
            report.entries.push(PolicyEntry {
                name,
                provenance: Provenance::StaticFile,
                addresses,
            });
        }
        Ok(())
    }

    /// Push each previously approved domain back through the approval path.
    async fn reapprove(&self, report: &mut LoadReport) -> Result<()> {
        let domains = match read_domain_list(self.approved_file) {
            Ok(Some(domains)) => domains,
            Ok(None) => {
                info!("No previously approved domains");
                return Ok(());
            }
            Err(e) => {
                report.warn(format!(
                    "Failed to read approved domains {}: {e}",
                    self.approved_file.display()
                ));
                return Ok(());
            }
        };

        for domain in domains {
            match self.approver.approve(&domain).await {
                Ok(approval) => report.entries.push(PolicyEntry {
                    name: approval.domain,
                    provenance: Provenance::UserApproved,
                    addresses: approval.addresses,
                }),
                Err(e @ (FirewallError::InvalidDomain(_) | FirewallError::Unresolved { .. })) => {
                    report.warn(format!("Skipping approved domain {domain}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct StaticResolution {
    results: Vec<(String, Resolution)>,
    warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_names() {
        assert_eq!(Provenance::RemoteMetadata.to_string(), "remote-metadata");
        assert_eq!(Provenance::StaticFile.to_string(), "static-file");
        assert_eq!(Provenance::UserApproved.to_string(), "user-approved");
    }

    #[test]
    fn test_report_counts_by_provenance() {
        let mut report = LoadReport::default();
        for (name, provenance) in [
            ("example.org", Provenance::StaticFile),
            ("github.com", Provenance::StaticFile),
            ("stackoverflow.com", Provenance::UserApproved),
        ] {
            report.entries.push(PolicyEntry {
                name: name.to_string(),
                provenance,
                addresses: Vec::new(),
            });
        }
        report.warn("Failed to resolve bad.invalid, skipping".to_string());

        assert_eq!(report.count(Provenance::StaticFile), 2);
        assert_eq!(report.count(Provenance::UserApproved), 1);
        assert_eq!(report.count(Provenance::RemoteMetadata), 0);
        assert_eq!(report.warnings.len(), 1);
    }
}
