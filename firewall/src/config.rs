//! Firewall configuration loading and parsing

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::address::AllowEntry;
use crate::error::{FirewallError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/egress-firewall/config.toml";
pub const CONFIG_ENV: &str = "EGRESS_FIREWALL_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct FirewallConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_domains_file")]
    pub domains_file: PathBuf,
    #[serde(default = "default_approved_file")]
    pub approved_file: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            domains_file: default_domains_file(),
            approved_file: default_approved_file(),
            audit_log: default_audit_log(),
            lock_file: default_lock_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_resolver_retries")]
    pub retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_resolver_timeout(),
            retries: default_resolver_retries(),
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metadata_url")]
    pub url: String,
    #[serde(default = "default_metadata_fields")]
    pub fields: Vec<String>,
    #[serde(default = "default_metadata_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_metadata_url(),
            fields: default_metadata_fields(),
            timeout_seconds: default_metadata_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_set_name")]
    pub set_name: String,
    #[serde(default = "default_internal_dns")]
    pub internal_dns: String,
    #[serde(default = "default_host_prefix")]
    pub host_prefix: u8,
    /// Overrides default-route detection when set.
    #[serde(default)]
    pub host_network: Option<String>,
    #[serde(default = "default_true")]
    pub disable_ipv6: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            set_name: default_set_name(),
            internal_dns: default_internal_dns(),
            host_prefix: default_host_prefix(),
            host_network: None,
            disable_ipv6: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_blocked_url")]
    pub blocked_url: String,
    #[serde(default = "default_allowed_url")]
    pub allowed_url: String,
    #[serde(default = "default_verify_timeout")]
    pub timeout_seconds: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_url: default_blocked_url(),
            allowed_url: default_allowed_url(),
            timeout_seconds: default_verify_timeout(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_domains_file() -> PathBuf { "/usr/local/share/whitelisted-domains.txt".into() }
fn default_approved_file() -> PathBuf { "/var/lib/egress-firewall/approved-domains.txt".into() }
fn default_audit_log() -> PathBuf { "/var/log/egress-firewall/audit.log".into() }
fn default_lock_file() -> PathBuf { "/run/egress-firewall.lock".into() }
fn default_resolver_timeout() -> u64 { 3 }
fn default_resolver_retries() -> u32 { 2 }
fn default_metadata_url() -> String { "https://api.github.com/meta".into() }
fn default_metadata_fields() -> Vec<String> { vec!["web".into(), "api".into(), "git".into()] }
fn default_metadata_timeout() -> u64 { 10 }
fn default_user_agent() -> String { concat!("egress-firewall/", env!("CARGO_PKG_VERSION")).into() }
fn default_set_name() -> String { "allowed-domains".into() }
fn default_internal_dns() -> String { "127.0.0.11".into() }
fn default_host_prefix() -> u8 { 24 }
fn default_blocked_url() -> String { "https://example.com".into() }
fn default_allowed_url() -> String { "https://api.github.com/zen".into() }
fn default_verify_timeout() -> u64 { 5 }

impl FirewallConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: FirewallConfig =
            toml::from_str(content).map_err(|e| FirewallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kernel.host_prefix > 32 {
            return Err(FirewallError::Config(format!(
                "kernel.host_prefix must be 0-32, got {}",
                self.kernel.host_prefix
            )));
        }
        if let Some(ref net) = self.kernel.host_network {
            net.parse::<AllowEntry>()
                .map_err(|_| FirewallError::Config(format!("kernel.host_network {net:?} is not a CIDR block")))?;
        }
        let set = &self.kernel.set_name;
        if set.is_empty()
            || set.len() > 31
            || !set.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(FirewallError::Config(format!("kernel.set_name {set:?} is not a valid ipset name")));
        }
        if self.resolver.timeout_seconds == 0 {
            return Err(FirewallError::Config("resolver.timeout_seconds must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration from an explicit path, `$EGRESS_FIREWALL_CONFIG`, or
/// the default location, in that order. A missing file means defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<FirewallConfig> {
    let config_path = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    if config_path.exists() {
        let content = fs::read_to_string(&config_path)?;
        FirewallConfig::from_toml(&content)
            .map_err(|e| FirewallError::Config(format!("{}: {e}", config_path.display())))
    } else {
        tracing::warn!("Config file not found at {}, using defaults", config_path.display());
        Ok(FirewallConfig::default())
    }
}
