//! egress-firewall — default-deny outbound filtering for sandboxed agents
//!
//! Computes an allow-set of IPv4 destinations from trusted metadata, a static
//! domain list and previously approved domains, installs it as iptables rules
//! backed by an ipset, and extends it one domain at a time at runtime.

pub mod address;
pub mod allowlist;
pub mod approval;
pub mod audit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod installer;
pub mod loader;
pub mod lock;
pub mod logging;
pub mod metadata;
pub mod netfilter;
pub mod probe;
pub mod resolver;

pub use address::AllowEntry;
pub use allowlist::AllowlistStore;
pub use audit::{AuditLog, AuditRecord, EventKind};
pub use config::{load_config, FirewallConfig};
pub use engine::{BootstrapReport, Engine};
pub use error::{FirewallError, Result};
