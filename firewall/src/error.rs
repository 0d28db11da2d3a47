//! Error taxonomy for the egress firewall.
//!
//! Skippable problems (an unresolvable static domain, an unreachable metadata
//! endpoint) never surface here; they are logged and collected as warnings.
//! Everything in this enum stops the operation that produced it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Invalid IPv4 address or CIDR block: {0:?}")]
    InvalidAddress(String),

    /// A source that claimed success produced something that is not an
    /// IPv4 address or range.
    #[error("Malformed address {address:?} returned by {source_name}")]
    MalformedAddress { address: String, source_name: String },

    #[error("Invalid domain format: {0:?}")]
    InvalidDomain(String),

    #[error("Failed to resolve {domain}: {reason}")]
    Unresolved { domain: String, reason: String },

    #[error("Failed to detect host network: {0}")]
    NoDefaultRoute(String),

    #[error("Firewall verification failed: {0} is reachable")]
    FilterBypassed(String),

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Metadata source unusable: {0}")]
    Metadata(String),

    #[error("Failed to lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;
