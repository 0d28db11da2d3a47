//! Post-install verification probe
//!
//! Confirms the filter both blocks and admits: a known-blocked destination
//! must be unreachable, and a known-allowed one should be reachable.

use async_trait::async_trait;
use nix::errno::Errno;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{FirewallError, Result};

/// Socket errors the filter produces: REJECT, DROP (connect times out) and
/// locally refused sends.
const BLOCKED_ERRNOS: [Errno; 6] = [
    Errno::ECONNREFUSED,
    Errno::EHOSTUNREACH,
    Errno::ENETUNREACH,
    Errno::ETIMEDOUT,
    Errno::EPERM,
    Errno::EACCES,
];

/// What a single request tells us about the path to a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// Packets reached the remote end, whatever happened afterwards.
    Reached,
    /// The connection attempt was refused, dropped or timed out.
    Blocked,
    /// The request failed for some other reason (DNS, local setup).
    Inconclusive(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: &str) -> Reachability;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        // The overall deadline is longer so a dropped connect reports as a connect timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout * 2)
            .no_proxy()
            .build()
            .map_err(|e| FirewallError::Config(format!("Failed to build probe client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: &str) -> Reachability {
        match self.client.get(url).send().await {
            // Any status code counts: the request made it through the filter.
            Ok(_) => Reachability::Reached,
            Err(e) => classify_failure(e.is_connect(), e.is_timeout(), &e),
        }
    }
}

/// Classify a failed request by the socket-level cause in its error chain.
fn classify_failure(connecting: bool, timed_out: bool, err: &(dyn StdError + 'static)) -> Reachability {
    if timed_out {
        return if connecting {
            Reachability::Blocked
        } else {
            Reachability::Reached
        };
    }

    let mut cause = Some(err);
    while let Some(e) = cause {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_blocked_io(io_err) {
                return Reachability::Blocked;
            }
            // TLS failures surface as InvalidData after the TCP handshake.
            if io_err.kind() == io::ErrorKind::InvalidData {
                return Reachability::Reached;
            }
        }
        cause = e.source();
    }

    if connecting {
        Reachability::Inconclusive(err.to_string())
    } else {
        Reachability::Reached
    }
}

fn is_blocked_io(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        return BLOCKED_ERRNOS.contains(&Errno::from_raw(code));
    }
    // Wrapped errors do not expose the inner error through `source()`.
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<io::Error>())
        .is_some_and(is_blocked_io)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub blocked_url: String,
    pub allowed_url: String,
    /// False when the blocked check was inconclusive.
    pub blocked_confirmed: bool,
    pub allowed_reachable: bool,
}

/// Run both checks concurrently.
///
/// A reached blocked URL is fatal. Anything short of a confirmed result
/// otherwise is a warning since the remote end may simply be down.
pub async fn verify<P: Probe + ?Sized>(probe: &P, blocked_url: &str, allowed_url: &str) -> Result<ProbeReport> {
    info!("Verifying firewall rules");
    let (blocked, allowed) = tokio::join!(probe.check(blocked_url), probe.check(allowed_url));

    let blocked_confirmed = match blocked {
        Reachability::Reached => return Err(FirewallError::FilterBypassed(blocked_url.to_string())),
        Reachability::Blocked => {
            info!("Firewall verification passed: {blocked_url} is blocked");
            true
        }
        Reachability::Inconclusive(reason) => {
            warn!("Could not confirm {blocked_url} is blocked: {reason}");
            false
        }
    };

    let allowed_reachable = allowed == Reachability::Reached;
    if allowed_reachable {
        info!("Firewall verification passed: {allowed_url} is reachable");
    } else {
        warn!("Unable to reach {allowed_url}; allowed traffic may be blocked");
    }

    Ok(ProbeReport {
        blocked_url: blocked_url.to_string(),
        allowed_url: allowed_url.to_string(),
        blocked_confirmed,
        allowed_reachable,
    })
}
