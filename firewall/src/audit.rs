//! Audit logging — append-only record of every allowlist change
//!
//! One record per line: `<RFC 3339 timestamp> | <EVENT_KIND> | <detail>`.
//! Writing is best-effort; a failed write is reported through tracing and
//! never fails the caller.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FirewallInit,
    AllowlistAdd,
    DomainApproved,
    FirewallReady,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FirewallInit => "FIREWALL_INIT",
            EventKind::AllowlistAdd => "ALLOWLIST_ADD",
            EventKind::DomainApproved => "DOMAIN_APPROVED",
            EventKind::FirewallReady => "FIREWALL_READY",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIREWALL_INIT" => Ok(EventKind::FirewallInit),
            "ALLOWLIST_ADD" => Ok(EventKind::AllowlistAdd),
            "DOMAIN_APPROVED" => Ok(EventKind::DomainApproved),
            "FIREWALL_READY" => Ok(EventKind::FirewallReady),
            other => Err(format!("unknown audit event kind: {other}")),
        }
    }
}

/// A parsed audit line
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

impl FromStr for AuditRecord {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.splitn(3, " | ");
        let (Some(ts), Some(kind), Some(detail)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("malformed audit line: {line}"));
        };
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| format!("bad audit timestamp {ts:?}: {e}"))?
            .with_timezone(&Utc);
        Ok(AuditRecord {
            timestamp,
            kind: kind.parse()?,
            detail: detail.to_string(),
        })
    }
}

/// Append-only audit log file
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Never fails; errors are logged.
    pub fn record(&self, kind: EventKind, detail: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let detail = detail.replace(['\n', '\r'], " ");
        let line = format!("{timestamp} | {kind} | {detail}\n");

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        match self.append(&line) {
            Ok(()) => debug!("Audit: {kind} {detail}"),
            Err(e) => error!("Failed to write audit log {}: {e}", self.path.display()),
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Read back every well-formed record. Unparseable lines are skipped.
    pub fn read_records(&self) -> std::io::Result<Vec<AuditRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents.lines().filter_map(|l| l.parse().ok()).collect())
    }
}
