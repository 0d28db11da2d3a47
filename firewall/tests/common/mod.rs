//! Fakes for the engine's four seams: DNS, metadata, probe and kernel.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use egress_firewall::metadata::FetchMetadata;
use egress_firewall::netfilter::CommandRunner;
use egress_firewall::probe::{Probe, Reachability};
use egress_firewall::resolver::Resolve;
use egress_firewall::{AllowEntry, Engine, FirewallConfig, FirewallError, Result};

pub const BLOCKED_URL: &str = "https://example.com";
pub const ALLOWED_URL: &str = "https://api.github.com/zen";

/// DNS answers from a fixed table; anything else is NXDOMAIN.
#[derive(Default)]
pub struct FakeResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl FakeResolver {
    pub fn with(mut self, name: &str, addrs: &[&str]) -> Self {
        self.answers
            .insert(name.into(), addrs.iter().map(|a| a.parse().unwrap()).collect());
        self
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<IpAddr>> {
        self.answers
            .get(name)
            .cloned()
            .ok_or_else(|| FirewallError::Unresolved {
                domain: name.into(),
                reason: "NXDOMAIN".into(),
            })
    }
}

/// Serves a fixed document, or fails like an unreachable endpoint.
pub struct FakeMetadata(pub Option<Value>);

#[async_trait]
impl FetchMetadata for FakeMetadata {
    async fn fetch(&self) -> Result<Value> {
        self.0
            .clone()
            .ok_or_else(|| FirewallError::Metadata("https://api.github.com/meta: connection refused".into()))
    }
}

pub struct FakeProbe {
    pub reachable: Vec<&'static str>,
}

impl FakeProbe {
    /// A correctly filtered network.
    pub fn filtered() -> Self {
        Self { reachable: vec![ALLOWED_URL] }
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn check(&self, url: &str) -> Reachability {
        if self.reachable.contains(&url) {
            Reachability::Reached
        } else {
            Reachability::Blocked
        }
    }
}

#[derive(Default)]
pub struct KernelState {
    pub commands: Vec<String>,
    pub set: BTreeSet<String>,
    pub set_exists: bool,
    /// `ipset add` calls that still succeed; `None` means unlimited.
    pub adds_left: Option<usize>,
    pub fail_del: bool,
    pub output_policy: Option<String>,
}

/// Simulated kernel: records every command and tracks ipset membership so
/// a second engine sees what the first one installed.
#[derive(Clone, Default)]
pub struct FakeKernel {
    pub state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn members(&self) -> Vec<String> {
        self.state.lock().unwrap().set.iter().cloned().collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    /// Let `n` more `ipset add` calls through, then fail every one after.
    pub fn fail_adds_after(&self, n: usize) {
        self.state.lock().unwrap().adds_left = Some(n);
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_del = true;
    }
}

#[async_trait]
impl CommandRunner for FakeKernel {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let line = format!("{program} {}", args.join(" "));
        let mut state = self.state.lock().unwrap();
        state.commands.push(line.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = match (program, args.as_slice()) {
            ("iptables", ["-P", "OUTPUT", policy]) => {
                state.output_policy = Some(policy.to_string());
                String::new()
            }
            ("iptables", ["-S", "OUTPUT"]) => match state.output_policy {
                Some(ref policy) => format!("-P OUTPUT {policy}\n"),
                None => String::new(),
            },
            ("ip", ["-4", "route", "show", "default"]) => "default via 172.17.0.1 dev eth0\n".to_string(),
            ("ipset", ["create", ..]) => {
                state.set.clear();
                state.set_exists = true;
                String::new()
            }
            ("ipset", ["destroy", ..]) => {
                state.set.clear();
                state.set_exists = false;
                String::new()
            }
            ("ipset", ["add", "-exist", _, entry]) if state.set_exists && state.adds_left != Some(0) => {
                if let Some(left) = state.adds_left.as_mut() {
                    *left -= 1;
                }
                state.set.insert(entry.to_string());
                String::new()
            }
            ("ipset", ["del", "-exist", _, entry]) if state.set_exists && !state.fail_del => {
                state.set.remove(*entry);
                String::new()
            }
            ("ipset", ["list", name]) if state.set_exists => {
                let mut listing = format!("Name: {name}\nType: hash:net\nMembers:\n");
                for member in &state.set {
                    listing.push_str(member);
                    listing.push('\n');
                }
                listing
            }
            ("ipset", _) => {
                return Err(FirewallError::Command {
                    command: line,
                    status: "exit status: 1".into(),
                    stderr: "The set with the given name does not exist".into(),
                });
            }
            _ => String::new(),
        };
        Ok(output)
    }
}

pub type TestEngine = Engine<FakeResolver, FakeMetadata, FakeProbe, FakeKernel>;

/// Defaults with every path inside `dir`.
pub fn config_in(dir: &Path) -> FirewallConfig {
    let mut config = FirewallConfig::default();
    config.paths.domains_file = dir.join("whitelisted-domains.txt");
    config.paths.approved_file = dir.join("approved-domains.txt");
    config.paths.audit_log = dir.join("log/audit.log");
    config.paths.lock_file = dir.join("firewall.lock");
    config.resolver.timeout_seconds = 1;
    config.resolver.retries = 0;
    config
}

pub fn engine(
    config: FirewallConfig,
    resolver: FakeResolver,
    metadata: Option<FakeMetadata>,
    probe: Option<FakeProbe>,
    kernel: FakeKernel,
) -> TestEngine {
    Engine::new(config, resolver, metadata, probe, kernel).unwrap()
}

pub fn entry(s: &str) -> AllowEntry {
    s.parse().unwrap()
}
