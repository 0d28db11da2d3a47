//! Kernel packet filter access — iptables rules, the ipset allow-set, routes
//!
//! Everything that touches kernel state goes through [`Netfilter`], which is
//! owned by the rule installer. Commands are executed through a
//! [`CommandRunner`] so they can be dry-run or recorded.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::address::AllowEntry;
use crate::error::{FirewallError, Result};

/// Runs one external command and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Executes commands on the host
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("exec: {program} {}", args.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| FirewallError::Command {
                command: format!("{program} {}", args.join(" ")),
                status: "spawn failed".into(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(FirewallError::Command {
                command: format!("{program} {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Logs commands instead of executing them. Reads return empty output.
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        info!("[dry-run] {program} {}", args.join(" "));
        Ok(String::new())
    }
}

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
    Output,
    Forward,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

/// Built-in chain policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

/// Rule verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    /// REJECT with the given ICMP type.
    Reject(&'static str),
}

/// An iptables filter rule, appended to its chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: Chain,
    pub protocol: Option<&'static str>,
    pub dport: Option<u16>,
    pub sport: Option<u16>,
    pub in_iface: Option<&'static str>,
    pub out_iface: Option<&'static str>,
    pub source: Option<AllowEntry>,
    pub destination: Option<AllowEntry>,
    pub state: Option<&'static str>,
    pub match_set: Option<String>,
    pub target: Target,
}

impl Rule {
    pub fn new(chain: Chain, target: Target) -> Self {
        Self {
            chain,
            protocol: None,
            dport: None,
            sport: None,
            in_iface: None,
            out_iface: None,
            source: None,
            destination: None,
            state: None,
            match_set: None,
            target,
        }
    }

    pub fn protocol(mut self, proto: &'static str) -> Self {
        self.protocol = Some(proto);
        self
    }

    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    pub fn sport(mut self, port: u16) -> Self {
        self.sport = Some(port);
        self
    }

    pub fn in_iface(mut self, iface: &'static str) -> Self {
        self.in_iface = Some(iface);
        self
    }

    pub fn out_iface(mut self, iface: &'static str) -> Self {
        self.out_iface = Some(iface);
        self
    }

    pub fn source(mut self, net: AllowEntry) -> Self {
        self.source = Some(net);
        self
    }

    pub fn destination(mut self, net: AllowEntry) -> Self {
        self.destination = Some(net);
        self
    }

    pub fn state(mut self, states: &'static str) -> Self {
        self.state = Some(states);
        self
    }

    pub fn match_set(mut self, set: &str) -> Self {
        self.match_set = Some(set.to_string());
        self
    }

    /// Arguments for `iptables`, starting with `-A <CHAIN>`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        push(&mut args, &["-A", self.chain.as_str()]);

        if let Some(iface) = self.in_iface {
            push(&mut args, &["-i", iface]);
        }
        if let Some(iface) = self.out_iface {
            push(&mut args, &["-o", iface]);
        }
        if let Some(ref src) = self.source {
            push(&mut args, &["-s", src.to_string().as_str()]);
        }
        if let Some(ref dst) = self.destination {
            push(&mut args, &["-d", dst.to_string().as_str()]);
        }
        if let Some(proto) = self.protocol {
            push(&mut args, &["-p", proto]);
        }
        if let Some(port) = self.sport {
            push(&mut args, &["--sport", port.to_string().as_str()]);
        }
        if let Some(port) = self.dport {
            push(&mut args, &["--dport", port.to_string().as_str()]);
        }
        if let Some(states) = self.state {
            push(&mut args, &["-m", "state", "--state", states]);
        }
        if let Some(ref set) = self.match_set {
            push(&mut args, &["-m", "set", "--match-set", set.as_str(), "dst"]);
        }

        match self.target {
            Target::Accept => push(&mut args, &["-j", "ACCEPT"]),
            Target::Drop => push(&mut args, &["-j", "DROP"]),
            Target::Reject(with) => push(&mut args, &["-j", "REJECT", "--reject-with", with]),
        }
        args
    }
}

fn push(args: &mut Vec<String>, parts: &[&str]) {
    args.extend(parts.iter().map(|p| p.to_string()));
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iptables {}", self.to_args().join(" "))
    }
}

const BUILTIN_NAT_CHAINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

/// Split one `iptables-save` rule line into arguments, honouring double quotes.
fn split_saved_rule(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Gateway of the first default route in `ip route` output.
pub fn parse_default_gateway(routes: &str) -> Option<Ipv4Addr> {
    routes
        .lines()
        .filter(|l| l.trim_start().starts_with("default"))
        .find_map(|l| {
            let mut tokens = l.split_whitespace();
            tokens.find(|t| *t == "via")?;
            tokens.next()?.parse().ok()
        })
}

/// Policy line (`-P <CHAIN> <POLICY>`) in `iptables -S <CHAIN>` output.
pub fn parse_policy(listing: &str) -> Option<Policy> {
    listing.lines().find_map(|l| {
        let mut tokens = l.split_whitespace();
        if tokens.next()? != "-P" {
            return None;
        }
        match tokens.nth(1)? {
            "ACCEPT" => Some(Policy::Accept),
            "DROP" => Some(Policy::Drop),
            _ => None,
        }
    })
}

/// Members listed by `ipset list <set>`.
pub fn parse_set_members(listing: &str) -> Vec<AllowEntry> {
    listing
        .lines()
        .skip_while(|l| !l.starts_with("Members:"))
        .skip(1)
        .filter_map(|l| {
            let token = l.split_whitespace().next()?;
            match token.parse() {
                Ok(entry) => Some(entry),
                Err(_) => {
                    warn!("Ignoring unexpected ipset member {token:?}");
                    None
                }
            }
        })
        .collect()
}

/// Typed access to iptables, ipset, ip route and sysctl
pub struct Netfilter<C> {
    runner: C,
    set_name: String,
}

impl<C: CommandRunner> Netfilter<C> {
    pub fn new(runner: C, set_name: &str) -> Self {
        Self {
            runner,
            set_name: set_name.to_string(),
        }
    }

    pub fn runner(&self) -> &C {
        &self.runner
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(program, &args).await
    }

    /// `-A` lines of the nat table that mention `pattern`.
    pub async fn save_nat_rules(&self, pattern: &str) -> Result<Vec<String>> {
        let saved = self.exec("iptables-save", &["-t", "nat"]).await?;
        Ok(saved
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("-A ") && l.contains(pattern))
            .map(String::from)
            .collect())
    }

    /// Recreate the chains the saved rules live in, then replay the rules.
    pub async fn restore_nat_rules(&self, rules: &[String]) -> Result<()> {
        let parsed: Vec<Vec<String>> = rules.iter().map(|r| split_saved_rule(r)).collect();

        let chains: BTreeSet<&str> = parsed
            .iter()
            .filter_map(|args| args.get(1).map(String::as_str))
            .filter(|chain| !BUILTIN_NAT_CHAINS.contains(chain))
            .collect();
        for chain in chains {
            // The chain may survive the flush if something re-created it.
            if let Err(e) = self.exec("iptables", &["-t", "nat", "-N", chain]).await {
                debug!("nat chain {chain} not created: {e}");
            }
        }

        for args in parsed {
            let mut full = vec!["-t".to_string(), "nat".to_string()];
            full.extend(args);
            self.runner.run("iptables", &full).await?;
        }
        Ok(())
    }

    /// Flush and delete every chain of the filter, nat and mangle tables and
    /// destroy the allow-set.
    pub async fn flush_all(&self) -> Result<()> {
        for table in ["filter", "nat", "mangle"] {
            self.exec("iptables", &["-t", table, "-F"]).await?;
            self.exec("iptables", &["-t", table, "-X"]).await?;
        }
        if let Err(e) = self.exec("ipset", &["destroy", self.set_name.as_str()]).await {
            debug!("ipset {} not destroyed (absent?): {e}", self.set_name);
        }
        Ok(())
    }

    pub async fn append(&self, rule: &Rule) -> Result<()> {
        debug!("{rule}");
        self.runner.run("iptables", &rule.to_args()).await?;
        Ok(())
    }

    pub async fn set_policy(&self, chain: Chain, policy: Policy) -> Result<()> {
        self.exec("iptables", &["-P", chain.as_str(), policy.as_str()])
            .await?;
        Ok(())
    }

    /// Current policy of a built-in filter chain.
    pub async fn policy(&self, chain: Chain) -> Result<Option<Policy>> {
        let listing = self.exec("iptables", &["-S", chain.as_str()]).await?;
        Ok(parse_policy(&listing))
    }

    pub async fn create_set(&self) -> Result<()> {
        self.exec("ipset", &["create", self.set_name.as_str(), "hash:net"]).await?;
        Ok(())
    }

    /// Idempotent: adding an existing member succeeds.
    pub async fn add_to_set(&self, entry: &AllowEntry) -> Result<()> {
        self.exec("ipset", &["add", "-exist", self.set_name.as_str(), entry.to_string().as_str()])
            .await?;
        Ok(())
    }

    /// Idempotent: removing an absent member succeeds.
    pub async fn remove_from_set(&self, entry: &AllowEntry) -> Result<()> {
        self.exec("ipset", &["del", "-exist", self.set_name.as_str(), entry.to_string().as_str()])
            .await?;
        Ok(())
    }

    pub async fn set_members(&self) -> Result<Vec<AllowEntry>> {
        let listing = self.exec("ipset", &["list", self.set_name.as_str()]).await?;
        Ok(parse_set_members(&listing))
    }

    pub async fn default_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let routes = self.exec("ip", &["-4", "route", "show", "default"]).await?;
        Ok(parse_default_gateway(&routes))
    }

    pub async fn disable_ipv6(&self) -> Result<()> {
        for scope in ["all", "default", "lo"] {
            let key = format!("net.ipv6.conf.{scope}.disable_ipv6=1");
            self.exec("sysctl", &["-w", key.as_str()]).await?;
        }
        Ok(())
    }
}
