//! IPv4 allowlist entries: validation, canonical form and range aggregation.
//!
//! An [`AllowEntry`] is the only thing the allowlist store accepts, so every
//! member of the store has passed [`AllowEntry::from_str`] (or was built from
//! an already-typed `Ipv4Addr`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::{FirewallError, Result};

/// An IPv4 host or network block. Host bits are masked off on construction,
/// so `10.1.2.3/8` and `10.0.0.0/8` are the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllowEntry {
    network: Ipv4Addr,
    prefix: u8,
}

impl AllowEntry {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(FirewallError::InvalidAddress(format!("{addr}/{prefix}")));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            network: addr,
            prefix: 32,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_host(&self) -> bool {
        self.prefix == 32
    }

    /// True if every address of `other` is inside `self`.
    pub fn contains(&self, other: &AllowEntry) -> bool {
        self.prefix <= other.prefix
            && u32::from(other.network) & mask(self.prefix) == u32::from(self.network)
    }

    /// The enclosing block one bit shorter, if `self` and `other` are its two halves.
    fn merge(&self, other: &AllowEntry) -> Option<AllowEntry> {
        if self.prefix != other.prefix || self.prefix == 0 || self == other {
            return None;
        }
        let parent_prefix = self.prefix - 1;
        let parent_mask = mask(parent_prefix);
        let a = u32::from(self.network) & parent_mask;
        let b = u32::from(other.network) & parent_mask;
        (a == b).then(|| AllowEntry {
            network: Ipv4Addr::from(a),
            prefix: parent_prefix,
        })
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for AllowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.network)
        } else {
            write!(f, "{}/{}", self.network, self.prefix)
        }
    }
}

impl FromStr for AllowEntry {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FirewallError::InvalidAddress(s.to_string());

        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let mut octets = [0u8; 4];
        let mut parts = addr_part.split('.');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            *octet = parse_decimal(part, 3).ok_or_else(invalid)?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        let prefix = match prefix_part {
            Some(p) => parse_decimal(p, 2).filter(|p| *p <= 32).ok_or_else(invalid)?,
            None => 32,
        };

        AllowEntry::new(Ipv4Addr::from(octets), prefix)
    }
}

/// Plain decimal with at most `max_digits` digits, no sign and no leading
/// zero (a leading zero is read as octal by some kernel tooling).
fn parse_decimal(s: &str, max_digits: usize) -> Option<u8> {
    if s.is_empty() || s.len() > max_digits || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse::<u8>().ok()
}

/// Is `s` a well-formed IPv4 address, optionally with a `/prefix`?
pub fn is_valid_entry(s: &str) -> bool {
    s.parse::<AllowEntry>().is_ok()
}

/// Validate a textual address produced by `source_name`. A failure here means
/// the source is lying about producing addresses, which is fatal.
pub fn validate_answer(raw: &str, source_name: &str) -> Result<AllowEntry> {
    raw.parse().map_err(|_| FirewallError::MalformedAddress {
        address: raw.to_string(),
        source_name: source_name.to_string(),
    })
}

/// Validate a resolver answer. Lookups are IPv4-only, so an IPv6 answer is
/// treated like a malformed one.
pub fn validate_ip(ip: IpAddr, source_name: &str) -> Result<AllowEntry> {
    match ip {
        IpAddr::V4(v4) => Ok(AllowEntry::host(v4)),
        IpAddr::V6(v6) => Err(FirewallError::MalformedAddress {
            address: v6.to_string(),
            source_name: source_name.to_string(),
        }),
    }
}

/// Collapse a list of blocks: drop duplicates, drop blocks covered by a
/// larger one and merge sibling halves into their parent.
pub fn aggregate(entries: impl IntoIterator<Item = AllowEntry>) -> Vec<AllowEntry> {
    let mut blocks: Vec<AllowEntry> = entries.into_iter().collect();
    blocks.sort();
    blocks.dedup();

    loop {
        // Sorted by (network, prefix): a covering block always precedes what it covers.
        let mut kept: Vec<AllowEntry> = Vec::with_capacity(blocks.len());
        for block in blocks {
            if kept.last().is_some_and(|k| k.contains(&block)) {
                continue;
            }
            kept.push(block);
        }

        let mut merged = Vec::with_capacity(kept.len());
        let mut changed = false;
        let mut i = 0;
        while i < kept.len() {
            if let Some(parent) = kept.get(i + 1).and_then(|next| kept[i].merge(next)) {
                merged.push(parent);
                changed = true;
                i += 2;
            } else {
                merged.push(kept[i]);
                i += 1;
            }
        }

        merged.sort();
        blocks = merged;
        if !changed {
            return blocks;
        }
    }
}
