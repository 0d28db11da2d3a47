//! Domain names: syntax check and the newline-delimited domain list format.

use std::path::Path;

use crate::error::{FirewallError, Result};

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// LDH hostname check: dot-separated labels of letters, digits and inner
/// hyphens. No wildcards, no trailing dot, no whitespace.
pub fn is_valid_domain(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

pub fn validate_domain(name: &str) -> Result<String> {
    if is_valid_domain(name) {
        Ok(name.to_ascii_lowercase())
    } else {
        Err(FirewallError::InvalidDomain(name.to_string()))
    }
}

/// Parse a domain list: one name per line, `#` starts a comment, blank lines
/// are ignored. Entries are lowercased and de-duplicated, first occurrence wins.
pub fn parse_domain_list(contents: &str) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for line in contents.lines() {
        let entry = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        }
        .trim();
        if entry.is_empty() {
            continue;
        }
        let entry = entry.to_ascii_lowercase();
        if !domains.contains(&entry) {
            domains.push(entry);
        }
    }
    domains
}

/// Read a domain list file. A missing file yields `None`.
pub fn read_domain_list(path: &Path) -> Result<Option<Vec<String>>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(parse_domain_list(&contents))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
