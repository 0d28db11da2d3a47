//! Published CIDR ranges of a trusted service (GitHub's `/meta` by default).

use async_trait::async_trait;
use serde_json::Value;
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::debug;

use crate::address::{aggregate, validate_answer, AllowEntry};
use crate::config::MetadataConfig;
use crate::error::{FirewallError, Result};

pub const SOURCE_NAME: &str = "remote-metadata";

#[async_trait]
pub trait FetchMetadata: Send + Sync {
    /// Fetch the raw metadata document.
    async fn fetch(&self) -> Result<Value>;
}

/// Fetches the document over HTTPS
pub struct HttpMetadata {
    client: reqwest::Client,
    url: String,
}

impl HttpMetadata {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FirewallError::Metadata(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl FetchMetadata for HttpMetadata {
    async fn fetch(&self) -> Result<Value> {
        debug!("Fetching metadata from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FirewallError::Metadata(format!("{}: {e}", self.url)))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| FirewallError::Metadata(format!("{}: invalid JSON: {e}", self.url)))
    }
}

/// Ranges extracted from a metadata document
#[derive(Debug, Default, PartialEq)]
pub struct MetadataRanges {
    /// Aggregated IPv4 blocks.
    pub entries: Vec<AllowEntry>,
    /// IPv4 strings seen before aggregation.
    pub raw_ipv4: usize,
    /// IPv6 ranges dropped because the family is disabled.
    pub skipped_ipv6: usize,
}

/// Pull the ranges listed under `fields` out of `doc`.
///
/// A missing or non-array field makes the whole document unusable
/// (`FirewallError::Metadata`, skippable). A listed value that is not an
/// IPv4 block is `FirewallError::MalformedAddress`, which is fatal.
pub fn extract_ranges(doc: &Value, fields: &[String]) -> Result<MetadataRanges> {
    let mut arrays = Vec::with_capacity(fields.len());
    for field in fields {
        let array = doc
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| FirewallError::Metadata(format!("required field {field:?} missing")))?;
        arrays.push(array);
    }

    let mut ranges = MetadataRanges::default();
    let mut parsed = Vec::new();
    for item in arrays.into_iter().flatten() {
        let Some(raw) = item.as_str() else {
            return Err(FirewallError::MalformedAddress {
                address: item.to_string(),
                source_name: SOURCE_NAME.to_string(),
            });
        };
        if is_ipv6_range(raw) {
            ranges.skipped_ipv6 += 1;
            continue;
        }
        parsed.push(validate_answer(raw, SOURCE_NAME)?);
        ranges.raw_ipv4 += 1;
    }

    ranges.entries = aggregate(parsed);
    Ok(ranges)
}

/// `addr` or `addr/prefix` in the IPv6 family. Only well-formed ranges
/// qualify; anything else is left for IPv4 validation to reject.
fn is_ipv6_range(raw: &str) -> bool {
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (raw, None),
    };
    addr.parse::<Ipv6Addr>().is_ok()
        && prefix.map_or(true, |p| p.parse::<u8>().is_ok_and(|p| p <= 128))
}
