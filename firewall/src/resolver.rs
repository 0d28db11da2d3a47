//! Concurrent domain resolution with bounded timeouts
//!
//! Every name of a batch gets its own task. A task never fails: it ends with
//! either a non-empty address list or an explicit `Unresolved` marker, and
//! the batch only returns once all of them have settled.

use async_trait::async_trait;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::TokioAsyncResolver;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{FirewallError, Result};

/// A single IPv4 lookup against some resolver.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver built from the system resolver configuration (`/etc/resolv.conf`).
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf(timeout: Duration) -> Result<Self> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| FirewallError::Config(format!("Failed to read resolver configuration: {e}")))?;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;
        opts.timeout = timeout;
        // Retries are driven by BatchResolver so each attempt is individually bounded.
        opts.attempts = 1;
        opts.cache_size = 0;

        Ok(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .inner
            .lookup_ip(name)
            .await
            .map_err(|e| FirewallError::Unresolved {
                domain: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }
}

/// Outcome of resolving one name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Non-empty, sorted, de-duplicated.
    Resolved(Vec<IpAddr>),
    Unresolved(String),
}

impl Resolution {
    pub fn addresses(&self) -> Option<&[IpAddr]> {
        match self {
            Resolution::Resolved(addrs) => Some(addrs),
            Resolution::Unresolved(_) => None,
        }
    }
}

/// Fans a batch of names out over the tokio runtime
pub struct BatchResolver<R> {
    resolver: Arc<R>,
    timeout: Duration,
    retries: u32,
}

impl<R: Resolve> BatchResolver<R> {
    pub fn new(resolver: R, timeout: Duration, retries: u32) -> Self {
        Self {
            resolver: Arc::new(resolver),
            timeout,
            retries,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub async fn resolve_one(&self, name: &str) -> Resolution {
        lookup_with_retry(self.resolver.as_ref(), name, self.timeout, self.retries).await
    }

    /// Resolve every distinct name concurrently and wait for all of them.
    pub async fn resolve_all(&self, names: &[String]) -> BTreeMap<String, Resolution> {
        let unique: BTreeSet<&String> = names.iter().collect();
        let mut tasks = JoinSet::new();

        for name in &unique {
            let resolver = Arc::clone(&self.resolver);
            let name = (*name).clone();
            let (timeout, retries) = (self.timeout, self.retries);
            tasks.spawn(async move {
                let resolution = lookup_with_retry(resolver.as_ref(), &name, timeout, retries).await;
                (name, resolution)
            });
        }
        debug!("Resolving {} domains concurrently", unique.len());

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, resolution)) => {
                    results.insert(name, resolution);
                }
                Err(e) => warn!("Resolver task failed: {e}"),
            }
        }

        for name in unique {
            results
                .entry(name.clone())
                .or_insert_with(|| Resolution::Unresolved("resolver task aborted".into()));
        }
        results
    }
}

async fn lookup_with_retry<R: Resolve + ?Sized>(
    resolver: &R,
    name: &str,
    timeout: Duration,
    retries: u32,
) -> Resolution {
    let mut last_error = String::new();

    for attempt in 0..=retries {
        match tokio::time::timeout(timeout, resolver.lookup_ipv4(name)).await {
            Ok(Ok(mut addrs)) => {
                if addrs.is_empty() {
                    return Resolution::Unresolved("no A records".into());
                }
                addrs.sort();
                addrs.dedup();
                return Resolution::Resolved(addrs);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {}ms", timeout.as_millis()),
        }
        debug!("Lookup of {name} failed (attempt {}): {last_error}", attempt + 1);
    }

    Resolution::Unresolved(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Answers from a table; names in `slow` never answer in time and names
    /// in `flaky` fail the first time they are asked.
    #[derive(Default)]
    struct FakeResolver {
        answers: HashMap<String, Vec<IpAddr>>,
        slow: Vec<String>,
        flaky: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn with(mut self, name: &str, addrs: &[&str]) -> Self {
            self.answers
                .insert(name.into(), addrs.iter().map(|a| a.parse().unwrap()).collect());
            self
        }
    }

    #[async_trait]
    impl Resolve for FakeResolver {
        async fn lookup_ipv4(&self, name: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow.iter().any(|s| s == name) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(pos) = flaky.iter().position(|f| f == name) {
                    flaky.remove(pos);
                    return Err(FirewallError::Unresolved {
                        domain: name.into(),
                        reason: "SERVFAIL".into(),
                    });
                }
            }
            self.answers
                .get(name)
                .cloned()
                .ok_or_else(|| FirewallError::Unresolved {
                    domain: name.into(),
                    reason: "NXDOMAIN".into(),
                })
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_every_name_gets_exactly_one_outcome() {
        let fake = FakeResolver::default()
            .with("example.org", &["93.184.216.34"])
            .with("github.com", &["140.82.112.3", "140.82.112.4"]);
        let batch = BatchResolver::new(fake, Duration::from_millis(200), 0);

        let input = names(&["example.org", "github.com", "bad.invalid"]);
        let results = batch.resolve_all(&input).await;

        assert_eq!(results.len(), input.len());
        assert_eq!(batch.resolver().calls.load(Ordering::SeqCst), input.len());
        assert!(results["example.org"].addresses().is_some_and(|a| !a.is_empty()));
        assert_eq!(results["github.com"].addresses().unwrap().len(), 2);
        assert!(matches!(results["bad.invalid"], Resolution::Unresolved(_)));
    }

    #[tokio::test]
    async fn test_slow_name_times_out_without_delaying_batch() {
        let fake = FakeResolver {
            slow: vec!["slow.example".into()],
            ..FakeResolver::default()
        }
        .with("fast.example", &["1.2.3.4"]);
        let batch = BatchResolver::new(fake, Duration::from_millis(100), 1);

        let started = Instant::now();
        let results = batch
            .resolve_all(&names(&["slow.example", "fast.example"]))
            .await;

        // Two bounded attempts, not 30 seconds.
        assert!(started.elapsed() < Duration::from_secs(5));
        match &results["slow.example"] {
            Resolution::Unresolved(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(results["fast.example"].addresses().is_some());
    }

    #[tokio::test]
    async fn test_retry_budget_recovers_transient_failure() {
        let fake = FakeResolver {
            flaky: Mutex::new(vec!["flaky.example".into()]),
            ..FakeResolver::default()
        }
        .with("flaky.example", &["5.6.7.8"]);
        let batch = BatchResolver::new(fake, Duration::from_millis(200), 1);

        let resolution = batch.resolve_one("flaky.example").await;
        assert_eq!(
            resolution,
            Resolution::Resolved(vec!["5.6.7.8".parse().unwrap()])
        );
        assert_eq!(batch.resolver().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_budget_gives_up() {
        let fake = FakeResolver {
            flaky: Mutex::new(vec!["flaky.example".into()]),
            ..FakeResolver::default()
        }
        .with("flaky.example", &["5.6.7.8"]);
        let batch = BatchResolver::new(fake, Duration::from_millis(200), 0);

        match batch.resolve_one("flaky.example").await {
            Resolution::Unresolved(reason) => assert!(reason.contains("SERVFAIL")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_answers_collapse() {
        let fake = FakeResolver::default().with("dup.example", &["9.9.9.9", "1.1.1.1", "9.9.9.9"]);
        let batch = BatchResolver::new(fake, Duration::from_millis(200), 0);
        let resolution = batch.resolve_one("dup.example").await;
        assert_eq!(resolution.addresses().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_answer_is_unresolved() {
        let fake = FakeResolver::default().with("empty.example", &[]);
        let batch = BatchResolver::new(fake, Duration::from_millis(200), 2);
        assert!(matches!(
            batch.resolve_one("empty.example").await,
            Resolution::Unresolved(_)
        ));
        assert_eq!(batch.resolver().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let batch = BatchResolver::new(FakeResolver::default(), Duration::from_millis(50), 0);
        assert!(batch.resolve_all(&[]).await.is_empty());
    }
}
