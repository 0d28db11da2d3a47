mod common;

use tempfile::TempDir;

use common::*;
use egress_firewall::{EventKind, FirewallError};

fn resolver() -> FakeResolver {
    FakeResolver::default()
        .with("example.org", &["93.184.216.34"])
        .with("stackoverflow.com", &["151.101.1.69", "151.101.65.69"])
        .with("v6only.example", &["2606:4700::6810:84e5"])
}

fn approvals(engine: &TestEngine) -> Vec<String> {
    engine
        .audit()
        .read_records()
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == EventKind::DomainApproved)
        .map(|r| r.detail)
        .collect()
}

/// Bootstrap with `example.org` as the only static domain.
async fn bootstrapped(dir: &TempDir, kernel: &FakeKernel) -> TestEngine {
    let config = config_in(dir.path());
    std::fs::write(&config.paths.domains_file, "example.org\n").unwrap();
    let engine = engine(config, resolver(), None, None, kernel.clone());
    engine.bootstrap().await.unwrap();
    kernel.clear_commands();
    engine
}

#[tokio::test]
async fn test_approval_extends_without_reset() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;

    let approval = engine.approve("stackoverflow.com").await.unwrap();

    assert_eq!(approval.domain, "stackoverflow.com");
    assert_eq!(approval.added, vec![entry("151.101.1.69"), entry("151.101.65.69")]);
    assert!(engine.store().contains(&entry("93.184.216.34")));
    assert_eq!(engine.store().len(), 3);
    assert_eq!(
        kernel.members(),
        vec!["151.101.1.69", "151.101.65.69", "93.184.216.34"]
    );

    // Only set additions after the read; no flush, no policy change.
    let commands = kernel.commands();
    assert!(commands
        .iter()
        .all(|c| c.starts_with("ipset add -exist") || c.starts_with("ipset list")));

    assert_eq!(approvals(&engine), vec!["stackoverflow.com: 151.101.1.69, 151.101.65.69"]);
}

#[tokio::test]
async fn test_standalone_approval_keeps_live_members() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    bootstrapped(&dir, &kernel).await;

    // A fresh process starts with an empty store.
    let engine = engine(config_in(dir.path()), resolver(), None, None, kernel.clone());
    let approval = engine.approve("stackoverflow.com").await.unwrap();

    assert_eq!(approval.added.len(), 2);
    assert!(engine.store().contains(&entry("93.184.216.34")));
    assert_eq!(kernel.members().len(), 3);
}

#[tokio::test]
async fn test_reapproving_known_domain_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;

    let approval = engine.approve("Example.ORG").await.unwrap();

    assert_eq!(approval.domain, "example.org");
    assert_eq!(approval.addresses, vec![entry("93.184.216.34")]);
    assert!(approval.added.is_empty());
    assert!(!kernel.commands().iter().any(|c| c.starts_with("ipset add")));
    assert_eq!(approvals(&engine).len(), 1);
}

#[tokio::test]
async fn test_malformed_domain_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;
    let before = engine.audit().read_records().unwrap().len();

    let err = engine.approve("not a domain").await.unwrap_err();

    assert!(matches!(err, FirewallError::InvalidDomain(_)));
    assert!(err.to_string().contains("Invalid domain format"));
    assert!(kernel.commands().is_empty());
    assert_eq!(engine.store().len(), 1);
    assert_eq!(engine.audit().read_records().unwrap().len(), before);
}

#[tokio::test]
async fn test_unresolvable_domain_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;

    let err = engine.approve("nxdomain.example").await.unwrap_err();

    assert!(matches!(err, FirewallError::Unresolved { ref domain, .. } if domain == "nxdomain.example"));
    assert_eq!(kernel.members(), vec!["93.184.216.34"]);
    assert!(approvals(&engine).is_empty());
}

#[tokio::test]
async fn test_non_ipv4_answer_is_rejected() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;

    let err = engine.approve("v6only.example").await.unwrap_err();

    assert!(matches!(err, FirewallError::MalformedAddress { .. }));
    assert_eq!(engine.store().len(), 1);
    assert!(approvals(&engine).is_empty());
}

#[tokio::test]
async fn test_failed_kernel_add_rolls_back() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;
    kernel.fail_adds_after(1);

    let err = engine.approve("stackoverflow.com").await.unwrap_err();

    assert!(matches!(err, FirewallError::Command { .. }));
    assert_eq!(kernel.members(), vec!["93.184.216.34"]);
    assert!(kernel
        .commands()
        .contains(&"ipset del -exist allowed-domains 151.101.1.69".to_string()));
    assert_eq!(engine.store().len(), 1);
    assert!(!engine.store().contains(&entry("151.101.1.69")));
    assert!(approvals(&engine).is_empty());
}

#[tokio::test]
async fn test_failed_rollback_is_audited() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = bootstrapped(&dir, &kernel).await;
    kernel.fail_adds_after(1);
    kernel.fail_deletes();

    assert!(engine.approve("stackoverflow.com").await.is_err());

    // The entry the kernel kept is both tracked and on record.
    assert!(kernel.members().contains(&"151.101.1.69".to_string()));
    assert!(engine.store().contains(&entry("151.101.1.69")));
    assert!(!engine.store().contains(&entry("151.101.65.69")));
    assert_eq!(
        approvals(&engine),
        vec!["stackoverflow.com: 151.101.1.69 (partial, rollback failed)"]
    );
}

#[tokio::test]
async fn test_approval_requires_installed_set() {
    let dir = TempDir::new().unwrap();
    let kernel = FakeKernel::default();
    let engine = engine(config_in(dir.path()), resolver(), None, None, kernel.clone());

    let err = engine.approve("stackoverflow.com").await.unwrap_err();

    assert!(matches!(err, FirewallError::Command { .. }));
    assert!(engine.store().is_empty());
    assert!(approvals(&engine).is_empty());
}
