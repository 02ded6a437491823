//! Integration tests: node lifecycle against in-memory collaborators.
//!
//! Every scenario runs the real orchestrator with `MemoryCluster`,
//! `RecordingChartInstaller` and `MemoryKeyTool`, and real key material in
//! a scratch directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use deploy_core::chart::ChartAction;
use deploy_core::cluster::{ClusterOp, MemoryCluster, NodeStatus};
use deploy_core::config::{ActivationConfig, RetryConfig};
use deploy_core::{
    ClusterError, Collaborators, DeployConfig, DeployError, NodeRegistry, Orchestrator,
    RecordingChartInstaller, TlsRotation, UpdateOptions,
};
use deploy_keys::pfx::PfxEntry;
use deploy_keys::{
    Fingerprint, KeyError, KeyFormat, KeyManager, KeyRole, KeyTool, Keystore, MemoryKeyTool,
    NodeAlias, PfxKeyManager,
};

/// Reference epoch: 2025-01-01 00:00:00 UTC.
const JAN_1_2025: i64 = 1735689600;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .try_init();
}

fn node(name: &str) -> NodeAlias {
    NodeAlias::parse(name).expect("valid alias")
}

struct Harness {
    dir: tempfile::TempDir,
    config: DeployConfig,
    cluster: Arc<MemoryCluster>,
    chart: Arc<RecordingChartInstaller>,
    key_tool: Arc<MemoryKeyTool>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(format: KeyFormat) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = DeployConfig {
            key_dir: dir.path().join("keys"),
            staging_dir: dir.path().join("staging"),
            registry_path: dir.path().join("registry.toml"),
            key_format: format,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 0,
            },
            activation: ActivationConfig {
                max_attempts: 3,
                interval_ms: 0,
            },
            ..DeployConfig::default()
        };
        let cluster = Arc::new(MemoryCluster::new(config.namespace.clone()));
        let chart = Arc::new(RecordingChartInstaller::with_cluster(cluster.clone()));
        let key_tool = Arc::new(MemoryKeyTool::new());
        let orchestrator = Orchestrator::with_clock(
            config.clone(),
            Collaborators {
                cluster: cluster.clone(),
                chart: chart.clone(),
                key_tool: key_tool.clone(),
            },
            || JAN_1_2025,
        )
        .unwrap();

        Self {
            dir,
            config,
            cluster,
            chart,
            key_tool,
            orchestrator,
        }
    }

    async fn deployed(format: KeyFormat, names: &[&str]) -> Self {
        let harness = Self::new(format);
        harness.orchestrator.deploy(names).await.unwrap();
        harness
    }

    fn key_files(&self, name: &str, roles: &[KeyRole]) -> Vec<PathBuf> {
        KeyManager::pem_key_paths(&node(name), &self.config.key_dir, roles)
    }

    fn pfx(&self) -> PfxKeyManager {
        PfxKeyManager::new(
            self.key_tool.clone(),
            self.config.key_dir.clone(),
            &self.config.pfx_password,
        )
    }

    fn remote_key(&self, file: &str) -> String {
        format!("{}/{file}", self.config.remote.keys_dir)
    }
}

/// SHA-256 of every path, keyed by path.
fn hashes(paths: &[PathBuf]) -> BTreeMap<PathBuf, Fingerprint> {
    paths
        .iter()
        .map(|p| (p.clone(), Fingerprint::of_file(p).unwrap()))
        .collect()
}

fn accounts(registry: &NodeRegistry) -> BTreeMap<String, u64> {
    registry
        .nodes()
        .iter()
        .map(|n| (n.alias.to_string(), n.account_num))
        .collect()
}

// ---------------------------------------------------------------------------
// Add
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_node_leaves_existing_nodes_untouched() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;

    let existing: Vec<PathBuf> = ["node0", "node1", "node2"]
        .iter()
        .flat_map(|n| h.key_files(n, &KeyRole::ALL))
        .collect();
    let before = hashes(&existing);
    let accounts_before = accounts(&h.orchestrator.registry().unwrap());

    let report = h.orchestrator.add_node("node3").await.unwrap();

    assert_eq!(hashes(&existing), before, "untouched key files changed");
    assert_eq!(report.topology.len(), 4);
    for (alias, account) in &accounts_before {
        let entry = report.topology.entry(&node(alias)).unwrap();
        assert_eq!(entry.account.num, *account, "{alias} account moved");
    }
    assert_eq!(
        report.topology.account_of(&node("node3")).unwrap().to_string(),
        "0.0.6"
    );
    assert!(report
        .completed_steps
        .iter()
        .any(|s| s == "await activation"));

    let registry = h.orchestrator.registry().unwrap();
    assert_eq!(registry.len(), 4);
    assert!(h.key_files("node3", &KeyRole::ALL).iter().all(|p| p.is_file()));
}

#[tokio::test]
async fn add_node_stages_private_keys_to_the_new_node_only() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    h.orchestrator.add_node("node2").await.unwrap();

    let private = h.remote_key("s-private-node2.pem");
    let public = h.remote_key("s-public-node2.pem");
    assert!(h.cluster.file("network-node2-0", &private).is_some());
    assert!(h.cluster.file("network-node0-0", &private).is_none());
    assert!(h.cluster.file("network-node0-0", &public).is_some());

    // Existing nodes receive the new address book, not regenerated keys.
    let config_txt = format!("{}/config.txt", "/opt/hgcapp/services-hedera/HapiApp2.0");
    let staged = h.cluster.file("network-node0-0", &config_txt).unwrap();
    let rendered = h.orchestrator.topology().unwrap().render();
    assert_eq!(String::from_utf8(staged).unwrap(), rendered);

    // Freeze ran on a node that was already part of the network.
    let froze = h
        .cluster
        .exec_log("network-node0-0")
        .contains(&h.config.freeze_command);
    assert!(froze);
    assert!(!h
        .cluster
        .exec_log("network-node2-0")
        .contains(&h.config.freeze_command));
}

#[tokio::test]
async fn added_node_receives_peer_public_certificates() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    h.orchestrator.add_node("node2").await.unwrap();

    for peer in ["node0", "node1"] {
        for prefix in ["s", "a"] {
            let public = format!("{prefix}-public-{peer}.pem");
            let staged = h
                .cluster
                .file("network-node2-0", &h.remote_key(&public))
                .unwrap_or_else(|| panic!("{public} not staged to node2"));
            let local = std::fs::read(h.config.key_dir.join(&public)).unwrap();
            assert_eq!(staged, local, "{public} differs from local copy");

            let private = h.remote_key(&format!("{prefix}-private-{peer}.pem"));
            assert!(h.cluster.file("network-node2-0", &private).is_none());
        }
    }
}

#[tokio::test]
async fn adding_an_existing_node_is_rejected() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    let before = hashes(&h.key_files("node1", &KeyRole::ALL));

    let err = h.orchestrator.add_node("node1").await.unwrap_err();
    assert!(matches!(err.root_cause(), DeployError::NodeAlreadyExists(n) if n.as_str() == "node1"));
    match err {
        DeployError::Pipeline(p) => {
            assert_eq!(p.step, "validate");
            assert!(p.completed_steps.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hashes(&h.key_files("node1", &KeyRole::ALL)), before);
}

#[tokio::test]
async fn empty_alias_is_a_missing_argument() {
    let h = Harness::new(KeyFormat::Pem);
    assert!(matches!(
        h.orchestrator.add_node("").await,
        Err(DeployError::MissingArgument(_))
    ));
    assert!(matches!(
        h.orchestrator.deploy::<&str>(&[]).await,
        Err(DeployError::MissingArgument(_))
    ));
}

#[tokio::test]
async fn activation_timeout_halts_and_retires_new_keys() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;

    // The pod exists before the chart upgrade and never becomes active.
    h.cluster.add_node_pods(&node("node3"));
    h.cluster
        .script_status(&node("node3"), [NodeStatus::StartingUp]);

    let err = h.orchestrator.add_node("node3").await.unwrap_err();
    match err.root_cause() {
        DeployError::NodeActivationTimeout {
            node,
            attempts,
            last_status,
        } => {
            assert_eq!(node.as_str(), "node3");
            assert_eq!(*attempts, 3);
            assert_eq!(last_status, "STARTING_UP");
        }
        other => panic!("unexpected error: {other}"),
    }
    let DeployError::Pipeline(p) = &err else {
        panic!("expected a pipeline error");
    };
    assert_eq!(p.step, "await activation");
    assert_eq!(p.node.as_deref(), Some("node3"));
    assert_eq!(p.updated_nodes, ["node0", "node1", "node2"]);
    assert!(p.completed_steps.iter().any(|s| s == "stage files"));

    // Nothing was persisted and the new keys were moved to backup.
    assert_eq!(h.orchestrator.registry().unwrap().len(), 3);
    assert!(h.key_files("node3", &KeyRole::ALL).iter().all(|p| !p.exists()));

    // Re-running the same operation once the node recovers completes it.
    h.cluster.script_status(&node("node3"), [NodeStatus::Active]);
    let report = h.orchestrator.add_node("node3").await.unwrap();
    assert_eq!(report.topology.len(), 4);
}

#[tokio::test]
async fn transient_staging_failures_are_retried() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    h.cluster.inject_failure(
        ClusterOp::CopyTo,
        Some("network-node0-0"),
        ClusterError::Transient("connection reset".into()),
        2,
    );

    h.orchestrator.add_node("node2").await.unwrap();
    assert_eq!(h.orchestrator.registry().unwrap().len(), 3);
}

#[tokio::test]
async fn terminal_cluster_errors_are_not_retried() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    h.cluster.inject_failure(
        ClusterOp::Exec,
        Some("network-node0-0"),
        ClusterError::Terminal("forbidden".into()),
        1,
    );

    let err = h.orchestrator.add_node("node2").await.unwrap_err();
    let DeployError::Pipeline(p) = &err else {
        panic!("expected a pipeline error");
    };
    assert_eq!(p.step, "freeze network");
    assert_eq!(p.attempts, 1);
    assert!(matches!(
        err.root_cause(),
        DeployError::Cluster(ClusterError::Terminal(_))
    ));
}

#[tokio::test]
async fn concurrent_operations_are_serialized() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0"]).await;

    let (a, b) = tokio::join!(
        h.orchestrator.add_node("node1"),
        h.orchestrator.add_node("node2"),
    );
    a.unwrap();
    b.unwrap();

    let registry = h.orchestrator.registry().unwrap();
    assert_eq!(registry.aliases(), [node("node0"), node("node1"), node("node2")]);
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tls_rotation_touches_only_the_target() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;

    let mut untouched: Vec<PathBuf> = ["node0", "node2"]
        .iter()
        .flat_map(|n| h.key_files(n, &KeyRole::ALL))
        .collect();
    untouched.extend(h.key_files("node1", &KeyRole::GOSSIP));
    let before = hashes(&untouched);
    let tls_before = hashes(&h.key_files("node1", &[KeyRole::Tls]));

    let report = h
        .orchestrator
        .update_node(
            "node1",
            UpdateOptions {
                tls: TlsRotation::Always,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(hashes(&untouched), before);
    let tls_after = hashes(&h.key_files("node1", &[KeyRole::Tls]));
    assert!(tls_before.iter().all(|(p, fp)| tls_after.get(p) != Some(fp)));
    assert!(report.completed_steps.iter().any(|s| s == "regenerate keys"));

    // The replaced files are kept in a dated backup directory.
    let backups: Vec<_> = std::fs::read_dir(h.config.key_dir.join("backup"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].join("hedera-node1.key").is_file());

    // Only node1 received a new TLS key.
    let tls_remote = format!("{}/hedera-node1.key", h.config.remote.tls_dir);
    assert!(h.cluster.file("network-node1-0", &tls_remote).is_some());
    assert!(h
        .cluster
        .file("network-node0-0", &format!("{}/hedera-node1.key", h.config.remote.tls_dir))
        .is_none());
}

#[tokio::test]
async fn fresh_tls_certificate_is_not_rotated_when_expiring_only() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1"]).await;
    let before = hashes(&h.key_files("node1", &KeyRole::ALL));

    let report = h
        .orchestrator
        .update_node(
            "node1",
            UpdateOptions {
                tls: TlsRotation::WhenExpiring,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(report.skipped_steps.iter().any(|s| s == "regenerate keys"));
    assert_eq!(hashes(&h.key_files("node1", &KeyRole::ALL)), before);
}

#[tokio::test]
async fn weight_update_changes_only_that_line() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;
    let before = h.orchestrator.topology().unwrap();

    let report = h
        .orchestrator
        .update_node(
            "node2",
            UpdateOptions {
                weight: Some(5),
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.topology.entry(&node("node2")).unwrap().weight, 5);
    for alias in ["node0", "node1"] {
        assert_eq!(
            report.topology.entry(&node(alias)),
            before.entry(&node(alias))
        );
    }
    assert_eq!(h.orchestrator.registry().unwrap().get(&node("node2")).unwrap().weight, 5);
}

#[tokio::test]
async fn updating_an_unknown_node_fails() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0"]).await;
    let err = h
        .orchestrator
        .update_node("node7", UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), DeployError::NodeNotFound(_)));
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_node_keeps_other_accounts_and_ids() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;
    let others: Vec<PathBuf> = ["node0", "node2"]
        .iter()
        .flat_map(|n| h.key_files(n, &KeyRole::ALL))
        .collect();
    let before = hashes(&others);

    let report = h.orchestrator.delete_node("node1").await.unwrap();

    assert_eq!(report.topology.aliases(), [node("node0"), node("node2")]);
    assert_eq!(
        report.topology.account_of(&node("node2")).unwrap().to_string(),
        "0.0.5"
    );
    assert_eq!(hashes(&others), before);
    assert!(h.key_files("node1", &KeyRole::ALL).iter().all(|p| !p.exists()));
    assert!(!h.cluster.pod_names().iter().any(|p| p.contains("node1")));

    let upgrade = h.chart.calls().last().cloned().unwrap();
    assert_eq!(upgrade.0, ChartAction::Upgrade);
    assert_eq!(upgrade.1.node_count(), 2);

    // Ids are never reused.
    let report = h.orchestrator.add_node("node3").await.unwrap();
    let entry = report.topology.entry(&node("node3")).unwrap();
    assert_eq!(entry.node_id, 3);
    assert_eq!(entry.account.to_string(), "0.0.6");
}

#[tokio::test]
async fn deleting_the_last_node_is_rejected() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0"]).await;
    let err = h.orchestrator.delete_node("node0").await.unwrap_err();
    assert!(matches!(err.root_cause(), DeployError::InvalidOperation(_)));
    assert!(h.key_files("node0", &KeyRole::ALL).iter().all(|p| p.is_file()));
}

// ---------------------------------------------------------------------------
// Deploy and topology
// ---------------------------------------------------------------------------

#[tokio::test]
async fn topology_is_deterministic() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0", "node1", "node2"]).await;

    let first = h.orchestrator.topology().unwrap().render();
    let second = h.orchestrator.topology().unwrap().render();
    assert_eq!(first, second);

    let staged = std::fs::read_to_string(h.config.staging_dir.join("config.txt")).unwrap();
    assert_eq!(staged, first);
    assert!(first.contains("address, 0, 0, node0, 1,"));
    assert!(first.ends_with("nextNodeId, 3\n"));
}

#[tokio::test]
async fn second_deploy_is_rejected() {
    let h = Harness::deployed(KeyFormat::Pem, &["node0"]).await;
    let err = h.orchestrator.deploy(&["node1"]).await.unwrap_err();
    assert!(matches!(err.root_cause(), DeployError::InvalidOperation(_)));

    let installs = h
        .chart
        .calls()
        .iter()
        .filter(|(action, _)| *action == ChartAction::Install)
        .count();
    assert_eq!(installs, 1);
}

// ---------------------------------------------------------------------------
// PKCS#12
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pkcs12_add_extends_public_container() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0", "node1"]).await;
    let pfx = h.pfx();

    let node0_private = pfx.private_pfx_path(&node("node0"));
    let before = Fingerprint::of_file(&node0_private).unwrap();
    let node0_public = pfx
        .public_certificate(&node("node0"), PfxEntry::Signing)
        .unwrap();

    h.orchestrator.add_node("node2").await.unwrap();

    assert_eq!(Fingerprint::of_file(&node0_private).unwrap(), before);
    let after = pfx
        .public_certificate(&node("node0"), PfxEntry::Signing)
        .unwrap();
    assert_eq!(after.der(), node0_public.der());
    assert_eq!(pfx.public_store().aliases(h.key_tool.as_ref()).unwrap().len(), 9);

    assert!(h
        .cluster
        .file("network-node2-0", &h.remote_key("private-node2.pfx"))
        .is_some());
    assert!(h
        .cluster
        .file("network-node0-0", &h.remote_key("private-node2.pfx"))
        .is_none());
    assert!(h
        .cluster
        .file("network-node0-0", &h.remote_key("public.pfx"))
        .is_some());
}

#[tokio::test]
async fn pkcs12_delete_drops_public_entries() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0", "node1", "node2"]).await;
    h.orchestrator.delete_node("node2").await.unwrap();

    let aliases = h.pfx().public_store().aliases(h.key_tool.as_ref()).unwrap();
    assert_eq!(aliases.len(), 6);
    assert!(!aliases.iter().any(|a| a.ends_with("node2")));
}

#[tokio::test]
async fn pkcs12_gossip_rotation_replaces_one_nodes_entries() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0", "node1"]).await;
    let pfx = h.pfx();
    let node0 = pfx.public_fingerprints(&[node("node0")]).unwrap();
    let node1 = pfx.public_fingerprints(&[node("node1")]).unwrap();

    h.orchestrator
        .update_node(
            "node1",
            UpdateOptions {
                rotate_gossip: true,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(pfx.public_fingerprints(&[node("node0")]).unwrap(), node0);
    let rotated = pfx.public_fingerprints(&[node("node1")]).unwrap();
    assert_eq!(rotated.len(), 3);
    assert!(rotated.iter().all(|(alias, fp)| node1.get(alias) != Some(fp)));
}

#[tokio::test]
async fn pkcs12_failed_rotation_restores_node_keys() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0", "node1"]).await;
    let pfx = h.pfx();
    let node1 = node("node1");
    let private_path = pfx.private_pfx_path(&node1);
    let private_before = Fingerprint::of_file(&private_path).unwrap();
    let public_before = pfx.public_fingerprints(&[node1.clone()]).unwrap();

    h.cluster.script_status(&node1, [NodeStatus::StartingUp]);
    let err = h
        .orchestrator
        .update_node(
            "node1",
            UpdateOptions {
                rotate_gossip: true,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap_err();
    let DeployError::Pipeline(p) = &err else {
        panic!("expected a pipeline error");
    };
    assert_eq!(p.step, "await activation");
    assert!(p.completed_steps.iter().any(|s| s == "regenerate keys"));

    // The original container is back and the public store matches it again.
    assert_eq!(Fingerprint::of_file(&private_path).unwrap(), private_before);
    assert_eq!(pfx.public_fingerprints(&[node1.clone()]).unwrap(), public_before);

    let private = Keystore::new(&private_path, h.config.pfx_password.clone());
    let exported = h
        .key_tool
        .export_cert(&private, &PfxEntry::Signing.private_alias(&node1))
        .unwrap();
    let published = pfx.public_certificate(&node1, PfxEntry::Signing).unwrap();
    assert_eq!(exported, published.pem().as_bytes());
}

#[tokio::test]
async fn pkcs12_failed_delete_restores_node_keys() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0", "node1", "node2"]).await;
    let pfx = h.pfx();
    let node2 = node("node2");
    let private_path = pfx.private_pfx_path(&node2);
    let private_before = Fingerprint::of_file(&private_path).unwrap();
    let public_before = pfx.public_fingerprints(&[node2.clone()]).unwrap();
    let tls_before = hashes(&h.key_files("node2", &[KeyRole::Tls]));

    // A remaining node never comes back after the restart.
    h.cluster.script_status(&node("node0"), [NodeStatus::StartingUp]);
    let err = h.orchestrator.delete_node("node2").await.unwrap_err();
    let DeployError::Pipeline(p) = &err else {
        panic!("expected a pipeline error");
    };
    assert_eq!(p.step, "await activation");
    assert!(p.completed_steps.iter().any(|s| s == "retire keys"));

    assert_eq!(Fingerprint::of_file(&private_path).unwrap(), private_before);
    assert_eq!(pfx.public_fingerprints(&[node2.clone()]).unwrap(), public_before);
    assert_eq!(hashes(&h.key_files("node2", &[KeyRole::Tls])), tls_before);
    assert_eq!(pfx.public_store().aliases(h.key_tool.as_ref()).unwrap().len(), 9);
    assert_eq!(h.orchestrator.registry().unwrap().len(), 3);
}

#[tokio::test]
async fn key_format_cannot_change_after_deployment() {
    let h = Harness::deployed(KeyFormat::Pkcs12, &["node0"]).await;

    let config = DeployConfig {
        key_format: KeyFormat::Pem,
        ..h.config.clone()
    };
    let pem = Orchestrator::new(
        config,
        Collaborators {
            cluster: h.cluster.clone(),
            chart: h.chart.clone(),
            key_tool: h.key_tool.clone(),
        },
    )
    .unwrap();

    let err = pem.add_node("node1").await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        DeployError::Key(KeyError::KeyFormatConflict { .. })
    ));
    assert!(h.dir.path().join("keys").join("private-node0.pfx").is_file());
}
