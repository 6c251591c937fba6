//! Integration tests for the cluster registry
//!
//! These tests tell the story of how the management cluster keeps its catalog
//! of remote clusters: a record plus a kubeconfig secret per cluster.

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::time::sleep;

use meshplane::crd::{KubernetesCluster, KubernetesClusterSpec, SecretRef};
use meshplane::registry::{resolve, ClusterRegistry, KubeClusterRegistry};
use meshplane::{Error, FIELD_MANAGER, MANUAL_DISCOVERY_SOURCE};

use super::helpers::{admin_connection, ensure_test_cluster};

const MANAGEMENT_NAMESPACE: &str = "meshplane-it-registry";

async fn ensure_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await
        .expect("failed to create namespace");
}

fn sample_record(name: &str) -> KubernetesCluster {
    KubernetesCluster::record(
        name,
        MANAGEMENT_NAMESPACE,
        MANUAL_DISCOVERY_SOURCE,
        KubernetesClusterSpec {
            secret_ref: SecretRef {
                name: name.to_string(),
                namespace: MANAGEMENT_NAMESPACE.to_string(),
            },
            write_namespace: "ns-1".to_string(),
            cluster_domain: None,
        },
    )
}

/// Story: Operator registers a cluster record and resolves it back
///
/// Expected behavior:
/// - The KubernetesCluster CRD is installed on demand
/// - The record and its kubeconfig secret are written together
/// - Resolving the record yields a connection to the same server,
///   authenticated only by the stored token
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_record_round_trips_through_management_cluster() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, MANAGEMENT_NAMESPACE).await;
    let registry = KubeClusterRegistry::new(client.clone(), MANAGEMENT_NAMESPACE);
    let name = "it-remote-round-trip";

    registry
        .ensure_record_type()
        .await
        .expect("failed to install record type");
    sleep(Duration::from_secs(2)).await;
    assert!(registry.record_type_installed().await.unwrap());

    let connection = admin_connection();
    let persisted = connection
        .sanitize("integration-token")
        .and_then(|c| c.to_persisted(c.context(), name))
        .expect("failed to build persisted kubeconfig");

    registry
        .upsert(&sample_record(name), &persisted)
        .await
        .expect("failed to write record");

    let fetched = registry.get(name).await.unwrap().expect("record missing");
    assert_eq!(fetched.spec.write_namespace, "ns-1");
    assert_eq!(fetched.discovered_by(), Some(MANUAL_DISCOVERY_SOURCE));
    assert!(registry
        .list()
        .await
        .unwrap()
        .iter()
        .any(|r| r.name_any() == name));

    let resolved = resolve(&registry, name).await.expect("failed to resolve");
    assert_eq!(resolved.connection.server(), connection.server());
    assert_eq!(resolved.connection.context(), name);

    let discovery = connection.discovery().await.expect("discovery failed");
    assert!(discovery.has_group("apps"));

    // Cleanup
    registry.delete_kubeconfig_secret(&fetched.spec.secret_ref).await.unwrap();
    registry.delete(name).await.unwrap();
}

/// Story: Deleting a record twice is harmless
///
/// Expected behavior:
/// - The second delete of the record and its secret succeeds
/// - Resolving the removed record reports it as not registered
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_repeated_delete_is_idempotent() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, MANAGEMENT_NAMESPACE).await;
    let registry = KubeClusterRegistry::new(client.clone(), MANAGEMENT_NAMESPACE);
    let name = "it-remote-delete";

    registry.ensure_record_type().await.unwrap();
    sleep(Duration::from_secs(2)).await;

    let record = sample_record(name);
    let persisted = admin_connection()
        .sanitize("integration-token")
        .and_then(|c| c.to_persisted(c.context(), name))
        .unwrap();
    registry.upsert(&record, &persisted).await.unwrap();

    for _ in 0..2 {
        registry
            .delete_kubeconfig_secret(&record.spec.secret_ref)
            .await
            .expect("secret delete should tolerate absence");
        registry
            .delete(name)
            .await
            .expect("record delete should tolerate absence");
    }

    assert!(registry.get(name).await.unwrap().is_none());
    assert!(matches!(
        resolve(&registry, name).await,
        Err(Error::ClusterNotRegistered { .. })
    ));
}
