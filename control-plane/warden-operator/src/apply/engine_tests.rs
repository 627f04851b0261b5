use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::*;
use crate::cluster::{MemoryCluster, Verb};
use crate::render::replica_affinity;

fn owner() -> Owner {
    Owner {
        api_version: "operator.warden.io/v1".into(),
        kind: "IntrusionDetection".into(),
        name: "default".into(),
        uid: Some("owner-uid".into()),
    }
}

fn engine(cluster: &MemoryCluster) -> ApplyEngine {
    ApplyEngine::new(Arc::new(cluster.clone()), Arc::new(Registry::default()))
}

fn config_map(name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("app".into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("key".to_string(), value.to_string())])),
        ..Default::default()
    }
}

fn namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some("app".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn deployment(replicas: i32) -> Deployment {
    let mut template = k8s_openapi::api::core::v1::PodTemplateSpec::default();
    template.spec = Some(k8s_openapi::api::core::v1::PodSpec {
        affinity: replica_affinity(replicas, "k8s-app", "worker", "app"),
        ..Default::default()
    });
    Deployment {
        metadata: ObjectMeta {
            name: Some("worker".into()),
            namespace: Some("app".into()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stack(value: &str) -> RenderResult {
    let mut out = RenderResult::new();
    out.create(namespace());
    out.create(config_map("settings", value));
    out.create(deployment(1));
    out
}

fn cm_id(name: &str) -> ResourceId {
    ResourceId::of::<ConfigMap>(Some("app"), name)
}

#[test_log::test(tokio::test)]
async fn second_apply_with_same_input_writes_nothing() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    let first = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(first.created.len(), 3);
    assert!(first.is_converged());

    cluster.reset_mutations().await;
    let second = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(second.mutations(), 0);
    assert_eq!(second.unchanged.len(), 3);
    assert_eq!(cluster.mutations().await.total(), 0);
}

#[test_log::test(tokio::test)]
async fn creates_follow_tier_order() {
    let cluster = MemoryCluster::new();
    let report = engine(&cluster)
        .apply_one(&owner(), "app", &stack("v1"))
        .await
        .unwrap();
    let kinds: Vec<&str> = report.created.iter().map(|id| id.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Namespace", "ConfigMap", "Deployment"]);
}

#[test_log::test(tokio::test)]
async fn changed_object_is_updated_and_foreign_fields_survive() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();

    // Someone else labels the live object.
    let mut live = cluster.object(&cm_id("settings")).await.unwrap();
    live.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert("team".into(), "blue".into());
    cluster.insert(&live).await.unwrap();

    cluster.reset_mutations().await;
    let report = engine.apply_one(&owner(), "app", &stack("v2")).await.unwrap();
    assert_eq!(report.updated, vec![cm_id("settings")]);
    assert_eq!(cluster.mutations().await.applies, 1);

    let live = cluster.object(&cm_id("settings")).await.unwrap();
    assert_eq!(live.data["data"]["key"], "v2");
    let labels = live.metadata.labels.unwrap();
    assert_eq!(labels.get("team").map(String::as_str), Some("blue"));
    assert_eq!(
        labels.get("warden.io/component").map(String::as_str),
        Some("app")
    );
}

#[test_log::test(tokio::test)]
async fn live_edits_are_reverted_on_the_next_pass() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();

    // Hand edit that keeps our annotations intact.
    let mut live = cluster.object(&cm_id("settings")).await.unwrap();
    live.data["data"]["key"] = "edited".into();
    cluster.insert(&live).await.unwrap();

    cluster.reset_mutations().await;
    let report = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(report.updated, vec![cm_id("settings")]);
    assert_eq!(report.unchanged.len(), 2);
    assert_eq!(cluster.mutations().await.applies, 1);

    let live = cluster.object(&cm_id("settings")).await.unwrap();
    assert_eq!(live.data["data"]["key"], "v1");

    // Repaired: the pass after that writes nothing.
    cluster.reset_mutations().await;
    let report = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(report.mutations(), 0);
}

#[test_log::test(tokio::test)]
async fn fields_no_longer_rendered_are_removed_on_update() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    let id = ResourceId::of::<Deployment>(Some("app"), "worker");

    let mut two = RenderResult::new();
    two.create(deployment(2));
    engine.apply_one(&owner(), "app", &two).await.unwrap();
    let live = cluster.object(&id).await.unwrap();
    assert!(live.data["spec"]["template"]["spec"].get("affinity").is_some());

    let mut one = RenderResult::new();
    one.create(deployment(1));
    engine.apply_one(&owner(), "app", &one).await.unwrap();
    let live = cluster.object(&id).await.unwrap();
    assert_eq!(live.data["spec"]["replicas"], 1);
    assert!(live.data["spec"]["template"]["spec"].get("affinity").is_none());
}

#[test_log::test(tokio::test)]
async fn one_failure_does_not_stop_the_batch() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    cluster.fail(Verb::Create, cm_id("settings")).await;

    let report = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(report.created.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, cm_id("settings"));
    assert_eq!(report.failures[0].op, Operation::Create);
    assert!(matches!(
        report.into_result(),
        Err(ApplyError::Batch { failures }) if failures.len() == 1
    ));

    cluster.clear_failures().await;
    let retry = engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    assert_eq!(retry.created, vec![cm_id("settings")]);
    assert!(retry.is_converged());
}

#[test_log::test(tokio::test)]
async fn deleting_absent_objects_is_a_no_op() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);
    engine.apply_one(&owner(), "app", &stack("v1")).await.unwrap();
    cluster.reset_mutations().await;

    let mut teardown = RenderResult::new();
    teardown.delete(config_map("settings", ""));
    teardown.delete(config_map("never-created", ""));
    teardown.delete(deployment(1));
    teardown.delete(namespace());
    let report = engine.apply_one(&owner(), "app", &teardown).await.unwrap();

    assert_eq!(report.deleted.len(), 3);
    assert_eq!(cluster.mutations().await.deletes, 3);
    assert!(cluster.ids().await.is_empty());

    cluster.reset_mutations().await;
    let again = engine.apply_one(&owner(), "app", &teardown).await.unwrap();
    assert_eq!(again.mutations(), 0);
    assert_eq!(cluster.mutations().await.total(), 0);
}

#[test_log::test(tokio::test)]
async fn objects_dropped_from_the_render_are_pruned() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);

    let mut before = RenderResult::new();
    before.create(config_map("settings", "v1"));
    before.create(config_map("legacy", "v1"));
    engine.apply_one(&owner(), "app", &before).await.unwrap();

    // Same kind, other component: not ours to prune.
    let mut other = RenderResult::new();
    other.create(config_map("neighbour", "v1"));
    engine.apply_one(&owner(), "other", &other).await.unwrap();

    let mut after = RenderResult::new();
    after.create(config_map("settings", "v1"));
    let report = engine.apply_one(&owner(), "app", &after).await.unwrap();

    assert_eq!(report.deleted, vec![cm_id("legacy")]);
    assert!(cluster.object(&cm_id("neighbour")).await.is_some());
    assert!(cluster.object(&cm_id("settings")).await.is_some());
}

#[test_log::test(tokio::test)]
async fn unlabelled_objects_are_never_pruned() {
    let cluster = MemoryCluster::new();
    cluster.insert(&config_map("hand-made", "x")).await.unwrap();

    let mut render = RenderResult::new();
    render.create(config_map("settings", "v1"));
    let report = engine(&cluster)
        .apply_one(&owner(), "app", &render)
        .await
        .unwrap();

    assert!(report.deleted.is_empty());
    assert!(cluster.object(&cm_id("hand-made")).await.is_some());
}

#[test_log::test(tokio::test)]
async fn owner_reference_requires_a_uid() {
    let cluster = MemoryCluster::new();
    let engine = engine(&cluster);

    let mut render = RenderResult::new();
    render.create(config_map("owned", "v1"));
    engine.apply_one(&owner(), "app", &render).await.unwrap();
    let refs = cluster
        .object(&cm_id("owned"))
        .await
        .unwrap()
        .metadata
        .owner_references
        .unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].uid, "owner-uid");
    assert_eq!(refs[0].controller, Some(true));

    let orphan_owner = Owner {
        uid: None,
        ..owner()
    };
    let mut render = RenderResult::new();
    render.create(config_map("unowned", "v1"));
    engine.apply_one(&orphan_owner, "solo", &render).await.unwrap();
    let obj = cluster.object(&cm_id("unowned")).await.unwrap();
    assert!(obj.metadata.owner_references.is_none());
}

#[test_log::test(tokio::test)]
async fn identity_claimed_by_two_components_is_rejected_before_writing() {
    let cluster = MemoryCluster::new();
    let mut a = RenderResult::new();
    a.create(config_map("shared", "a"));
    let mut b = RenderResult::new();
    b.create(config_map("shared", "b"));

    let err = engine(&cluster)
        .apply(
            &owner(),
            &[
                Rendered {
                    component: "a".into(),
                    result: a,
                },
                Rendered {
                    component: "b".into(),
                    result: b,
                },
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::InvalidRender(RenderError::InvalidConfig(_))));
    assert_eq!(cluster.mutations().await.total(), 0);
}

#[test_log::test(tokio::test)]
async fn desired_in_one_component_and_deleted_in_another_is_rejected() {
    let cluster = MemoryCluster::new();
    let mut a = RenderResult::new();
    a.create(config_map("shared", "a"));
    let mut b = RenderResult::new();
    b.delete(config_map("shared", ""));

    let err = engine(&cluster)
        .apply(
            &owner(),
            &[
                Rendered {
                    component: "a".into(),
                    result: a,
                },
                Rendered {
                    component: "b".into(),
                    result: b,
                },
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ApplyError::InvalidRender(RenderError::OverlappingPartition(id)) if id == cm_id("shared")
    ));
}
