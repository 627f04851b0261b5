//! Apply/prune engine.
//!
//! Brings the cluster in line with a set of render results. Objects are
//! created tier by tier, updated only when their applied-hash annotation
//! differs from the desired one, deleted in reverse tier order, and pruned
//! when they carry a component's labels but are no longer desired. Every
//! object is attempted; failures are collected instead of aborting.

mod report;

#[cfg(test)]
mod engine_tests;

pub use report::{ApplyError, ApplyFailure, ApplyReport, Operation};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError, covers, to_dynamic};
use crate::config::Registry;
use crate::render::{RenderError, RenderResult, RenderedResource, ResourceId, Tier};

/// Kinds a component may own, listed for orphan discovery.
const PRUNABLE: &[(&str, &str)] = &[
    ("v1", "Namespace"),
    ("v1", "ServiceAccount"),
    ("v1", "Secret"),
    ("v1", "ConfigMap"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("v1", "Service"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "DaemonSet"),
];

/// The high-level resource every applied object is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Option<String>,
}

impl Owner {
    pub fn of<K>(obj: &K) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let meta = obj.meta();
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }

    /// Controller reference for garbage collection; none without a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.uid.as_ref().map(|uid| OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// One component's render result, labelled with the component it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub component: String,
    pub result: RenderResult,
}

struct Desired {
    id: ResourceId,
    tier: Tier,
    hash: String,
    object: DynamicObject,
}

enum Step {
    Created(ResourceId),
    Updated(ResourceId),
    Unchanged(ResourceId),
    Deleted(ResourceId),
    Absent,
    Failed(ApplyFailure),
}

#[derive(Clone)]
pub struct ApplyEngine {
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<Registry>,
}

impl ApplyEngine {
    pub fn new(cluster: Arc<dyn ClusterApi>, registry: Arc<Registry>) -> Self {
        Self { cluster, registry }
    }

    /// Apply a single component.
    pub async fn apply_one(
        &self,
        owner: &Owner,
        component: &str,
        result: &RenderResult,
    ) -> Result<ApplyReport, ApplyError> {
        let rendered = [Rendered {
            component: component.to_string(),
            result: result.clone(),
        }];
        self.apply(owner, &rendered).await
    }

    /// Apply several components as one batch.
    ///
    /// The union is validated first; an invalid union is rejected before
    /// anything is written. Per-object failures land in the report.
    #[instrument(skip_all, fields(owner = %owner.name, kind = %owner.kind))]
    pub async fn apply(
        &self,
        owner: &Owner,
        rendered: &[Rendered],
    ) -> Result<ApplyReport, ApplyError> {
        validate_union(rendered)?;
        let mut report = ApplyReport::default();

        let mut by_tier: BTreeMap<Tier, Vec<Desired>> = BTreeMap::new();
        for r in rendered {
            for obj in &r.result.to_create {
                match self.desired(owner, &r.component, obj) {
                    Ok(d) => by_tier.entry(d.tier).or_default().push(d),
                    Err(error) => report.failures.push(ApplyFailure {
                        id: obj.id(),
                        op: Operation::Create,
                        error,
                    }),
                }
            }
        }
        let desired_ids: BTreeSet<ResourceId> = by_tier
            .values()
            .flatten()
            .map(|d| d.id.clone())
            .collect();

        for (tier, batch) in &by_tier {
            debug!(?tier, count = batch.len(), "applying tier");
            let steps = join_all(batch.iter().map(|d| self.converge(d))).await;
            record(&mut report, steps);
        }

        let mut deletes: BTreeMap<Tier, BTreeSet<ResourceId>> = BTreeMap::new();
        for r in rendered {
            for obj in &r.result.to_delete {
                deletes.entry(obj.tier()).or_default().insert(obj.id());
            }
        }
        self.delete_tiers(&mut report, deletes).await;

        let orphans = self.orphans(rendered, &desired_ids, &mut report).await;
        self.delete_tiers(&mut report, orphans).await;

        if report.is_converged() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                unchanged = report.unchanged.len(),
                "apply converged"
            );
        } else {
            warn!(failures = report.failures.len(), "apply did not converge");
        }
        Ok(report)
    }

    /// Stamp labels, owner reference and applied hash onto a rendered object.
    fn desired(
        &self,
        owner: &Owner,
        component: &str,
        obj: &RenderedResource,
    ) -> Result<Desired, ClusterError> {
        let keys = &self.registry.keys;
        let mut value = obj.to_value()?;
        let meta = value
            .as_object_mut()
            .map(|m| m.entry("metadata").or_insert_with(|| JsonValue::Object(Default::default())))
            .and_then(JsonValue::as_object_mut)
            .ok_or_else(|| ClusterError::Invalid(format!("{} is not an object", obj.id())))?;

        let labels = meta
            .entry("labels")
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            for (k, v) in self.registry.managed_labels(component) {
                labels.insert(k, JsonValue::String(v));
            }
        }
        if let Some(owner_ref) = owner.owner_reference() {
            meta.insert(
                "ownerReferences".into(),
                serde_json::to_value(vec![owner_ref])?,
            );
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(JsonValue::as_object_mut) {
            annotations.remove(&keys.applied_hash_annotation);
        }

        let hash = warden_pki::fingerprint(&serde_json::to_vec(&value)?);
        if let Some(meta) = value.get_mut("metadata").and_then(JsonValue::as_object_mut) {
            let annotations = meta
                .entry("annotations")
                .or_insert_with(|| JsonValue::Object(Default::default()));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(
                    keys.applied_hash_annotation.clone(),
                    JsonValue::String(hash.clone()),
                );
            }
        }

        Ok(Desired {
            id: obj.id(),
            tier: obj.tier(),
            hash,
            object: to_dynamic(value)?,
        })
    }

    async fn converge(&self, d: &Desired) -> Step {
        let failed = |op, error| {
            warn!(id = %d.id, %op, %error, "apply step failed");
            Step::Failed(ApplyFailure {
                id: d.id.clone(),
                op,
                error,
            })
        };
        let live = match self.cluster.get(&d.id).await {
            Ok(live) => live,
            Err(e) => return failed(Operation::Read, e),
        };
        match live {
            None => match self.cluster.create(&d.object).await {
                Ok(_) => {
                    info!(id = %d.id, "created");
                    Step::Created(d.id.clone())
                }
                // Lost a race with another writer; converge onto it.
                Err(ClusterError::Conflict(_)) => self.update(d).await,
                Err(e) => failed(Operation::Create, e),
            },
            Some(live) if self.is_current(&live, d) => {
                debug!(id = %d.id, "unchanged");
                Step::Unchanged(d.id.clone())
            }
            Some(_) => self.update(d).await,
        }
    }

    async fn update(&self, d: &Desired) -> Step {
        match self.cluster.apply(&d.object).await {
            Ok(_) => {
                info!(id = %d.id, "updated");
                Step::Updated(d.id.clone())
            }
            Err(error) => {
                warn!(id = %d.id, %error, "update failed");
                Step::Failed(ApplyFailure {
                    id: d.id.clone(),
                    op: Operation::Update,
                    error,
                })
            }
        }
    }

    /// The live object was written from this exact render and nobody has
    /// edited the fields it sets since. Server-managed metadata is ignored.
    fn is_current(&self, live: &DynamicObject, d: &Desired) -> bool {
        if self.applied_hash(live) != Some(d.hash.as_str()) {
            return false;
        }
        let (Ok(mut want), Ok(have)) = (
            serde_json::to_value(&d.object),
            serde_json::to_value(live),
        ) else {
            return false;
        };
        if let Some(meta) = want.get_mut("metadata").and_then(JsonValue::as_object_mut) {
            meta.retain(|k, _| k == "labels" || k == "annotations");
        }
        covers(&have, &want)
    }

    fn applied_hash<'a>(&self, live: &'a DynamicObject) -> Option<&'a str> {
        live.metadata
            .annotations
            .as_ref()?
            .get(&self.registry.keys.applied_hash_annotation)
            .map(String::as_str)
    }

    async fn remove(&self, id: &ResourceId) -> Step {
        match self.cluster.get(id).await {
            Ok(None) => Step::Absent,
            Ok(Some(_)) => match self.cluster.delete(id).await {
                Ok(()) => {
                    info!(%id, "deleted");
                    Step::Deleted(id.clone())
                }
                Err(error) => Step::Failed(ApplyFailure {
                    id: id.clone(),
                    op: Operation::Delete,
                    error,
                }),
            },
            Err(error) => Step::Failed(ApplyFailure {
                id: id.clone(),
                op: Operation::Read,
                error,
            }),
        }
    }

    async fn delete_tiers(
        &self,
        report: &mut ApplyReport,
        by_tier: BTreeMap<Tier, BTreeSet<ResourceId>>,
    ) {
        for (_, ids) in by_tier.into_iter().rev() {
            let steps = join_all(ids.iter().map(|id| self.remove(id))).await;
            record(report, steps);
        }
    }

    /// Labelled objects of the rendered components that nothing desires any
    /// more and that are not already scheduled for deletion.
    async fn orphans(
        &self,
        rendered: &[Rendered],
        desired: &BTreeSet<ResourceId>,
        report: &mut ApplyReport,
    ) -> BTreeMap<Tier, BTreeSet<ResourceId>> {
        let scheduled: BTreeSet<ResourceId> = rendered
            .iter()
            .flat_map(|r| r.result.to_delete.iter().map(RenderedResource::id))
            .collect();
        let components: BTreeSet<&str> =
            rendered.iter().map(|r| r.component.as_str()).collect();

        let mut out: BTreeMap<Tier, BTreeSet<ResourceId>> = BTreeMap::new();
        for component in components {
            let labels = self.registry.managed_labels(component);
            for (api_version, kind) in PRUNABLE {
                let listed = match self.cluster.list(api_version, kind, &labels).await {
                    Ok(objs) => objs,
                    Err(error) => {
                        report.failures.push(ApplyFailure {
                            id: ResourceId::new(*api_version, *kind, None, ""),
                            op: Operation::List,
                            error,
                        });
                        continue;
                    }
                };
                for obj in listed {
                    let Some(id) = crate::cluster::object_id(&obj) else {
                        continue;
                    };
                    if !desired.contains(&id) && !scheduled.contains(&id) {
                        debug!(%id, component, "pruning orphan");
                        out.entry(Tier::of_kind(kind)).or_default().insert(id);
                    }
                }
            }
        }
        out
    }
}

fn record(report: &mut ApplyReport, steps: Vec<Step>) {
    for step in steps {
        match step {
            Step::Created(id) => report.created.push(id),
            Step::Updated(id) => report.updated.push(id),
            Step::Unchanged(id) => report.unchanged.push(id),
            Step::Deleted(id) => report.deleted.push(id),
            Step::Absent => {}
            Step::Failed(f) => report.failures.push(f),
        }
    }
}

/// Each result on its own, then across components: no identity desired
/// twice and none both desired and deleted.
fn validate_union(rendered: &[Rendered]) -> Result<(), RenderError> {
    let mut owners: HashMap<ResourceId, &str> = HashMap::new();
    for r in rendered {
        r.result.validate()?;
        for id in r.result.create_ids() {
            if let Some(other) = owners.insert(id.clone(), &r.component) {
                return Err(RenderError::InvalidConfig(format!(
                    "{id} is rendered by both {other} and {}",
                    r.component
                )));
            }
        }
    }
    for r in rendered {
        for id in r.result.delete_ids() {
            if owners.contains_key(&id) {
                return Err(RenderError::OverlappingPartition(id));
            }
        }
    }
    Ok(())
}
