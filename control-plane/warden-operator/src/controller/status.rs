//! Status surfacing on the primary resource.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use super::{Feature, FeatureContext, Outcome};
use crate::cluster::ClusterError;
use crate::crd::{Condition, ConditionStatus, ConditionType, FeatureStatus};
use crate::render::ResourceId;

pub const STATE_READY: &str = "Ready";
pub const STATE_DEGRADED: &str = "Degraded";

fn condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        type_,
        status,
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: None,
    }
}

fn conditions(outcome: &Outcome) -> Vec<Condition> {
    use ConditionStatus::{False, True};
    use ConditionType::{Degraded, Ready};
    match outcome {
        Outcome::Ready => {
            let msg = "All objects available";
            vec![
                condition(Ready, True, "AllObjectsAvailable", msg),
                condition(Degraded, False, "AllObjectsAvailable", msg),
            ]
        }
        Outcome::Degraded { reason } => vec![
            condition(Ready, False, "ResourceDegraded", reason),
            condition(Degraded, True, "ResourceDegraded", reason),
        ],
        Outcome::RetryAfter { reason, .. } => vec![
            condition(Ready, False, "ResourceNotReady", reason),
            condition(Degraded, True, "ResourceNotReady", reason),
        ],
    }
}

/// Carry the transition time over from `previous` for every condition whose
/// status did not flip; stamp `now` on the rest.
pub fn upsert_conditions(
    previous: &[Condition],
    next: Vec<Condition>,
    now: &str,
) -> Vec<Condition> {
    next.into_iter()
        .map(|mut c| {
            let carried = previous
                .iter()
                .find(|p| p.type_ == c.type_ && p.status == c.status)
                .and_then(|p| p.last_transition_time.clone());
            c.last_transition_time = carried.or_else(|| Some(now.to_string()));
            c
        })
        .collect()
}

pub fn status_for(
    outcome: &Outcome,
    generation: Option<i64>,
    previous: Option<&FeatureStatus>,
    now: &str,
) -> FeatureStatus {
    let previous_conditions = previous
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let state = if outcome.is_ready() {
        STATE_READY
    } else {
        STATE_DEGRADED
    };
    FeatureStatus {
        state: Some(state.to_string()),
        observed_generation: generation,
        conditions: Some(upsert_conditions(
            previous_conditions,
            conditions(outcome),
            now,
        )),
    }
}

/// Whether `next` differs from `previous` in anything but timestamps.
pub fn should_patch(previous: Option<&FeatureStatus>, next: &FeatureStatus) -> bool {
    let normalize = |s: &FeatureStatus| {
        let mut s = s.clone();
        for c in s.conditions.iter_mut().flatten() {
            c.last_transition_time = None;
        }
        s
    };
    match previous {
        None => true,
        Some(prev) => normalize(prev) != normalize(next),
    }
}

/// Patch the status of `obj` when the outcome changes it. Returns whether
/// a patch was issued.
pub async fn report<K: Feature>(
    ctx: &FeatureContext,
    obj: &K,
    outcome: &Outcome,
) -> Result<bool, ClusterError> {
    let now = Utc::now().to_rfc3339();
    let previous = obj.status();
    let next = status_for(outcome, obj.meta().generation, previous, &now);
    if !should_patch(previous, &next) {
        debug!(feature = K::FEATURE, "status unchanged");
        return Ok(false);
    }
    let id = ResourceId::of::<K>(obj.namespace().as_deref(), &obj.name_any());
    ctx.cluster
        .patch_status(&id, &serde_json::to_value(&next)?)
        .await?;
    Ok(true)
}
