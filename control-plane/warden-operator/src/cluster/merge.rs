//! Field-level merge used by the in-memory cluster to mimic server-side
//! apply.

use serde_json::{Map, Value as JsonValue};

/// Merge `desired` into `live`.
///
/// Objects merge key by key, keys only present in `live` survive, arrays
/// and scalars from `desired` replace, and `null` removes the key.
pub fn merge_into(live: &mut JsonValue, desired: &JsonValue) {
    match (live, desired) {
        (JsonValue::Object(live), JsonValue::Object(desired)) => {
            for (key, value) in desired {
                if value.is_null() {
                    live.remove(key);
                    continue;
                }
                match live.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_into(existing, value)
                    }
                    _ => {
                        live.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

/// Drop from `live` every field the previous apply set (`last`) that the
/// new apply (`desired`) no longer mentions. Fields set by other writers
/// are never in `last` and survive.
pub fn remove_dropped(live: &mut JsonValue, last: &JsonValue, desired: &JsonValue) {
    let (Some(live), Some(last)) = (live.as_object_mut(), last.as_object()) else {
        return;
    };
    let desired = desired.as_object();
    for (key, previous) in last {
        match desired.and_then(|d| d.get(key)) {
            None => {
                live.remove(key);
            }
            Some(next) => {
                if let Some(child) = live.get_mut(key) {
                    remove_dropped(child, previous, next);
                }
            }
        }
    }
}

/// True when every field of `desired` holds the same value in `live`.
///
/// Keys only present in `live` are ignored, so values the server fills in
/// do not count as drift. Arrays must match element by element and a
/// `null` in `desired` matches an absent key.
pub fn covers(live: &JsonValue, desired: &JsonValue) -> bool {
    match (live, desired) {
        (JsonValue::Object(live), JsonValue::Object(desired)) => {
            desired.iter().all(|(key, want)| match live.get(key) {
                Some(have) => covers(have, want),
                None => want.is_null(),
            })
        }
        (JsonValue::Array(live), JsonValue::Array(desired)) => {
            live.len() == desired.len()
                && live.iter().zip(desired).all(|(have, want)| covers(have, want))
        }
        (live, desired) => live == desired,
    }
}

/// Union of owner references keyed by uid. Entries from `desired` win on
/// the same uid; at most one controller survives and an existing one is
/// never displaced.
pub fn merge_owner_references(
    live: Option<&JsonValue>,
    desired: Option<&JsonValue>,
) -> Option<JsonValue> {
    let as_list = |v: Option<&JsonValue>| {
        v.and_then(JsonValue::as_array).cloned().unwrap_or_default()
    };
    let live = as_list(live);
    let desired = as_list(desired);
    if live.is_empty() && desired.is_empty() {
        return None;
    }
    let uid = |r: &JsonValue| r.get("uid").and_then(JsonValue::as_str).map(str::to_string);
    let is_controller =
        |r: &JsonValue| r.get("controller").and_then(JsonValue::as_bool).unwrap_or(false);

    let mut out: Vec<JsonValue> = live
        .iter()
        .filter(|l| !desired.iter().any(|d| uid(d) == uid(l)))
        .cloned()
        .collect();
    let foreign_controller = out.iter().any(is_controller);
    for mut d in desired {
        if foreign_controller && is_controller(&d) {
            if let Some(map) = d.as_object_mut() {
                map.insert("controller".into(), JsonValue::Bool(false));
            }
        }
        out.push(d);
    }
    Some(JsonValue::Array(out))
}

/// Apply the owner reference union onto a merged object.
pub fn fix_owner_references(
    merged: &mut JsonValue,
    live: &JsonValue,
    desired: &JsonValue,
) {
    let refs = merge_owner_references(
        live.pointer("/metadata/ownerReferences"),
        desired.pointer("/metadata/ownerReferences"),
    );
    if let (Some(refs), Some(meta)) = (
        refs,
        merged.get_mut("metadata").and_then(JsonValue::as_object_mut),
    ) {
        meta.insert("ownerReferences".into(), refs);
    }
}

pub fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}
