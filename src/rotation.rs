//! StatefulSet rotation.
//!
//! A stateful workload whose template materially changed cannot always be
//! updated in place; instead a new generation is created under
//! `<name>---<N>` and the predecessors are removed. This module holds the
//! rename/rotate decisions, the discovery of the live rotation members, and
//! the planner that patches the outgoing manifest item.

use crate::cluster::ClusterApi;
use crate::error::{EngineError, Result};
use crate::manifest::Resource;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const ROTATION_ANNOTATION: &str = "foreman/rotation";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const REALNAME_LABEL: &str = "app.kubernetes.io/realname";

pub(crate) static ROTATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)---(\d+)$").expect("rotation regex"));

static IMAGE_BLACKLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(docker.io/)*redis").expect("blacklist regex"),
        Regex::new(r"^(docker.io/)*postgres").expect("blacklist regex"),
    ]
});

/// Spec keys that on their own never force a rotation.
const ROTATE_EXEMPT_KEYS: [&str; 3] = ["template", "replicas", "updateStrategy"];

/// Parses the rotation index out of `<name>---<N>`.
pub fn extract_rotation(name: &str) -> Result<u32> {
    let caps = ROTATION_RE
        .captures(name)
        .ok_or_else(|| EngineError::NoCurrentRotation(format!("rotation not found in {}", name)))?;
    caps[2]
        .parse()
        .map_err(|e| EngineError::NoCurrentRotation(format!("{}: {}", name, e)))
}

/// Whether the workload participates in rotation at all.
///
/// The `foreman/rotation` annotation wins when set; otherwise workloads
/// running a blacklisted image (Redis, Postgres) default to disabled and
/// everything else to enabled.
pub fn should_rename(sts: &Resource) -> bool {
    let mut flag = sts.annotation(ROTATION_ANNOTATION).to_string();
    if flag.is_empty() {
        let blacklisted = sts
            .value()
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .is_some_and(|containers| {
                containers.iter().any(|c| {
                    c.get("image")
                        .and_then(Value::as_str)
                        .is_some_and(|image| IMAGE_BLACKLIST.iter().any(|re| re.is_match(image)))
                })
            });
        flag = if blacklisted { "disabled" } else { "enabled" }.to_string();
    }
    flag == "enabled"
}

/// Whether the observed diff forces a new generation.
pub fn should_rotate(diff: &Map<String, Value>, sts: &Resource) -> bool {
    if diff.is_empty() {
        return false;
    }
    let Some(spec_changes) = diff.get("spec").and_then(Value::as_object) else {
        return false;
    };
    if !should_rename(sts) {
        return false;
    }
    let replicas = sts
        .value()
        .pointer("/spec/replicas")
        .and_then(Value::as_i64);
    if replicas == Some(1) {
        if spec_changes.len() == 1 && spec_changes.contains_key("replicas") {
            return false;
        }
        debug!(
            sts = %sts.name(),
            changes = ?spec_changes.keys().collect::<Vec<_>>(),
            "rotate reason: spec changes with 1-replica workload"
        );
        return true;
    }
    for key in spec_changes.keys() {
        if !ROTATE_EXEMPT_KEYS.contains(&key.as_str()) {
            debug!(sts = %sts.name(), key = %key, "rotate reason: must-rotate spec change");
            return true;
        }
    }
    if let Some(template) = spec_changes.get("template").and_then(Value::as_object) {
        if template.contains_key("labels") {
            debug!(sts = %sts.name(), "rotate reason: template labels changed");
            return true;
        }
    }
    false
}

/// The live rotation members for one logical name.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentRotation {
    /// In-cluster names, sorted.
    pub names: Vec<String>,
    /// Highest rotation index found.
    pub rotation: u32,
}

/// Discovers the current rotation by listing `^<name>---\d+$` members.
///
/// Returns `None` when no member exists or the listing fails (a rollout
/// must still proceed on a degraded listing, matching the in-place path).
pub async fn current_rotation(
    cluster: &dyn ClusterApi,
    name: &str,
    namespace: &str,
) -> Option<CurrentRotation> {
    let pattern = Regex::new(&format!(r"^{}---\d+$", regex::escape(name))).ok()?;
    let mut names = match cluster.list_statefulset_names(namespace, &pattern).await {
        Ok(names) => names,
        Err(e) => {
            warn!(sts = %name, namespace = %namespace, "rotation listing failed: {}", e);
            return None;
        }
    };
    if names.is_empty() {
        return None;
    }
    names.sort();
    let rotation = extract_rotation(names.last().unwrap()).ok()?;
    Some(CurrentRotation { names, rotation })
}

/// A resource scheduled for removal after the apply phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub name: String,
    pub namespace: String,
    pub kind: String,
}

/// Plans the rotation for one StatefulSet and patches the outgoing manifest
/// item in place: generational name, realname labels on the resource and its
/// pod template, and topology-spread selectors.
///
/// Returns whether a new generation was started. Predecessor generations are
/// appended to `to_removes` — all of them on rotation, all but the latest
/// otherwise.
pub fn plan_rotation(
    old: &Resource,
    new: &mut Resource,
    current: Option<&CurrentRotation>,
    diff: &Map<String, Value>,
    fallback_namespace: &str,
    to_removes: &mut Vec<Removal>,
) -> Result<bool> {
    let rotate = !diff.is_empty() && should_rotate(diff, old);
    info!(
        sts = %old.name(),
        namespace = %fallback_namespace,
        "planning rotation for stateful workload"
    );
    if let Some(current) = current {
        info!(sts = %old.name(), rotation = current.rotation, "current rotation found");
    }

    let mut remove_all = false;
    let mut rotated = false;
    let new_name = if rotate {
        let current = current.ok_or_else(|| EngineError::NoCurrentRotation(old.name().to_string()))?;
        remove_all = true;
        rotated = true;
        format!("{}---{}", old.name(), current.rotation + 1)
    } else if let Some(current) = current {
        format!("{}---{}", old.name(), current.rotation)
    } else {
        old.name().to_string()
    };

    new.set_name(&new_name);
    new.set_label(REALNAME_LABEL, &new_name);
    new.set_label_at("/spec/template/metadata", REALNAME_LABEL, &new_name);
    if let Some(constraints) = new
        .value_mut()
        .pointer_mut("/spec/template/spec/topologySpreadConstraints")
        .and_then(Value::as_array_mut)
    {
        for constraint in constraints {
            if let Some(obj) = constraint.as_object_mut() {
                let mut match_labels = Map::new();
                match_labels.insert(
                    REALNAME_LABEL.to_string(),
                    Value::String(new_name.clone()),
                );
                let mut selector = Map::new();
                selector.insert("matchLabels".to_string(), Value::Object(match_labels));
                obj.insert("labelSelector".to_string(), Value::Object(selector));
            }
        }
    }

    if let Some(current) = current {
        let removes: &[String] = if remove_all {
            &current.names
        } else {
            &current.names[..current.names.len() - 1]
        };
        let namespace = if new.namespace().is_empty() {
            fallback_namespace
        } else {
            new.namespace()
        };
        for name in removes {
            to_removes.push(Removal {
                name: name.clone(),
                namespace: namespace.to_string(),
                kind: "StatefulSet".to_string(),
            });
        }
    }

    info!(sts = %new_name, "applying rotation");
    Ok(rotated)
}

/// First-introduction rename pass over the rendered list.
///
/// Every StatefulSet not yet carrying a rotation suffix whose rename is
/// enabled is renamed to `<name>---0`, recording `oldName → newName`.
/// StatefulSets left alone contribute their logical→physical label pair so
/// autoscalers can still be retargeted.
pub fn rename_statefulsets(list: &mut [Resource], names: &mut HashMap<String, String>) {
    for r in list.iter_mut() {
        if r.kind() != "StatefulSet" {
            continue;
        }
        if !ROTATION_RE.is_match(r.name()) && should_rename(r) {
            let org = r.name().to_string();
            let renamed = format!("{}---0", org);
            r.set_name(&renamed);
            names.insert(org, renamed);
        } else {
            let org = r.label(NAME_LABEL).to_string();
            let real = r.label(REALNAME_LABEL).to_string();
            if !org.is_empty() && !real.is_empty() {
                names.insert(org, real);
            }
        }
    }
}
