//! Twin documents and patches
//!
//! Both are thin wrappers over JSON objects. `$version` is carried inside the
//! object, as the upstream service does.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const VERSION_KEY: &str = "$version";

/// Desired or reported property patch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TwinPatch(Map<String, Value>);

impl TwinPatch {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self(properties)
    }

    /// Build a patch from a JSON value, which must be an object
    pub fn from_value(value: Value) -> HubResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(HubError::internal_error(format!(
                "twin patch must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> HubResult<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn version(&self) -> Option<i64> {
        self.0.get(VERSION_KEY).and_then(Value::as_i64)
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.0.insert(VERSION_KEY.to_string(), Value::from(version));
        self
    }

    /// Properties without the `$version` marker
    pub fn properties(&self) -> Map<String, Value> {
        let mut properties = self.0.clone();
        properties.remove(VERSION_KEY);
        properties
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.keys().all(|k| k == VERSION_KEY)
    }

    /// Dotted paths of every leaf the patch touches
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths(&self.properties(), "", &mut paths);
        paths
    }

    /// Remove `paths` from the patch, pruning objects left empty
    pub fn without_paths(&self, paths: &[String]) -> Self {
        let mut properties = self.0.clone();
        for path in paths {
            remove_path(&mut properties, path);
        }
        Self(properties)
    }

    /// Apply this patch to `target` with JSON merge-patch semantics
    ///
    /// `null` removes a property, objects merge recursively, anything else replaces.
    pub fn merge_into(&self, target: &mut Map<String, Value>) {
        merge(target, &self.properties());
    }

    pub fn to_bytes(&self) -> HubResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.properties())?)
    }
}

fn collect_paths(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(child) if !child.is_empty() => collect_paths(child, &path, out),
            _ => out.push(path),
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            let now_empty = match map.get_mut(head) {
                Some(Value::Object(child)) => {
                    remove_path(child, rest);
                    child.is_empty()
                }
                _ => false,
            };
            if now_empty {
                map.remove(head);
            }
        }
    }
}

fn merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(child_patch) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(child_target) = entry {
                    merge(child_target, child_patch);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Full twin as returned by the upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: Map<String, Value>,
    #[serde(default)]
    pub reported: Map<String, Value>,
}

impl TwinDocument {
    pub fn desired_version(&self) -> Option<i64> {
        self.desired.get(VERSION_KEY).and_then(Value::as_i64)
    }

    pub fn reported_version(&self) -> Option<i64> {
        self.reported.get(VERSION_KEY).and_then(Value::as_i64)
    }

    /// Merge a desired patch and adopt its version
    pub fn apply_desired(&mut self, patch: &TwinPatch) {
        patch.merge_into(&mut self.desired);
        if let Some(version) = patch.version() {
            self.desired
                .insert(VERSION_KEY.to_string(), Value::from(version));
        }
    }

    /// Merge a reported patch acknowledged at `version`
    pub fn apply_reported(&mut self, patch: &TwinPatch, version: Option<i64>) {
        patch.merge_into(&mut self.reported);
        if let Some(version) = version {
            self.reported
                .insert(VERSION_KEY.to_string(), Value::from(version));
        }
    }
}
