//! Registry of dependent kinds
//!
//! Every successful release reports the kinds found in its manifest. Each kind
//! is handed out for watching once for the lifetime of the process. Kinds that
//! change routinely as part of normal Ambassador operation are never watched.

use std::collections::HashSet;

use kube::core::GroupVersionKind;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use ambassador_common::kube_utils::split_api_version;

/// Kinds whose changes never trigger a reconcile
pub const IGNORED_KINDS: [&str; 9] = [
    "AuthService",
    "Deployment",
    "Filter",
    "FilterPolicy",
    "Mapping",
    "RateLimitService",
    "Secret",
    "Service",
    "ServiceAccount",
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestHeader {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// Kinds found in a multi-document YAML manifest, in order of appearance
pub fn manifest_kinds(manifest: &str) -> Vec<GroupVersionKind> {
    let mut kinds = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let header = match Option::<ManifestHeader>::deserialize(document) {
            Ok(Some(header)) => header,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "skipping unparsable manifest document");
                continue;
            }
        };
        let (Some(api_version), Some(kind)) = (header.api_version, header.kind) else {
            continue;
        };
        let (group, version) = split_api_version(&api_version);
        let gvk = GroupVersionKind::gvk(group, version, &kind);
        if !kinds.contains(&gvk) {
            kinds.push(gvk);
        }
    }
    kinds
}

/// Set of kinds already being watched
#[derive(Default)]
pub struct WatchRegistry {
    seen: Mutex<HashSet<GroupVersionKind>>,
}

impl WatchRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the kinds of a release manifest
    ///
    /// Returns the kinds not seen before that should start being watched.
    pub fn observe(&self, manifest: &str) -> Vec<GroupVersionKind> {
        let mut seen = self.seen.lock();
        manifest_kinds(manifest)
            .into_iter()
            .filter(|gvk| seen.insert(gvk.clone()))
            .filter(|gvk| !IGNORED_KINDS.contains(&gvk.kind.as_str()))
            .collect()
    }

    /// Number of kinds recorded so far, ignored ones included
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether nothing was recorded yet
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
