//! Spec change detection
//!
//! The hash of the last evaluated spec is kept in an annotation on the
//! installation. A spec whose hash differs from the recorded one is urgent
//! and bypasses the update window.

use ambassador_common::crd::AmbassadorInstallationSpec;
use ambassador_common::kube_utils::deterministic_hash;
use ambassador_common::Result;

/// SHA-256 of the spec's canonical JSON encoding
///
/// Map-typed fields are `BTreeMap`s, so key order is stable.
pub fn spec_hash(spec: &AmbassadorInstallationSpec) -> Result<String> {
    let canonical = serde_json::to_string(spec)?;
    Ok(deterministic_hash(&canonical))
}

/// Whether the spec changed since the recorded hash
///
/// Without a record there is nothing to compare against, so the answer is no.
pub fn has_changed(current: &str, recorded: Option<&str>) -> bool {
    recorded.is_some_and(|previous| previous != current)
}
