//! AmbassadorInstallation CRD types
//!
//! An AmbassadorInstallation describes which Ambassador release should run
//! in its namespace. The operator owns the status; the spec is read-only to it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ConditionLedger;

/// Version selector used when the spec leaves `version` empty
pub const DEFAULT_VERSION_SELECTOR: &str = "*";

/// Desired state of an Ambassador installation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "getambassador.io",
    version = "v2",
    kind = "AmbassadorInstallation",
    plural = "ambassadorinstallations",
    shortname = "ambins",
    namespaced,
    status = "AmbassadorInstallationStatus",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Update-Window","type":"string","jsonPath":".spec.updateWindow"}"#,
    printcolumn = r#"{"name":"Last-Check","type":"string","jsonPath":".status.lastCheckTime"}"#,
    printcolumn = r#"{"name":"Deployed","type":"string","jsonPath":".status.conditions[?(@.type=='Deployed')].status"}"#,
    printcolumn = r#"{"name":"Deployed-Version","type":"string","jsonPath":".status.deployedRelease.appVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AmbassadorInstallationSpec {
    /// Version selector for the Ambassador app version
    ///
    /// - `1.1` pins 1.1 (and its patch releases)
    /// - `1.1.*` / `2.*` select the newest release under that prefix
    /// - `*` selects the newest GA release
    /// - `3.0-ea` / `4.*-ea` also accept early-access releases
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Image (`repository:tag`) to use instead of the chart's image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,

    /// Helm repository (or chart archive) URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_repo: Option<String>,

    /// Ambassador log level (debug, info, warn, error...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Comma-separated cron windows in which upgrades may run
    ///
    /// Empty means any time; an entry equal to `never` disables upgrades.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub update_window: String,

    /// Chart value overrides; keys may be dotted paths or nested maps
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub helm_values: BTreeMap<String, serde_json::Value>,

    /// Install the open-source flavor instead of the Edge Stack
    #[serde(default, rename = "installOSS")]
    pub install_oss: bool,
}

impl AmbassadorInstallationSpec {
    /// Version selector, falling back to the default when unset
    pub fn version_selector(&self) -> &str {
        match self.version.trim() {
            "" => DEFAULT_VERSION_SELECTOR,
            v => v,
        }
    }
}

/// Observed state of an Ambassador installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AmbassadorInstallationStatus {
    /// Conditions the installation has experienced
    #[serde(default)]
    pub conditions: ConditionLedger,

    /// Currently deployed release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_release: Option<DeployedRelease>,

    /// Last time a successful update check was performed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Ambassador edition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Flavor {
    /// Open-source Ambassador API Gateway
    #[serde(rename = "OSS")]
    Oss,
    /// Ambassador Edge Stack
    #[serde(rename = "AES")]
    Aes,
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oss => write!(f, "OSS"),
            Self::Aes => write!(f, "AES"),
        }
    }
}

/// Snapshot of a successfully deployed Helm release
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployedRelease {
    /// Helm release name
    pub name: String,
    /// Chart version
    pub version: String,
    /// Ambassador version installed by the chart
    pub app_version: String,
    /// Rendered manifest of the release
    #[serde(default)]
    pub manifest: String,
    /// Installed edition
    pub flavor: Flavor,
}
