//! Chart retrieval and Helm release management
//!
//! Two seams: [`ChartIndex`] lists the charts a repository publishes, and
//! [`ReleaseManager`] inspects and mutates the Helm release of an
//! installation. Production implementations talk HTTP (`reqwest`) and drive
//! the `helm` binary; tests use the generated mocks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Deserializer};
use tokio::process::Command;
use tracing::{debug, info};

use ambassador_common::{Error, ReleaseOperation, Result};

use crate::values::HelmValues;
use crate::version::ChartCandidate;

/// HTTP timeout for repository index requests
const INDEX_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the chart of a release comes from
#[derive(Clone, Debug, PartialEq)]
pub enum ChartSource {
    /// A chart selected from a repository index
    Repository {
        /// Repository URL
        repo_url: String,
        /// Chart name
        chart: String,
        /// Selected chart
        candidate: ChartCandidate,
    },
    /// A chart archive installed directly
    Archive {
        /// Archive URL
        url: String,
    },
}

impl ChartSource {
    /// Chart version, when known before installing
    pub fn chart_version(&self) -> Option<&str> {
        match self {
            Self::Repository { candidate, .. } => Some(&candidate.chart_version),
            Self::Archive { .. } => None,
        }
    }

    /// Helm arguments naming the chart
    fn chart_args(&self) -> Vec<String> {
        match self {
            Self::Repository {
                repo_url,
                chart,
                candidate,
            } => vec![
                chart.clone(),
                "--repo".to_string(),
                repo_url.clone(),
                "--version".to_string(),
                candidate.chart_version.clone(),
            ],
            Self::Archive { url } => vec![url.clone()],
        }
    }
}

/// Everything needed to act on one release
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRequest {
    /// Release name
    pub name: String,
    /// Release namespace
    pub namespace: String,
    /// Chart to install
    pub chart: ChartSource,
    /// Values to install with
    pub values: HelmValues,
}

/// What the release manager knows about an existing release
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseState {
    /// A release with this name exists
    pub installed: bool,
    /// The existing release differs from the requested one
    pub update_required: bool,
}

/// A deployed Helm release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Release {
    /// Release name
    pub name: String,
    /// Chart version
    pub chart_version: String,
    /// App version installed by the chart
    pub app_version: String,
    /// Rendered manifest
    pub manifest: String,
    /// Chart notes
    pub notes: String,
}

/// Result of an uninstall
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The release was removed
    Uninstalled,
    /// There was no release to remove
    NotFound,
}

/// Lists the charts published by a repository
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartIndex: Send + Sync {
    /// All published versions of `chart` in the repository at `repo_url`
    ///
    /// A repository without the chart yields an empty list.
    async fn candidates(&self, repo_url: &str, chart: &str) -> Result<Vec<ChartCandidate>>;
}

/// Inspects and mutates Helm releases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Whether the release exists and differs from the request
    async fn state(&self, request: &ReleaseRequest) -> Result<ReleaseState>;

    /// Install a new release
    async fn install(&self, request: &ReleaseRequest) -> Result<Release>;

    /// Upgrade an existing release
    async fn upgrade(&self, request: &ReleaseRequest) -> Result<Release>;

    /// Make sure an up-to-date release is healthy
    async fn reconcile(&self, request: &ReleaseRequest) -> Result<Release>;

    /// Remove a release
    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome>;
}

/// Whether a `helmRepo` points at a chart archive rather than a repository
pub fn is_archive_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    [".tgz", ".tar.gz", ".zip"]
        .iter()
        .any(|suffix| path.ends_with(suffix))
}

// =============================================================================
// Repository index
// =============================================================================

#[derive(Debug, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    #[serde(default, deserialize_with = "version_string")]
    app_version: String,
    #[serde(deserialize_with = "version_string")]
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

/// Unquoted versions (`appVersion: 1.5`) arrive as YAML numbers
fn version_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a version, found {:?}",
            other
        ))),
    }
}

/// Resolve a chart URL from an index against the repository URL
fn resolve_chart_url(repo_url: &str, chart_url: &str) -> String {
    let base = format!("{}/", repo_url.trim_end_matches('/'));
    reqwest::Url::parse(&base)
        .and_then(|b| b.join(chart_url))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| chart_url.to_string())
}

/// Parse an `index.yaml` into the candidates for one chart
pub fn parse_index(repo_url: &str, chart: &str, index: &str) -> Result<Vec<ChartCandidate>> {
    let index: RepositoryIndex = serde_yaml::from_str(index)
        .map_err(|e| Error::download(repo_url, format!("invalid repository index: {}", e)))?;

    Ok(index
        .entries
        .get(chart)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| !e.urls.is_empty())
                .map(|e| ChartCandidate {
                    app_version: e.app_version.clone(),
                    chart_version: e.version.clone(),
                    urls: e
                        .urls
                        .iter()
                        .map(|u| resolve_chart_url(repo_url, u))
                        .collect(),
                })
                .collect()
        })
        .unwrap_or_default())
}

/// [`ChartIndex`] fetching `index.yaml` over HTTP
#[derive(Clone)]
pub struct HttpChartIndex {
    client: reqwest::Client,
}

impl HttpChartIndex {
    /// Index client with the default request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(INDEX_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context(e.to_string(), "chart-index"))?;
        Ok(Self { client })
    }

    /// Index client using an existing HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChartIndex for HttpChartIndex {
    async fn candidates(&self, repo_url: &str, chart: &str) -> Result<Vec<ChartCandidate>> {
        let index_url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
        debug!(url = %index_url, "fetching repository index");

        let response = self
            .client
            .get(&index_url)
            .send()
            .await
            .map_err(|e| Error::download(repo_url, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::download(
                repo_url,
                format!("HTTP {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::download(repo_url, format!("reading index failed: {}", e)))?;

        let candidates = parse_index(repo_url, chart, &body)?;
        info!(url = %index_url, chart, count = candidates.len(), "repository index fetched");
        Ok(candidates)
    }
}

// =============================================================================
// Helm CLI
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct HelmReleaseInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartMetadata {
    #[serde(default)]
    version: String,
    #[serde(default)]
    app_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct HelmChart {
    #[serde(default)]
    metadata: HelmChartMetadata,
}

/// Release as printed by `helm ... -o json`
#[derive(Debug, Default, Deserialize)]
struct HelmRelease {
    name: String,
    #[serde(default)]
    info: HelmReleaseInfo,
    #[serde(default)]
    chart: HelmChart,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    manifest: String,
}

impl HelmRelease {
    fn values(&self) -> HelmValues {
        match &self.config {
            serde_json::Value::Object(map) => HelmValues::from_json_map(map.clone()),
            _ => HelmValues::new(),
        }
    }

    fn is_deployed(&self) -> bool {
        self.info.status == "deployed"
    }
}

impl From<HelmRelease> for Release {
    fn from(r: HelmRelease) -> Self {
        Self {
            name: r.name,
            chart_version: r.chart.metadata.version,
            app_version: r.chart.metadata.app_version,
            manifest: r.manifest,
            notes: r.info.notes,
        }
    }
}

/// Whether the deployed release differs from the requested one
fn update_required(request: &ReleaseRequest, deployed: &HelmRelease) -> bool {
    let chart_changed = request
        .chart
        .chart_version()
        .is_some_and(|wanted| wanted != deployed.chart.metadata.version);
    chart_changed || !deployed.values().same_values(&request.values)
}

fn release_not_found(stderr: &str) -> bool {
    stderr.contains("not found")
}

fn status_args(name: &str, namespace: &str) -> Vec<String> {
    ["status", name, "--namespace", namespace, "-o", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn install_args(request: &ReleaseRequest) -> Vec<String> {
    let mut args = vec!["install".to_string(), request.name.clone()];
    args.extend(request.chart.chart_args());
    args.extend(
        ["--namespace", request.namespace.as_str(), "-o", "json"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.extend(request.values.set_args());
    args
}

fn upgrade_args(request: &ReleaseRequest) -> Vec<String> {
    let mut args = vec!["upgrade".to_string(), request.name.clone()];
    args.extend(request.chart.chart_args());
    args.extend(
        [
            "--namespace",
            request.namespace.as_str(),
            "--reset-values",
            "-o",
            "json",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.extend(request.values.set_args());
    args
}

fn uninstall_args(name: &str, namespace: &str) -> Vec<String> {
    ["uninstall", name, "--namespace", namespace]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Captured output of a helm invocation
struct HelmOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// [`ReleaseManager`] driving the `helm` binary
#[derive(Clone, Debug)]
pub struct HelmCli {
    binary: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmCli {
    /// Use the helm binary at `binary` (looked up in `PATH` when relative)
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        operation: ReleaseOperation,
        release: &str,
        args: &[String],
    ) -> Result<HelmOutput> {
        debug!(release, command = %args.first().map(String::as_str).unwrap_or_default(), "running helm");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::release(operation, release, format!("failed to run helm: {}", e)))?;

        Ok(HelmOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_for_release(
        &self,
        operation: ReleaseOperation,
        release: &str,
        args: &[String],
    ) -> Result<HelmRelease> {
        let output = self.run(operation, release, args).await?;
        if !output.success {
            return Err(Error::release(operation, release, output.stderr));
        }
        serde_json::from_str(&output.stdout).map_err(|e| {
            Error::release(operation, release, format!("unreadable helm output: {}", e))
        })
    }

    async fn status(
        &self,
        operation: ReleaseOperation,
        name: &str,
        namespace: &str,
    ) -> Result<Option<HelmRelease>> {
        let output = self
            .run(operation, name, &status_args(name, namespace))
            .await?;
        if !output.success {
            if release_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(Error::release(operation, name, output.stderr));
        }
        serde_json::from_str(&output.stdout)
            .map(Some)
            .map_err(|e| Error::release(operation, name, format!("unreadable helm output: {}", e)))
    }
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn state(&self, request: &ReleaseRequest) -> Result<ReleaseState> {
        let deployed = self
            .status(ReleaseOperation::Reconcile, &request.name, &request.namespace)
            .await?;
        Ok(match deployed {
            None => ReleaseState::default(),
            Some(deployed) => ReleaseState {
                installed: true,
                update_required: update_required(request, &deployed),
            },
        })
    }

    async fn install(&self, request: &ReleaseRequest) -> Result<Release> {
        self.run_for_release(ReleaseOperation::Install, &request.name, &install_args(request))
            .await
            .map(Release::from)
    }

    async fn upgrade(&self, request: &ReleaseRequest) -> Result<Release> {
        self.run_for_release(ReleaseOperation::Update, &request.name, &upgrade_args(request))
            .await
            .map(Release::from)
    }

    async fn reconcile(&self, request: &ReleaseRequest) -> Result<Release> {
        let current = self
            .status(ReleaseOperation::Reconcile, &request.name, &request.namespace)
            .await?
            .ok_or_else(|| {
                Error::release(ReleaseOperation::Reconcile, &request.name, "release not found")
            })?;
        if current.is_deployed() {
            return Ok(current.into());
        }

        info!(release = %request.name, status = %current.info.status, "re-applying release");
        self.run_for_release(ReleaseOperation::Reconcile, &request.name, &upgrade_args(request))
            .await
            .map(Release::from)
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome> {
        let output = self
            .run(
                ReleaseOperation::Uninstall,
                name,
                &uninstall_args(name, namespace),
            )
            .await?;
        match (output.success, release_not_found(&output.stderr)) {
            (true, _) => Ok(UninstallOutcome::Uninstalled),
            (false, true) => Ok(UninstallOutcome::NotFound),
            (false, false) => Err(Error::release(
                ReleaseOperation::Uninstall,
                name,
                output.stderr,
            )),
        }
    }
}
