//! AmbassadorInstallation controller
//!
//! One reconciliation pass decides what, if anything, should happen to the
//! Helm release of an installation and records the outcome in its status:
//!
//! 1. duplicates are skipped for good
//! 2. only the oldest installation of a namespace is acted upon
//! 3. the finalizer is added before anything is installed
//! 4. deletion uninstalls the release and releases the finalizer
//! 5. the spec hash annotation tracks spec changes
//! 6. parameters are validated (flavor, image, version, window)
//! 7. a healthy deployment waits for its update interval and window
//! 8. OSS to AES migrations check for blocking resources
//! 9. the chart is resolved and the release installed, upgraded or reconciled
//!
//! Every failure becomes a `Failed` condition. Parameter errors wait for a
//! spec change; everything else is retried on the poll interval. The status is
//! written once, at the end of the pass.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use ambassador_common::crd::{
    AmbassadorInstallation, AmbassadorInstallationStatus, Condition, ConditionReason,
    ConditionStatus, ConditionType, DeployedRelease, Flavor,
};
use ambassador_common::kube_utils::{annotation, has_finalizer, is_not_found};
use ambassador_common::{
    Error, ReleaseOperation, AMBASSADOR_GROUP, AMBASSADOR_VERSION, FIELD_MANAGER,
    INSTALLATION_FINALIZER, SPEC_HASH_ANNOTATION,
};

use crate::config::ControllerConfig;
use crate::duplicate::{is_primary, DUPLICATE_MESSAGE};
use crate::migration::{can_migrate, plan_flavor, AES_EXCLUSIVE_KINDS};
use crate::release::{
    is_archive_url, ChartIndex, ChartSource, HelmCli, HttpChartIndex, ReleaseManager,
    ReleaseRequest, UninstallOutcome,
};
use crate::spec_change::{has_changed, spec_hash};
use crate::state::{update_gate, GateInput, InstallationState, ReleaseAction, UpdateGate};
use crate::values::{desired_values, load_values_files, HelmValues};
use crate::version::VersionConstraint;
use crate::watches::WatchRegistry;
use crate::window::UpdateWindow;

/// Requeue delay after adding the finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Channel announcing newly discovered dependent kinds
pub type DependentSender = UnboundedSender<GroupVersionKind>;

/// Trait abstracting Kubernetes client operations for AmbassadorInstallation
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of an installation
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AmbassadorInstallationStatus,
    ) -> Result<(), Error>;

    /// Store the spec hash annotation on an installation
    async fn record_spec_hash(&self, namespace: &str, name: &str, hash: &str)
        -> Result<(), Error>;

    /// List the installations of a namespace
    async fn list_installations(&self, namespace: &str)
        -> Result<Vec<AmbassadorInstallation>, Error>;

    /// Count the Ambassador resources of `kind` in a namespace
    ///
    /// A kind whose CRD is not installed counts as zero.
    async fn count_resources(&self, namespace: &str, kind: &str) -> Result<usize, Error>;

    /// Add a finalizer to an installation
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from an installation
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn installations(&self, namespace: &str) -> Api<AmbassadorInstallation> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AmbassadorInstallationStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });
        self.installations(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn record_spec_hash(
        &self,
        namespace: &str,
        name: &str,
        hash: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { SPEC_HASH_ANNOTATION: hash }
            }
        });
        self.installations(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_installations(
        &self,
        namespace: &str,
    ) -> Result<Vec<AmbassadorInstallation>, Error> {
        let list = self
            .installations(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn count_resources(&self, namespace: &str, kind: &str) -> Result<usize, Error> {
        let gvk = GroupVersionKind::gvk(AMBASSADOR_GROUP, AMBASSADOR_VERSION, kind);
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items.len()),
            Err(e) if is_not_found(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.installations(namespace);
        let installation = api.get(name).await?;
        let mut finalizers = installation.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.installations(namespace);
        let installation = match api.get(name).await {
            Ok(i) => i,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = installation
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Controller context shared by every reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Chart repository access
    pub charts: Arc<dyn ChartIndex>,
    /// Helm release operations
    pub releases: Arc<dyn ReleaseManager>,
    /// Intervals, deadlines and defaults
    pub config: ControllerConfig,
    /// Dependent kinds already handed out for watching
    pub watches: Arc<WatchRegistry>,
    /// Where newly discovered dependent kinds are announced
    pub dependents: Option<DependentSender>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        charts: Arc<dyn ChartIndex>,
        releases: Arc<dyn ReleaseManager>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            charts,
            releases,
            config,
            watches: Arc::new(WatchRegistry::new()),
            dependents: None,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::from_env())
///     .dependents(tx)
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    charts: Option<Arc<dyn ChartIndex>>,
    releases: Option<Arc<dyn ReleaseManager>>,
    config: ControllerConfig,
    dependents: Option<DependentSender>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            charts: None,
            releases: None,
            config: ControllerConfig::default(),
            dependents: None,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the chart index
    pub fn chart_index(mut self, charts: Arc<dyn ChartIndex>) -> Self {
        self.charts = Some(charts);
        self
    }

    /// Override the release manager
    pub fn release_manager(mut self, releases: Arc<dyn ReleaseManager>) -> Self {
        self.releases = Some(releases);
        self
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Announce discovered dependent kinds on this channel
    pub fn dependents(mut self, tx: DependentSender) -> Self {
        self.dependents = Some(tx);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let charts: Arc<dyn ChartIndex> = match self.charts {
            Some(charts) => charts,
            None => Arc::new(HttpChartIndex::new()?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            charts,
            releases: self
                .releases
                .unwrap_or_else(|| Arc::new(HelmCli::default())),
            config: self.config,
            watches: Arc::new(WatchRegistry::new()),
            dependents: self.dependents,
        })
    }
}

/// What a pass that reached the release stage did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassOutcome {
    /// The timing gate held the pass back
    Held(UpdateGate),
    /// A release operation succeeded
    Released(ReleaseAction),
}

/// Reconcile an AmbassadorInstallation
#[instrument(
    skip(installation, ctx),
    fields(installation = %installation.name_any(), namespace = ?installation.namespace())
)]
pub async fn reconcile(
    installation: Arc<AmbassadorInstallation>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = installation.name_any();
    let namespace = installation
        .namespace()
        .ok_or_else(|| Error::internal_with_context("installation has no namespace", "reconciler"))?;
    let original = installation.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let deleting = installation.metadata.deletion_timestamp.is_some();
    let holds_finalizer = has_finalizer(&installation.metadata, INSTALLATION_FINALIZER);

    if InstallationState::derive(Some(&status), false).is_terminal() {
        if deleting && holds_finalizer {
            ctx.kube
                .remove_finalizer(&namespace, &name, INSTALLATION_FINALIZER)
                .await?;
        }
        debug!("duplicate installation, skipping");
        return Ok(Action::await_change());
    }

    let all = ctx.kube.list_installations(&namespace).await?;
    if !is_primary(&installation, &all) {
        warn!("another installation is primary in this namespace, disabling this one");
        status.conditions.set(
            Condition::new(ConditionType::Irreconcilable, ConditionStatus::False)
                .with_reason(ConditionReason::DuplicateError)
                .with_message(DUPLICATE_MESSAGE),
        );
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::await_change());
    }

    if deleting {
        if !holds_finalizer {
            return Ok(Action::await_change());
        }
        return handle_deletion(&name, &namespace, status, &original, &ctx).await;
    }

    if !holds_finalizer {
        info!("adding finalizer");
        ctx.kube
            .add_finalizer(&namespace, &name, INSTALLATION_FINALIZER)
            .await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let hash = spec_hash(&installation.spec)?;
    let recorded = annotation(&installation.metadata, SPEC_HASH_ANNOTATION);
    let spec_changed = has_changed(&hash, recorded);
    if recorded != Some(hash.as_str()) {
        debug!(spec_changed, "recording spec hash");
        ctx.kube.record_spec_hash(&namespace, &name, &hash).await?;
    }

    status.conditions.set(Condition::new(
        ConditionType::Initialized,
        ConditionStatus::True,
    ));
    status.conditions.remove(ConditionType::Irreconcilable);

    let result = run_pass(&installation, &namespace, &ctx, &mut status, spec_changed).await;

    let outcome = match result {
        Ok(PassOutcome::Held(gate)) => {
            debug!(?gate, "release step held back");
            Ok(Action::requeue(ctx.config.check_interval))
        }
        Ok(PassOutcome::Released(action)) => {
            info!(?action, "release step complete");
            Ok(Action::requeue(ctx.config.check_interval))
        }
        Err(e) => match e.condition_reason() {
            Some(reason) => {
                warn!(error = %e, %reason, "reconciliation pass failed");
                status.conditions.set(
                    Condition::new(ConditionType::Failed, ConditionStatus::True)
                        .with_reason(reason)
                        .with_message(e.condition_message()),
                );
                if e.is_retryable() {
                    Ok(Action::requeue(ctx.config.check_interval))
                } else {
                    Ok(Action::await_change())
                }
            }
            None => Err(e),
        },
    };

    if status != original {
        ctx.kube.patch_status(&namespace, &name, &status).await?;
    }
    outcome
}

/// Steps from parameter validation to release bookkeeping
async fn run_pass(
    installation: &AmbassadorInstallation,
    namespace: &str,
    ctx: &Context,
    status: &mut AmbassadorInstallationStatus,
    spec_changed: bool,
) -> Result<PassOutcome, Error> {
    let name = installation.name_any();
    let spec = &installation.spec;
    let config = &ctx.config;

    let spec_values = HelmValues::from_json_map(spec.helm_values.clone());
    let deployed_flavor = status.deployed_release.as_ref().map(|r| r.flavor);
    let plan = plan_flavor(spec.install_oss, spec_values.enable_aes(), deployed_flavor)
        .map_err(|e| e.for_installation(&name))?;

    let file_values = load_values_files(&config.values_files);
    let values =
        desired_values(spec, plan.flavor, &file_values).map_err(|e| e.for_installation(&name))?;

    let selector = spec.version_selector();
    let constraint = VersionConstraint::parse(selector).map_err(|_| {
        Error::parameters_for(&name, format!("could not parse version from {:?}", selector))
    })?;

    let window = UpdateWindow::parse(&spec.update_window).map_err(|_| {
        Error::parameters_for(
            &name,
            format!("could not parse an update window from {}", spec.update_window),
        )
    })?;

    let now = Utc::now();
    let gate = update_gate(GateInput {
        state: InstallationState::derive(Some(status), false),
        urgent: plan.migrating || spec_changed,
        last_check: status.last_check_time,
        now,
        update_interval: to_chrono(config.update_interval),
        window_open: window.allowed(now, to_chrono(config.check_interval)),
    });
    if gate != UpdateGate::Proceed {
        return Ok(PassOutcome::Held(gate));
    }

    if plan.migrating {
        info!("migrating from OSS to AES");
        let mut counts = BTreeMap::new();
        for kind in AES_EXCLUSIVE_KINDS {
            let count = ctx
                .kube
                .count_resources(namespace, kind)
                .await
                .map_err(|e| {
                    warn!(kind, error = %e, "resource lookup failed");
                    Error::precondition(format!("could not look up {} in the cluster", kind))
                })?;
            counts.insert(kind.to_string(), count);
        }
        can_migrate(plan.flavor, Flavor::Oss, &counts)?;
    }

    let repo_url = spec
        .helm_repo
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or(&config.default_repo_url);

    let chart = if is_archive_url(repo_url) {
        ChartSource::Archive {
            url: repo_url.to_string(),
        }
    } else {
        let candidates = tokio::time::timeout(
            config.update_timeout,
            ctx.charts.candidates(repo_url, &config.chart_name),
        )
        .await
        .map_err(|_| Error::download(repo_url, "timed out fetching the repository index"))??;

        let best = constraint
            .select_best(&candidates)
            .map_err(|e| Error::parameters_for(&name, e.to_string()))?;
        debug!(
            app_version = %best.app_version,
            chart_version = %best.chart_version,
            "selected chart"
        );
        ChartSource::Repository {
            repo_url: repo_url.to_string(),
            chart: config.chart_name.clone(),
            candidate: best.clone(),
        }
    };

    let request = ReleaseRequest {
        name: name.clone(),
        namespace: namespace.to_string(),
        chart,
        values,
    };

    let current = with_deadline(
        config.update_timeout,
        ReleaseOperation::Reconcile,
        &name,
        ctx.releases.state(&request),
    )
    .await?;

    let action = ReleaseAction::choose(current.installed, current.update_required);
    info!(?action, "applying release");
    let release = match action {
        ReleaseAction::Install => {
            with_deadline(
                config.update_timeout,
                ReleaseOperation::Install,
                &name,
                ctx.releases.install(&request),
            )
            .await?
        }
        ReleaseAction::Upgrade => {
            with_deadline(
                config.update_timeout,
                ReleaseOperation::Update,
                &name,
                ctx.releases.upgrade(&request),
            )
            .await?
        }
        ReleaseAction::Reconcile => {
            with_deadline(
                config.update_timeout,
                ReleaseOperation::Reconcile,
                &name,
                ctx.releases.reconcile(&request),
            )
            .await?
        }
    };
    debug!(notes = %release.notes, "release notes");

    register_dependents(ctx, &release.manifest);

    status.conditions.remove(ConditionType::Failed);
    status.conditions.set(
        Condition::new(ConditionType::Deployed, ConditionStatus::True)
            .with_reason(action.success_reason())
            .with_message(action.success_message()),
    );
    status.deployed_release = Some(DeployedRelease {
        name: release.name,
        version: release.chart_version,
        app_version: release.app_version,
        manifest: release.manifest,
        flavor: plan.flavor,
    });
    status.last_check_time = Some(now);

    Ok(PassOutcome::Released(action))
}

/// Uninstall the release of a deleted installation and release its finalizer
async fn handle_deletion(
    name: &str,
    namespace: &str,
    mut status: AmbassadorInstallationStatus,
    original: &AmbassadorInstallationStatus,
    ctx: &Context,
) -> Result<Action, Error> {
    info!("uninstalling release");
    let outcome = with_deadline(
        ctx.config.delete_timeout,
        ReleaseOperation::Uninstall,
        name,
        ctx.releases.uninstall(name, namespace),
    )
    .await;

    match outcome {
        Ok(outcome) => {
            if outcome == UninstallOutcome::NotFound {
                info!("release already gone");
            }
            status.conditions.remove(ConditionType::Failed);
            status.conditions.set(
                Condition::new(ConditionType::Deployed, ConditionStatus::False)
                    .with_reason(ConditionReason::UninstallSuccessful)
                    .with_message("Release uninstalled successfully"),
            );
            status.deployed_release = None;
            ctx.kube.patch_status(namespace, name, &status).await?;
            ctx.kube
                .remove_finalizer(namespace, name, INSTALLATION_FINALIZER)
                .await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(error = %e, "uninstall failed");
            status.conditions.set(
                Condition::new(ConditionType::Failed, ConditionStatus::True)
                    .with_reason(
                        e.condition_reason()
                            .unwrap_or(ConditionReason::UninstallError),
                    )
                    .with_message(e.condition_message()),
            );
            if status != *original {
                ctx.kube.patch_status(namespace, name, &status).await?;
            }
            Ok(Action::requeue(ctx.config.check_interval))
        }
    }
}

/// Run a collaborator call under a deadline
///
/// Expiry fails with the operation's retryable error.
async fn with_deadline<T, F>(
    deadline: Duration,
    operation: ReleaseOperation,
    release: &str,
    call: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(deadline, call).await.map_err(|_| {
        Error::release(
            operation,
            release,
            format!("timed out after {}s", deadline.as_secs()),
        )
    })?
}

/// Hand new dependent kinds of a release manifest to the watcher
fn register_dependents(ctx: &Context, manifest: &str) {
    for gvk in ctx.watches.observe(manifest) {
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "new dependent kind");
        if let Some(tx) = &ctx.dependents {
            if tx.send(gvk).is_err() {
                warn!("dependent watcher is not running");
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Error policy for the controller
///
/// Errors that never reach a condition (API failures, internal errors) are
/// retried on the poll interval.
pub fn error_policy(
    installation: Arc<AmbassadorInstallation>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        installation = %installation.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.check_interval)
}
