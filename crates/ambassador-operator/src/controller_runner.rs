//! Controller runner - builds the installation controller and its watches

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use ambassador_common::crd::AmbassadorInstallation;
use ambassador_installer::{error_policy, reconcile, Context, ControllerConfig};

use crate::dependents;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Pending "reconcile everything" requests from dependent watches
const TRIGGER_BUFFER: usize = 1;

/// Boxed future of one long-running task
pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the installation controller and the dependent watcher
///
/// `namespace` restricts both to one namespace.
pub fn build_controllers(
    client: Client,
    namespace: Option<String>,
    config: ControllerConfig,
) -> anyhow::Result<Vec<Task>> {
    let (kinds_tx, kinds_rx) = mpsc::unbounded_channel();
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .dependents(kinds_tx)
            .build()?,
    );

    let installations: Api<AmbassadorInstallation> = match &namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "watching a single namespace");
            Api::namespaced(client.clone(), ns)
        }
        None => Api::all(client.clone()),
    };

    tracing::info!("- AmbassadorInstallation controller");

    let controller = Controller::new(
        installations,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .reconcile_all_on(ReceiverStream::new(trigger_rx))
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("AmbassadorInstallation"));

    let watches = dependents::run(client, namespace, kinds_rx, trigger_tx);

    Ok(vec![Box::pin(controller), Box::pin(watches)])
}

/// Log the outcome of each reconciliation
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
