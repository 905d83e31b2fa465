//! Watches on resources created by the Ambassador release
//!
//! The controller announces every new kind found in a release manifest. Each
//! kind gets a dynamic watcher. Deleting a release-owned object, or changing
//! its spec, asks the controller to reconcile every installation.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Annotation Helm puts on every object it manages
pub const RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";

/// Last seen generation of each release-owned object of one kind
#[derive(Debug, Default)]
pub struct GenerationTracker {
    generations: HashMap<String, Option<i64>>,
}

impl GenerationTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a watch event and report whether it warrants a reconcile
    ///
    /// Only deletions and generation changes of already-known objects count.
    /// First sightings, including the initial list, are recorded silently.
    pub fn observe(&mut self, event: Event<DynamicObject>) -> bool {
        match event {
            Event::Init | Event::InitDone => false,
            Event::InitApply(obj) => {
                if let Some(key) = release_key(&obj) {
                    self.generations.insert(key, obj.metadata.generation);
                }
                false
            }
            Event::Apply(obj) => {
                let Some(key) = release_key(&obj) else {
                    return false;
                };
                match self.generations.insert(key, obj.metadata.generation) {
                    Some(previous) => previous != obj.metadata.generation,
                    None => false,
                }
            }
            Event::Delete(obj) => match release_key(&obj) {
                Some(key) => {
                    self.generations.remove(&key);
                    true
                }
                None => false,
            },
        }
    }

    /// Number of objects being tracked
    pub fn len(&self) -> usize {
        self.generations.len()
    }
}

/// `namespace/name` of a release-owned object
fn release_key(obj: &DynamicObject) -> Option<String> {
    obj.annotations().get(RELEASE_NAME_ANNOTATION)?;
    Some(format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    ))
}

/// First delay before retrying a failed kind lookup
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Longest delay between kind lookups
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Start a watcher for every kind received on `kinds`
///
/// Runs until the sending side is dropped.
pub async fn run(
    client: Client,
    namespace: Option<String>,
    mut kinds: mpsc::UnboundedReceiver<GroupVersionKind>,
    trigger: mpsc::Sender<()>,
) {
    while let Some(gvk) = kinds.recv().await {
        tokio::spawn(resolve_and_watch(
            client.clone(),
            namespace.clone(),
            gvk,
            trigger.clone(),
        ));
    }
    debug!("dependent kind channel closed");
}

async fn resolve_and_watch(
    client: Client,
    namespace: Option<String>,
    gvk: GroupVersionKind,
    trigger: mpsc::Sender<()>,
) {
    let lookup = || async {
        discovery::pinned_kind(&client, &gvk)
            .await
            .map(|(ar, caps)| (ar, caps.scope))
    };
    let Some(ar) = resolve(&gvk, &trigger, lookup).await else {
        return;
    };

    info!(kind = %ar.kind, group = %ar.group, version = %ar.version, "watching dependent kind");
    watch_kind(client, namespace, ar, trigger).await;
}

/// Resolve a kind, retrying failed lookups with backoff
///
/// Gives up on cluster-scoped kinds and once the controller stops listening.
async fn resolve<F, Fut, E>(
    gvk: &GroupVersionKind,
    trigger: &mpsc::Sender<()>,
    mut lookup: F,
) -> Option<ApiResource>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(ApiResource, Scope), E>>,
    E: std::fmt::Display,
{
    let mut delay = INITIAL_RETRY_DELAY;
    loop {
        match lookup().await {
            Ok((_, Scope::Cluster)) => {
                debug!(kind = %gvk.kind, "skipping cluster-scoped dependent kind");
                return None;
            }
            Ok((ar, _)) => return Some(ar),
            Err(e) => {
                warn!(
                    kind = %gvk.kind,
                    group = %gvk.group,
                    error = %e,
                    retry_in = ?delay,
                    "cannot resolve dependent kind"
                );
                tokio::time::sleep(delay).await;
                if trigger.is_closed() {
                    return None;
                }
                delay = next_retry_delay(delay);
            }
        }
    }
}

fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

async fn watch_kind(
    client: Client,
    namespace: Option<String>,
    ar: ApiResource,
    trigger: mpsc::Sender<()>,
) {
    let api: Api<DynamicObject> = match &namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    let mut tracker = GenerationTracker::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if tracker.observe(event) {
                    debug!(kind = %ar.kind, "dependent changed, reconciling installations");
                    // A full buffer already holds a pending reconcile
                    if let Err(mpsc::error::TrySendError::Closed(())) = trigger.try_send(()) {
                        debug!(kind = %ar.kind, "controller stopped, ending watch");
                        return;
                    }
                }
            }
            Err(e) => warn!(kind = %ar.kind, error = %e, "dependent watch error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"))
    }

    fn object(name: &str, generation: i64, owned: bool) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &config_map_resource()).within("ambassador");
        obj.metadata.generation = Some(generation);
        if owned {
            obj.metadata.annotations = Some(
                [(RELEASE_NAME_ANNOTATION.to_string(), "ambassador".to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        obj
    }

    // =========================================================================
    // Kind resolution
    // =========================================================================

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        assert_eq!(next_retry_delay(INITIAL_RETRY_DELAY), Duration::from_secs(10));
        assert_eq!(next_retry_delay(Duration::from_secs(200)), MAX_RETRY_DELAY);
        assert_eq!(next_retry_delay(MAX_RETRY_DELAY), MAX_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookups_are_retried_until_resolved() {
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let (trigger, _rx) = mpsc::channel(1);
        let mut attempts = 0;

        let ar = resolve(&gvk, &trigger, || {
            attempts += 1;
            let outcome = if attempts < 3 {
                Err("discovery unavailable".to_string())
            } else {
                Ok((config_map_resource(), Scope::Namespaced))
            };
            std::future::ready(outcome)
        })
        .await;

        assert_eq!(ar.map(|ar| ar.kind), Some("ConfigMap".to_string()));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn cluster_scoped_kinds_are_skipped() {
        let gvk = GroupVersionKind::gvk("", "v1", "Namespace");
        let (trigger, _rx) = mpsc::channel(1);

        let ar = resolve(&gvk, &trigger, || {
            std::future::ready(Ok::<_, String>((config_map_resource(), Scope::Cluster)))
        })
        .await;
        assert!(ar.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_stop_once_the_controller_is_gone() {
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let (trigger, rx) = mpsc::channel(1);
        drop(rx);

        let ar = resolve(&gvk, &trigger, || {
            std::future::ready(Err::<(ApiResource, Scope), _>("no route".to_string()))
        })
        .await;
        assert!(ar.is_none());
    }

    // =========================================================================
    // Change detection
    // =========================================================================

    #[test]
    fn initial_list_and_creation_do_not_trigger() {
        let mut tracker = GenerationTracker::new();
        assert!(!tracker.observe(Event::Init));
        assert!(!tracker.observe(Event::InitApply(object("a", 1, true))));
        assert!(!tracker.observe(Event::InitDone));
        assert!(!tracker.observe(Event::Apply(object("b", 1, true))));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn generation_change_triggers() {
        let mut tracker = GenerationTracker::new();
        tracker.observe(Event::InitApply(object("a", 1, true)));

        assert!(!tracker.observe(Event::Apply(object("a", 1, true))), "status-only update");
        assert!(tracker.observe(Event::Apply(object("a", 2, true))));
    }

    #[test]
    fn deletion_of_owned_object_triggers() {
        let mut tracker = GenerationTracker::new();
        tracker.observe(Event::InitApply(object("a", 1, true)));
        assert!(tracker.observe(Event::Delete(object("a", 1, true))));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn objects_outside_the_release_are_ignored() {
        let mut tracker = GenerationTracker::new();
        tracker.observe(Event::InitApply(object("user", 1, false)));
        assert!(!tracker.observe(Event::Apply(object("user", 5, false))));
        assert!(!tracker.observe(Event::Delete(object("user", 5, false))));
        assert_eq!(tracker.len(), 0);
    }
}
