//! Process-wide service watcher.
//!
//! One watcher per discovery service key, shared by every endpoint that
//! references it. The first subscriber opens the watch and blocks until
//! the initial instance list arrives; later subscribers are replayed the
//! cached list immediately. A background loop per key keeps reading
//! updates and fans them out; a reaper removes canceled subscribers every
//! 30 seconds so the fan-out path never mutates the subscriber map.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch as signal;
use uuid::Uuid;

use janus_discovery::{Discovery, DiscoveryResult, ServiceInstance};

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A consumer of instance-list updates for one service key.
pub trait Subscriber: Send + Sync + 'static {
    /// Deliver a new instance list.
    ///
    /// Returning [`janus_discovery::DiscoveryError::Canceled`] marks the
    /// subscriber for removal by the reaper; it is not removed inline.
    fn callback(&self, instances: &[ServiceInstance]) -> DiscoveryResult<()>;

    /// Whether this subscriber has been canceled.
    fn canceled(&self) -> bool;
}

/// Stable hash of an instance set, used to log and compare snapshots.
///
/// Instances are ordered by id first so the hash is insensitive to the
/// order the provider returned them in.
#[must_use]
pub fn instances_set_hash(instances: &[ServiceInstance]) -> String {
    let mut sorted: Vec<_> = instances.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let Ok(encoded) = serde_json::to_vec(&sorted) else {
        return String::new();
    };
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    hasher.finish().to_string()
}

struct WatcherStatus {
    initialized: signal::Receiver<bool>,
    cached: Mutex<Vec<ServiceInstance>>,
}

#[derive(Default)]
struct Inner {
    statuses: HashMap<String, Arc<WatcherStatus>>,
    subscribers: HashMap<String, HashMap<String, Arc<dyn Subscriber>>>,
}

/// The watcher registry. See the module docs for the lifecycle.
pub struct ServiceWatcher {
    inner: Arc<Mutex<Inner>>,
}

impl ServiceWatcher {
    /// A standalone watcher with its own reaper task.
    ///
    /// Production code uses [`global`]; tests construct their own to stay
    /// isolated.
    #[must_use]
    pub fn new() -> Self {
        let inner: Arc<Mutex<Inner>> = Arc::default();
        let reaper_view = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(inner) = reaper_view.upgrade() else {
                    return;
                };
                reap_canceled(&inner);
            }
        });
        Self { inner }
    }

    /// Subscribe to updates for `endpoint`.
    ///
    /// Opens the discovery watch when this is the first subscriber for the
    /// key (blocking on the initial instance list); otherwise replays the
    /// cached list. Returns whether a watcher already existed.
    pub async fn add(
        &self,
        discovery: Arc<dyn Discovery>,
        endpoint: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> bool {
        let existing = {
            let inner = self.inner.lock().expect("watcher registry poisoned");
            inner.statuses.get(endpoint).cloned()
        };

        let existed = match existing {
            Some(status) => {
                // Wait for the opener to finish the initial read.
                let mut initialized = status.initialized.clone();
                let _ = initialized.wait_for(|done| *done).await;
                let cached = status.cached.lock().expect("watcher cache poisoned").clone();
                if !cached.is_empty() {
                    tracing::info!(
                        endpoint,
                        instances = cached.len(),
                        hash = %instances_set_hash(&cached),
                        "using cached instances for new subscriber"
                    );
                    let _ = subscriber.callback(&cached);
                }
                true
            }
            None => {
                self.open_watch(discovery, endpoint, subscriber.clone()).await;
                false
            }
        };

        tracing::info!(endpoint, "add subscriber");
        let mut inner = self.inner.lock().expect("watcher registry poisoned");
        inner
            .subscribers
            .entry(endpoint.to_string())
            .or_default()
            .insert(Uuid::new_v4().to_string(), subscriber);
        existed
    }

    async fn open_watch(
        &self,
        discovery: Arc<dyn Discovery>,
        endpoint: &str,
        subscriber: Arc<dyn Subscriber>,
    ) {
        let mut watcher = match discovery.watch(endpoint).await {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::error!(endpoint, error = %err, "failed to initialize watcher");
                return;
            }
        };
        tracing::info!(endpoint, "initialized watcher");

        let (init_tx, init_rx) = signal::channel(false);
        let status = Arc::new(WatcherStatus {
            initialized: init_rx,
            cached: Mutex::new(Vec::new()),
        });
        self.inner
            .lock()
            .expect("watcher registry poisoned")
            .statuses
            .insert(endpoint.to_string(), status.clone());

        // Initial snapshot, delivered synchronously to the opener.
        match watcher.next().await {
            Ok(instances) => {
                tracing::info!(
                    endpoint,
                    instances = instances.len(),
                    hash = %instances_set_hash(&instances),
                    "initial services discovery complete"
                );
                *status.cached.lock().expect("watcher cache poisoned") = instances.clone();
                let _ = subscriber.callback(&instances);
            }
            Err(err) => {
                tracing::error!(
                    endpoint,
                    error = %err,
                    "initial services discovery failed, the watch will retry asynchronously"
                );
            }
        }
        let _ = init_tx.send(true);

        // Update loop.
        let inner = self.inner.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            // Keep the initialized signal alive for late subscribers.
            let _init_tx = init_tx;
            loop {
                match watcher.next().await {
                    Err(err) if err.is_cancellation() => {
                        tracing::warn!(endpoint, "watch canceled");
                        return;
                    }
                    Err(err) => {
                        tracing::error!(
                            endpoint,
                            error = %err,
                            "watch failed, retrying after backoff"
                        );
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    Ok(instances) if instances.is_empty() => {
                        tracing::warn!(endpoint, "empty services, likely no available instance");
                    }
                    Ok(instances) => {
                        tracing::info!(
                            endpoint,
                            instances = instances.len(),
                            hash = %instances_set_hash(&instances),
                            "received services"
                        );
                        {
                            let guard = inner.lock().expect("watcher registry poisoned");
                            if let Some(status) = guard.statuses.get(&endpoint) {
                                *status.cached.lock().expect("watcher cache poisoned") =
                                    instances.clone();
                            }
                        }
                        do_callback(&inner, &endpoint, &instances);
                    }
                }
            }
        });
    }

    /// Cached instances for a service key, for the debug surface.
    #[must_use]
    pub fn cached_instances(&self, endpoint: &str) -> Option<Vec<ServiceInstance>> {
        let inner = self.inner.lock().expect("watcher registry poisoned");
        inner
            .statuses
            .get(endpoint)
            .map(|s| s.cached.lock().expect("watcher cache poisoned").clone())
    }

    /// Subscriber ids for a service key, for the debug surface.
    #[must_use]
    pub fn subscriber_ids(&self, endpoint: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("watcher registry poisoned");
        inner
            .subscribers
            .get(endpoint)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for ServiceWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn do_callback(inner: &Arc<Mutex<Inner>>, endpoint: &str, instances: &[ServiceInstance]) {
    let subscribers: Vec<(String, Arc<dyn Subscriber>)> = {
        let guard = inner.lock().expect("watcher registry poisoned");
        guard
            .subscribers
            .get(endpoint)
            .map(|m| m.iter().map(|(id, s)| (id.clone(), s.clone())).collect())
            .unwrap_or_default()
    };
    let mut canceled = 0;
    for (id, subscriber) in subscribers {
        if let Err(err) = subscriber.callback(instances) {
            if err.is_cancellation() {
                canceled += 1;
                tracing::warn!(endpoint, id = %id, "subscriber canceled, will delete later");
            } else {
                tracing::error!(endpoint, id = %id, error = %err, "subscriber callback failed");
            }
        }
    }
    if canceled > 0 {
        tracing::warn!(endpoint, canceled, "canceled subscribers pending cleanup");
    }
}

fn reap_canceled(inner: &Arc<Mutex<Inner>>) {
    let mut guard = inner.lock().expect("watcher registry poisoned");
    for (endpoint, subscribers) in &mut guard.subscribers {
        let before = subscribers.len();
        subscribers.retain(|id, subscriber| {
            let keep = !subscriber.canceled();
            if !keep {
                tracing::warn!(endpoint, id = %id, "reaping canceled subscriber");
            }
            keep
        });
        let removed = before - subscribers.len();
        if removed > 0 {
            tracing::info!(
                endpoint,
                removed,
                remaining = subscribers.len(),
                "cleaned canceled subscribers"
            );
        }
    }
}

/// The process-wide watcher used by the production assembly.
///
/// Must first be touched from inside a tokio runtime (it spawns the
/// reaper); tests should build their own [`ServiceWatcher`] instead.
pub fn global() -> &'static ServiceWatcher {
    static GLOBAL: OnceLock<ServiceWatcher> = OnceLock::new();
    GLOBAL.get_or_init(ServiceWatcher::new)
}
