//! Fixed-list discovery provider.
//!
//! Serves a hand-maintained instance list per service and pushes every
//! update to open watchers. Used by the test suites and local demos; real
//! deployments plug in an external provider through the registry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{Discovery, DiscoveryError, DiscoveryResult, ServiceInstance, Watcher};

/// A discovery provider backed by in-memory instance lists.
#[derive(Default)]
pub struct FixedDiscovery {
    services: Mutex<HashMap<String, watch::Sender<Vec<ServiceInstance>>>>,
}

impl FixedDiscovery {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance list for a service, notifying all watchers.
    pub fn set_instances(&self, service: &str, instances: Vec<ServiceInstance>) {
        let mut services = self.services.lock().expect("fixed discovery poisoned");
        match services.get(service) {
            Some(tx) => {
                let _ = tx.send(instances);
            }
            None => {
                let (tx, _) = watch::channel(instances);
                services.insert(service.to_string(), tx);
            }
        }
    }

    /// Drop a service entirely; watchers observe a cancellation.
    pub fn remove_service(&self, service: &str) {
        self.services
            .lock()
            .expect("fixed discovery poisoned")
            .remove(service);
    }
}

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn watch(&self, service: &str) -> DiscoveryResult<Box<dyn Watcher>> {
        let rx = {
            let mut services = self.services.lock().expect("fixed discovery poisoned");
            services
                .entry(service.to_string())
                .or_insert_with(|| watch::channel(Vec::new()).0)
                .subscribe()
        };
        Ok(Box::new(FixedWatcher { rx, delivered_initial: false }))
    }
}

struct FixedWatcher {
    rx: watch::Receiver<Vec<ServiceInstance>>,
    delivered_initial: bool,
}

#[async_trait]
impl Watcher for FixedWatcher {
    async fn next(&mut self) -> DiscoveryResult<Vec<ServiceInstance>> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Ok(self.rx.borrow().clone());
        }
        self.rx
            .changed()
            .await
            .map_err(|_| DiscoveryError::Canceled)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
