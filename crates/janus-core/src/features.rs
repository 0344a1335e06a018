//! Process-wide feature flags.
//!
//! Flags are registered once at startup (typically from a module that owns
//! the guarded behaviour) and can be flipped at runtime by operational
//! tooling. Lookups on the hot path are a single relaxed atomic load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// A registered feature flag.
pub struct Feature {
    name: &'static str,
    enabled: AtomicBool,
}

impl Feature {
    /// The flag's registry name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Flip the flag.
    pub fn set(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }
}

fn registry() -> &'static Mutex<HashMap<&'static str, &'static Feature>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, &'static Feature>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a flag with its default state and return a static handle.
///
/// Registering the same name twice returns the original handle; the default
/// of the second registration is ignored.
pub fn register(name: &'static str, default: bool) -> &'static Feature {
    let mut map = registry().lock().expect("feature registry poisoned");
    map.entry(name).or_insert_with(|| {
        Box::leak(Box::new(Feature {
            name,
            enabled: AtomicBool::new(default),
        }))
    })
}

/// Flip a flag by name. Returns false when the flag is unknown.
pub fn set(name: &str, on: bool) -> bool {
    let map = registry().lock().expect("feature registry poisoned");
    match map.get(name) {
        Some(feature) => {
            feature.set(on);
            true
        }
        None => false,
    }
}

/// Snapshot of all registered flags, sorted by name.
#[must_use]
pub fn snapshot() -> Vec<(String, bool)> {
    let map = registry().lock().expect("feature registry poisoned");
    let mut out: Vec<_> = map
        .values()
        .map(|f| (f.name().to_string(), f.enabled()))
        .collect();
    out.sort();
    out
}
