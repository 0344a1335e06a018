//! Gateway config file loading and change watching.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use janus_core::config::Gateway;
use janus_core::{GatewayError, GatewayResult};

/// Load and parse the YAML gateway config.
pub fn load(path: &Path) -> GatewayResult<Gateway> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::config(format!("failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| GatewayError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Debounced file watcher invoking `on_change` whenever the config file is
/// rewritten.
pub struct ConfigWatcher {
    // Held for its side effect; dropping it stops the watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<Event>,
    debounce: Duration,
    last_change: Option<Instant>,
}

impl ConfigWatcher {
    /// Watch the config file's parent directory (editors replace files
    /// rather than rewriting them in place).
    pub fn new(path: &Path) -> GatewayResult<Self> {
        let (tx, rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("failed to create config watcher: {e}")))?;
        let watch_root: PathBuf = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_root, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("failed to watch config: {e}")))?;
        Ok(Self {
            _watcher: watcher,
            rx,
            debounce: Duration::from_millis(500),
            last_change: None,
        })
    }

    /// Wait for the next (debounced) config change.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            let event = self.rx.recv().await?;
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            let now = Instant::now();
            if let Some(last) = self.last_change {
                if now.duration_since(last) < self.debounce {
                    continue;
                }
            }
            self.last_change = Some(now);
            return Some(());
        }
    }
}
