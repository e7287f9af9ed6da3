//! Background directory monitor.
//!
//! Scans the documents directory on a fixed interval, hashing each
//! candidate file and reconciling the result against the registry:
//! new files are opened and registered, vanished files are unloaded,
//! and (when reload is enabled) changed files are unloaded and
//! re-opened in the same pass. Unloading takes the resource's content
//! lock first, so a bound session is always waited out rather than
//! having its document pulled from under it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gridserve_engine::Engine;
use log::{debug, info, warn};

use crate::registry::{Registry, Resource, MONITOR_HOLDER};

pub struct MonitorConfig {
    pub documents_dir: PathBuf,
    pub poll_interval: Duration,
    pub reload_on_change: bool,
}

/// Handle to the running monitor thread. `stop` (or drop) requests
/// shutdown and joins, letting any in-flight scan finish.
pub struct DirectoryMonitor {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl DirectoryMonitor {
    pub fn start(
        config: MonitorConfig,
        registry: Arc<Registry>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("doc-monitor".into())
            .spawn(move || {
                info!(
                    "monitoring {} every {:?}",
                    config.documents_dir.display(),
                    config.poll_interval
                );
                run_monitor(&config, &registry, engine.as_ref(), &thread_shutdown);
            })
            .ok();

        Self { handle, shutdown }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DirectoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_monitor(
    config: &MonitorConfig,
    registry: &Registry,
    engine: &dyn Engine,
    shutdown: &AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        reconcile(config, registry, engine);
        // Sleep in short slices so shutdown stays responsive across
        // long poll intervals.
        let mut remaining = config.poll_interval;
        while !remaining.is_zero() {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let slice = remaining.min(Duration::from_millis(100));
            thread::sleep(slice);
            remaining -= slice;
        }
    }
}

/// Names the scanner skips: hidden files and editor lock/backup files.
fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name.starts_with("~$")
}

fn file_digest(path: &Path) -> std::io::Result<blake3::Hash> {
    Ok(blake3::hash(&fs::read(path)?))
}

/// Walk `documents_dir` and digest every regular file, keyed by the
/// path relative to the root (with `/` separators). A file that fails
/// to read is skipped for this pass and retried on the next.
pub fn scan_documents(documents_dir: &Path) -> HashMap<String, blake3::Hash> {
    let mut found = HashMap::new();
    let mut pending = vec![documents_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read {}: {}", dir.display(), err);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_ignored(&name) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                match file_digest(&path) {
                    Ok(digest) => {
                        let key = relative_key(documents_dir, &path);
                        found.insert(key, digest);
                    }
                    Err(err) => {
                        warn!("cannot hash {}: {}", path.display(), err);
                    }
                }
            }
        }
    }
    found
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// One monitor pass: diff the directory against the registry and
/// apply the difference.
pub fn reconcile(config: &MonitorConfig, registry: &Registry, engine: &dyn Engine) {
    let on_disk = scan_documents(&config.documents_dir);

    for (name, digest) in registry.digests() {
        match on_disk.get(&name) {
            None => {
                info!("{} removed from disk, unloading", name);
                unload(registry, &name);
            }
            Some(current) if *current != digest => {
                if config.reload_on_change {
                    info!("{} changed on disk, reloading", name);
                    unload(registry, &name);
                } else {
                    debug!("{} changed on disk, reload disabled", name);
                }
            }
            Some(_) => {}
        }
    }

    for (name, digest) in on_disk {
        if registry.lookup(&name).is_some() {
            continue;
        }
        let path = config.documents_dir.join(&name);
        match engine.open(&path) {
            Ok(document) => {
                info!("loaded {}", name);
                registry.insert(Arc::new(Resource::new(name, digest, document)));
            }
            Err(err) => {
                warn!("cannot open {}: {}", path.display(), err);
            }
        }
    }
}

/// Remove a resource, waiting out any session that holds its lock.
/// The entry leaves the table only after exclusive access is won, so
/// no request can observe a half-unloaded document.
fn unload(registry: &Registry, name: &str) {
    if let Some(resource) = registry.lookup(name) {
        resource.lock().acquire_blocking(MONITOR_HOLDER);
        registry.remove(name);
        resource.lock().release(MONITOR_HOLDER);
    }
}
