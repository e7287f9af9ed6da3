//! Process-wide resource registry and per-resource locking.
//!
//! One table maps resource name to its open document, exclusive lock,
//! and content digest, behind a single structural mutex — insert,
//! remove, and lookup are each atomic, so readers can never observe a
//! half-updated entry. Only the directory monitor mutates the table;
//! sessions look entries up and take the per-resource content lock.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridserve_engine::Document;

/// Identifies a lock holder: connection ids count up from 1.
pub type HolderId = u64;

/// Reserved holder id for the directory monitor's unload path.
pub const MONITOR_HOLDER: HolderId = 0;

/// Exclusive content lock, tracked by holder id. At most one session
/// holds it, for that session's entire binding; the monitor takes it
/// before unloading so removal can never race a live read/write.
pub struct ResourceLock {
    holder: Mutex<Option<HolderId>>,
    released: Condvar,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Acquire without blocking. Returns false if another holder owns
    /// the lock. Re-acquiring while already holding is allowed.
    pub fn try_acquire(&self, holder: HolderId) -> bool {
        let mut current = self.holder.lock().unwrap();
        match *current {
            None => {
                *current = Some(holder);
                true
            }
            Some(owner) => owner == holder,
        }
    }

    /// Block until the lock is free, up to `timeout`. Returns false on
    /// timeout. Bind-time waits go through here so a client can never
    /// hang forever behind a session that never disconnects.
    pub fn acquire_timeout(&self, holder: HolderId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.holder.lock().unwrap();
        loop {
            match *current {
                None => {
                    *current = Some(holder);
                    return true;
                }
                Some(owner) if owner == holder => return true,
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(current, deadline - now)
                        .unwrap();
                    current = guard;
                }
            }
        }
    }

    /// Block until the lock is free. Used by the monitor, whose unload
    /// must wait out any bound session.
    pub fn acquire_blocking(&self, holder: HolderId) {
        let mut current = self.holder.lock().unwrap();
        loop {
            match *current {
                None => {
                    *current = Some(holder);
                    return;
                }
                Some(owner) if owner == holder => return,
                Some(_) => {
                    current = self.released.wait(current).unwrap();
                }
            }
        }
    }

    /// Release if held by `holder`. Returns false — rather than
    /// panicking — when the lock is free or owned by someone else.
    pub fn release(&self, holder: HolderId) -> bool {
        let mut current = self.holder.lock().unwrap();
        if *current == Some(holder) {
            *current = None;
            self.released.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_held_by(&self, holder: HolderId) -> bool {
        *self.holder.lock().unwrap() == Some(holder)
    }

    pub fn is_held(&self) -> bool {
        self.holder.lock().unwrap().is_some()
    }
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered document: engine handle, content lock, and the digest
/// of the on-disk bytes that produced the handle. The digest is fixed
/// for the entry's lifetime — a changed file is unloaded and recreated,
/// never patched in place.
pub struct Resource {
    name: String,
    digest: blake3::Hash,
    lock: ResourceLock,
    document: Mutex<Box<dyn Document>>,
}

impl Resource {
    pub fn new(name: impl Into<String>, digest: blake3::Hash, document: Box<dyn Document>) -> Self {
        Self {
            name: name.into(),
            digest,
            lock: ResourceLock::new(),
            document: Mutex::new(document),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    /// Run `f` against the document. The inner mutex is held only for
    /// the duration of the call; exclusivity across requests comes
    /// from the content lock, not from here.
    pub fn with_document<R>(&self, f: impl FnOnce(&mut dyn Document) -> R) -> R {
        let mut document = self.document.lock().unwrap();
        f(document.as_mut())
    }
}

/// The resource table. Thread-safe; shared via `Arc`.
pub struct Registry {
    resources: Mutex<HashMap<String, Arc<Resource>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, resource: Arc<Resource>) {
        self.resources
            .lock()
            .unwrap()
            .insert(resource.name().to_string(), resource);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.lock().unwrap().remove(name)
    }

    /// Snapshot of (name, digest) pairs for the monitor's diff pass.
    pub fn digests(&self) -> Vec<(String, blake3::Hash)> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .map(|(name, resource)| (name.clone(), resource.digest()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.resources.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().unwrap().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
