//! In-memory index of known service instances.
//!
//! Entries are keyed by service name and node ID and carry an expiry instant.
//! Every mutation is fanned out to the active watchers while the write lock is
//! held, so watchers observe changes in exactly the order they were applied
//! and readers never see a half-applied upsert.

use crate::clock::Clock;
use crate::error::{RegistryError, Result};
use crate::watcher::{WatchOptions, WatchQueue, Watcher};
use lanreg_core::types::{Action, Service, WatchEvent};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A cached single-node service snapshot and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub service: Service,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// service name -> node id -> entry
    services: HashMap<String, HashMap<String, CacheEntry>>,
    watchers: Vec<Arc<WatchQueue>>,
}

impl StoreInner {
    fn broadcast(&self, action: Action, service: &Service) {
        let event = WatchEvent::new(action, service.clone());
        for watcher in &self.watchers {
            if watcher.matches(&event) {
                watcher.push(event.clone());
            }
        }
    }
}

/// Service cache with TTL expiry and change notification.
#[derive(Debug)]
pub struct ServiceStore {
    clock: Arc<dyn Clock>,
    watch_capacity: usize,
    next_watcher_id: AtomicU64,
    inner: RwLock<StoreInner>,
}

impl ServiceStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>, watch_capacity: usize) -> Self {
        Self {
            clock,
            watch_capacity,
            next_watcher_id: AtomicU64::new(1),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Inserts or refreshes every node of the service.
    ///
    /// A new node emits [`Action::Create`]; a known node whose version,
    /// address, metadata or endpoints changed emits [`Action::Update`]. Either
    /// way the expiry is pushed out to `now + ttl`. Returns the emitted
    /// actions in node order.
    pub fn upsert(&self, service: &Service, ttl: Duration) -> Vec<Action> {
        let expires_at = self.clock.now() + ttl;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut actions = Vec::new();

        for node in &service.nodes {
            let snapshot = service.with_single_node(node);
            let nodes = inner.services.entry(service.name.clone()).or_default();

            let action = match nodes.get_mut(&node.id) {
                Some(entry) => {
                    entry.expires_at = expires_at;
                    if entry.service != snapshot {
                        entry.service = snapshot.clone();
                        Some(Action::Update)
                    } else {
                        None
                    }
                }
                None => {
                    nodes.insert(
                        node.id.clone(),
                        CacheEntry {
                            service: snapshot.clone(),
                            expires_at,
                        },
                    );
                    Some(Action::Create)
                }
            };

            if let Some(action) = action {
                debug!(service = %service.name, node = %node.id, %action, "Cache updated");
                inner.broadcast(action, &snapshot);
                actions.push(action);
            }
        }

        actions
    }

    /// Removes a node immediately and emits [`Action::Delete`].
    ///
    /// Returns false if the node was not cached.
    pub fn invalidate(&self, name: &str, node_id: &str) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(nodes) = inner.services.get_mut(name) else {
            return false;
        };
        let Some(entry) = nodes.remove(node_id) else {
            return false;
        };
        if nodes.is_empty() {
            inner.services.remove(name);
        }

        debug!(service = %name, node = %node_id, "Cache entry invalidated");
        inner.broadcast(Action::Delete, &entry.service);
        true
    }

    /// Removes every entry whose expiry has passed, emitting
    /// [`Action::Delete`] for each. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut expired = Vec::new();
        for nodes in inner.services.values_mut() {
            nodes.retain(|_, entry| {
                if entry.expires_at <= now {
                    expired.push(entry.service.clone());
                    false
                } else {
                    true
                }
            });
        }
        inner.services.retain(|_, nodes| !nodes.is_empty());

        for service in &expired {
            if let Some(node) = service.nodes.first() {
                info!(service = %service.name, node = %node.id, "Cache entry expired");
            }
            inner.broadcast(Action::Delete, service);
        }

        expired.len()
    }

    /// Returns every live instance of a service, one [`Service`] per version,
    /// ordered by version with nodes ordered by ID. Endpoints of each version
    /// are those of its lowest node ID.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when no live entry exists.
    pub fn get(&self, name: &str) -> Result<Vec<Service>> {
        let now = self.clock.now();
        let inner = self.inner.read();

        let mut by_version: BTreeMap<&str, Service> = BTreeMap::new();
        if let Some(nodes) = inner.services.get(name) {
            // version-level fields come from the lowest node id
            let mut live: Vec<(&String, &CacheEntry)> =
                nodes.iter().filter(|(_, e)| e.expires_at > now).collect();
            live.sort_by(|a, b| a.0.cmp(b.0));
            for (_, entry) in live {
                let cached = &entry.service;
                by_version
                    .entry(cached.version.as_str())
                    .or_insert_with(|| Service {
                        name: cached.name.clone(),
                        version: cached.version.clone(),
                        endpoints: cached.endpoints.clone(),
                        nodes: Vec::new(),
                    })
                    .nodes
                    .extend(cached.nodes.iter().cloned());
            }
        }

        if by_version.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        Ok(by_version.into_values().collect())
    }

    /// Returns the distinct names of services with at least one live entry,
    /// in sorted order.
    pub fn list(&self) -> Vec<String> {
        let now = self.clock.now();
        let inner = self.inner.read();

        inner
            .services
            .iter()
            .filter(|(_, nodes)| nodes.values().any(|e| e.expires_at > now))
            .map(|(name, _)| name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns a copy of one cached entry.
    pub fn entry(&self, name: &str, node_id: &str) -> Option<CacheEntry> {
        self.inner
            .read()
            .services
            .get(name)
            .and_then(|nodes| nodes.get(node_id))
            .cloned()
    }

    /// Number of cached node entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.read().services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes a new watcher to future mutations.
    pub fn watch(self: &Arc<Self>, options: WatchOptions) -> Watcher {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(WatchQueue::new(id, self.watch_capacity, options));
        self.inner.write().watchers.push(Arc::clone(&queue));
        Watcher::new(queue, Arc::downgrade(self))
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.inner.write().watchers.retain(|w| w.id() != id);
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.read().watchers.len()
    }

    /// Stops every watcher and drops all entries.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        for watcher in inner.watchers.drain(..) {
            watcher.close();
        }
        inner.services.clear();
    }
}
