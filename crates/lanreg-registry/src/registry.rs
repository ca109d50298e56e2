//! Public registry interface and the multicast implementation.

use crate::clock::{Clock, TokioClock};
use crate::error::{RegistryError, Result};
use crate::store::ServiceStore;
use crate::transport::MulticastTransport;
use crate::watcher::{WatchOptions, Watcher};
use async_trait::async_trait;
use lanreg_core::types::Service;
use lanreg_core::RegistryConfig;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Service registry operations.
///
/// Lookups read the local cache and never touch the network.
#[async_trait]
pub trait Registry: Send + Sync + Debug {
    /// Backend name
    fn name(&self) -> &str;

    /// Starts networking and background tasks. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Ordered shutdown: refuse new registrations, say goodbye, drain sends,
    /// close the socket, then stop every watcher. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Announces every node of the service.
    ///
    /// Returns once the first announce round has been sent.
    async fn register(&self, service: &Service) -> Result<()>;

    /// Sends goodbyes and removes the nodes from the local cache.
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Every known instance of a service, one entry per version.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// Every known service, hydrated, one entry per name.
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Subscribes to changes matching `options`.
    async fn watch_with(&self, options: WatchOptions) -> Result<Watcher>;

    /// Subscribes to every change.
    async fn watch(&self) -> Result<Watcher> {
        self.watch_with(WatchOptions::default()).await
    }

    /// Asks peers to re-announce, every service or just one.
    async fn query(&self, service: Option<&str>) -> Result<()>;
}

/// Registry backed by multicast announcements on the local network.
#[derive(Debug)]
pub struct MulticastRegistry {
    id: Uuid,
    config: RegistryConfig,
    store: Arc<ServiceStore>,
    transport: MulticastTransport,
    started: AtomicBool,
    lifecycle: Mutex<()>,
}

impl MulticastRegistry {
    pub const NAME: &'static str = "multicast";

    /// Creates a registry driven by tokio's clock.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Creates a registry with an explicit clock for cache expiry.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ServiceStore::new(
            Arc::clone(&clock),
            config.watch_queue_capacity,
        ));
        let transport = MulticastTransport::new(config.clone(), Arc::clone(&store), clock);
        let id = Uuid::new_v4();

        debug!(%id, service = %config.service_name, "Multicast registry created");

        Ok(Self {
            id,
            config,
            store,
            transport,
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    /// Unique ID of this registry instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Address the socket is bound to while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &MulticastTransport {
        &self.transport
    }

    pub fn store(&self) -> &Arc<ServiceStore> {
        &self.store
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(RegistryError::NotStarted)
        }
    }
}

#[async_trait]
impl Registry for MulticastRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        self.transport.start().await?;
        self.started.store(true, Ordering::SeqCst);
        info!(id = %self.id, "Registry started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.transport.stop().await;
        self.store.close();
        info!(id = %self.id, "Registry stopped");
        result
    }

    async fn register(&self, service: &Service) -> Result<()> {
        self.ensure_started()?;
        service.validate().map_err(RegistryError::InvalidService)?;

        self.transport.announce(service).await?;
        self.store.upsert(service, self.config.ttl());

        info!(
            service = %service.name,
            version = %service.version,
            nodes = service.nodes.len(),
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.ensure_started()?;

        let result = self.transport.goodbye(service).await;
        for node in &service.nodes {
            self.store.invalidate(&service.name, &node.id);
        }

        info!(service = %service.name, nodes = service.nodes.len(), "Service deregistered");
        result
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        self.store.get(name)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for name in self.store.list() {
            match self.store.get(&name) {
                Ok(found) => services.extend(merge_versions(found)),
                // expired between list and get
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(services)
    }

    async fn watch_with(&self, options: WatchOptions) -> Result<Watcher> {
        self.ensure_started()?;
        Ok(self.store.watch(options))
    }

    async fn query(&self, service: Option<&str>) -> Result<()> {
        self.ensure_started()?;
        self.transport.query(service).await
    }
}

/// Folds the per-version groups of one service into a single entry. Nodes
/// are ordered by ID; the version is kept only when every node agrees.
fn merge_versions(groups: Vec<Service>) -> Option<Service> {
    let mut groups = groups.into_iter();
    let mut merged = groups.next()?;
    for group in groups {
        if group.version != merged.version {
            merged.version.clear();
        }
        merged.nodes.extend(group.nodes);
    }
    merged.nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Some(merged)
}
