//! Multicast UDP transport.
//!
//! One receive task owns the socket for reading and one writer task drains the
//! send queue, so the socket is never used concurrently by callers. Two timed
//! tasks run alongside: the sweep (cache expiry and stale chunk sets) and the
//! refresh (periodic re-announce of local nodes).
//!
//! A non-multicast group runs the transport in unicast loopback mode: the
//! socket binds to the group address itself and sends to its own bound
//! address. Port 0 then picks an ephemeral port.

use crate::clock::Clock;
use crate::error::{RegistryError, Result};
use crate::local::{LocalNodes, RegistrationState};
use crate::reassembly::ChunkAssembler;
use crate::store::ServiceStore;
use crate::wire::{self, Announcement, Inbound, Naming};
use bytes::Bytes;
use lanreg_codec::RecordCodec;
use lanreg_core::types::Service;
use lanreg_core::RegistryConfig;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest datagram we accept
const RECV_BUFFER_SIZE: usize = 9000;

/// Pause after a failed receive so a persistent socket error cannot spin
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A batch of packets for the writer, with an optional completion signal.
struct Outbound {
    packets: Vec<Bytes>,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

/// State shared with the background tasks.
#[derive(Debug)]
struct Shared {
    config: RegistryConfig,
    naming: Naming,
    store: Arc<ServiceStore>,
    local: Arc<LocalNodes>,
    assembler: ChunkAssembler,
}

impl Shared {
    fn ttl_secs(&self) -> u32 {
        u32::try_from(self.config.ttl_secs).unwrap_or(u32::MAX)
    }

    fn announce_packets(&self, announcement: &Announcement) -> Option<Vec<Bytes>> {
        match announcement.packets(&self.naming, self.ttl_secs(), self.config.max_packet_size) {
            Ok(packets) => Some(packets),
            Err(e) => {
                warn!(
                    service = %announcement.service.name,
                    node = %announcement.node.id,
                    error = %e,
                    "Failed to build announce packets"
                );
                None
            }
        }
    }

    /// Processes one received datagram. Never fails: anything unusable is
    /// logged and dropped.
    fn handle_datagram(&self, data: &[u8], from: SocketAddr, outbound: Option<&flume::Sender<Outbound>>) {
        let message = match wire::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(%from, error = %e, "Dropping malformed packet");
                return;
            }
        };

        for inbound in wire::parse(&message, &self.naming) {
            match inbound {
                Inbound::Query { service } => {
                    debug!(%from, service = ?service, "Answering query");
                    let Some(outbound) = outbound else {
                        continue;
                    };
                    for announcement in self.local.registered(service.as_deref()) {
                        let Some(packets) = self.announce_packets(&announcement) else {
                            continue;
                        };
                        let queued = self.local.send_if_current(
                            &announcement.service.name,
                            &announcement.node.id,
                            announcement.record_id,
                            || outbound.try_send(Outbound { packets, ack: None }).is_ok(),
                        );
                        if queued == Some(false) {
                            warn!("Send queue full, dropping query answer");
                        }
                    }
                }
                Inbound::Fragment(fragment) => {
                    if self.local.contains(&fragment.service, &fragment.node_id) {
                        continue;
                    }
                    let (service, node) = (fragment.service.clone(), fragment.node_id.clone());
                    match self.assembler.accept(fragment) {
                        Ok(Some(completed)) => {
                            debug!(%from, service = %service, node = %node, "Peer record received");
                            self.store.upsert(&completed.service, completed.ttl);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(%from, service = %service, node = %node, error = %e, "Dropping undecodable record");
                        }
                    }
                }
                Inbound::Goodbye { service, node_id } => {
                    if self.local.contains(&service, &node_id) {
                        continue;
                    }
                    debug!(%from, service = %service, node = %node_id, "Peer goodbye received");
                    self.store.invalidate(&service, &node_id);
                }
            }
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    writer_shutdown: CancellationToken,
    outbound: flume::Sender<Outbound>,
    local_addr: SocketAddr,
    writer: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the discovery socket and its background tasks.
pub struct MulticastTransport {
    shared: Arc<Shared>,
    codec: RecordCodec,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
}

impl std::fmt::Debug for MulticastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastTransport")
            .field("group", &self.shared.config.group)
            .field("port", &self.shared.config.port)
            .field("running", &self.is_running())
            .finish()
    }
}

impl MulticastTransport {
    pub fn new(config: RegistryConfig, store: Arc<ServiceStore>, clock: Arc<dyn Clock>) -> Self {
        let codec = RecordCodec::new(config.max_record_size);
        let assembler = ChunkAssembler::new(
            codec,
            config.reassembly_window(),
            config.max_pending_records,
            clock,
        );
        Self {
            shared: Arc::new(Shared {
                naming: Naming::new(&config.domain),
                config,
                store,
                local: Arc::new(LocalNodes::new()),
                assembler,
            }),
            codec,
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the socket is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|running| running.local_addr)
    }

    pub fn naming(&self) -> &Naming {
        &self.shared.naming
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    pub fn local(&self) -> &LocalNodes {
        &self.shared.local
    }

    /// Binds the socket and launches the background tasks, then asks peers to
    /// announce themselves.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyStarted`] if running; [`RegistryError::Transport`]
    /// if the socket cannot be set up.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(RegistryError::AlreadyStarted);
        }

        let config = &self.shared.config;
        let (socket, dest) = bind_socket(config)?;
        let socket = Arc::new(socket);
        let local_addr = socket
            .local_addr()
            .map_err(|e| RegistryError::transport("local_addr", e))?;

        let (tx, rx) = flume::bounded(config.send_queue_capacity);
        let shutdown = CancellationToken::new();
        let writer_shutdown = CancellationToken::new();

        let writer = tokio::spawn(writer_loop(
            Arc::clone(&socket),
            dest,
            rx,
            writer_shutdown.clone(),
        ));
        let tasks = vec![
            tokio::spawn(receive_loop(
                Arc::clone(&self.shared),
                socket,
                (!config.is_multicast()).then_some(local_addr),
                tx.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(sweep_loop(Arc::clone(&self.shared), shutdown.clone())),
            tokio::spawn(refresh_loop(
                Arc::clone(&self.shared),
                tx.clone(),
                shutdown.clone(),
            )),
        ];

        match wire::query_packet(&self.shared.naming.all_services()) {
            Ok(packet) => {
                let _ = tx.try_send(Outbound {
                    packets: vec![packet],
                    ack: None,
                });
            }
            Err(e) => warn!(error = %e, "Failed to build startup query"),
        }

        *state = Some(Running {
            shutdown,
            writer_shutdown,
            outbound: tx,
            local_addr,
            writer,
            tasks,
        });
        self.running.store(true, Ordering::SeqCst);

        info!(
            group = %config.group,
            port = config.port,
            %local_addr,
            multicast = config.is_multicast(),
            "Multicast transport started"
        );
        Ok(())
    }

    /// Sends goodbyes for every local node, stops the background tasks and
    /// drains pending sends until the shutdown deadline. Stopping a stopped
    /// transport is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.state.lock().take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        info!("Stopping multicast transport");

        running.shutdown.cancel();

        for node in self.shared.local.drain() {
            let announcement = node.announcement;
            match announcement.goodbye_packet(&self.shared.naming, self.shared.config.max_packet_size) {
                Ok(packet) => {
                    if running
                        .outbound
                        .try_send(Outbound {
                            packets: vec![packet],
                            ack: None,
                        })
                        .is_err()
                    {
                        warn!(service = %announcement.service.name, node = %announcement.node.id, "Send queue full, goodbye dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to build goodbye packet"),
            }
        }

        running.writer_shutdown.cancel();
        drop(running.outbound);

        let mut writer = running.writer;
        if timeout(self.shared.config.shutdown_timeout(), &mut writer)
            .await
            .is_err()
        {
            warn!("Send queue not drained before shutdown deadline");
            writer.abort();
        }

        for task in running.tasks {
            task.abort();
            let _ = task.await;
        }

        info!("Multicast transport stopped");
        Ok(())
    }

    /// Announces every node of the service and records them as local nodes.
    ///
    /// Waits until the first announce round has been written to the socket;
    /// the remaining rounds follow in the background with doubling spacing.
    /// On failure the nodes of this call are forgotten again.
    pub async fn announce(&self, service: &Service) -> Result<()> {
        self.shared.naming.check(service)?;
        let announcements = service
            .nodes
            .iter()
            .map(|node| Announcement::new(service, node, &self.codec))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut done: Vec<&Announcement> = Vec::with_capacity(announcements.len());
        for announcement in &announcements {
            if let Err(e) = self.announce_one(announcement).await {
                for ann in done.iter().chain(std::iter::once(&announcement)) {
                    self.shared.local.remove(&ann.service.name, &ann.node.id);
                }
                return Err(e);
            }
            done.push(announcement);
        }
        Ok(())
    }

    async fn announce_one(&self, announcement: &Announcement) -> Result<()> {
        let packets = announcement.packets(
            &self.shared.naming,
            self.shared.ttl_secs(),
            self.shared.config.max_packet_size,
        )?;
        let (name, node_id, record_id) = (
            announcement.service.name.clone(),
            announcement.node.id.clone(),
            announcement.record_id,
        );

        self.shared.local.begin(announcement.clone());
        self.submit(packets.clone(), "announce").await?;
        self.shared
            .local
            .transition(&name, &node_id, record_id, RegistrationState::Registered);
        debug!(service = %name, node = %node_id, record_id, "Announced");

        let Some((sender, shutdown)) = self.channel() else {
            return Ok(());
        };
        let local = Arc::clone(&self.shared.local);
        let delays = announce_delays(
            self.shared.config.announce_interval(),
            self.shared.config.announce_count.saturating_sub(1),
        );

        tokio::spawn(async move {
            for delay in delays {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let queued = local.send_if_current(&name, &node_id, record_id, || {
                    sender
                        .try_send(Outbound {
                            packets: packets.clone(),
                            ack: None,
                        })
                        .is_ok()
                });
                match queued {
                    None => return,
                    Some(false) => {
                        debug!(service = %name, node = %node_id, "Send queue full, skipping repeat announce")
                    }
                    Some(true) => {}
                }
            }
        });

        Ok(())
    }

    /// Sends a zero-TTL goodbye for every node of the service and forgets
    /// the local registration.
    pub async fn goodbye(&self, service: &Service) -> Result<()> {
        let mut result = Ok(());
        for node in &service.nodes {
            let announcement = match self.shared.local.get(&service.name, &node.id) {
                Some(local) => {
                    self.shared.local.transition(
                        &service.name,
                        &node.id,
                        local.announcement.record_id,
                        RegistrationState::Deregistering,
                    );
                    local.announcement
                }
                None => Announcement::new(service, node, &self.codec)?,
            };

            let sent = match announcement.goodbye_packet(&self.shared.naming, self.shared.config.max_packet_size) {
                Ok(packet) => self.submit(vec![packet], "goodbye").await,
                Err(e) => Err(e.into()),
            };
            self.shared.local.remove(&service.name, &node.id);

            match sent {
                Ok(()) => debug!(service = %service.name, node = %node.id, "Goodbye sent"),
                Err(e) => {
                    warn!(service = %service.name, node = %node.id, error = %e, "Goodbye failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Asks peers to re-announce, either every service or one.
    pub async fn query(&self, service: Option<&str>) -> Result<()> {
        let name = match service {
            Some(service) => self.shared.naming.service_type(service),
            None => self.shared.naming.all_services(),
        };
        let packet = wire::query_packet(&name)?;
        self.submit(vec![packet], "query").await
    }

    /// Feeds a datagram through the receive path as if it came off the
    /// socket.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let sender = self.channel().map(|(sender, _)| sender);
        self.shared.handle_datagram(data, from, sender.as_ref());
    }

    fn channel(&self) -> Option<(flume::Sender<Outbound>, CancellationToken)> {
        self.state
            .lock()
            .as_ref()
            .map(|running| (running.outbound.clone(), running.shutdown.clone()))
    }

    /// Queues packets and waits for the writer to report the outcome.
    async fn submit(&self, packets: Vec<Bytes>, operation: &str) -> Result<()> {
        let (sender, _) = self.channel().ok_or(RegistryError::NotStarted)?;
        let (ack, done) = oneshot::channel();
        sender
            .send_async(Outbound {
                packets,
                ack: Some(ack),
            })
            .await
            .map_err(|_| RegistryError::NotStarted)?;

        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RegistryError::transport(operation, e)),
            Err(_) => Err(RegistryError::NotStarted),
        }
    }
}

/// Creates the socket and returns it with the destination for sends.
fn bind_socket(config: &RegistryConfig) -> Result<(UdpSocket, SocketAddr)> {
    let setup = |op: &str| {
        let op = op.to_string();
        move |e: io::Error| RegistryError::transport(op, e)
    };

    let multicast = config.is_multicast();
    let domain = match config.group {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(setup("create socket"))?;

    if multicast {
        socket.set_reuse_address(true).map_err(setup("set reuse address"))?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(setup("set reuse port"))?;
    }
    socket.set_nonblocking(true).map_err(setup("set nonblocking"))?;

    let bind_addr = match (multicast, config.group) {
        (true, IpAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
        (true, IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port),
        (false, group) => SocketAddr::new(group, config.port),
    };
    socket.bind(&bind_addr.into()).map_err(setup("bind"))?;

    if multicast {
        match config.group {
            IpAddr::V4(group) => {
                if config.interfaces.is_empty() {
                    socket
                        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                        .map_err(setup("join multicast group"))?;
                } else {
                    for interface in &config.interfaces {
                        socket
                            .join_multicast_v4(&group, interface)
                            .map_err(setup("join multicast group"))?;
                    }
                    socket
                        .set_multicast_if_v4(&config.interfaces[0])
                        .map_err(setup("set multicast interface"))?;
                }
                socket.set_multicast_loop_v4(true).map_err(setup("set multicast loop"))?;
                socket
                    .set_multicast_ttl_v4(config.multicast_ttl)
                    .map_err(setup("set multicast ttl"))?;
            }
            IpAddr::V6(group) => {
                socket
                    .join_multicast_v6(&group, 0)
                    .map_err(setup("join multicast group"))?;
                socket.set_multicast_loop_v6(true).map_err(setup("set multicast loop"))?;
                socket
                    .set_multicast_hops_v6(config.multicast_ttl)
                    .map_err(setup("set multicast hops"))?;
            }
        }
    }

    let socket = UdpSocket::from_std(socket.into()).map_err(setup("register socket"))?;
    let dest = if multicast {
        SocketAddr::new(config.group, config.port)
    } else {
        socket.local_addr().map_err(setup("local_addr"))?
    };
    Ok((socket, dest))
}

/// In unicast loopback mode everything we send comes back from `own_addr`
/// and is dropped outright.
async fn receive_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    own_addr: Option<SocketAddr>,
    outbound: flume::Sender<Outbound>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((_, from)) if Some(from) == own_addr => {}
                Ok((len, from)) => shared.handle_datagram(&buf[..len], from, Some(&outbound)),
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }
        }
    }
    debug!("Receive loop stopped");
}

async fn writer_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    queue: flume::Receiver<Outbound>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            next = queue.recv_async() => match next {
                Ok(outbound) => send_outbound(&socket, dest, outbound).await,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    while let Ok(outbound) = queue.try_recv() {
        send_outbound(&socket, dest, outbound).await;
    }
    debug!("Writer stopped");
}

async fn send_outbound(socket: &UdpSocket, dest: SocketAddr, outbound: Outbound) {
    let mut result = Ok(());
    for packet in &outbound.packets {
        if let Err(e) = socket.send_to(packet, dest).await {
            warn!(%dest, error = %e, "Send failed");
            result = Err(e);
            break;
        }
    }
    if let Some(ack) = outbound.ack {
        let _ = ack.send(result);
    }
}

/// Gaps between repeat announces: `first`, then doubling each time.
fn announce_delays(first: Duration, repeats: u32) -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(first), |delay| Some(delay.saturating_mul(2))).take(repeats as usize)
}

async fn sweep_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = interval(shared.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = shared.store.sweep();
                let purged = shared.assembler.purge();
                if expired > 0 || purged > 0 {
                    debug!(expired, purged, "Sweep completed");
                }
            }
        }
    }
}

async fn refresh_loop(
    shared: Arc<Shared>,
    outbound: flume::Sender<Outbound>,
    shutdown: CancellationToken,
) {
    let period = shared.config.refresh_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for announcement in shared.local.registered(None) {
                    shared.store.upsert(&announcement.service, shared.config.ttl());
                    let Some(packets) = shared.announce_packets(&announcement) else {
                        continue;
                    };
                    let queued = shared.local.send_if_current(
                        &announcement.service.name,
                        &announcement.node.id,
                        announcement.record_id,
                        || outbound.try_send(Outbound { packets, ack: None }).is_ok(),
                    );
                    if queued == Some(false) {
                        warn!(service = %announcement.service.name, "Send queue full, skipping refresh");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::watcher::WatchOptions;
    use lanreg_core::types::{Action, Node};

    fn config() -> RegistryConfig {
        RegistryConfig::builder()
            .group(Ipv4Addr::LOCALHOST)
            .port(0)
            .ttl(Duration::from_secs(10))
            .refresh_interval(Duration::from_secs(5))
            .announce_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn transport() -> (Arc<ServiceStore>, MulticastTransport) {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let store = Arc::new(ServiceStore::new(Arc::clone(&clock), 16));
        let transport = MulticastTransport::new(config(), Arc::clone(&store), clock);
        (store, transport)
    }

    fn peer_service() -> Service {
        Service::new("peer", "2.0.0")
            .with_node(Node::new("peer-1", "10.0.0.9:9000").with_metadata("zone", "a"))
    }

    fn peer_packets(ttl: u32) -> Vec<Bytes> {
        let service = peer_service();
        let announcement =
            Announcement::new(&service, &service.nodes[0], &RecordCodec::default()).unwrap();
        announcement.packets(&Naming::new("lanreg"), ttl, 1400).unwrap()
    }

    fn from() -> SocketAddr {
        "127.0.0.1:5353".parse().unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_store, transport) = transport();
        assert!(transport.local_addr().is_none());

        transport.start().await.unwrap();
        assert!(transport.is_running());
        assert!(transport.local_addr().is_some());
        assert!(matches!(
            transport.start().await,
            Err(RegistryError::AlreadyStarted)
        ));

        transport.stop().await.unwrap();
        assert!(!transport.is_running());
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_start() {
        let (_store, transport) = transport();
        assert!(matches!(
            transport.announce(&peer_service()).await,
            Err(RegistryError::NotStarted)
        ));
        assert!(transport.local().is_empty());
        assert!(matches!(
            transport.query(None).await,
            Err(RegistryError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_peer_announce_over_socket() {
        let (store, transport) = transport();
        transport.start().await.unwrap();
        let target = transport.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for packet in peer_packets(120) {
            peer.send_to(&packet, target).await.unwrap();
        }

        assert!(wait_for(|| store.get("peer").is_ok()).await);
        let services = store.get("peer").unwrap();
        assert_eq!(services[0].version, "2.0.0");
        assert_eq!(services[0].nodes, peer_service().nodes);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_goodbye_invalidates() {
        let (store, transport) = transport();
        for packet in peer_packets(120) {
            transport.handle_datagram(&packet, from());
        }
        assert!(store.get("peer").is_ok());

        for packet in peer_packets(0) {
            transport.handle_datagram(&packet, from());
        }
        assert!(matches!(store.get("peer"), Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_packets_do_not_stop_processing() {
        let (store, transport) = transport();
        transport.handle_datagram(&[0xde, 0xad, 0xbe, 0xef], from());
        transport.handle_datagram(&[0u8; 64], from());
        for packet in peer_packets(120) {
            transport.handle_datagram(&packet, from());
        }
        assert!(store.get("peer").is_ok());
    }

    #[tokio::test]
    async fn test_own_packets_are_suppressed() {
        let (store, transport) = transport();
        transport.start().await.unwrap();

        let service = peer_service();
        transport.announce(&service).await.unwrap();
        assert_eq!(
            transport.local().state("peer", "peer-1"),
            Some(RegistrationState::Registered)
        );

        // packets loop back to our own socket but never reach the cache
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("peer").is_err());

        transport.goodbye(&service).await.unwrap();
        assert!(transport.local().is_empty());
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_forgets_local_nodes() {
        let (_store, transport) = transport();
        transport.start().await.unwrap();
        transport.announce(&peer_service()).await.unwrap();
        assert_eq!(transport.local().len(), 1);

        transport.stop().await.unwrap();
        assert!(transport.local().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_silent_peers() {
        let (store, transport) = transport();
        transport.start().await.unwrap();
        let watcher = store.watch(WatchOptions::default());

        for packet in peer_packets(2) {
            transport.handle_datagram(&packet, from());
        }
        assert_eq!(watcher.next().await.unwrap().action, Action::Create);

        tokio::time::advance(Duration::from_secs(3)).await;
        let event = timeout(Duration::from_secs(2), watcher.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.service.nodes, peer_service().nodes);
        assert!(matches!(store.get("peer"), Err(RegistryError::NotFound(_))));

        transport.stop().await.unwrap();
    }

    #[test]
    fn test_announce_delays_double_and_saturate() {
        let delays: Vec<_> = announce_delays(Duration::from_millis(10), 3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );

        let delays: Vec<_> = announce_delays(Duration::MAX / 2, 4).collect();
        assert_eq!(delays.len(), 4);
        assert_eq!(delays[3], Duration::MAX);

        assert_eq!(announce_delays(Duration::from_secs(1), 0).count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_record_is_rejected_before_sending() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let store = Arc::new(ServiceStore::new(Arc::clone(&clock), 16));
        let mut config = config();
        config.max_record_size = 64;
        let transport = MulticastTransport::new(config, store, clock);
        transport.start().await.unwrap();

        let service = peer_service().with_node(
            Node::new("peer-2", "10.0.0.9:9001").with_metadata("blob", "x".repeat(200)),
        );
        assert!(matches!(
            transport.announce(&service).await,
            Err(RegistryError::TooLarge { max: 64, .. })
        ));
        assert!(transport.local().is_empty());
        transport.stop().await.unwrap();
    }
}
