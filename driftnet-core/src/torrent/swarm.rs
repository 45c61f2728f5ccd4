//! Swarm coordination: connection workers, unchoke admission and announces.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::Instrument;

use super::session::{PeerSession, SessionContext, SessionSettings};
use super::tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient, TrackerPeer,
};
use super::{
    ConnectionDescriptor, PeerId, PieceIndex, PieceStore, Progress, TorrentError, TorrentMetadata,
};
use crate::config::DriftnetConfig;
use crate::tracing_setup::session_span;

/// Swarm-wide gate on how many peers we upload to at once.
#[async_trait]
pub trait UnchokeAdmission: Send + Sync {
    /// Asks for an upload slot; `true` means the peer may be unchoked.
    ///
    /// # Errors
    ///
    /// - `TorrentError::CoordinatorShutdown` - The arbiter has stopped
    async fn request_unchoke(&self, descriptor: ConnectionDescriptor)
    -> Result<bool, TorrentError>;

    /// Returns a slot previously granted to `descriptor`.
    async fn release(&self, descriptor: ConnectionDescriptor);
}

/// Commands accepted by the admission arbiter.
pub enum AdmissionCommand {
    RequestUnchoke {
        descriptor: ConnectionDescriptor,
        responder: oneshot::Sender<bool>,
    },
    Release {
        descriptor: ConnectionDescriptor,
    },
}

/// Cloneable handle to the admission arbiter actor.
#[derive(Clone)]
pub struct AdmissionHandle {
    sender: mpsc::Sender<AdmissionCommand>,
}

impl AdmissionHandle {
    /// Spawns the arbiter with `max_unchoked` upload slots.
    ///
    /// The actor stops once every handle is dropped.
    pub fn spawn(max_unchoked: usize) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(run_arbiter(max_unchoked, receiver));
        Self { sender }
    }
}

#[async_trait]
impl UnchokeAdmission for AdmissionHandle {
    async fn request_unchoke(
        &self,
        descriptor: ConnectionDescriptor,
    ) -> Result<bool, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(AdmissionCommand::RequestUnchoke {
                descriptor,
                responder,
            })
            .await
            .map_err(|_| TorrentError::CoordinatorShutdown)?;

        rx.await.map_err(|_| TorrentError::CoordinatorShutdown)
    }

    async fn release(&self, descriptor: ConnectionDescriptor) {
        // A stopped arbiter has no slots left to return
        let _ = self
            .sender
            .send(AdmissionCommand::Release { descriptor })
            .await;
    }
}

/// Processes admission commands one at a time, so grants are serialized
/// across the whole swarm.
async fn run_arbiter(max_unchoked: usize, mut receiver: mpsc::Receiver<AdmissionCommand>) {
    tracing::debug!("Admission arbiter started with {} slots", max_unchoked);
    let mut unchoked: HashSet<ConnectionDescriptor> = HashSet::new();

    while let Some(command) = receiver.recv().await {
        match command {
            AdmissionCommand::RequestUnchoke {
                descriptor,
                responder,
            } => {
                let granted = unchoked.contains(&descriptor)
                    || (unchoked.len() < max_unchoked && unchoked.insert(descriptor));
                tracing::debug!(
                    "Unchoke {} for {} ({}/{} slots used)",
                    if granted { "granted" } else { "denied" },
                    descriptor,
                    unchoked.len(),
                    max_unchoked
                );
                // Requester may have gone away; keep the slot consistent anyway
                if responder.send(granted).is_err() && granted {
                    unchoked.remove(&descriptor);
                }
            }
            AdmissionCommand::Release { descriptor } => {
                unchoked.remove(&descriptor);
            }
        }
    }

    tracing::debug!("Admission arbiter stopped");
}

/// Runs every peer connection of one torrent.
///
/// Owns the worker set, the unchoke arbiter and the shutdown signal;
/// piece state lives in the shared [`PieceStore`].
pub struct SwarmCoordinator {
    config: DriftnetConfig,
    metadata: TorrentMetadata,
    store: Arc<PieceStore>,
    peer_id: PeerId,
    admission: AdmissionHandle,
    connection_slots: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    connected: Arc<Mutex<HashSet<SocketAddr>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    listen_port: AtomicU16,
    completed_announced: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SwarmCoordinator {
    /// Creates a coordinator and spawns its admission arbiter.
    pub fn new(
        config: DriftnetConfig,
        metadata: TorrentMetadata,
        store: Arc<PieceStore>,
        peer_id: PeerId,
    ) -> Self {
        let admission = AdmissionHandle::spawn(config.network.max_unchoked_peers);
        let connection_slots = Arc::new(Semaphore::new(config.network.max_peer_connections));
        let listen_port = AtomicU16::new(config.network.listen_port);
        // Seeding from the start never reports `completed`
        let completed_announced = AtomicBool::new(store.is_complete());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            metadata,
            store,
            peer_id,
            admission,
            connection_slots,
            workers: Mutex::new(JoinSet::new()),
            connected: Arc::new(Mutex::new(HashSet::new())),
            acceptor: Mutex::new(None),
            listen_port,
            completed_announced,
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Port announced to trackers; the bound port once listening.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    /// Number of connection workers still running.
    pub fn worker_count(&self) -> usize {
        let mut workers = self.workers.lock();
        reap_finished(&mut workers);
        workers.len()
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            info_hash: self.metadata.info_hash,
            local_peer_id: self.peer_id,
            store: Arc::clone(&self.store),
            admission: Arc::new(self.admission.clone()),
            settings: SessionSettings::from_config(&self.config),
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Dials `peers` concurrently and starts a worker per connection.
    ///
    /// Peers we are already connected to are skipped, and dialing stops
    /// once `max_peer_connections` workers are live. Failed dials are
    /// logged and dropped. Returns the number of workers started.
    pub async fn start_outgoing(&self, peers: Vec<TrackerPeer>) -> usize {
        let mut candidates = Vec::new();
        {
            let connected = self.connected.lock();
            let mut seen = HashSet::new();
            for peer in peers {
                if connected.contains(&peer.address) || !seen.insert(peer.address) {
                    continue;
                }
                let Ok(permit) = Arc::clone(&self.connection_slots).try_acquire_owned() else {
                    tracing::debug!("Connection limit reached, not dialing remaining peers");
                    break;
                };
                candidates.push((peer, permit));
            }
        }

        if candidates.is_empty() {
            return 0;
        }

        let connect_timeout = self.config.network.connect_timeout;
        let dial_count = candidates.len();
        let dials = stream::iter(candidates)
            .map(move |(peer, permit)| async move {
                match tokio::time::timeout(connect_timeout, TcpStream::connect(peer.address)).await
                {
                    Ok(Ok(stream)) => Some((peer, stream, permit)),
                    Ok(Err(e)) => {
                        tracing::debug!("Failed to connect to {}: {}", peer, e);
                        None
                    }
                    Err(_) => {
                        tracing::debug!("Connecting to {} timed out", peer);
                        None
                    }
                }
            })
            .buffer_unordered(dial_count)
            .filter_map(|connected| async move { connected })
            .collect::<Vec<_>>()
            .await;

        let started = dials.len();
        for (peer, stream, permit) in dials {
            self.spawn_worker(stream, peer.address, peer.peer_id, permit);
        }

        tracing::info!("Connected to {}/{} dialed peers", started, dial_count);
        started
    }

    /// Accepts inbound connections on `listener` until shutdown.
    ///
    /// Connections beyond `max_peer_connections` are closed immediately.
    /// Inbound peers' ids are not checked.
    pub fn start_incoming(self: &Arc<Self>, listener: TcpListener) {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        let acceptor = tokio::spawn(async move {
            loop {
                let (stream, address) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    },
                    _ = shutdown.wait_for(|stop| *stop) => break,
                };

                let Ok(permit) = Arc::clone(&coordinator.connection_slots).try_acquire_owned()
                else {
                    tracing::debug!("Rejecting {}: connection limit reached", address);
                    continue;
                };
                coordinator.spawn_worker(stream, address, None, permit);
            }
            tracing::debug!("Stopped accepting peer connections");
        });

        if let Some(previous) = self.acceptor.lock().replace(acceptor) {
            previous.abort();
        }
    }

    /// Binds `port` on all interfaces (0 picks a free port) and starts
    /// accepting. Returns the bound address.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - The port could not be bound
    pub async fn listen(self: &Arc<Self>, port: u16) -> Result<SocketAddr, TorrentError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let address = listener.local_addr()?;
        self.listen_port.store(address.port(), Ordering::Relaxed);
        tracing::info!("Listening for peers on {}", address);

        self.start_incoming(listener);
        Ok(address)
    }

    fn spawn_worker(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        expected_peer_id: Option<PeerId>,
        permit: OwnedSemaphorePermit,
    ) {
        let context = self.session_context();
        let connected = Arc::clone(&self.connected);
        connected.lock().insert(address);

        let worker = async move {
            let _permit = permit;
            if let Err(e) = PeerSession::run(stream, address, expected_peer_id, context).await {
                tracing::debug!("Worker for {} finished with error: {}", address, e);
            }
            connected.lock().remove(&address);
        };

        let mut workers = self.workers.lock();
        reap_finished(&mut workers);
        workers.spawn(worker.instrument(session_span(address)));
    }

    /// Waits until every connection worker has finished.
    pub async fn wait_for_workers(&self) {
        loop {
            let mut workers = std::mem::take(&mut *self.workers.lock());
            if workers.is_empty() {
                return;
            }

            while let Some(result) = workers.join_next().await {
                log_worker_exit(result);
            }
        }
    }

    /// Transfer counters with the short last piece accounted for.
    pub fn progress(&self) -> Progress {
        let mut progress = self.store.progress();
        let layout = self.store.layout();
        let piece_count = layout.piece_count();

        if piece_count > 0 {
            let last = PieceIndex::new(piece_count - 1);
            if self.store.has_piece(last) {
                let shortfall = (layout.piece_length() - layout.piece_size(last)) as u64;
                progress.downloaded = progress.downloaded.saturating_sub(shortfall);
            }
        }
        progress.downloaded = progress.downloaded.min(layout.total_length());
        progress.left = layout.total_length() - progress.downloaded;
        progress
    }

    /// Resolves once every piece is verified and stored.
    pub async fn wait_for_download(&self) {
        self.store.wait_for_download().await;
    }

    /// Persists the local bitfield and syncs storage so the download can
    /// resume later.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Writing the data or sidecar failed
    pub async fn stop_download(&self) -> Result<(), TorrentError> {
        self.store.save_progress().await?;
        let progress = self.progress();
        tracing::info!(
            "Saved progress: {}/{} pieces, {} bytes left",
            self.store.local_bitfield().count_ones(),
            self.store.piece_count(),
            progress.left
        );
        Ok(())
    }

    /// Sends one announce with the current transfer counters.
    ///
    /// # Errors
    ///
    /// Whatever the tracker client reports.
    pub async fn announce(
        &self,
        tracker: &dyn TrackerClient,
        event: Option<AnnounceEvent>,
    ) -> Result<AnnounceResponse, TorrentError> {
        let progress = self.progress();
        let request = AnnounceRequest {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            port: self.listen_port(),
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
        };

        let response = tracker.announce(request).await?;
        if event == Some(AnnounceEvent::Completed) {
            self.completed_announced.store(true, Ordering::Relaxed);
        }
        Ok(response)
    }

    /// Re-announces until shutdown, dialing any new peers returned.
    ///
    /// The wait between announces follows the tracker's interval, never
    /// dropping below `min_announce_interval`. A `completed` event is sent
    /// once, as soon as the download finishes.
    pub async fn run_announce_loop(&self, tracker: Arc<dyn TrackerClient>, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut next_wait = self.announce_wait(interval, None);

        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep(next_wait) => None,
                _ = self.store.wait_for_download(),
                    if !self.completed_announced.load(Ordering::Relaxed) => Some(AnnounceEvent::Completed),
                _ = shutdown.wait_for(|stop| *stop) => return,
            };

            match self.announce(tracker.as_ref(), event).await {
                Ok(response) => {
                    next_wait = self.announce_wait(
                        Duration::from_secs(response.interval as u64),
                        response.min_interval,
                    );
                    if !self.store.is_complete() && !response.peers.is_empty() {
                        self.start_outgoing(response.peers).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("Announce to {} failed: {}", tracker.tracker_url(), e);
                    next_wait =
                        self.announce_wait(self.config.network.default_announce_interval, None);
                    if event == Some(AnnounceEvent::Completed) {
                        // Not retried; later periodic announces carry left=0
                        self.completed_announced.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn announce_wait(&self, interval: Duration, min_interval: Option<u32>) -> Duration {
        let floor = min_interval
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or_default()
            .max(self.config.network.min_announce_interval);
        interval.max(floor)
    }

    /// Stops accepting, closes every session and persists progress.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Progress could not be persisted
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        tracing::info!("Shutting down swarm for {}", self.metadata.name);
        self.shutdown.send_replace(true);
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }

        self.wait_for_workers().await;
        self.stop_download().await
    }
}

fn reap_finished(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.try_join_next() {
        log_worker_exit(result);
    }
}

fn log_worker_exit(result: Result<(), JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        tracing::error!("Connection worker panicked: {}", e);
    }
}
