//! Per-connection peer-wire state machine.
//!
//! One [`PeerSession`] drives one TCP connection through
//! `Handshaking -> ExchangingBitfield -> Active -> Closed`. While active, a
//! receive path decodes and dispatches incoming messages and a send path
//! writes queued outbound messages, HAVE notifications and keep-alives. The
//! two run concurrently and only meet through a bounded channel and the
//! shared [`PieceStore`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;

use super::swarm::UnchokeAdmission;
use super::{
    Bitfield, ConnectionDescriptor, HandshakeCodec, InfoHash, MessageCodec, PeerHandshake, PeerId,
    PeerMessage, PieceIndex, PieceStore, TorrentError,
};
use crate::config::DriftnetConfig;

/// Lifecycle of a peer connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    ExchangingBitfield,
    Active,
    Closed,
}

/// Choke and interest flags for both directions of a connection.
///
/// `peer_*` describe what the remote told us, `client_*` what we told it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub peer_choked: bool,
    pub client_choked: bool,
    pub peer_interested: bool,
    pub client_interested: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            peer_choked: true,
            client_choked: true,
            peer_interested: false,
            client_interested: false,
        }
    }
}

/// Timing and buffering knobs for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub piece_timeout: Duration,
    pub read_timeout: Duration,
    pub keepalive_interval: Duration,
    pub have_flush_interval: Duration,
    pub outbound_queue_capacity: usize,
}

impl SessionSettings {
    pub fn from_config(config: &DriftnetConfig) -> Self {
        Self {
            piece_timeout: config.torrent.piece_timeout,
            read_timeout: config.network.read_timeout,
            keepalive_interval: config.network.keepalive_interval,
            have_flush_interval: config.network.have_flush_interval,
            outbound_queue_capacity: config.network.outbound_queue_capacity.max(1),
        }
    }
}

/// Everything a session shares with the rest of the swarm.
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub store: Arc<PieceStore>,
    pub admission: Arc<dyn UnchokeAdmission>,
    pub settings: SessionSettings,
    /// Flips to `true` when the swarm is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

/// Receive-side state of one registered connection.
pub struct PeerSession {
    peer: SocketAddr,
    descriptor: ConnectionDescriptor,
    store: Arc<PieceStore>,
    admission: Arc<dyn UnchokeAdmission>,
    outbound: mpsc::Sender<PeerMessage>,
    piece_timeout: Duration,
    status: ConnectionStatus,
    state: SessionState,
    in_flight: Option<(PieceIndex, Instant)>,
    holds_unchoke_slot: bool,
}

impl PeerSession {
    /// Runs a complete connection over an established stream.
    ///
    /// Performs the handshake (checking `expected_peer_id` when the tracker
    /// supplied one), exchanges bitfields, then services the connection
    /// until it fails or the swarm shuts down. The connection is always
    /// unregistered and its unchoke slot released before this returns.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolMismatch` - Handshake did not match this torrent
    /// - `TorrentError::DecodeError` - Malformed frame or bitfield
    /// - `TorrentError::ReadTimeout` - Peer went silent
    /// - `TorrentError::RequestTimeout` - A piece request stalled
    /// - `TorrentError::Io` - Socket failure
    pub async fn run<S>(
        stream: S,
        peer: SocketAddr,
        expected_peer_id: Option<PeerId>,
        context: SessionContext,
    ) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut shutdown = context.shutdown.clone();
        let settings = context.settings;
        let max_frame_len = context.store.layout().max_frame_len();
        let (mut reader, mut writer) = tokio::io::split(stream);

        // Registered before the BITFIELD snapshot; later completions arrive as HAVEs
        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);
        let mut session = PeerSession::new(
            peer,
            Arc::clone(&context.store),
            Arc::clone(&context.admission),
            &Bitfield::new(context.store.piece_count() as usize),
            outbound,
            settings.piece_timeout,
        );
        let descriptor = session.descriptor;
        tracing::Span::current().record("conn", tracing::field::display(descriptor));

        let established = tokio::select! {
            result = establish(&mut reader, &mut writer, peer, expected_peer_id, &context) => {
                result.map(Some)
            }
            _ = shutdown.wait_for(|stop| *stop) => Ok(None),
        };
        let (peer_field, first_message) = match established {
            Ok(Some(established)) => established,
            Ok(None) => {
                session.teardown().await;
                return Ok(());
            }
            Err(e) => {
                session.teardown().await;
                return Err(e);
            }
        };
        context.store.set_peer_field(descriptor, peer_field.as_bytes());

        let have_notify = context
            .store
            .have_notifier(descriptor)
            .unwrap_or_default();

        tracing::info!(
            "Connected to {} as {} (peer has {}/{} pieces)",
            peer,
            session.descriptor,
            peer_field.count_ones(),
            peer_field.piece_count()
        );

        let result = tokio::select! {
            result = session.receive_loop(&mut reader, max_frame_len, settings.read_timeout, first_message) => result,
            result = send_loop(
                &mut writer,
                outbound_rx,
                &context.store,
                descriptor,
                have_notify,
                settings,
            ) => result,
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        };

        session.teardown().await;
        match &result {
            Ok(()) => tracing::info!("Session {} with {} closed", descriptor, peer),
            Err(e) => tracing::info!("Session {} with {} closed: {}", descriptor, peer, e),
        }
        result
    }

    /// Registers a connection whose peer advertised `peer_field`.
    ///
    /// Outbound messages are queued on `outbound`; nothing is sent until
    /// [`PeerSession::start`] runs.
    pub fn new(
        peer: SocketAddr,
        store: Arc<PieceStore>,
        admission: Arc<dyn UnchokeAdmission>,
        peer_field: &Bitfield,
        outbound: mpsc::Sender<PeerMessage>,
        piece_timeout: Duration,
    ) -> Self {
        let descriptor = store.register_connection(peer_field.as_bytes());
        Self {
            peer,
            descriptor,
            store,
            admission,
            outbound,
            piece_timeout,
            status: ConnectionStatus::default(),
            state: SessionState::ExchangingBitfield,
            in_flight: None,
            holds_unchoke_slot: false,
        }
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Piece currently requested from the peer, if any.
    pub fn in_flight(&self) -> Option<PieceIndex> {
        self.in_flight.map(|(index, _)| index)
    }

    /// Announces initial interest and activates the session.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Send path is gone
    pub async fn start(&mut self) -> Result<(), TorrentError> {
        let interested = self.store.compute_request_queue(self.descriptor);
        self.status.client_interested = interested;
        self.enqueue(if interested {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        })
        .await?;

        self.state = SessionState::Active;
        Ok(())
    }

    /// Dispatches one incoming message, then schedules follow-up traffic.
    ///
    /// Recoverable faults (choke violations, duplicate or corrupt pieces,
    /// requests we cannot serve) are logged and swallowed.
    ///
    /// # Errors
    ///
    /// Any error that is fatal to the connection.
    pub async fn handle_message(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        tracing::debug!("{} <- {}", self.descriptor, message.name());

        match self.dispatch(message).await {
            Ok(()) => {}
            Err(e) if !e.is_connection_fatal() => {
                tracing::warn!("{} ({}): {}", self.descriptor, self.peer, e);
            }
            Err(e) => return Err(e),
        }

        self.after_dispatch().await
    }

    async fn dispatch(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.status.peer_choked = true;
                if let Some((index, _)) = self.in_flight.take() {
                    self.store.requeue_request(self.descriptor, index);
                }
            }
            PeerMessage::Unchoke => {
                self.status.peer_choked = false;
            }
            PeerMessage::Interested => {
                self.status.peer_interested = true;
                if self.status.client_choked {
                    if self.admission.request_unchoke(self.descriptor).await? {
                        self.holds_unchoke_slot = true;
                        self.status.client_choked = false;
                        self.enqueue(PeerMessage::Unchoke).await?;
                    } else {
                        tracing::debug!("{} denied an unchoke slot", self.descriptor);
                    }
                }
            }
            PeerMessage::NotInterested => {
                self.status.peer_interested = false;
                if !self.status.client_choked {
                    self.release_unchoke_slot().await;
                    self.status.client_choked = true;
                    self.enqueue(PeerMessage::Choke).await?;
                }
            }
            PeerMessage::Have { piece_index } => {
                self.store.update_peer_field(self.descriptor, piece_index)?;
            }
            PeerMessage::Bitfield { .. } => {
                return Err(TorrentError::ProtocolError {
                    message: "BITFIELD after the first message".to_string(),
                });
            }
            PeerMessage::Piece {
                piece_index: index,
                offset,
                data,
            } => {
                // Only whole pieces are ever requested
                if offset != 0 {
                    return Err(TorrentError::ProtocolError {
                        message: format!("PIECE {index} at unrequested offset {offset}"),
                    });
                }

                let requested = self.in_flight.is_some_and(|(pending, _)| pending == index);
                if requested {
                    self.in_flight = None;
                }

                match self.store.receive_piece(self.descriptor, index, &data).await {
                    Ok(()) => self.store.create_have_broadcast(self.descriptor, index),
                    Err(e) => {
                        if requested {
                            self.store.release_claim(index);
                        }
                        return Err(e);
                    }
                }
            }
            PeerMessage::Request {
                piece_index: index,
                offset,
                length,
            } => {
                if self.status.client_choked {
                    return Err(TorrentError::ChokeViolation { index });
                }

                let data = self.store.get_piece(index, offset, length).await?;
                self.enqueue(PeerMessage::Piece {
                    piece_index: index,
                    offset,
                    data,
                })
                .await?;
            }
            PeerMessage::Cancel { .. } => {}
        }
        Ok(())
    }

    async fn after_dispatch(&mut self) -> Result<(), TorrentError> {
        if !self.status.client_interested && self.store.compute_request_queue(self.descriptor) {
            self.status.client_interested = true;
            self.enqueue(PeerMessage::Interested).await?;
        }

        if self.status.client_interested && !self.status.peer_choked && self.in_flight.is_none() {
            match self.store.next_request(self.descriptor) {
                Some(index) => {
                    self.enqueue(PeerMessage::Request {
                        piece_index: index,
                        offset: 0,
                        length: self.store.piece_size(index),
                    })
                    .await?;
                    self.in_flight = Some((index, Instant::now() + self.piece_timeout));
                }
                None => {
                    self.status.client_interested = false;
                    self.enqueue(PeerMessage::NotInterested).await?;
                }
            }
        }

        for index in self.store.drain_have_notifications(self.descriptor) {
            self.enqueue(PeerMessage::Have { piece_index: index })
            .await?;
        }
        Ok(())
    }

    async fn receive_loop<R>(
        &mut self,
        reader: &mut R,
        max_frame_len: usize,
        read_timeout: Duration,
        first_message: Option<PeerMessage>,
    ) -> Result<(), TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        self.start().await?;
        if let Some(message) = first_message {
            self.handle_message(message).await?;
        }

        loop {
            self.check_stall()?;

            let wait = match self.in_flight {
                Some((_, deadline)) => {
                    read_timeout.min(deadline.saturating_duration_since(Instant::now()))
                }
                None => read_timeout,
            };

            let message =
                match tokio::time::timeout(wait, MessageCodec::read_message(reader, max_frame_len))
                    .await
                {
                    Ok(message) => message?,
                    Err(_) => {
                        self.check_stall()?;
                        return Err(TorrentError::ReadTimeout {
                            timeout: read_timeout,
                        });
                    }
                };

            self.handle_message(message).await?;
        }
    }

    fn check_stall(&self) -> Result<(), TorrentError> {
        match self.in_flight {
            Some((index, deadline)) if Instant::now() >= deadline => {
                Err(TorrentError::RequestTimeout { index })
            }
            _ => Ok(()),
        }
    }

    async fn enqueue(&self, message: PeerMessage) -> Result<(), TorrentError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TorrentError::PeerConnectionError {
                reason: format!("send path for {} closed", self.peer),
            })
    }

    async fn release_unchoke_slot(&mut self) {
        if self.holds_unchoke_slot {
            self.holds_unchoke_slot = false;
            self.admission.release(self.descriptor).await;
        }
    }

    /// Unregisters from the store and gives back the unchoke slot.
    pub async fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let in_flight = self.in_flight.take().map(|(index, _)| index);
        self.store.unregister_connection(self.descriptor, in_flight);
        self.release_unchoke_slot().await;
    }
}

/// Handshake and bitfield exchange for a connection that is already
/// registered but has no peer field yet.
///
/// Returns the peer's bitfield and, if the peer skipped BITFIELD, the first
/// message it sent instead.
async fn establish<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    expected_peer_id: Option<PeerId>,
    context: &SessionContext,
) -> Result<(Bitfield, Option<PeerMessage>), TorrentError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let read_timeout = context.settings.read_timeout;
    let piece_count = context.store.piece_count() as usize;

    tracing::debug!("{}: {:?}", peer, SessionState::Handshaking);
    let ours = PeerHandshake::new(context.info_hash, context.local_peer_id);
    HandshakeCodec::write_handshake(writer, &ours).await?;
    let theirs = with_read_timeout(read_timeout, HandshakeCodec::read_handshake(reader)).await?;
    HandshakeCodec::validate(&theirs, &context.info_hash, expected_peer_id.as_ref())?;
    if theirs.peer_id == context.local_peer_id {
        return Err(TorrentError::ProtocolMismatch {
            reason: "connected to ourselves".to_string(),
        });
    }

    tracing::debug!("{} ({}): {:?}", peer, theirs.peer_id, SessionState::ExchangingBitfield);
    let local = context.store.local_bitfield();
    MessageCodec::write_message(
        writer,
        &PeerMessage::Bitfield {
            bitfield: bytes::Bytes::copy_from_slice(local.as_bytes()),
        },
    )
    .await?;

    let first = with_read_timeout(
        read_timeout,
        MessageCodec::read_message(reader, context.store.layout().max_frame_len()),
    )
    .await?;

    match first {
        PeerMessage::Bitfield { bitfield } => {
            Ok((Bitfield::from_wire(&bitfield, piece_count)?, None))
        }
        other => Ok((Bitfield::new(piece_count), Some(other))),
    }
}

async fn with_read_timeout<T>(
    timeout: Duration,
    read: impl Future<Output = Result<T, TorrentError>>,
) -> Result<T, TorrentError> {
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| TorrentError::ReadTimeout { timeout })?
}

/// Writes queued messages in order, folds pending HAVEs into frames and
/// keeps an idle connection alive.
async fn send_loop<W>(
    writer: &mut W,
    mut outbound: mpsc::Receiver<PeerMessage>,
    store: &PieceStore,
    descriptor: ConnectionDescriptor,
    have_notify: Arc<Notify>,
    settings: SessionSettings,
) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    let mut flush = tokio::time::interval(settings.have_flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_write = Instant::now();

    loop {
        let keepalive_at = last_write + settings.keepalive_interval;
        let wrote = tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                tracing::debug!("{} -> {}", descriptor, message.name());
                MessageCodec::write_message(writer, &message).await?;
                true
            }
            _ = have_notify.notified() => write_haves(writer, store, descriptor).await?,
            _ = flush.tick() => write_haves(writer, store, descriptor).await?,
            _ = tokio::time::sleep_until(keepalive_at) => {
                MessageCodec::write_message(writer, &PeerMessage::KeepAlive).await?;
                true
            }
        };

        if wrote {
            last_write = Instant::now();
        }
    }
}

async fn write_haves<W>(
    writer: &mut W,
    store: &PieceStore,
    descriptor: ConnectionDescriptor,
) -> Result<bool, TorrentError>
where
    W: AsyncWrite + Unpin,
{
    let pending = store.drain_have_notifications(descriptor);
    for index in &pending {
        MessageCodec::write_message(
            writer,
            &PeerMessage::Have {
                piece_index: *index,
            },
        )
        .await?;
    }
    Ok(!pending.is_empty())
}
