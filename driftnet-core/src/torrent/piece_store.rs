//! Shared piece availability and request scheduling.
//!
//! One [`PieceStore`] per torrent, shared by every peer session through an
//! `Arc`. It owns the local bitfield (pieces we have), the transit field
//! (pieces some connection has claimed) and a slot per registered
//! connection holding that peer's advertised bitfield, its bounded request
//! queue and its pending HAVE notifications.
//!
//! Locking: a connection slot is always locked before the global state,
//! and no lock is held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};

use super::{Bitfield, PieceIndex, TorrentError};
use crate::storage::{PieceStorage, StorageError};

/// Piece geometry of a single-file torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: u32,
    total_length: u64,
    piece_count: u32,
}

impl PieceLayout {
    /// Computes the piece count as `ceil(total_length / piece_length)`.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        let piece_count = if piece_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length as u64) as u32
        };
        Self {
            piece_length,
            total_length,
            piece_count,
        }
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Size of piece `index`; only the last piece may be short.
    ///
    /// Returns 0 for indices outside the torrent.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let i = index.as_u32();
        if i >= self.piece_count {
            0
        } else if i + 1 == self.piece_count {
            (self.total_length - self.piece_offset(index)) as u32
        } else {
            self.piece_length
        }
    }

    /// Byte offset of piece `index` within the payload.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index.as_u32() as u64 * self.piece_length as u64
    }

    /// Length of a BITFIELD payload for this torrent.
    pub fn bitfield_len(&self) -> usize {
        (self.piece_count as usize).div_ceil(8)
    }

    /// Largest frame body a peer may legitimately send: a whole-piece PIECE
    /// or, for torrents with many tiny pieces, the BITFIELD.
    pub fn max_frame_len(&self) -> usize {
        (self.piece_length as usize + 13).max(self.bitfield_len() + 1)
    }
}

/// Handle for a registered connection, unique for the store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionDescriptor(u64);

impl ConnectionDescriptor {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Transfer counters reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

struct SharedState {
    local: Bitfield,
    transit: Bitfield,
}

struct ConnectionState {
    peer_field: Bitfield,
    requests: VecDeque<PieceIndex>,
}

/// Pending HAVE indices, deduplicated so the queue never exceeds the
/// piece count.
struct HaveQueue {
    pending: VecDeque<PieceIndex>,
    queued: Bitfield,
}

struct ConnectionSlot {
    state: Mutex<ConnectionState>,
    haves: Mutex<HaveQueue>,
    have_notify: Arc<Notify>,
}

/// Piece availability, transit claims and per-connection scheduling.
pub struct PieceStore {
    layout: PieceLayout,
    storage: Arc<dyn PieceStorage>,
    request_queue_size: usize,
    state: Mutex<SharedState>,
    connections: RwLock<HashMap<ConnectionDescriptor, Arc<ConnectionSlot>>>,
    next_descriptor: AtomicU64,
    uploaded: AtomicU64,
    completed: watch::Sender<usize>,
}

impl PieceStore {
    /// Creates a store seeded with `local` as the pieces already held.
    ///
    /// `local` is normalized to the layout's piece count.
    pub fn new(
        layout: PieceLayout,
        storage: Arc<dyn PieceStorage>,
        request_queue_size: usize,
        local: Bitfield,
    ) -> Self {
        let piece_count = layout.piece_count() as usize;
        let local = Bitfield::from_bytes(local.as_bytes(), piece_count);
        let (completed, _) = watch::channel(local.count_ones());

        Self {
            layout,
            storage,
            request_queue_size: request_queue_size.max(1),
            state: Mutex::new(SharedState {
                local,
                transit: Bitfield::new(piece_count),
            }),
            connections: RwLock::new(HashMap::new()),
            next_descriptor: AtomicU64::new(1),
            uploaded: AtomicU64::new(0),
            completed,
        }
    }

    /// Creates a store whose local bitfield is loaded from storage.
    ///
    /// Missing or short persisted data starts the download from scratch.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If the persisted bitfield could not be read
    pub async fn open(
        layout: PieceLayout,
        storage: Arc<dyn PieceStorage>,
        request_queue_size: usize,
    ) -> Result<Self, TorrentError> {
        let piece_count = layout.piece_count() as usize;
        let local = match storage.load_bitfield(layout.bitfield_len()).await? {
            Some(bytes) => Bitfield::from_bytes(&bytes, piece_count),
            None => Bitfield::new(piece_count),
        };

        tracing::info!(
            "Resuming with {}/{} pieces already verified",
            local.count_ones(),
            piece_count
        );

        Ok(Self::new(layout, storage, request_queue_size, local))
    }

    /// Registers a connection and copies the peer's advertised bitfield.
    ///
    /// The copy is truncated or padded to the local bitfield length.
    pub fn register_connection(&self, peer_bitfield: &[u8]) -> ConnectionDescriptor {
        let piece_count = self.layout.piece_count() as usize;
        let descriptor =
            ConnectionDescriptor(self.next_descriptor.fetch_add(1, Ordering::Relaxed));

        let slot = Arc::new(ConnectionSlot {
            state: Mutex::new(ConnectionState {
                peer_field: Bitfield::from_bytes(peer_bitfield, piece_count),
                requests: VecDeque::with_capacity(self.request_queue_size),
            }),
            haves: Mutex::new(HaveQueue {
                pending: VecDeque::new(),
                queued: Bitfield::new(piece_count),
            }),
            have_notify: Arc::new(Notify::new()),
        });

        self.connections.write().insert(descriptor, slot);
        tracing::debug!("Registered {}", descriptor);
        descriptor
    }

    /// Removes a connection and releases every claim it holds.
    ///
    /// Claims for queued requests and for `in_flight` are cleared before
    /// this returns. Unknown descriptors are ignored.
    pub fn unregister_connection(
        &self,
        descriptor: ConnectionDescriptor,
        in_flight: Option<PieceIndex>,
    ) {
        let Some(slot) = self.connections.write().remove(&descriptor) else {
            return;
        };

        let mut conn = slot.state.lock();
        let mut state = self.state.lock();
        let mut released = 0;
        for index in conn.requests.drain(..).chain(in_flight) {
            state.transit.clear(index);
            released += 1;
        }

        tracing::debug!("Unregistered {}, released {} claims", descriptor, released);
    }

    /// Fills the connection's request queue with pieces only this peer
    /// can currently give us.
    ///
    /// Returns `true` without rescanning if the queue is already non-empty.
    /// Otherwise scans for pieces the peer has, we lack and nobody has
    /// claimed, claiming each one as it is queued, and returns whether
    /// anything was added. The scan and claims happen under the global
    /// state lock, so concurrent callers never queue the same piece.
    pub fn compute_request_queue(&self, descriptor: ConnectionDescriptor) -> bool {
        let Some(slot) = self.slot(descriptor) else {
            return false;
        };

        let mut conn = slot.state.lock();
        if !conn.requests.is_empty() {
            return true;
        }

        let piece_count = self.layout.piece_count() as usize;
        let mut state = self.state.lock();
        let SharedState { local, transit } = &mut *state;
        let ConnectionState {
            peer_field,
            requests,
        } = &mut *conn;
        let mut added = false;

        'scan: for (byte_index, &peer_byte) in peer_field.as_bytes().iter().enumerate() {
            let wanted =
                peer_byte & !local.as_bytes()[byte_index] & !transit.as_bytes()[byte_index];
            if wanted == 0 {
                continue;
            }

            for bit in 0..8 {
                if wanted & (0x80 >> bit) == 0 {
                    continue;
                }
                let i = byte_index * 8 + bit;
                if i >= piece_count {
                    break 'scan;
                }

                let index = PieceIndex::new(i as u32);
                if let Ok(true) = transit.set(index) {
                    requests.push_back(index);
                    added = true;
                }
                if requests.len() >= self.request_queue_size {
                    break 'scan;
                }
            }
        }

        added
    }

    /// Pops the next piece to request, refilling the queue when empty.
    ///
    /// The returned piece stays claimed by this connection until it is
    /// received, released or the connection unregisters.
    ///
    /// Queued pieces that arrived unsolicited in the meantime are skipped.
    pub fn next_request(&self, descriptor: ConnectionDescriptor) -> Option<PieceIndex> {
        let slot = self.slot(descriptor)?;
        loop {
            let queued = slot.state.lock().requests.pop_front();
            let index = match queued {
                Some(index) => index,
                None if self.compute_request_queue(descriptor) => continue,
                None => return None,
            };
            if !self.has_piece(index) {
                return Some(index);
            }
        }
    }

    /// Puts a still-claimed in-flight piece back at the head of the queue.
    ///
    /// If the queue is full its tail is dropped and that claim released.
    pub fn requeue_request(&self, descriptor: ConnectionDescriptor, index: PieceIndex) {
        let Some(slot) = self.slot(descriptor) else {
            self.release_claim(index);
            return;
        };

        let mut conn = slot.state.lock();
        conn.requests.push_front(index);
        if conn.requests.len() > self.request_queue_size
            && let Some(dropped) = conn.requests.pop_back()
        {
            self.state.lock().transit.clear(dropped);
        }
    }

    /// Releases the transit claim on one piece.
    pub fn release_claim(&self, index: PieceIndex) {
        self.state.lock().transit.clear(index);
    }

    /// Verifies and stores a complete piece received from a peer.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If `index` is outside the torrent
    /// - `TorrentError::DuplicatePiece` - If the piece is already held; progress is unchanged
    /// - `TorrentError::PieceHashMismatch` - If the data fails verification; the bit stays unset
    /// - `TorrentError::Storage` - If the storage backend failed
    pub async fn receive_piece(
        &self,
        descriptor: ConnectionDescriptor,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), TorrentError> {
        if index.as_u32() >= self.layout.piece_count() {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Piece index {index} out of range for {} pieces",
                    self.layout.piece_count()
                ),
            });
        }

        if self.state.lock().local.has(index) {
            return Err(TorrentError::DuplicatePiece { index });
        }

        match self.storage.write_piece(index, data).await {
            Ok(()) => {}
            Err(StorageError::HashMismatch { .. }) => {
                return Err(TorrentError::PieceHashMismatch { index });
            }
            Err(StorageError::InvalidPieceSize {
                expected, actual, ..
            }) => {
                tracing::debug!(
                    "{} sent {} bytes for piece {}, expected {}",
                    descriptor,
                    actual,
                    index,
                    expected
                );
                return Err(TorrentError::PieceHashMismatch { index });
            }
            Err(e) => return Err(e.into()),
        }

        let completed = {
            let mut state = self.state.lock();
            let newly_set = state.local.set(index)?;
            state.transit.clear(index);
            if !newly_set {
                return Err(TorrentError::DuplicatePiece { index });
            }
            state.local.count_ones()
        };

        if let Some(slot) = self.slot(descriptor) {
            slot.state.lock().requests.retain(|&queued| queued != index);
        }

        self.completed.send_replace(completed);
        tracing::debug!(
            "{} delivered piece {} ({}/{})",
            descriptor,
            index,
            completed,
            self.layout.piece_count()
        );
        Ok(())
    }

    /// Queues a HAVE for `index` on every connection except `origin`.
    ///
    /// Never blocks; an index already pending for a connection is not
    /// queued twice.
    pub fn create_have_broadcast(&self, origin: ConnectionDescriptor, index: PieceIndex) {
        let connections = self.connections.read();
        for (descriptor, slot) in connections.iter() {
            if *descriptor == origin {
                continue;
            }

            let mut haves = slot.haves.lock();
            if let Ok(true) = haves.queued.set(index) {
                haves.pending.push_back(index);
                slot.have_notify.notify_one();
            }
        }
    }

    /// Takes every pending HAVE index for a connection, oldest first.
    pub fn drain_have_notifications(&self, descriptor: ConnectionDescriptor) -> Vec<PieceIndex> {
        let Some(slot) = self.slot(descriptor) else {
            return Vec::new();
        };

        let mut haves = slot.haves.lock();
        let drained: Vec<PieceIndex> = haves.pending.drain(..).collect();
        for index in &drained {
            haves.queued.clear(*index);
        }
        drained
    }

    /// Wake-up handle signalled whenever a HAVE is queued for a connection.
    pub fn have_notifier(&self, descriptor: ConnectionDescriptor) -> Option<Arc<Notify>> {
        self.slot(descriptor)
            .map(|slot| Arc::clone(&slot.have_notify))
    }

    /// Records that the peer behind `descriptor` now has `index`.
    ///
    /// Only that connection's copy of the peer bitfield changes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If `index` is outside the torrent
    pub fn update_peer_field(
        &self,
        descriptor: ConnectionDescriptor,
        index: PieceIndex,
    ) -> Result<(), TorrentError> {
        if index.as_u32() >= self.layout.piece_count() {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "HAVE for piece {index} out of range for {} pieces",
                    self.layout.piece_count()
                ),
            });
        }

        if let Some(slot) = self.slot(descriptor) {
            slot.state.lock().peer_field.set(index)?;
        }
        Ok(())
    }

    /// Replaces the connection's copy of the peer bitfield.
    ///
    /// The copy is truncated or padded to the local bitfield length. Unknown
    /// descriptors are ignored.
    pub fn set_peer_field(&self, descriptor: ConnectionDescriptor, peer_bitfield: &[u8]) {
        if let Some(slot) = self.slot(descriptor) {
            let piece_count = self.layout.piece_count() as usize;
            slot.state.lock().peer_field = Bitfield::from_bytes(peer_bitfield, piece_count);
        }
    }

    /// Reads a byte range of a piece we hold, for serving a REQUEST.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceNotFound` - If we do not have the piece
    /// - `TorrentError::RangeExceeded` - If `begin + length` runs past the piece
    /// - `TorrentError::Storage` - If the storage backend failed
    pub async fn get_piece(
        &self,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, TorrentError> {
        if !self.state.lock().local.has(index) {
            return Err(TorrentError::PieceNotFound { index });
        }

        let piece_size = self.layout.piece_size(index);
        if begin as u64 + length as u64 > piece_size as u64 {
            return Err(TorrentError::RangeExceeded {
                index,
                begin,
                length,
                piece_size,
            });
        }

        let data = Bytes::from(self.storage.read_piece(index).await?);
        if data.len() < piece_size as usize {
            return Err(TorrentError::Storage(StorageError::FilesystemError {
                message: format!("Stored piece {index} is {} bytes", data.len()),
            }));
        }

        self.uploaded.fetch_add(length as u64, Ordering::Relaxed);
        Ok(data.slice(begin as usize..(begin + length) as usize))
    }

    /// Transfer counters, counting every held piece as a full piece.
    pub fn progress(&self) -> Progress {
        let held = self.state.lock().local.count_ones() as u64;
        let downloaded = held * self.layout.piece_length() as u64;
        Progress {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded,
            left: self.layout.total_length().saturating_sub(downloaded),
        }
    }

    /// Resolves once every piece is held; immediately if already complete.
    pub async fn wait_for_download(&self) {
        let piece_count = self.layout.piece_count() as usize;
        let mut completed = self.completed.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = completed.wait_for(|&count| count >= piece_count).await;
    }

    /// Persists the local bitfield and syncs piece data.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If either write failed
    pub async fn save_progress(&self) -> Result<(), TorrentError> {
        let bytes = self.state.lock().local.as_bytes().to_vec();
        self.storage.sync().await?;
        self.storage.save_bitfield(&bytes).await?;
        Ok(())
    }

    /// Snapshot of the local bitfield.
    pub fn local_bitfield(&self) -> Bitfield {
        self.state.lock().local.clone()
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.state.lock().local.has(index)
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().local.is_complete()
    }

    pub fn piece_count(&self) -> u32 {
        self.layout.piece_count()
    }

    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        self.layout.piece_size(index)
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Pieces currently queued for a connection, head first.
    pub fn queued_requests(&self, descriptor: ConnectionDescriptor) -> Vec<PieceIndex> {
        self.slot(descriptor)
            .map(|slot| slot.state.lock().requests.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of pieces currently claimed by some connection.
    pub fn transit_count(&self) -> usize {
        self.state.lock().transit.count_ones()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    fn slot(&self, descriptor: ConnectionDescriptor) -> Option<Arc<ConnectionSlot>> {
        self.connections.read().get(&descriptor).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::storage::test_fixtures::{MemoryStorage, TestContent};

    fn field(piece_count: usize, pieces: &[u32]) -> Vec<u8> {
        let mut field = Bitfield::new(piece_count);
        for &i in pieces {
            field.set(PieceIndex::new(i)).unwrap();
        }
        field.as_bytes().to_vec()
    }

    fn store_for(content: &TestContent, queue_size: usize) -> (PieceStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new(content));
        let store = PieceStore::new(
            content.layout,
            storage.clone(),
            queue_size,
            Bitfield::new(content.layout.piece_count() as usize),
        );
        (store, storage)
    }

    #[test]
    fn test_layout_short_last_piece() {
        let layout = PieceLayout::new(16384, 40000);
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.piece_size(PieceIndex::new(0)), 16384);
        assert_eq!(layout.piece_size(PieceIndex::new(2)), 40000 - 2 * 16384);
        assert_eq!(layout.piece_size(PieceIndex::new(3)), 0);
        assert_eq!(layout.piece_offset(PieceIndex::new(2)), 32768);
        assert_eq!(layout.bitfield_len(), 1);
        assert_eq!(layout.max_frame_len(), 16384 + 13);
    }

    #[test]
    fn test_overlapping_peers_get_disjoint_queues() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);

        let a = store.register_connection(&field(5, &[0, 1, 2]));
        let b = store.register_connection(&field(5, &[2, 3, 4]));

        assert!(store.compute_request_queue(a));
        let a_queue = store.queued_requests(a);
        assert_eq!(a_queue.len(), 2);
        assert!(a_queue.iter().all(|i| i.as_u32() <= 2));

        assert!(store.compute_request_queue(b));
        let b_queue = store.queued_requests(b);
        assert!(b_queue.iter().all(|i| !a_queue.contains(i)));
        assert!(b_queue.iter().all(|i| (2..=4).contains(&i.as_u32())));
        assert_eq!(store.transit_count(), a_queue.len() + b_queue.len());
    }

    #[test]
    fn test_compute_returns_true_for_non_empty_queue() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0, 1, 2, 3]));

        assert!(store.compute_request_queue(a));
        assert!(store.compute_request_queue(a));
        assert_eq!(store.queued_requests(a).len(), 2);
        assert_eq!(store.transit_count(), 2);
    }

    #[test]
    fn test_compute_skips_held_pieces_and_spare_bits() {
        let content = TestContent::new(8, 80);
        let storage = Arc::new(MemoryStorage::new(&content));
        let local = Bitfield::from_bytes(&field(10, &[0, 1]), 10);
        let store = PieceStore::new(content.layout, storage, 10, local);

        // Peer claims everything, including the six spare bits
        let a = store.register_connection(&[0xFF, 0xFF]);
        assert!(store.compute_request_queue(a));
        let queued: Vec<u32> = store.queued_requests(a).iter().map(|i| i.as_u32()).collect();
        assert_eq!(queued, (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_next_request_exhausts_then_returns_none() {
        let content = TestContent::new(8, 24);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(3, &[0, 1, 2]));

        assert_eq!(store.next_request(a), Some(PieceIndex::new(0)));
        assert_eq!(store.next_request(a), Some(PieceIndex::new(1)));
        assert_eq!(store.next_request(a), Some(PieceIndex::new(2)));
        assert_eq!(store.next_request(a), None);
        assert_eq!(store.transit_count(), 3);
    }

    #[test]
    fn test_unregister_releases_claims_for_reclaim() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0, 1, 2]));
        let b = store.register_connection(&field(5, &[0, 1, 2]));

        let in_flight = store.next_request(a);
        assert_eq!(in_flight, Some(PieceIndex::new(0)));
        assert_eq!(store.queued_requests(a), vec![PieceIndex::new(1)]);

        // Only the piece a did not claim is left for b
        assert_eq!(store.next_request(b), Some(PieceIndex::new(2)));
        assert_eq!(store.next_request(b), None);

        store.unregister_connection(a, in_flight);
        assert_eq!(store.transit_count(), 1);
        assert_eq!(store.next_request(b), Some(PieceIndex::new(0)));
        assert_eq!(store.next_request(b), Some(PieceIndex::new(1)));

        // Unknown descriptors are ignored
        store.unregister_connection(a, Some(PieceIndex::new(4)));
        assert_eq!(store.connection_count(), 1);
    }

    #[test]
    fn test_requeue_keeps_claim_and_bound() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0, 1, 2, 3]));

        let first = store.next_request(a).unwrap();
        store.requeue_request(a, first);
        assert_eq!(store.queued_requests(a), vec![first, PieceIndex::new(1)]);
        assert_eq!(store.transit_count(), 2);

        // Drain the queue and refill it with 2 and 3
        assert_eq!(store.next_request(a), Some(first));
        let second = store.next_request(a).unwrap();
        assert!(store.compute_request_queue(a));
        assert_eq!(store.transit_count(), 4);

        // A full queue sheds its tail claim
        store.requeue_request(a, second);
        assert_eq!(
            store.queued_requests(a),
            vec![second, PieceIndex::new(2)]
        );
        assert_eq!(store.transit_count(), 3);

        let b = store.register_connection(&field(5, &[3]));
        assert_eq!(store.next_request(b), Some(PieceIndex::new(3)));
    }

    #[tokio::test]
    async fn test_receive_piece_sets_bit_and_clears_claim() {
        let content = TestContent::new(8, 40);
        let (store, storage) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0, 1, 2, 3, 4]));

        let index = store.next_request(a).unwrap();
        store
            .receive_piece(a, index, content.piece(index))
            .await
            .unwrap();

        assert!(store.has_piece(index));
        assert_eq!(store.transit_count(), 1);
        assert_eq!(storage.stored_piece_count(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_piece_is_never_requested() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0, 1, 2]));
        let b = store.register_connection(&field(5, &[0]));
        assert!(store.compute_request_queue(a));
        assert_eq!(
            store.queued_requests(a),
            vec![PieceIndex::new(0), PieceIndex::new(1)]
        );

        // a sends piece 1 before we ask for it
        let one = PieceIndex::new(1);
        store.receive_piece(a, one, content.piece(one)).await.unwrap();
        assert_eq!(store.queued_requests(a), vec![PieceIndex::new(0)]);

        // b delivers piece 0 while it is still queued on a
        let zero = PieceIndex::new(0);
        store.receive_piece(b, zero, content.piece(zero)).await.unwrap();

        assert_eq!(store.next_request(a), Some(PieceIndex::new(2)));
        assert_eq!(store.next_request(a), None);
    }

    #[test]
    fn test_set_peer_field_replaces_copy() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 4);
        let a = store.register_connection(&[]);
        assert!(!store.compute_request_queue(a));

        store.set_peer_field(a, &field(5, &[3, 4]));
        assert!(store.compute_request_queue(a));
        assert_eq!(
            store.queued_requests(a),
            vec![PieceIndex::new(3), PieceIndex::new(4)]
        );
    }

    #[tokio::test]
    async fn test_duplicate_piece_leaves_progress_unchanged() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0]));
        let index = PieceIndex::new(0);

        store
            .receive_piece(a, index, content.piece(index))
            .await
            .unwrap();
        let before = store.progress();

        let result = store.receive_piece(a, index, content.piece(index)).await;
        assert!(matches!(result, Err(TorrentError::DuplicatePiece { .. })));
        assert_eq!(store.progress(), before);
    }

    #[tokio::test]
    async fn test_corrupt_piece_keeps_bit_unset() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&field(5, &[0]));
        let index = store.next_request(a).unwrap();

        let result = store.receive_piece(a, index, &[0u8; 8]).await;
        assert!(matches!(result, Err(TorrentError::PieceHashMismatch { .. })));
        assert!(!store.has_piece(index));
        assert_eq!(store.progress().downloaded, 0);

        // Still claimed until the session releases it
        assert_eq!(store.transit_count(), 1);
        store.release_claim(index);
        assert_eq!(store.transit_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_out_of_range_piece() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&[]);

        let result = store.receive_piece(a, PieceIndex::new(5), &[0u8; 8]).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_progress_counts_whole_pieces() {
        let content = TestContent::new(8, 80);
        let (store, _) = store_for(&content, 4);
        let a = store.register_connection(&[]);

        for k in 0..4u32 {
            let index = PieceIndex::new(k);
            store
                .receive_piece(a, index, content.piece(index))
                .await
                .unwrap();
            let progress = store.progress();
            assert_eq!(progress.downloaded, (k as u64 + 1) * 8);
            assert_eq!(progress.left, 80 - (k as u64 + 1) * 8);
        }
    }

    #[test]
    fn test_have_broadcast_skips_origin_and_dedups() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&[]);
        let b = store.register_connection(&[]);
        let c = store.register_connection(&[]);

        store.create_have_broadcast(a, PieceIndex::new(3));
        store.create_have_broadcast(c, PieceIndex::new(1));
        store.create_have_broadcast(a, PieceIndex::new(3));

        assert_eq!(
            store.drain_have_notifications(b),
            vec![PieceIndex::new(3), PieceIndex::new(1)]
        );
        assert_eq!(store.drain_have_notifications(a), vec![PieceIndex::new(1)]);
        assert_eq!(store.drain_have_notifications(c), vec![PieceIndex::new(3)]);
        assert!(store.drain_have_notifications(b).is_empty());

        // Drained indices may be queued again
        store.create_have_broadcast(a, PieceIndex::new(3));
        assert_eq!(store.drain_have_notifications(b), vec![PieceIndex::new(3)]);
    }

    #[test]
    fn test_update_peer_field() {
        let content = TestContent::new(8, 40);
        let (store, _) = store_for(&content, 2);
        let a = store.register_connection(&[]);

        assert!(!store.compute_request_queue(a));
        store.update_peer_field(a, PieceIndex::new(4)).unwrap();
        assert!(store.compute_request_queue(a));
        assert_eq!(store.queued_requests(a), vec![PieceIndex::new(4)]);

        assert!(store.update_peer_field(a, PieceIndex::new(5)).is_err());
    }

    #[tokio::test]
    async fn test_get_piece_ranges() {
        let content = TestContent::new(8, 20);
        let storage = Arc::new(MemoryStorage::seeded(&content));
        let full = Bitfield::from_bytes(&[0xFF], 3);
        let store = PieceStore::new(content.layout, storage, 2, full);

        let last = PieceIndex::new(2);
        let data = store.get_piece(last, 1, 3).await.unwrap();
        assert_eq!(data.as_ref(), &content.piece(last)[1..4]);
        assert_eq!(store.progress().uploaded, 3);

        let result = store.get_piece(last, 2, 3).await;
        assert!(matches!(
            result,
            Err(TorrentError::RangeExceeded { piece_size: 4, .. })
        ));
        assert_eq!(store.progress().uploaded, 3);
    }

    #[tokio::test]
    async fn test_get_piece_not_held() {
        let content = TestContent::new(8, 20);
        let (store, _) = store_for(&content, 2);

        let result = store.get_piece(PieceIndex::new(0), 0, 8).await;
        assert!(matches!(result, Err(TorrentError::PieceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_download() {
        let content = TestContent::new(8, 16);
        let (store, _) = store_for(&content, 2);
        let store = Arc::new(store);
        let a = store.register_connection(&[]);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_for_download().await })
        };

        for i in 0..2 {
            let index = PieceIndex::new(i);
            store
                .receive_piece(a, index, content.piece(index))
                .await
                .unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(store.is_complete());

        // Already complete resolves immediately
        store.wait_for_download().await;
    }

    #[tokio::test]
    async fn test_save_and_open_progress() {
        let content = TestContent::new(8, 40);
        let (store, storage) = store_for(&content, 2);
        let a = store.register_connection(&[]);
        let index = PieceIndex::new(3);
        store
            .receive_piece(a, index, content.piece(index))
            .await
            .unwrap();

        store.save_progress().await.unwrap();
        assert_eq!(storage.saved_bitfield(), Some(vec![0b0001_0000]));
        assert_eq!(storage.sync_count(), 1);

        let reopened = PieceStore::open(content.layout, storage, 2).await.unwrap();
        assert!(reopened.has_piece(index));
        assert_eq!(reopened.progress().downloaded, 8);
    }

    #[tokio::test]
    async fn test_open_without_sidecar_starts_empty() {
        let content = TestContent::new(8, 40);
        let storage = Arc::new(MemoryStorage::new(&content));

        let store = PieceStore::open(content.layout, storage, 2).await.unwrap();
        assert_eq!(store.local_bitfield().count_ones(), 0);
    }

    proptest! {
        #[test]
        fn prop_concurrent_queues_are_disjoint(
            peer_fields in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 4),
                2..6,
            ),
            queue_size in 1usize..8,
        ) {
            let content = TestContent::new(4, 4 * 30);
            let (store, _) = store_for(&content, queue_size);
            let descriptors: Vec<_> = peer_fields
                .iter()
                .map(|bytes| store.register_connection(bytes))
                .collect();

            std::thread::scope(|scope| {
                for &descriptor in &descriptors {
                    let store = &store;
                    scope.spawn(move || store.compute_request_queue(descriptor));
                }
            });

            let mut seen = HashSet::new();
            let mut total = 0;
            for (descriptor, bytes) in descriptors.iter().zip(&peer_fields) {
                let peer = Bitfield::from_bytes(bytes, 30);
                let queue = store.queued_requests(*descriptor);
                prop_assert!(queue.len() <= queue_size);
                for index in queue {
                    prop_assert!(peer.has(index));
                    prop_assert!(seen.insert(index));
                    total += 1;
                }
            }
            prop_assert_eq!(store.transit_count(), total);
        }
    }
}
