//! Per-torrent state: the atom pool, connected peer sessions, the shared
//! picker/replication map they feed, and the periodic timers that drive
//! choking, reconnection, and atom maintenance (spec.md §3-§4.6).

use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicU32, Arc},
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, RwLock},
    time::interval,
};

use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{
    atom::{AtomId, AtomPool, DiscoverySource},
    choke::{self, Candidate},
    conf::TorrentConf,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::Result,
    lifecycle,
    metainfo::Metainfo,
    peer::{
        self, Handshake, HandshakeCodec, PeerBookkeeping, PeerHandle, PexMessage, PexPeer, SessionEvent,
        SharedStatus,
    },
    picker::Picker,
    replication::ReplicationMap,
    storage_info::StorageInfo,
    Bitfield, PeerId, PieceIndex, TorrentId,
};

/// Commands the engine sends a running torrent. Separate from
/// [`SessionEvent`], which flows the other way (session to torrent).
pub(crate) enum Command {
    /// A connection the engine's listener accepted and identified as
    /// belonging to this torrent by info hash (spec.md §6 "incoming
    /// connection gate").
    InboundPeer {
        addr: std::net::SocketAddr,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    Stop,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Everything a torrent tracks about the peers it knows of and is
/// connected to: the long-lived atom pool plus the live sessions bound to
/// a subset of its atoms (spec.md §3).
#[derive(Default)]
struct TorrentPeers {
    pool: AtomPool,
    connected: HashMap<AtomId, PeerHandle>,
    bookkeeping: HashMap<AtomId, PeerBookkeeping>,
    /// Last-known availability per connected peer, used for replication
    /// drop on disconnect and for future seeding decisions.
    pieces: HashMap<AtomId, Bitfield>,
    peer_ids: HashMap<AtomId, PeerId>,
    interested_in_us: HashSet<AtomId>,
}

/// Owns a single torrent's runtime state and drives its periodic
/// controllers. Spawned as its own task by the engine.
pub(crate) struct Torrent {
    id: TorrentId,
    conf: TorrentConf,
    storage: StorageInfo,
    shared: Arc<SharedStatus>,
    picker: Arc<RwLock<Picker>>,
    replication: Arc<RwLock<ReplicationMap>>,
    disk: Arc<DiskHandle>,
    peers: TorrentPeers,
    own_pieces: Arc<RwLock<Bitfield>>,
    event_chan: mpsc::UnboundedSender<SessionEvent>,
    event_port: mpsc::UnboundedReceiver<SessionEvent>,
    command_port: CommandReceiver,
    alert_port: TorrentAlertReceiver,
    /// Block reads in flight for serving peers, keyed by the block they
    /// cover so a result can be routed back to every peer that asked for
    /// it (spec.md §4.1 "Request" handling).
    pending_reads: HashMap<(PieceIndex, u32), Vec<peer::Sender>>,
    max_peers: usize,
    running: bool,
    /// The set of connected peer addresses we last gossiped about via PEX,
    /// so the next tick can send only what changed (spec.md §4.1/BEP 11).
    pex_snapshot: HashSet<std::net::SocketAddr>,
    /// Which atoms have contributed a block to each piece currently being
    /// assembled, so a failed hash check (spec.md §6 "integrity failure")
    /// knows whom to blame. Cleared as pieces complete or fail.
    piece_contributors: HashMap<PieceIndex, Vec<AtomId>>,
}

impl Torrent {
    pub fn new(
        id: TorrentId,
        client_id: PeerId,
        metainfo: &Metainfo,
        conf: TorrentConf,
        disk: Arc<DiskHandle>,
        alert_port: TorrentAlertReceiver,
    ) -> (Self, CommandSender) {
        let storage = StorageInfo::new(metainfo, conf.download_dir.clone());
        let (event_chan, event_port) = mpsc::unbounded_channel();
        let (command_chan, command_port) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedStatus {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            piece_count: storage.piece_count,
            piece_len: AtomicU32::new(storage.piece_len),
            keepalive_interval: conf.keepalive_interval,
            metainfo: Arc::new(metainfo.clone()),
            private: metainfo.private,
            request_buf_secs: conf.request_buf_secs,
        });
        let replication_map = ReplicationMap::new(storage.piece_count);
        let piece_len = storage.piece_len;
        let last_piece_len = storage.last_piece_len;
        let piece_count = storage.piece_count;
        let picker = Picker::new(storage.piece_count, &replication_map, move |index| {
            if index + 1 == piece_count {
                last_piece_len
            } else {
                piece_len
            }
        });
        let max_peers = conf.max_connected_peer_count;
        let torrent = Self {
            id,
            conf,
            own_pieces: Arc::new(RwLock::new(Bitfield::none(storage.piece_count))),
            storage,
            shared,
            picker: Arc::new(RwLock::new(picker)),
            replication: Arc::new(RwLock::new(replication_map)),
            disk,
            peers: TorrentPeers::default(),
            event_chan,
            event_port,
            command_port,
            alert_port,
            pending_reads: HashMap::new(),
            max_peers,
            running: true,
            pex_snapshot: HashSet::new(),
            piece_contributors: HashMap::new(),
        };
        (torrent, command_chan)
    }

    /// Registers a newly learned peer address with the atom pool (from a
    /// tracker response, PEX, an incoming connection, etc).
    pub fn learn_peer(&mut self, addr: std::net::SocketAddr, source: DiscoverySource, now: Instant) -> AtomId {
        self.peers.pool.ensure(addr, source, now)
    }

    /// Runs the torrent's event loop until told to stop. Drives the
    /// rechoke tick (spec.md §4.4), the reconnect pulse (§4.5), and the
    /// atom pool maintenance sweep (§4.6), alongside reacting to peer
    /// session events and disk alerts as they arrive.
    pub async fn run(mut self) -> Result<()> {
        let mut rechoke_timer = interval(self.conf.rechoke_interval);
        let mut reconnect_timer = interval(self.conf.reconnect_pulse_interval);
        let mut ageing_timer = interval(self.conf.atom_ageing_interval);
        let mut pex_timer = interval(self.conf.pex_interval);
        let mut refill_timer = interval(std::time::Duration::from_secs(10));

        while self.running {
            tokio::select! {
                event = self.event_port.recv() => {
                    match event {
                        Some(event) => self.handle_session_event(event).await?,
                        None => break,
                    }
                }
                alert = self.alert_port.recv() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await,
                        None => break,
                    }
                }
                command = self.command_port.recv() => {
                    match command {
                        Some(Command::InboundPeer { addr, socket, handshake }) => {
                            self.accept_inbound_peer(addr, socket, handshake, Instant::now());
                        }
                        Some(Command::Stop) | None => break,
                    }
                }
                _ = rechoke_timer.tick() => {
                    self.rechoke().await;
                }
                _ = reconnect_timer.tick() => {
                    self.reconnect_pulse(Instant::now()).await;
                }
                _ = ageing_timer.tick() => {
                    lifecycle::run_maintenance_sweep(&mut self.peers.pool, self.max_peers, Instant::now());
                }
                _ = pex_timer.tick() => {
                    if self.conf.pex_enabled && !self.shared.private {
                        self.gossip_pex();
                    }
                }
                _ = refill_timer.tick() => {
                    self.refill_upkeep(Instant::now()).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::PeerIdentified { atom, peer_id } => {
                self.peers.peer_ids.insert(atom, peer_id);
            }
            SessionEvent::BitfieldReceived { atom, bitfield } => {
                if bitfield.is_seed() {
                    if let Some(a) = self.peers.pool.get_mut(atom) {
                        a.mark_seed();
                    }
                }
                self.peers.pieces.insert(atom, bitfield);
            }
            SessionEvent::HaveReceived { atom, piece_index } => {
                let piece_count = self.storage.piece_count;
                self.peers
                    .pieces
                    .entry(atom)
                    .or_insert_with(|| Bitfield::none(piece_count))
                    .set_piece(piece_index);
                if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                    bk.last_activity = Instant::now();
                }
            }
            SessionEvent::BlockReceived { atom, info } => {
                // the picker and disk write were already updated by the
                // session itself; track who to blame if this piece fails
                // its hash check, and feed the choke controller's rate and
                // interest-grade bookkeeping.
                let now = Instant::now();
                self.piece_contributors.entry(info.piece_index).or_default().push(atom);
                if let Some(a) = self.peers.pool.get_mut(atom) {
                    a.piece_data_time = Some(now);
                }
                if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                    bk.download_rate.record(now, u64::from(info.len));
                    bk.choke.note_block_received(now);
                    bk.last_activity = now;
                }
            }
            SessionEvent::BlockSent { atom, info } => {
                if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                    bk.upload_rate.record(Instant::now(), u64::from(info.len));
                    bk.last_activity = Instant::now();
                }
            }
            SessionEvent::PieceCompleted { piece_index } => {
                self.own_pieces.write().await.set_piece(piece_index);
                self.piece_contributors.remove(&piece_index);
                self.broadcast_have(piece_index);
            }
            SessionEvent::PeerChokedUs { .. } | SessionEvent::PeerUnchokedUs { .. } => {}
            SessionEvent::PeerInterested { atom } => {
                self.peers.interested_in_us.insert(atom);
                if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                    bk.last_activity = Instant::now();
                }
            }
            SessionEvent::PeerNotInterested { atom } => {
                self.peers.interested_in_us.remove(&atom);
            }
            SessionEvent::PexReceived { atom: _, added } => {
                let now = Instant::now();
                for peer in added {
                    self.peers.pool.ensure(peer.addr, DiscoverySource::Pex, now);
                }
            }
            SessionEvent::BlockRequested { atom: _, info, reply_to } => {
                self.pending_reads
                    .entry((info.piece_index, info.offset))
                    .or_default()
                    .push(reply_to);
                self.disk.read_block(self.id, info)?;
            }
            SessionEvent::Disconnected { atom, succeeded, read_anything } => {
                self.remove_peer(atom, succeeded, read_anything).await;
            }
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                if batch.is_piece_valid == Some(true) {
                    if let Some(block) = batch.blocks.first() {
                        let piece_index = block.piece_index;
                        self.picker.write().await.received_piece(piece_index);
                        self.own_pieces.write().await.set_piece(piece_index);
                        self.piece_contributors.remove(&piece_index);
                        self.broadcast_have(piece_index);
                    }
                } else if batch.is_piece_valid == Some(false) {
                    self.handle_integrity_failure(&batch).await;
                }
                // is_piece_valid == None is a partial batch (not yet the
                // piece's last block); nothing to do until the piece
                // completes or fails.
            }
            TorrentAlert::BatchWrite(Err(e)) => {
                log::warn!("torrent {} write failed: {}", self.id, e);
            }
            TorrentAlert::BlockRead(Ok((info, data))) => {
                if let Some(replies) = self.pending_reads.remove(&(info.piece_index, info.offset)) {
                    for reply in replies {
                        let _ = reply.send(peer::Command::SendBlock(info, data.clone()));
                    }
                }
            }
            TorrentAlert::BlockRead(Err(e)) => {
                log::warn!("torrent {} read failed: {}", self.id, e);
            }
        }
    }

    fn broadcast_have(&self, piece_index: PieceIndex) {
        for handle in self.peers.connected.values() {
            let _ = handle.send_have(piece_index);
        }
    }

    /// Tears down a session's bookkeeping and updates its atom's failure
    /// state. `succeeded` is false whenever the session ended via a
    /// protocol or transport error (spec.md §7); `read_anything` further
    /// distinguishes a dead address from a peer that misbehaved after
    /// connecting (spec.md §4.7).
    async fn remove_peer(&mut self, atom: AtomId, succeeded: bool, read_anything: bool) {
        self.peers.connected.remove(&atom);
        self.peers.bookkeeping.remove(&atom);
        self.peers.peer_ids.remove(&atom);
        self.peers.interested_in_us.remove(&atom);
        if let Some(bitfield) = self.peers.pieces.remove(&atom) {
            let mut replication = self.replication.write().await;
            crate::replication::ReplicationMap::drop(&mut replication, &bitfield);
        }
        if let Some(a) = self.peers.pool.get_mut(atom) {
            a.peer = None;
            if succeeded {
                a.num_fails = 0;
            } else {
                a.num_fails = a.num_fails.saturating_add(1);
                if !read_anything {
                    a.flags2.insert(crate::atom::AtomFlags2::UNREACHABLE);
                }
            }
        }
    }

    /// Disconnects a live session and tears down its bookkeeping right
    /// away, without waiting for the session task to report back
    /// (spec.md §4.5/§7's "do_purge"). Used for banned atoms and stale or
    /// over-cap peers the lifecycle controller decides to cull.
    async fn do_purge(&mut self, atom: AtomId) {
        if let Some(handle) = self.peers.connected.get(&atom) {
            let _ = handle.shutdown();
        }
        self.remove_peer(atom, true, true).await;
    }

    /// Runs one rechoke tick (spec.md §4.4): the unchoking half ranks
    /// peers by rate and unchokes the top `upload_slots`, plus one
    /// optimistic slot; the interest half separately decides which peers
    /// we declare `Interested` in, biased toward peers that actually
    /// deliver what we ask for.
    async fn rechoke(&mut self) {
        let now = Instant::now();
        let is_seeding = self.own_pieces.read().await.is_seed();
        let is_uploading = self.own_pieces.read().await.iter_have().next().is_some();

        let is_private = self.shared.private;
        let atoms: Vec<AtomId> = self.peers.connected.keys().copied().collect();
        let mut candidates: Vec<Candidate> = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let peer_id = match self.peers.peer_ids.get(&atom) {
                Some(id) => *id,
                None => continue,
            };
            let is_interested = self.peers.interested_in_us.contains(&atom);
            let is_seed = self.peers.pool.get(atom).map(|a| a.is_seed()).unwrap_or(false);
            let bk = match self.peers.bookkeeping.get_mut(&atom) {
                Some(bk) => bk,
                None => continue,
            };
            let download_rate = bk.download_rate.rate(now);
            let upload_rate = bk.upload_rate.rate(now);
            let rate = if is_seeding {
                upload_rate
            } else if is_private {
                download_rate + upload_rate
            } else {
                download_rate
            };
            let was_unchoked = !bk.choke.is_choked;
            let is_newly_connected = now.saturating_duration_since(bk.connected_at) < Duration::from_secs(30);
            candidates.push(Candidate {
                peer_id,
                rate,
                is_interested,
                is_seed,
                was_unchoked,
                is_newly_connected,
            });
        }

        let mut unchoked = choke::rechoke(&candidates, self.conf.upload_slots, is_uploading);

        // an atom still within its optimistic-immunity window stays
        // unchoked regardless of rank; advancing the tick here also frees
        // the slot for a new pick once immunity lapses.
        let mut still_immune = false;
        for (atom, peer_id) in self.peers.peer_ids.clone() {
            if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                if bk.choke.is_optimistically_unchoked {
                    if bk.choke.tick_optimistic() {
                        bk.choke.is_optimistically_unchoked = false;
                    } else {
                        still_immune = true;
                        if !unchoked.contains(&peer_id) {
                            unchoked.push(peer_id);
                        }
                    }
                }
            }
        }
        if !still_immune {
            if let Some(optimistic) = choke::pick_optimistic_unchoke(&candidates, &unchoked) {
                let peer_id = optimistic.peer_id;
                unchoked.push(peer_id);
                if let Some(atom) = self.peers.peer_ids.iter().find(|(_, id)| **id == peer_id).map(|(a, _)| *a) {
                    if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                        bk.choke.start_optimistic_unchoke();
                    }
                }
            }
        }

        for (atom, peer_id) in self.peers.peer_ids.clone() {
            let should_unchoke = unchoked.contains(&peer_id);
            if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                bk.choke.is_choked = !should_unchoke;
            }
            if let Some(handle) = self.peers.connected.get(&atom) {
                if should_unchoke {
                    let _ = handle.unchoke();
                } else {
                    let _ = handle.choke();
                }
            }
        }

        self.rechoke_interest(now).await;
    }

    /// The Interest half of spec.md §4.4: classifies every connected peer
    /// by its recent blocks-received/cancels-sent history and declares
    /// interest only in the best `min_interested_peers`..`max_connected_peer_count`
    /// of them. Adaptive shrink/grow of that window (based on a recent
    /// high-cancel-rate signal) isn't implemented; this always targets
    /// `max_connected_peer_count`, a documented simplification.
    async fn rechoke_interest(&mut self, now: Instant) {
        let own_pieces = self.own_pieces.read().await;
        let atoms: Vec<AtomId> = self.peers.connected.keys().copied().collect();
        let mut candidates: Vec<(crate::PeerId, choke::InterestGrade, bool)> = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let peer_id = match self.peers.peer_ids.get(&atom) {
                Some(id) => *id,
                None => continue,
            };
            let has_wanted = self
                .peers
                .pieces
                .get(&atom)
                .map(|bf| bf.iter_have().any(|i| !own_pieces.has_piece(i)))
                .unwrap_or(false);
            let grade = match self.peers.bookkeeping.get_mut(&atom) {
                Some(bk) => bk.choke.grade(now),
                None => continue,
            };
            candidates.push((peer_id, grade, has_wanted));
        }
        drop(own_pieces);

        let interested = choke::select_interested(&candidates, self.conf.max_connected_peer_count);
        for (atom, peer_id) in self.peers.peer_ids.clone() {
            if let Some(handle) = self.peers.connected.get(&atom) {
                let _ = handle.set_interest(interested.contains(&peer_id));
            }
        }
    }

    /// Sends every connected peer a PEX payload of what changed in our
    /// connected-peer set since the last gossip tick (spec.md §4.1,
    /// BEP 11): each peer gets `added`/`dropped` with its own address
    /// excluded, since a peer already knows about itself.
    fn gossip_pex(&mut self) {
        let current: HashSet<std::net::SocketAddr> = self.peers.connected.values().map(|h| h.addr).collect();
        let added: Vec<PexPeer> = current
            .difference(&self.pex_snapshot)
            .map(|addr| PexPeer { addr: *addr })
            .collect();
        let dropped: Vec<PexPeer> = self
            .pex_snapshot
            .difference(&current)
            .map(|addr| PexPeer { addr: *addr })
            .collect();
        self.pex_snapshot = current;

        if added.is_empty() && dropped.is_empty() {
            return;
        }
        for handle in self.peers.connected.values() {
            let added = added.iter().filter(|p| p.addr != handle.addr).cloned().collect();
            let dropped = dropped.iter().filter(|p| p.addr != handle.addr).cloned().collect();
            let _ = handle.send_pex(PexMessage { added, dropped });
        }
    }

    /// Runs the refill-upkeep tick (spec.md §4.2, every 10s): cancels
    /// requests that have been outstanding past `request_timeout`, so
    /// they can be reassigned to a different peer, and records the
    /// cancellation against the peer that was sitting on them for the
    /// choke controller's Interest classification.
    async fn refill_upkeep(&mut self, now: Instant) {
        let timed_out = self.picker.write().await.collect_timed_out(now, self.conf.request_timeout);
        for request in timed_out {
            if let Some(handle) = self.peers.connected.get(&request.atom) {
                let _ = handle.cancel(request.info);
            }
            if let Some(bk) = self.peers.bookkeeping.get_mut(&request.atom) {
                bk.choke.note_cancel_sent(now);
            }
        }
        // webseeds are a Non-goal, so the divisor is just our connected
        // peer count; always at least 1 to avoid a division by zero.
        let active_peers = self.peers.connected.len().max(1);
        self.picker.write().await.update_endgame(active_peers);
    }

    /// Handles a piece that was written to disk but failed its hash check
    /// (spec.md §6 "integrity failure", §7): blames every atom that
    /// contributed a block to the piece, bans and disconnects any atom
    /// that crosses `max_strikes`, and resets the piece so it's requested
    /// again from scratch.
    async fn handle_integrity_failure(&mut self, batch: &crate::disk::BatchWrite) {
        let piece_index = match batch.blocks.first() {
            Some(block) => block.piece_index,
            None => return,
        };
        log::warn!("torrent {} piece {} failed integrity check", self.id, piece_index);

        let contributors = self.piece_contributors.remove(&piece_index).unwrap_or_default();
        let mut to_purge = Vec::new();
        for atom in contributors {
            if let Some(bk) = self.peers.bookkeeping.get_mut(&atom) {
                bk.blame = bk.blame.saturating_add(1);
                if bk.blame >= self.conf.max_strikes {
                    to_purge.push(atom);
                }
            }
        }
        for atom in to_purge {
            log::warn!("torrent {} banning atom for repeated corrupt pieces", self.id);
            if let Some(a) = self.peers.pool.get_mut(atom) {
                a.flags2.insert(crate::atom::AtomFlags2::BANNED);
            }
            self.do_purge(atom).await;
        }

        self.picker.write().await.reset_piece(piece_index);
    }

    /// Binds an incoming connection the engine's listener already
    /// identified as ours to a (possibly new) atom and spawns its session
    /// (spec.md §6 "incoming connection gate").
    fn accept_inbound_peer(
        &mut self,
        addr: std::net::SocketAddr,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
        now: Instant,
    ) {
        if self.peers.connected.len() >= self.max_peers {
            return;
        }
        let atom = self.peers.pool.ensure(addr, DiscoverySource::Incoming, now);
        if self.peers.connected.contains_key(&atom) {
            // already have a live session bound to this atom; the spec.md
            // §8 "no live peer and in-flight handshake at once" invariant
            // is about outgoing dials, but a duplicate incoming connection
            // from the same address is just as redundant
            return;
        }
        if let Some(a) = self.peers.pool.get_mut(atom) {
            if a.is_banned() || a.blocklisted == crate::atom::Blocklisted::Yes {
                return;
            }
            a.last_connection_at = Some(now);
            a.peer = Some(atom);
        }
        let handle = peer::spawn_inbound(
            Arc::clone(&self.shared),
            Arc::clone(&self.picker),
            Arc::clone(&self.replication),
            Arc::clone(&self.own_pieces),
            Arc::clone(&self.disk),
            self.event_chan.clone(),
            addr,
            atom,
            socket,
            handshake,
        );
        self.peers.connected.insert(atom, handle);
        self.peers.bookkeeping.insert(atom, PeerBookkeeping::default());
    }

    /// Enforces the per-torrent connection cap by closing the worst peers
    /// by liveliness ordering until at or under `max_peers` (spec.md §4.5
    /// step 1). The per-session cap across all running torrents (step 2)
    /// isn't implemented: this engine runs each torrent as an independent
    /// task with no shared registry of connections across torrents, so
    /// there's nowhere to enforce a cross-torrent cap from.
    async fn cull_over_cap(&mut self, now: Instant) {
        if self.peers.connected.len() <= self.max_peers {
            return;
        }
        let excess = self.peers.connected.len() - self.max_peers;
        let atoms: Vec<AtomId> = self.peers.connected.keys().copied().collect();
        let mut candidates = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let piece_data_time = self.peers.pool.get(atom).and_then(|a| a.piece_data_time);
            let bk = match self.peers.bookkeeping.get_mut(&atom) {
                Some(bk) => bk,
                None => continue,
            };
            candidates.push(lifecycle::LivelinessCandidate {
                atom,
                rate: bk.download_rate.rate(now) + bk.upload_rate.rate(now),
                piece_data_time,
                connected_at: bk.connected_at,
            });
        }
        let worst = lifecycle::rank_for_culling(candidates, now);
        for atom in worst.into_iter().take(excess) {
            self.do_purge(atom).await;
        }
    }

    /// Closes peers that are no longer worth keeping connected (spec.md
    /// §4.5 step 3): both sides are seeding with nothing left for PEX to
    /// exchange, or the peer has been idle past the sliding threshold.
    async fn cull_dead_peers(&mut self, now: Instant) {
        let we_are_seed = self.own_pieces.read().await.is_seed();
        let threshold = lifecycle::idle_threshold(self.peers.connected.len(), self.max_peers);
        let atoms: Vec<AtomId> = self.peers.connected.keys().copied().collect();
        let mut to_purge = Vec::new();
        for atom in atoms {
            let peer_is_seed = self.peers.pieces.get(&atom).map(|bf| bf.is_seed()).unwrap_or(false);
            let bk = match self.peers.bookkeeping.get(&atom) {
                Some(bk) => bk,
                None => continue,
            };
            let idle_for = now.saturating_duration_since(bk.last_activity);
            let both_seeding_done = we_are_seed
                && peer_is_seed
                && (!self.conf.pex_enabled || idle_for >= Duration::from_secs(30));
            if both_seeding_done || idle_for >= threshold {
                to_purge.push(atom);
            }
        }
        for atom in to_purge {
            self.do_purge(atom).await;
        }
    }

    /// Runs one reconnect pulse: culls over-cap and dead peers, then asks
    /// the lifecycle controller for the best candidates to dial and spawns
    /// outbound sessions for them (spec.md §4.5).
    async fn reconnect_pulse(&mut self, now: Instant) {
        self.cull_over_cap(now).await;
        self.cull_dead_peers(now).await;
        if self.peers.connected.len() >= self.max_peers {
            return;
        }
        let want = self
            .conf
            .max_connect_attempts_per_pulse
            .min(self.max_peers - self.peers.connected.len());
        let ctx = lifecycle::TorrentContext {
            priority: lifecycle::TorrentPriority::Normal,
            recently_started: false,
            is_seeding: self.own_pieces.read().await.is_seed(),
        };
        let addrs = lifecycle::select_reconnect_candidates(&self.peers.pool, ctx, want, now);
        for addr in addrs {
            let atom = match self.peers.pool.find(&addr) {
                Some(id) => id,
                None => continue,
            };
            if let Some(a) = self.peers.pool.get_mut(atom) {
                a.last_connection_attempt_at = Some(now);
                a.peer = Some(atom);
            }
            let handle = peer::spawn_outbound(
                Arc::clone(&self.shared),
                Arc::clone(&self.picker),
                Arc::clone(&self.replication),
                Arc::clone(&self.own_pieces),
                Arc::clone(&self.disk),
                self.event_chan.clone(),
                addr,
                atom,
            );
            self.peers.connected.insert(atom, handle);
            self.peers.bookkeeping.insert(atom, PeerBookkeeping::default());
        }
    }
}
