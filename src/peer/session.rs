//! A single peer connection's session: handshake, LTEP negotiation,
//! availability exchange, and the steady-state message loop (spec.md
//! §4.1).

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    FutureExt, SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time::interval,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    atom::AtomId,
    disk::DiskHandle,
    download::PieceDownload,
    error::{Error, Result},
    metainfo::Metainfo,
    picker::Picker,
    replication::ReplicationMap,
    Bitfield, BlockInfo, PeerId,
};

use super::{
    codec::{Handshake, HandshakeCodec, PeerCodec},
    handshake::EncryptionMode,
    ltep::{ExtendedHandshake, ExtendedMessage, MetadataMessage, MetadataMsgKind, PexMessage, PexPeer},
    message::{Message, MessageId},
};

/// Torrent-wide information a session needs but never mutates directly
/// (the torrent's info hash, our own id, and the pieces we have).
pub(crate) struct SharedStatus {
    pub id: crate::TorrentId,
    pub info_hash: crate::Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub piece_len: std::sync::atomic::AtomicU32,
    /// How long a session may stay quiet before it must send a keepalive
    /// (spec.md §4.1).
    pub keepalive_interval: std::time::Duration,
    /// The torrent's full metainfo, always known before a session is ever
    /// spawned (a torrent isn't started until its metadata is complete,
    /// see engine.rs's `add_torrent_by_info_hash`/`torrent_got_metadata`
    /// split) — kept here so a session can serve BEP 9 metadata requests
    /// directly from its own bytes.
    pub metainfo: Arc<Metainfo>,
    pub private: bool,
    /// The `REQUEST_BUF_SECS` term of the desired-request-count formula
    /// (spec.md §4.2).
    pub request_buf_secs: u32,
}

impl SharedStatus {
    fn piece_len(&self, index: usize) -> Result<u32> {
        if index >= self.piece_count {
            return Err(Error::InvalidPieceIndex);
        }
        Ok(self.piece_len.load(std::sync::atomic::Ordering::Relaxed))
    }
}

/// Events a session reports to its owning torrent, which centralizes
/// atom/replication/choke bookkeeping across all of a torrent's sessions.
pub(crate) enum SessionEvent {
    /// Sent once, right after the handshake, so the torrent can resolve
    /// this atom's identity for the choke controller's candidate list.
    PeerIdentified { atom: AtomId, peer_id: PeerId },
    BitfieldReceived { atom: AtomId, bitfield: Bitfield },
    HaveReceived { atom: AtomId, piece_index: crate::PieceIndex },
    BlockReceived { atom: AtomId, info: BlockInfo },
    /// A block was actually written to the wire for a peer's request,
    /// feeding that peer's upload-rate bookkeeping (spec.md §4.4 rule 3).
    BlockSent { atom: AtomId, info: BlockInfo },
    PieceCompleted { piece_index: crate::PieceIndex },
    PeerChokedUs { atom: AtomId },
    PeerUnchokedUs { atom: AtomId },
    PeerInterested { atom: AtomId },
    PeerNotInterested { atom: AtomId },
    /// A PEX gossip message arrived; the torrent merges the added peers
    /// into its atom pool (spec.md §3, `DiscoverySource::Pex`). Dropped
    /// peers aren't acted on beyond bookkeeping the torrent might keep,
    /// since we never forcibly disconnect an atom just because a third
    /// party lost track of it.
    PexReceived { atom: AtomId, added: Vec<PexPeer> },
    /// A peer requested a block we have; the torrent forwards this to the
    /// disk task and routes the reply back to `reply_to`.
    BlockRequested { atom: AtomId, info: BlockInfo, reply_to: Sender },
    /// The session ended, for any reason: a clean shutdown, a protocol or
    /// transport error, or a failed outgoing connection/handshake. The
    /// torrent uses `succeeded`/`read_anything` to update the atom's
    /// `num_fails`/unreachable bookkeeping (spec.md §4.5/§7).
    Disconnected {
        atom: AtomId,
        succeeded: bool,
        read_anything: bool,
    },
}

pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    Shutdown,
    Choke,
    Unchoke,
    /// Announces a newly completed piece to this peer.
    Have(crate::PieceIndex),
    /// The torrent asks us to deliver a block we previously served a
    /// `Request` for, once the disk read completes.
    SendBlock(BlockInfo, Vec<u8>),
    /// The torrent's periodic PEX gossip payload for this peer (spec.md
    /// §4.1, 90s), sent only if the peer negotiated `ut_pex` support.
    SendPex(PexMessage),
    /// A request we sent this peer timed out and the torrent reassigned the
    /// block elsewhere; tell the peer we no longer want it and drop our own
    /// bookkeeping for it.
    Cancel(BlockInfo),
    /// The choke controller's Interest half (spec.md §4.4) reassessed
    /// whether we still want this peer's pieces; declares it on the wire
    /// if it changed.
    SetInterest(bool),
}

#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_choked: bool,
    is_peer_interested: bool,
    best_request_queue_len: Option<usize>,
    downloaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
            downloaded_block_bytes_count: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    picker: Arc<RwLock<Picker>>,
    replication: Arc<RwLock<ReplicationMap>>,
    /// The pieces we ourselves have, shared with the torrent and every
    /// other session, consulted when deciding whether a `Request` is for a
    /// piece we can actually serve (spec.md §4.1 "Request" edge case).
    own_pieces: Arc<RwLock<Bitfield>>,
    disk: Arc<DiskHandle>,
    events: UnboundedSender<SessionEvent>,
    cmd_port: Fuse<Receiver>,
    self_sender: Sender,
    addr: SocketAddr,
    atom_id: AtomId,
    status: Status,
    downloads: std::collections::HashMap<crate::PieceIndex, PieceDownload>,
    /// Requests this peer has sent us that we've accepted and forwarded to
    /// the disk task, but not yet answered. Bounds how many blocks we'll
    /// buffer serving for one peer (spec.md §4.1, 512) and lets an
    /// incoming `Cancel` actually suppress the reply once the disk read
    /// completes instead of sending a block nobody wants anymore.
    served_requests: std::collections::HashSet<BlockInfo>,
    peer_id: Option<PeerId>,
    peer_pieces: Bitfield,
    peer_supports_fast_ext: bool,
    peer_supports_ltep: bool,
    /// The peer's advertised outstanding-request limit from its LTEP
    /// handshake, if any, clamping the desired-request-count formula
    /// (spec.md §4.2).
    peer_reqq: Option<u32>,
    /// This peer's recent download rate (bytes/sec it has sent us), the
    /// `peer_rate` term of the desired-request-count formula.
    download_rate: crate::counter::ThroughputCounter,
    extension_ids: std::collections::HashMap<String, u8>,
    /// Shared with this session's `PeerCodec` once the wire codec is
    /// swapped in after the plain handshake, so `handle_extended` can
    /// update the ids the encoder tags outgoing `Extended` messages with
    /// as soon as the peer's own LTEP handshake arrives.
    remote_ext_ids: Arc<std::sync::Mutex<std::collections::HashMap<String, u8>>>,
    encryption: EncryptionMode,
    last_write: Instant,
    /// Whether any bytes have ever been read from this peer, used to tell a
    /// dead address (no bytes read, flag atom unreachable) apart from a
    /// peer that misbehaved after connecting (spec.md §4.7/§7).
    read_anything: bool,
    /// Non-piece messages waiting for their batch period to elapse (spec.md
    /// §4.1 "Outbound batching"). Piece payloads never enter this queue.
    outbound_batch: Vec<Message>,
    /// When the oldest message currently in `outbound_batch` was appended.
    batch_started_at: Option<Instant>,
    /// The minimum of every priority period pushed into the batch since
    /// the last flush; the batch flushes once this elapses.
    batch_period: Duration,
}

/// How long a batched message may sit before it must go out (spec.md
/// §4.1 "Outbound batching").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Priority {
    Immediate,
    High,
    Low,
}

impl Priority {
    fn period(self) -> Duration {
        match self {
            Priority::Immediate => Duration::from_secs(0),
            Priority::High => Duration::from_secs(2),
            Priority::Low => Duration::from_secs(10),
        }
    }
}

fn message_priority(msg: &Message) -> Priority {
    match msg {
        Message::Have { .. } => Priority::Low,
        Message::Extended(ExtendedMessage::Metadata(_)) | Message::Extended(ExtendedMessage::Pex(_)) => {
            Priority::High
        }
        _ => Priority::Immediate,
    }
}

/// Largest number of a peer's `Request`s we'll hold onto awaiting a disk
/// read before refusing further ones (spec.md §4.1).
const MAX_SERVED_REQUESTS: usize = 512;

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    fn new(
        torrent: Arc<SharedStatus>,
        picker: Arc<RwLock<Picker>>,
        replication: Arc<RwLock<ReplicationMap>>,
        own_pieces: Arc<RwLock<Bitfield>>,
        disk: Arc<DiskHandle>,
        events: UnboundedSender<SessionEvent>,
        addr: SocketAddr,
        atom_id: AtomId,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = torrent.piece_count;
        (
            Self {
                torrent,
                picker,
                replication,
                own_pieces,
                disk,
                events,
                cmd_port: cmd_port.fuse(),
                self_sender: cmd_chan.clone(),
                addr,
                atom_id,
                status: Status::default(),
                downloads: std::collections::HashMap::new(),
                served_requests: std::collections::HashSet::new(),
                peer_id: None,
                peer_pieces: Bitfield::none(piece_count),
                peer_supports_fast_ext: false,
                peer_supports_ltep: false,
                peer_reqq: None,
                download_rate: crate::counter::ThroughputCounter::default(),
                extension_ids: std::collections::HashMap::new(),
                remote_ext_ids: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
                encryption: EncryptionMode::default(),
                last_write: Instant::now(),
                read_anything: false,
                outbound_batch: Vec::new(),
                batch_started_at: None,
                batch_period: Duration::from_secs(10),
            },
            cmd_chan,
        )
    }

    /// Whether this session ever read a byte off the wire, consulted by
    /// [`super::spawn_outbound`]/[`super::spawn_inbound`] after the session
    /// ends to decide whether to flag the atom unreachable.
    pub(crate) fn read_anything(&self) -> bool {
        self.read_anything
    }

    /// Recomputes how many blocks we want outstanding with this peer
    /// (spec.md §4.2 "Desired request count per peer"), called whenever a
    /// choke/unchoke is received. No global rate limiter exists in this
    /// engine, so `torrent_limit`/`session_limit` are treated as
    /// unbounded; the formula reduces to this peer's own observed rate.
    fn recompute_desired_requests(&mut self, now: Instant) {
        if self.status.is_choked || !self.status.is_interested {
            self.status.best_request_queue_len = Some(0);
            return;
        }
        let rate = self.download_rate.rate(now).max(1);
        let block_len = u64::from(crate::BLOCK_LEN);
        let desired = (rate * u64::from(self.torrent.request_buf_secs) / block_len).max(4);
        let desired = match self.peer_reqq {
            Some(reqq) => desired.min(u64::from(reqq)),
            None => desired,
        };
        self.status.best_request_queue_len = Some(desired as usize);
    }

    /// Whether a `Request`'s block falls entirely within its piece, so a
    /// malicious or buggy peer can't make us read (or later, overflow) past
    /// a piece's actual length.
    fn request_in_bounds(&self, info: &BlockInfo) -> bool {
        match self.torrent.piece_len(info.piece_index) {
            Ok(piece_len) => (info.offset as u64) + (info.len as u64) <= piece_len as u64,
            Err(_) => false,
        }
    }

    /// Builds our own LTEP handshake, advertising the torrent's metadata
    /// size unless it's private (BEP 9 doesn't forbid this for private
    /// torrents, but there's no reason to volunteer it to a swarm that
    /// isn't supposed to be discovering peers through anything but its
    /// tracker).
    fn our_extended_handshake(&self) -> ExtendedHandshake {
        let metadata_size = if self.torrent.private {
            None
        } else {
            Some(self.torrent.metainfo.metadata_size())
        };
        ExtendedHandshake::with_metadata_size("peerengine".to_string(), metadata_size, false, None)
    }

    /// Sends a message and records the write for the keepalive timer.
    async fn send(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        sink.send(msg).await?;
        self.last_write = Instant::now();
        Ok(())
    }

    /// Appends a non-piece message to the outbound batch and flushes it if
    /// the batch's period has already elapsed (spec.md §4.1 "Outbound
    /// batching"). An `Immediate` message has a zero period, so it flushes
    /// the whole batch right away, preserving per-peer send order.
    async fn queue_message(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        let priority = message_priority(&msg);
        if self.outbound_batch.is_empty() {
            self.batch_started_at = Some(Instant::now());
            self.batch_period = priority.period();
        } else {
            self.batch_period = self.batch_period.min(priority.period());
        }
        self.outbound_batch.push(msg);
        self.try_flush_batch(sink).await
    }

    /// Flushes the outbound batch if `batch_period` has elapsed since its
    /// oldest message was appended. Called both right after every
    /// `queue_message` and on a fixed tick from `run`'s select loop, so a
    /// `Low`-priority batch with nothing new arriving still goes out.
    async fn try_flush_batch(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let due = match self.batch_started_at {
            Some(started) => started.elapsed() >= self.batch_period,
            None => false,
        };
        if due {
            for msg in self.outbound_batch.drain(..) {
                sink.send(msg).await?;
            }
            self.last_write = Instant::now();
            self.batch_started_at = None;
            self.batch_period = Duration::from_secs(10);
        }
        Ok(())
    }

    /// Builds a session that will dial out to `addr` (caller then calls
    /// [`PeerSession::start`]).
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        picker: Arc<RwLock<Picker>>,
        replication: Arc<RwLock<ReplicationMap>>,
        own_pieces: Arc<RwLock<Bitfield>>,
        disk: Arc<DiskHandle>,
        events: UnboundedSender<SessionEvent>,
        addr: SocketAddr,
        atom_id: AtomId,
    ) -> (Self, Sender) {
        Self::new(torrent, picker, replication, own_pieces, disk, events, addr, atom_id)
    }

    /// Builds a session for a connection the engine's listener already
    /// accepted and identified by info hash (caller then calls
    /// [`PeerSession::start_inbound`] with the handshake it already read
    /// off the wire).
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        picker: Arc<RwLock<Picker>>,
        replication: Arc<RwLock<ReplicationMap>>,
        own_pieces: Arc<RwLock<Bitfield>>,
        disk: Arc<DiskHandle>,
        events: UnboundedSender<SessionEvent>,
        addr: SocketAddr,
        atom_id: AtomId,
    ) -> (Self, Sender) {
        Self::new(torrent, picker, replication, own_pieces, disk, events, addr, atom_id)
    }

    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);
        self.status.state = State::Handshaking;
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id, true);
        socket.send(handshake.clone()).await?;

        let peer_handshake = match socket.next().await {
            Some(Ok(h)) => {
                self.read_anything = true;
                h
            }
            Some(Err(e)) => {
                self.read_anything = true;
                return Err(e);
            }
            None => return Err(Error::ProtocolViolation("peer closed before handshake")),
        };
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.peer_id = Some(peer_handshake.peer_id);
        self.peer_supports_fast_ext = peer_handshake.supports_fast_ext();
        self.peer_supports_ltep = peer_handshake.supports_ltep();
        let _ = self.events.send(SessionEvent::PeerIdentified {
            atom: self.atom_id,
            peer_id: peer_handshake.peer_id,
        });

        let old_parts = socket.into_parts();
        let codec = PeerCodec::new();
        self.remote_ext_ids = codec.remote_ext_ids();
        let mut new_parts = FramedParts::new(old_parts.io, codec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        if self.peer_supports_ltep {
            socket
                .send(Message::Extended(ExtendedMessage::Handshake(self.our_extended_handshake())))
                .await?;
        }

        self.status.state = State::AvailabilityExchange;
        self.run(socket).await
    }

    /// Completes the handshake on a connection the engine's listener
    /// already accepted and peeked the info hash of, then runs the
    /// session to completion. `socket` has already yielded
    /// `peer_handshake` from its decoder; we only need to send ours back.
    pub async fn start_inbound(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        log::info!("Accepted peer {} session", self.addr);
        // the engine's listener already decoded a handshake off this socket
        // to route it here, so bytes have definitely been read.
        self.read_anything = true;
        self.status.state = State::Handshaking;
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.peer_id = Some(peer_handshake.peer_id);
        self.peer_supports_fast_ext = peer_handshake.supports_fast_ext();
        self.peer_supports_ltep = peer_handshake.supports_ltep();
        let _ = self.events.send(SessionEvent::PeerIdentified {
            atom: self.atom_id,
            peer_id: peer_handshake.peer_id,
        });

        let reply = Handshake::new(self.torrent.info_hash, self.torrent.client_id, true);
        socket.send(reply).await?;

        let old_parts = socket.into_parts();
        let codec = PeerCodec::new();
        self.remote_ext_ids = codec.remote_ext_ids();
        let mut new_parts = FramedParts::new(old_parts.io, codec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        if self.peer_supports_ltep {
            socket
                .send(Message::Extended(ExtendedMessage::Handshake(self.our_extended_handshake())))
                .await?;
        }

        self.status.state = State::AvailabilityExchange;
        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut keepalive_timer = interval(self.torrent.keepalive_interval);
        let mut batch_timer = interval(Duration::from_secs(1));

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.read_anything = true;
                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_msg(&mut sink, msg).await?;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_command(&mut sink, cmd).await? {
                        break;
                    }
                }
                _ = keepalive_timer.tick().fuse() => {
                    if self.last_write.elapsed() >= self.torrent.keepalive_interval {
                        self.send(&mut sink, Message::KeepAlive).await?;
                    }
                }
                _ = batch_timer.tick().fuse() => {
                    self.try_flush_batch(&mut sink).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Shutdown => return Ok(false),
            Command::Choke => {
                if !self.status.is_peer_choked {
                    self.status.is_peer_choked = true;
                    self.queue_message(sink, Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    self.queue_message(sink, Message::Unchoke).await?;
                }
            }
            Command::Have(piece_index) => {
                self.queue_message(sink, Message::Have { piece_index }).await?;
            }
            Command::SendBlock(info, data) => {
                // the peer may have cancelled this request while the disk
                // read was in flight; don't bother sending bytes nobody
                // asked for anymore.
                if self.served_requests.remove(&info) {
                    self.send(
                        sink,
                        Message::Block {
                            piece_index: info.piece_index,
                            offset: info.offset,
                            data,
                        },
                    )
                    .await?;
                    let _ = self.events.send(SessionEvent::BlockSent { atom: self.atom_id, info });
                }
            }
            Command::SendPex(msg) => {
                if self.extension_ids.contains_key(super::ltep::UT_PEX) {
                    self.queue_message(sink, Message::Extended(ExtendedMessage::Pex(msg))).await?;
                }
            }
            Command::Cancel(info) => {
                if let Some(d) = self.downloads.get_mut(&info.piece_index) {
                    d.remove_request_from(self.atom_id, &info);
                    if d.is_empty() {
                        self.downloads.remove(&info.piece_index);
                    }
                }
                self.queue_message(sink, Message::Cancel(info)).await?;
            }
            Command::SetInterest(interested) => {
                if interested != self.status.is_interested {
                    self.status.is_interested = interested;
                    if interested {
                        self.queue_message(sink, Message::Interested).await?;
                    } else {
                        self.queue_message(sink, Message::NotInterested).await?;
                    }
                }
            }
        }
        Ok(true)
    }

    async fn handle_availability_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.torrent.piece_count);
                self.peer_pieces = bitfield.clone();
                self.replication.write().await.bump(&bitfield);
                let _ = self.events.send(SessionEvent::BitfieldReceived {
                    atom: self.atom_id,
                    bitfield,
                });
            }
            Message::HaveAll => {
                let bitfield = Bitfield::all(self.torrent.piece_count);
                self.peer_pieces = bitfield.clone();
                self.replication.write().await.bump(&bitfield);
                let _ = self.events.send(SessionEvent::BitfieldReceived {
                    atom: self.atom_id,
                    bitfield,
                });
            }
            Message::HaveNone => {
                self.peer_pieces = Bitfield::none(self.torrent.piece_count);
            }
            Message::Extended(ext) => {
                self.handle_extended(sink, ext).await?;
                return Ok(());
            }
            other => {
                log::debug!("Peer {} sent {:?} before availability", self.addr, other.id());
            }
        }

        self.status.state = State::Connected;
        self.status.is_interested = !self.peer_pieces.is_empty_set();
        if self.status.is_interested {
            self.queue_message(sink, Message::Interested).await?;
        }
        self.recompute_desired_requests(Instant::now());
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone => {
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    self.status.is_choked = true;
                    self.downloads.clear();
                    self.recompute_desired_requests(Instant::now());
                    let _ = self.events.send(SessionEvent::PeerChokedUs { atom: self.atom_id });
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    self.status.is_choked = false;
                    self.recompute_desired_requests(Instant::now());
                    let _ = self.events.send(SessionEvent::PeerUnchokedUs { atom: self.atom_id });
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    self.status.is_peer_interested = true;
                    let _ = self.events.send(SessionEvent::PeerInterested { atom: self.atom_id });
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    self.status.is_peer_interested = false;
                    let _ = self
                        .events
                        .send(SessionEvent::PeerNotInterested { atom: self.atom_id });
                }
            }
            Message::Have { piece_index } => {
                self.peer_pieces.set_piece(piece_index);
                self.replication.write().await.bump_piece(piece_index);
                let _ = self.events.send(SessionEvent::HaveReceived {
                    atom: self.atom_id,
                    piece_index,
                });
            }
            Message::Suggest { .. } | Message::AllowedFast { .. } => {
                // informational hints; the picker doesn't special-case them yet
            }
            Message::Request(info) => {
                let accepted = !self.status.is_peer_choked
                    && self.served_requests.len() < MAX_SERVED_REQUESTS
                    && self.request_in_bounds(&info)
                    && self.own_pieces.read().await.has_piece(info.piece_index);
                if accepted {
                    self.served_requests.insert(info);
                    let _ = self.events.send(SessionEvent::BlockRequested {
                        atom: self.atom_id,
                        info,
                        reply_to: self.self_sender.clone(),
                    });
                } else if self.peer_supports_fast_ext {
                    self.queue_message(sink, Message::Reject(info)).await?;
                }
            }
            Message::Cancel(info) => {
                // the peer no longer wants a block it asked us for; if the
                // disk read hasn't completed yet this suppresses the reply,
                // otherwise it's a no-op since we already sent it.
                self.served_requests.remove(&info);
            }
            Message::Reject(info) => {
                if let Some(d) = self.downloads.get_mut(&info.piece_index) {
                    d.remove_request(&info);
                }
            }
            Message::Block { piece_index, offset, data } => {
                let info = BlockInfo { piece_index, offset, len: data.len() as u32 };
                self.handle_block_msg(info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Extended(ext) => self.handle_extended(sink, ext).await?,
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        ext: ExtendedMessage,
    ) -> Result<()> {
        match ext {
            ExtendedMessage::Handshake(h) => {
                self.peer_reqq = h.reqq;
                *self.remote_ext_ids.lock().unwrap() = h.m.clone();
                self.extension_ids = h.m;
            }
            ExtendedMessage::Metadata(msg) => {
                // requesting metadata ourselves is out of scope: a torrent
                // is never running without its full metainfo already in
                // hand (see engine.rs's add_torrent_by_info_hash split), so
                // we only ever need to serve these, never issue them.
                if msg.kind == MetadataMsgKind::Request {
                    let reply = match self.torrent.metainfo.metadata_piece(msg.piece) {
                        Some(data) if !self.torrent.private => {
                            MetadataMessage::data(msg.piece, self.torrent.metainfo.metadata_size(), data.to_vec())
                        }
                        _ => MetadataMessage::reject(msg.piece),
                    };
                    self.queue_message(sink, Message::Extended(ExtendedMessage::Metadata(reply))).await?;
                }
            }
            ExtendedMessage::Pex(msg) => {
                let _ = self.events.send(SessionEvent::PexReceived {
                    atom: self.atom_id,
                    added: msg.added,
                });
            }
            ExtendedMessage::Unknown { id, payload } => {
                log::trace!("Peer {} sent unknown extension {}: {} bytes", self.addr, id, payload.len());
            }
        }
        Ok(())
    }

    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked && !self.peer_supports_fast_ext {
            return Ok(());
        }
        let want = self.status.best_request_queue_len.unwrap_or(4);
        let outstanding: usize = self.downloads.values().map(|d| d.request_count()).sum();
        if outstanding >= want {
            return Ok(());
        }
        let mut to_request = want - outstanding;
        let mut candidate_pending = outstanding;
        let mut picker = self.picker.write().await;
        let now = Instant::now();
        while to_request > 0 {
            let piece_len = |index: crate::PieceIndex| {
                self.torrent.piece_len(index).unwrap_or(crate::BLOCK_LEN)
            };
            match picker.pick_block(self.atom_id, candidate_pending, to_request, &self.peer_pieces, piece_len, now) {
                Some(info) => {
                    self.downloads
                        .entry(info.piece_index)
                        .or_insert_with(PieceDownload::new)
                        .add_request(info, self.atom_id, now);
                    // picker is borrowed across this loop, so this goes
                    // through sink directly rather than self.send
                    sink.send(Message::Request(info)).await?;
                    to_request -= 1;
                    candidate_pending += 1;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn handle_block_msg(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        let download = match self.downloads.get_mut(&info.piece_index) {
            Some(d) if d.has_pending(&info) => d,
            _ => {
                log::warn!("Peer {} sent unrequested block {:?}", self.addr, info);
                return Ok(());
            }
        };
        download.remove_request(&info);
        self.status.downloaded_block_bytes_count += info.len as u64;
        self.download_rate.record(Instant::now(), u64::from(info.len));

        let mut picker = self.picker.write().await;
        picker.received_block(&info);
        let _ = self.events.send(SessionEvent::BlockReceived { atom: self.atom_id, info });

        if download.is_empty() {
            self.downloads.remove(&info.piece_index);
        }

        self.disk.write_block(self.torrent.id, info, data)?;
        Ok(())
    }
}
