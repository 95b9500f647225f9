//! The peer wire protocol and per-connection session (spec.md §4.1).
//!
//! A [`PeerSession`] speaks the wire protocol for exactly one TCP
//! connection. It reports everything a torrent needs to make cross-peer
//! decisions (availability, chokes, completed blocks) as [`SessionEvent`]s
//! rather than mutating shared state directly, so the atom pool,
//! replication map, and choke controller all stay owned by the torrent.

mod codec;
mod handshake;
mod ltep;
mod message;
mod session;

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpStream, sync::RwLock};
use tokio_util::codec::Framed;

use crate::{
    atom::AtomId, choke::ChokeState, counter::ThroughputCounter, disk::DiskHandle, picker::Picker,
    replication::ReplicationMap,
};

pub(crate) use codec::{Handshake, HandshakeCodec};
pub(crate) use ltep::{PexMessage, PexPeer, METADATA_PIECE_LEN};
pub(crate) use session::{Command, PeerSession, Sender, SessionEvent, SharedStatus};

/// A torrent's handle onto one live peer session: the command channel to
/// it, plus the identity the torrent needs to correlate incoming
/// [`SessionEvent`]s back to an atom.
pub(crate) struct PeerHandle {
    pub atom_id: AtomId,
    pub addr: SocketAddr,
    chan: Sender,
}

impl PeerHandle {
    pub fn choke(&self) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::Choke)?)
    }

    pub fn unchoke(&self) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::Unchoke)?)
    }

    pub fn send_have(&self, piece_index: crate::PieceIndex) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::Have(piece_index))?)
    }

    pub fn send_block(&self, info: crate::BlockInfo, data: Vec<u8>) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::SendBlock(info, data))?)
    }

    pub fn send_pex(&self, msg: PexMessage) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::SendPex(msg))?)
    }

    pub fn cancel(&self, info: crate::BlockInfo) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::Cancel(info))?)
    }

    pub fn set_interest(&self, interested: bool) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::SetInterest(interested))?)
    }

    pub fn shutdown(&self) -> crate::error::Result<()> {
        Ok(self.chan.send(Command::Shutdown)?)
    }
}

/// Spawns a session that connects out to `addr` and runs it to completion
/// in its own task. `events` is the torrent-wide channel every session of a
/// torrent reports to.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_outbound(
    torrent: Arc<SharedStatus>,
    picker: Arc<RwLock<Picker>>,
    replication: Arc<RwLock<ReplicationMap>>,
    own_pieces: Arc<RwLock<crate::Bitfield>>,
    disk: Arc<DiskHandle>,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    addr: SocketAddr,
    atom_id: AtomId,
) -> PeerHandle {
    let disconnect_events = events.clone();
    let (mut session, chan) =
        PeerSession::outbound(torrent, picker, replication, own_pieces, disk, events, addr, atom_id);
    tokio::task::spawn(async move {
        let result = session.start().await;
        if let Err(e) = &result {
            log::info!("Peer {} session ended: {}", addr, e);
        }
        let _ = disconnect_events.send(SessionEvent::Disconnected {
            atom: atom_id,
            succeeded: result.is_ok(),
            read_anything: session.read_anything(),
        });
    });
    PeerHandle { atom_id, addr, chan }
}

/// Spawns a session that completes the handshake on an already-accepted
/// connection (the engine's listener read `peer_handshake` off `socket`
/// to learn which torrent it's for before calling this).
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_inbound(
    torrent: Arc<SharedStatus>,
    picker: Arc<RwLock<Picker>>,
    replication: Arc<RwLock<ReplicationMap>>,
    own_pieces: Arc<RwLock<crate::Bitfield>>,
    disk: Arc<DiskHandle>,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    addr: SocketAddr,
    atom_id: AtomId,
    socket: Framed<TcpStream, HandshakeCodec>,
    peer_handshake: Handshake,
) -> PeerHandle {
    let disconnect_events = events.clone();
    let (mut session, chan) =
        PeerSession::inbound(torrent, picker, replication, own_pieces, disk, events, addr, atom_id);
    tokio::task::spawn(async move {
        let result = session.start_inbound(socket, peer_handshake).await;
        if let Err(e) = &result {
            log::info!("Peer {} session ended: {}", addr, e);
        }
        let _ = disconnect_events.send(SessionEvent::Disconnected {
            atom: atom_id,
            succeeded: result.is_ok(),
            read_anything: session.read_anything(),
        });
    });
    PeerHandle { atom_id, addr, chan }
}

/// Per-peer choke bookkeeping a torrent keeps alongside its [`PeerHandle`],
/// fed by the peer's reported events and consulted on each rechoke tick
/// (spec.md §4.4). Kept outside the session itself since rechoking compares
/// candidates across an entire torrent's peer set.
pub(crate) struct PeerBookkeeping {
    pub choke: ChokeState,
    /// Bytes/sec this peer has sent us, feeding rechoke's rate ranking
    /// while leeching.
    pub download_rate: ThroughputCounter,
    /// Bytes/sec we've sent this peer, feeding rechoke's rate ranking
    /// while seeding (or summed with `download_rate` for a private
    /// torrent).
    pub upload_rate: ThroughputCounter,
    pub connected_at: std::time::Instant,
    /// Consecutive pieces this atom has contributed a block to that
    /// later failed the hash check. Crosses `max_strikes` to a ban
    /// (spec.md §6 "integrity failure").
    pub blame: u32,
    /// Last time this peer did anything worth keeping it around for
    /// (sent us a block, a have, declared interest, ...), feeding the
    /// reconnect pulse's idle-close check (spec.md §4.5 step 3).
    pub last_activity: std::time::Instant,
}

impl Default for PeerBookkeeping {
    fn default() -> Self {
        let now = std::time::Instant::now();
        Self {
            choke: ChokeState::default(),
            download_rate: ThroughputCounter::default(),
            upload_rate: ThroughputCounter::default(),
            connected_at: now,
            blame: 0,
            last_activity: now,
        }
    }
}
