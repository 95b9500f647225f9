//! The torrent manager: the crate's top-level handle (spec.md §6 "To the
//! torrent manager"). Owns the disk task, the incoming connection gate,
//! and the registry of running torrents; every public entry point
//! acquires [`EngineState`]'s lock, giving the engine single-writer,
//! many-reader semantics over its own bookkeeping (spec.md §5).

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::{net::TcpListener, sync::RwLock, task::JoinHandle};
use tokio_util::codec::Framed;

use crate::{
    conf::Conf,
    disk::{Alert, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{Handshake, HandshakeCodec},
    storage_info::StorageInfo,
    torrent::{Command as TorrentCommand, CommandSender, Torrent},
    Sha1Hash, TorrentId,
};

/// A registered torrent's handle: enough for the engine to route an
/// incoming connection to it by info hash and to stop its task.
struct TorrentHandle {
    info_hash: Sha1Hash,
    command_chan: CommandSender,
    join_handle: JoinHandle<Result<()>>,
}

/// Everything the engine mutates across its public entry points, behind
/// one lock so `add_torrent`/`remove_torrent`/the listener all see a
/// consistent registry. The disk's engine-scoped alert port lives here
/// too: only the task holding the write half of the lock ever polls it,
/// which is what lets `add_torrent` match the `TorrentAllocation` alert
/// it caused to the one it's awaiting without a separate correlation id.
struct EngineState {
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
    alert_port: crate::disk::AlertReceiver,
    /// Torrents registered by info hash alone, awaiting metadata from a
    /// peer's LTEP exchange before their storage layout can be allocated
    /// (spec.md §6, `torrent_got_metadata`).
    pending_metadata: HashMap<TorrentId, Sha1Hash>,
}

/// The crate's top-level handle. Torrents run as independent tasks; the
/// engine tracks them only for lookup, routing, and lifecycle control.
pub struct Engine {
    conf: Conf,
    disk: Arc<DiskHandle>,
    state: Arc<RwLock<EngineState>>,
    listener_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the disk task; does not yet listen for incoming
    /// connections (call [`Engine::start`] for that).
    pub fn new(conf: Conf) -> Result<Self> {
        let (disk, alert_port) = DiskHandle::spawn()?;
        Ok(Self {
            conf,
            disk: Arc::new(disk),
            state: Arc::new(RwLock::new(EngineState {
                torrents: HashMap::new(),
                next_id: 0,
                alert_port,
                pending_metadata: HashMap::new(),
            })),
            listener_task: None,
        })
    }

    /// Starts accepting incoming peer connections on `listen_addr` and
    /// routing each one to the torrent its handshake names, by info hash
    /// (spec.md §6 "incoming connection gate").
    pub async fn start(&mut self, listen_addr: SocketAddr) -> Result<()> {
        let mut listener = TcpListener::bind(listen_addr).await?;
        log::info!("Listening for incoming peer connections on {}", listen_addr);
        let state = Arc::clone(&self.state);
        self.listener_task = Some(tokio::task::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::task::spawn(async move {
                            if let Err(e) = Self::greet_inbound(state, socket, addr).await {
                                log::debug!("Inbound connection from {} dropped: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Incoming connection listener error: {}", e);
                    }
                }
            }
        }));
        Ok(())
    }

    /// Reads the handshake off a freshly accepted connection and, if it
    /// names a torrent we're running, hands the connection off to it.
    async fn greet_inbound(
        state: Arc<RwLock<EngineState>>,
        socket: tokio::net::TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        use futures::StreamExt;

        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = match socket.next().await {
            Some(h) => h?,
            None => return Err(Error::ProtocolViolation("peer closed before handshake")),
        };

        let command_chan = {
            let state = state.read().await;
            state
                .torrents
                .values()
                .find(|t| t.info_hash == handshake.info_hash)
                .map(|t| t.command_chan.clone())
        };
        match command_chan {
            Some(chan) => {
                chan.send(TorrentCommand::InboundPeer { addr, socket, handshake })
                    .map_err(|_| Error::ChannelClosed)?;
                Ok(())
            }
            None => Err(Error::InvalidPeerInfoHash),
        }
    }

    /// Stops the incoming connection listener, every running torrent, and
    /// the disk task.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        let mut state = self.state.write().await;
        for (_, torrent) in state.torrents.drain() {
            let _ = torrent.command_chan.send(TorrentCommand::Stop);
            torrent.join_handle.abort();
        }
        self.disk.request_shutdown()
    }

    /// Parses a `.torrent` file's bytes, allocates its on-disk layout, and
    /// starts its runtime task, returning the id the engine assigned it.
    pub async fn add_torrent(&self, metainfo_bytes: &[u8], download_dir: Option<PathBuf>) -> Result<TorrentId> {
        let metainfo = Metainfo::from_bytes(metainfo_bytes)?;
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;
        self.allocate_and_spawn(&mut state, id, &metainfo, download_dir).await?;
        Ok(id)
    }

    /// Registers a torrent by info hash alone, before its metadata has
    /// been obtained (e.g. from a magnet link). The torrent isn't started
    /// until [`Engine::torrent_got_metadata`] supplies the full metainfo.
    pub async fn add_torrent_by_info_hash(&self, info_hash: Sha1Hash) -> TorrentId {
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;
        state.pending_metadata.insert(id, info_hash);
        id
    }

    /// Completes a torrent previously registered via
    /// [`Engine::add_torrent_by_info_hash`] once its metadata has been
    /// assembled from a peer's LTEP metadata exchange (spec.md §6).
    pub async fn torrent_got_metadata(
        &self,
        id: TorrentId,
        metainfo: Metainfo,
        download_dir: Option<PathBuf>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let expected = state
            .pending_metadata
            .get(&id)
            .copied()
            .ok_or(Error::InvalidTorrentId)?;
        if expected != metainfo.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        state.pending_metadata.remove(&id);
        self.allocate_and_spawn(&mut state, id, &metainfo, download_dir).await
    }

    async fn allocate_and_spawn(
        &self,
        state: &mut EngineState,
        id: TorrentId,
        metainfo: &Metainfo,
        download_dir: Option<PathBuf>,
    ) -> Result<()> {
        let mut torrent_conf = self.conf.torrent.clone();
        if let Some(dir) = download_dir {
            torrent_conf.download_dir = dir;
        }
        if metainfo.private {
            torrent_conf.pex_enabled = false;
            torrent_conf.private = true;
        }

        let storage = StorageInfo::new(metainfo, torrent_conf.download_dir.clone());
        self.disk
            .new_torrent(id, storage, metainfo.piece_hashes_bytes().to_vec())?;

        let alert_port = loop {
            match state.alert_port.recv().await {
                Some(Alert::TorrentAllocation(Ok(alloc))) if alloc.id == id => {
                    break alloc.alert_port;
                }
                Some(Alert::TorrentAllocation(Ok(_))) => continue,
                Some(Alert::TorrentAllocation(Err(e))) => {
                    return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                }
                None => return Err(Error::ChannelClosed),
            }
        };

        let (torrent, command_chan) = Torrent::new(
            id,
            self.conf.engine.client_id,
            metainfo,
            torrent_conf,
            Arc::clone(&self.disk),
            alert_port,
        );
        let join_handle = tokio::task::spawn(torrent.run());
        state.torrents.insert(
            id,
            TorrentHandle {
                info_hash: metainfo.info_hash,
                command_chan,
                join_handle,
            },
        );
        Ok(())
    }

    /// Stops and deregisters a single torrent.
    pub async fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        let mut state = self.state.write().await;
        let torrent = state.torrents.remove(&id).ok_or(Error::InvalidTorrentId)?;
        let _ = torrent.command_chan.send(TorrentCommand::Stop);
        torrent.join_handle.abort();
        Ok(())
    }
}
