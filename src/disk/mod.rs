//! The disk IO subsystem.
//!
//! Disk access is isolated in its own task (`Disk::start`) so that neither
//! the torrent's nor a peer session's async task ever blocks on a syscall.
//! Callers talk to it through a [`DiskHandle`], which is just a command
//! channel plus a join handle for the spawned actor task.

mod error;
mod io;
mod iovecs {
    pub use crate::iovecs::{IoVec, IoVecs};
}

pub(crate) use error::{NewTorrentError, Result, WriteError};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{error::Error, storage_info::StorageInfo, BlockInfo, TorrentId};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands the engine (or a torrent/peer session) may send to the disk
/// task.
pub(crate) enum Command {
    /// Registers a new torrent, creating its file system layout.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Enqueues a downloaded block for writing. Once the block completes a
    /// piece, the piece is hashed and, if valid, flushed to disk.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block back off disk, for serving to a peer we're seeding to.
    ReadBlock { id: TorrentId, info: BlockInfo },
    Shutdown,
}

/// Alerts the disk task sends back to the engine, not tied to any one
/// torrent (e.g. allocation results, since the torrent doesn't exist in
/// the engine's registry until allocation succeeds).
pub(crate) enum Alert {
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

/// Sent on successful torrent allocation: the id (echoed back so the
/// engine can correlate it with its pending request) and the channel on
/// which this torrent's disk alerts will subsequently arrive.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts scoped to a single torrent.
pub(crate) enum TorrentAlert {
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
    BlockRead(std::result::Result<(BlockInfo, Vec<u8>), WriteError>),
}

/// The result of writing a piece's blocks to disk: which blocks were
/// persisted and whether the piece as a whole hashed correctly.
pub(crate) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: Option<bool>,
}

/// A handle to the disk task, held by the engine.
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl DiskHandle {
    /// Spawns the disk task and returns a handle to it plus the channel on
    /// which engine-scoped alerts (currently just allocation results)
    /// arrive.
    pub(crate) fn spawn() -> Result<(Self, AlertReceiver)> {
        let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
        let join_handle = tokio::task::spawn(async move { disk.start().await });
        Ok((
            Self {
                cmd_chan,
                join_handle: Some(join_handle),
            },
            alert_port,
        ))
    }

    pub(crate) fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
        })?)
    }

    pub(crate) fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub(crate) fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReadBlock { id, info })?)
    }

    /// Requests the disk task stop, without waiting for it to drain. Used
    /// by the engine when it only holds a shared `Arc<DiskHandle>` and so
    /// can't call [`DiskHandle::shutdown`], which needs to own the join
    /// handle.
    pub(crate) fn request_shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        if let Some(handle) = self.join_handle.take() {
            handle
                .await
                .map_err(|_| Error::ProtocolViolation("disk task panicked"))??;
        }
        Ok(())
    }
}
