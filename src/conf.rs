//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Number of upload slots the choke controller unchokes per rechoke
    /// (spec.md §4.4 step 4), not counting the optimistic slot.
    pub upload_slots: usize,

    /// Lower bound on the interest list (spec.md §4.4): `max_peers` is
    /// adaptively shrunk/grown between this and `max_connected_peer_count`.
    pub min_interested_peers: usize,

    /// How many rechoke ticks an optimistically-unchoked peer is immune
    /// from rechoking (spec.md §4.4 step 5).
    pub optimistic_unchoke_ticks: u32,

    /// How many seconds of requests we try to keep buffered with a peer
    /// (the `REQUEST_BUF_SECS` term in spec.md §4.2's desired-request-count
    /// formula).
    pub request_buf_secs: u32,

    /// Age at which an outstanding block request is eligible for timed
    /// cancellation (spec.md §4.2, 120s).
    pub request_timeout: Duration,

    /// Strikes a peer can accumulate for contributing to corrupt pieces
    /// before its atom is banned (spec.md §7, 5 strikes).
    pub max_strikes: u32,

    /// Period of the rechoke/refill-upkeep timers (spec.md §4.4/§4.2, 10s).
    pub rechoke_interval: Duration,

    /// Period of the lifecycle controller's reconnect pulse (spec.md §4.5,
    /// 500ms).
    pub reconnect_pulse_interval: Duration,

    /// Period of the atom pool maintenance sweep (spec.md §4.6, 60s).
    pub atom_ageing_interval: Duration,

    /// Number of new outbound connections the lifecycle controller may
    /// start per reconnect pulse (spec.md §4.5, 6 per 500ms tick).
    pub max_connect_attempts_per_pulse: usize,

    /// How long a peer session may go without writing anything before a
    /// keepalive is sent (spec.md §4.1, 100s).
    pub keepalive_interval: Duration,

    /// PEX gossip period (spec.md §4.1, 90s).
    pub pex_interval: Duration,

    /// Whether PEX is enabled for this torrent (disabled for private
    /// torrents).
    pub pex_enabled: bool,

    /// Whether this torrent is private (no DHT, no PEX, no unofficial
    /// trackers).
    pub private: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            upload_slots: 4,
            min_interested_peers: 5,
            optimistic_unchoke_ticks: 4,
            request_buf_secs: 10,
            request_timeout: Duration::from_secs(120),
            max_strikes: 5,
            rechoke_interval: Duration::from_secs(10),
            reconnect_pulse_interval: Duration::from_millis(500),
            atom_ageing_interval: Duration::from_secs(60),
            max_connect_attempts_per_pulse: 6,
            keepalive_interval: Duration::from_secs(100),
            pex_interval: Duration::from_secs(90),
            pex_enabled: true,
            private: false,
        }
    }
}
