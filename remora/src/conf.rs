use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The client id prefix advertised in handshakes and to trackers, in Azureus
/// style: dash, two letter client abbreviation, four digit version, dash.
const CLIENT_ID_PREFIX: &[u8] = b"-RM0010-";

/// The configuration of a single download.
///
/// All knobs are plain data and are threaded through the engine explicitly;
/// there is no process-global configuration. The defaults produced by
/// [`Conf::new`] are sensible for real swarms, while tests tighten the
/// timeouts to keep runtimes short.
#[derive(Clone, Debug)]
pub struct Conf {
    /// Where the downloaded torrent is placed. Single file torrents download
    /// to `download_dir/name`, archives to `download_dir/name/...`.
    pub download_dir: PathBuf,
    /// Our own id, sent in handshakes and tracker announces. Generated once
    /// per engine run.
    pub client_id: PeerId,
    /// The port reported to trackers. This build never accepts inbound
    /// connections, the port is advertised only because announces require it.
    pub listen_port: u16,
    /// The maximum number of peer sessions kept open at a time.
    pub max_peers: usize,
    /// The number of block requests kept outstanding per peer to saturate the
    /// link.
    pub pipeline_len: usize,
    /// How long to wait for a TCP connect and the subsequent handshake.
    pub connect_timeout: Duration,
    /// How long an outstanding block request may go unanswered before it is
    /// handed back to the piece selector.
    pub request_timeout: Duration,
    /// A keepalive frame is sent if nothing else was written for this long.
    pub keep_alive_interval: Duration,
    /// The session is dropped if the peer sends nothing for this long.
    pub inactivity_timeout: Duration,
    /// The first reconnect to a dropped peer waits this long. Each further
    /// failure doubles the wait.
    pub min_reconnect_backoff: Duration,
    /// The reconnect backoff ceiling.
    pub max_reconnect_backoff: Duration,
    /// Used when the tracker does not provide an announce interval.
    pub default_announce_interval: Duration,
}

impl Conf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            client_id: gen_client_id(),
            listen_port: 51413,
            max_peers: 50,
            pipeline_len: 8,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(120),
            min_reconnect_backoff: Duration::from_secs(15),
            max_reconnect_backoff: Duration::from_secs(300),
            default_announce_interval: Duration::from_secs(60),
        }
    }
}

/// Generates a new peer id: the client prefix followed by random digits.
fn gen_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id.iter_mut().skip(CLIENT_ID_PREFIX.len()) {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}
