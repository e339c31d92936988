//! The engine wires the components of a download together: it spawns the
//! disk task, builds the shared piece map, and runs the coordinator to
//! completion on the current async runtime.

use std::{net::SocketAddr, sync::Arc};

use reqwest::Url;
use tokio::sync::RwLock;

use crate::{
    conf::Conf,
    disk,
    error::*,
    metainfo::Metainfo,
    piece_map::PieceMap,
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentContext},
    tracker::Tracker,
};

/// Downloads the torrent described by the metainfo into the configured
/// download directory.
///
/// Peers are learned from the metainfo's tracker(s); `extra_peers` are
/// connected in addition, which allows downloading from known seeds without
/// any tracker at all. The call returns once every piece is verified and
/// flushed to disk, or with the first fatal error.
pub async fn download(
    conf: Conf,
    metainfo: Metainfo,
    extra_peers: Vec<SocketAddr>,
) -> Result<()> {
    let storage = StorageInfo::new(&metainfo, &conf.download_dir);
    log::info!(
        "Torrent '{}': {} piece(s), {} bytes, download dir {:?}",
        metainfo.info.name,
        storage.piece_count,
        storage.download_len,
        storage.download_dir,
    );
    log::info!("Info hash: {}", hex::encode(metainfo.info_hash));

    let trackers: Vec<Tracker> = metainfo
        .trackers()
        .into_iter()
        .filter_map(|url| match url.parse::<Url>() {
            Ok(url) => Some(Tracker::new(url)),
            Err(e) => {
                log::warn!("Skipping invalid tracker URL {}: {}", url, e);
                None
            }
        })
        .collect();

    let (disk_join_handle, disk, disk_alert_port) =
        disk::spawn(storage.clone(), metainfo.info.pieces.clone())?;

    let ctx = Arc::new(TorrentContext {
        info_hash: metainfo.info_hash,
        client_id: conf.client_id,
        piece_map: RwLock::new(PieceMap::new(&storage)),
        storage,
        conf,
    });

    let mut torrent =
        Torrent::new(ctx, disk, disk_alert_port, trackers, &extra_peers);
    let result = torrent.start().await;

    // the coordinator already sent the disk task its shutdown command; wait
    // for the final flush before reporting the outcome
    match disk_join_handle.await {
        Ok(Err(e)) => log::warn!("Disk task error on shutdown: {}", e),
        Err(e) => log::warn!("Disk task panicked: {}", e),
        Ok(Ok(())) => (),
    }

    result
}
