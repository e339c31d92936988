use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    task, time,
};

use crate::{
    conf::Conf,
    disk::{Alert as DiskAlert, AlertReceiver, DiskHandle},
    error::*,
    peer::{self, PeerSession},
    piece_map::PieceMap,
    storage_info::StorageInfo,
    tracker::{Announce, Event as AnnounceEvent, Tracker},
    BlockInfo, PeerId, Sha1Hash,
};

/// Consecutive full announce failures tolerated before the engine gives up,
/// provided it has no peers left to work with either.
const MAX_ANNOUNCE_FAILURES: u32 = 5;

/// Information of the torrent shared with the peer sessions.
pub(crate) struct TorrentContext {
    /// The info hash of the torrent, derived from its metainfo. This is used
    /// to identify the torrent with other peers and trackers.
    pub info_hash: Sha1Hash,
    /// Our own id, advertised to peers and trackers.
    pub client_id: PeerId,
    /// Storage related information of the torrent.
    pub storage: StorageInfo,
    /// The shared piece and request accounting. Mutated by sessions and the
    /// coordinator alike; the lock is only ever held across short,
    /// non-suspending operations.
    pub piece_map: RwLock<PieceMap>,
    /// The engine configuration.
    pub conf: Conf,
}

/// Notifications sent by the per-peer session tasks to the coordinator.
enum Event {
    SessionStopped {
        addr: SocketAddr,
        result: Result<(), crate::peer::error::PeerError>,
    },
}

/// The coordinator's bookkeeping of a peer address it knows about.
#[derive(Default)]
struct PeerRecord {
    /// Whether a session to this address is currently running.
    connected: bool,
    /// How many times in a row a session to this address has failed.
    failures: u32,
    /// Do not reconnect before this instant. `None` means the address may be
    /// tried right away.
    next_attempt: Option<Instant>,
}

/// The coordinator of a single download.
///
/// Owns the peer list, spawns up to the configured number of concurrent
/// sessions sharing the piece map and the disk handle, reaps timed out
/// requests, keeps the tracker(s) posted, and terminates when the piece map
/// reports completion.
pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    /// The handle to the disk IO task, used to issue commands on it. A copy
    /// of this handle is passed down to each peer session.
    disk: DiskHandle,
    /// The port on which the disk task reports the resume scan and piece
    /// write results.
    disk_alert_port: AlertReceiver,
    /// The torrent's trackers, in announce order.
    trackers: Vec<Tracker>,
    /// The command channels of the running peer sessions.
    peers: HashMap<SocketAddr, peer::Sender>,
    /// Every peer address we ever learned about, with reconnect bookkeeping.
    known_peers: HashMap<SocketAddr, PeerRecord>,
    /// Cloned into every spawned session task so it can report its end.
    event_chan: UnboundedSender<Event>,
    event_port: UnboundedReceiver<Event>,
    /// When the next periodic announce (or announce retry) is due.
    next_announce: Option<Instant>,
    announce_failures: u32,
    announced_started: bool,
    completed: bool,
    start_time: Option<Instant>,
}

impl Torrent {
    pub fn new(
        ctx: Arc<TorrentContext>,
        disk: DiskHandle,
        disk_alert_port: AlertReceiver,
        trackers: Vec<Tracker>,
        initial_peers: &[SocketAddr],
    ) -> Self {
        let (event_chan, event_port) = mpsc::unbounded_channel();
        let known_peers = initial_peers
            .iter()
            .map(|addr| (*addr, PeerRecord::default()))
            .collect();
        Self {
            ctx,
            disk,
            disk_alert_port,
            trackers,
            peers: HashMap::new(),
            known_peers,
            event_chan,
            event_port,
            next_announce: None,
            announce_failures: 0,
            announced_started: false,
            completed: false,
            start_time: None,
        }
    }

    /// Runs the download to completion.
    ///
    /// Returns normally once all pieces are verified and flushed, or with an
    /// error on a fatal condition. Either way all sessions are shut down,
    /// the tracker is told, and the disk task is asked to flush.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent");
        self.start_time = Some(Instant::now());

        // before any peer connection is made, the disk task reports which
        // pieces are already complete on disk from an earlier run
        match self.disk_alert_port.recv().await {
            Some(DiskAlert::ResumeScan(Ok(resumed))) => {
                let mut piece_map = self.ctx.piece_map.write().await;
                piece_map.register_resumed(&resumed);
            }
            Some(DiskAlert::ResumeScan(Err(e))) => {
                log::error!("Fatal storage error in resume scan: {}", e);
                let _ = self.disk.shutdown();
                return Err(Error::Scan(e));
            }
            Some(_) | None => return Err(Error::Channel),
        }

        if self.ctx.piece_map.read().await.is_complete() {
            log::info!("Torrent already complete on disk, nothing to do");
            self.completed = true;
            let _ = self.disk.shutdown();
            return Ok(());
        }

        if self.trackers.is_empty() && self.known_peers.is_empty() {
            let _ = self.disk.shutdown();
            return Err(Error::NoPeerSource);
        }

        let result = self.run().await;
        self.shutdown().await;
        result
    }

    async fn run(&mut self) -> Result<()> {
        // learn the first peers from the tracker, then open sessions
        if !self.trackers.is_empty() {
            self.announce(Some(AnnounceEvent::Started)).await?;
        }
        self.connect_peers();

        let mut tick_timer = time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    self.tick().await?;
                }
                disk_alert = self.disk_alert_port.recv() => {
                    match disk_alert {
                        Some(alert) => {
                            if self.handle_disk_alert(alert).await? {
                                return Ok(());
                            }
                        }
                        None => return Err(Error::Channel),
                    }
                }
                event = self.event_port.recv() => {
                    match event {
                        Some(Event::SessionStopped { addr, result }) => {
                            self.handle_session_stopped(addr, result);
                        }
                        None => return Err(Error::Channel),
                    }
                }
            }
        }
    }

    /// The coordinator's once-a-second housekeeping: reap request timeouts,
    /// fire the periodic announce, open sessions to newly available peers,
    /// and log progress.
    async fn tick(&mut self) -> Result<()> {
        let reaped = self
            .ctx
            .piece_map
            .write()
            .await
            .reap_timeouts(Instant::now(), self.ctx.conf.request_timeout);
        if !reaped.is_empty() {
            let mut by_peer: HashMap<SocketAddr, Vec<BlockInfo>> =
                HashMap::new();
            for (peer, block) in reaped {
                by_peer.entry(peer).or_default().push(block);
            }
            for (peer, blocks) in by_peer {
                log::warn!(
                    "{} request(s) to {} timed out",
                    blocks.len(),
                    peer
                );
                if let Some(chan) = self.peers.get(&peer) {
                    let _ = chan.send(peer::Command::ReqsTimedOut(blocks));
                }
            }
        }

        if let Some(next_announce) = self.next_announce {
            if !self.trackers.is_empty() && Instant::now() >= next_announce {
                self.announce(None).await?;
            }
        }

        self.connect_peers();

        let (downloaded, left, missing) = {
            let piece_map = self.ctx.piece_map.read().await;
            (
                piece_map.downloaded(),
                piece_map.left(),
                piece_map.missing_count(),
            )
        };
        log::debug!(
            "Progress: {} piece(s) missing, {} b downloaded, {} b left, \
            {} peer(s)",
            missing,
            downloaded,
            left,
            self.peers.len()
        );

        Ok(())
    }

    /// Announces to the first tracker that responds.
    ///
    /// On success the returned peers are merged into the known peer list and
    /// the next periodic announce is scheduled. Failures are retried with
    /// backoff and only become fatal once the engine has no tracker response
    /// and no peers whatsoever to fall back to.
    async fn announce(
        &mut self,
        event: Option<AnnounceEvent>,
    ) -> Result<()> {
        let (downloaded, left) = {
            let piece_map = self.ctx.piece_map.read().await;
            (piece_map.downloaded(), piece_map.left())
        };

        let mut last_error = None;
        for tracker in &self.trackers {
            let params = Announce {
                info_hash: self.ctx.info_hash,
                peer_id: self.ctx.client_id,
                port: self.ctx.conf.listen_port,
                ip: None,
                downloaded,
                uploaded: 0,
                left,
                peer_count: Some(self.ctx.conf.max_peers),
                event,
            };
            match tracker.announce(params).await {
                Ok(resp) => {
                    log::info!(
                        "Tracker {} returned {} peer(s)",
                        tracker,
                        resp.peers.len()
                    );
                    for addr in &resp.peers {
                        self.known_peers.entry(*addr).or_default();
                    }
                    let interval = resp
                        .announce_interval()
                        .unwrap_or(self.ctx.conf.default_announce_interval);
                    self.next_announce = Some(Instant::now() + interval);
                    self.announce_failures = 0;
                    if event == Some(AnnounceEvent::Started) {
                        self.announced_started = true;
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Announce to {} failed: {}", tracker, e);
                    last_error = Some(e);
                }
            }
        }

        // every tracker failed; retry with backoff, fatally only if there
        // are no peers left to make progress with either
        self.announce_failures += 1;
        let exp = self.announce_failures.saturating_sub(1).min(4);
        let backoff = Duration::from_secs(30) * 2u32.pow(exp);
        self.next_announce = Some(Instant::now() + backoff);

        if self.announce_failures >= MAX_ANNOUNCE_FAILURES
            && self.peers.is_empty()
            && self.known_peers.is_empty()
        {
            if let Some(e) = last_error {
                return Err(Error::Tracker(e));
            }
        }
        Ok(())
    }

    /// Opens sessions to available peer addresses, up to the configured
    /// session cap. Fresh peers are preferred over previously dropped ones,
    /// which become eligible again once their reconnect backoff expires.
    fn connect_peers(&mut self) {
        let now = Instant::now();
        let mut candidates: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .filter(|(_, record)| {
                !record.connected
                    && record.next_attempt.map_or(true, |at| now >= at)
            })
            .map(|(addr, _)| *addr)
            .collect();
        candidates.sort_by_key(|addr| self.known_peers[addr].failures);

        for addr in candidates {
            if self.peers.len() >= self.ctx.conf.max_peers {
                break;
            }
            self.spawn_session(addr);
        }
    }

    fn spawn_session(&mut self, addr: SocketAddr) {
        log::info!("Connecting to peer {}", addr);
        self.known_peers.entry(addr).or_default().connected = true;

        let (mut session, cmd_chan) = PeerSession::new(
            Arc::clone(&self.ctx),
            self.disk.clone(),
            addr,
        );
        self.peers.insert(addr, cmd_chan);

        let events = self.event_chan.clone();
        task::spawn(async move {
            let result = session.start().await;
            // the coordinator may already be gone during shutdown
            let _ = events.send(Event::SessionStopped { addr, result });
        });
    }

    fn handle_session_stopped(
        &mut self,
        addr: SocketAddr,
        result: Result<(), crate::peer::error::PeerError>,
    ) {
        self.peers.remove(&addr);
        let conf = &self.ctx.conf;
        let record = self.known_peers.entry(addr).or_default();
        record.connected = false;
        match result {
            Ok(()) => log::info!("Peer {} session ended", addr),
            Err(e) => {
                log::warn!("Peer {} session failed: {}", addr, e);
                record.failures += 1;
                let backoff = reconnect_backoff(conf, record.failures);
                record.next_attempt = Some(Instant::now() + backoff);
                log::debug!(
                    "Peer {} reconnect backoff: {} s",
                    addr,
                    backoff.as_secs()
                );
            }
        }
        self.connect_peers();
    }

    /// Applies a disk alert. Returns true when the download just completed.
    async fn handle_disk_alert(&mut self, alert: DiskAlert) -> Result<bool> {
        match alert {
            DiskAlert::PieceWrite(Ok(write)) => {
                if write.is_valid {
                    let missing = {
                        let mut piece_map = self.ctx.piece_map.write().await;
                        piece_map.on_verified(write.index);
                        piece_map.missing_count()
                    };
                    log::info!(
                        "Piece {} verified and flushed, {} piece(s) left",
                        write.index,
                        missing
                    );
                    if missing == 0 {
                        log::info!("Torrent download complete");
                        self.completed = true;
                        return Ok(true);
                    }
                } else {
                    // the piece is corrupt: reset it and drop every session
                    // that contributed blocks to it
                    let contributors = self
                        .ctx
                        .piece_map
                        .write()
                        .await
                        .on_verify_failed(write.index);
                    log::warn!(
                        "Piece {} failed verification, dropping {} \
                        contributing peer(s)",
                        write.index,
                        contributors.len()
                    );
                    for addr in contributors {
                        let conf = &self.ctx.conf;
                        if let Some(record) = self.known_peers.get_mut(&addr)
                        {
                            record.failures += 1;
                            record.next_attempt = Some(
                                Instant::now()
                                    + reconnect_backoff(
                                        conf,
                                        record.failures,
                                    ),
                            );
                        }
                        if let Some(chan) = self.peers.get(&addr) {
                            let _ = chan.send(peer::Command::Shutdown);
                        }
                    }
                }
                Ok(false)
            }
            DiskAlert::PieceWrite(Err(e)) => {
                log::error!("Fatal storage error: {}", e);
                Err(Error::Storage(e))
            }
            DiskAlert::ResumeScan(_) => {
                log::warn!("Unexpected resume scan alert, ignoring");
                Ok(false)
            }
        }
    }

    /// Shuts the torrent down: closes all sessions, tells the tracker, and
    /// asks the disk task to flush.
    async fn shutdown(&mut self) {
        log::info!("Shutting down torrent");
        for (_, chan) in self.peers.drain() {
            let _ = chan.send(peer::Command::Shutdown);
        }

        if self.announced_started {
            let event = if self.completed {
                AnnounceEvent::Completed
            } else {
                AnnounceEvent::Stopped
            };
            let (downloaded, left) = {
                let piece_map = self.ctx.piece_map.read().await;
                (piece_map.downloaded(), piece_map.left())
            };
            for tracker in &self.trackers {
                let params = Announce {
                    info_hash: self.ctx.info_hash,
                    peer_id: self.ctx.client_id,
                    port: self.ctx.conf.listen_port,
                    ip: None,
                    downloaded,
                    uploaded: 0,
                    left,
                    peer_count: None,
                    event: Some(event),
                };
                if tracker.announce(params).await.is_ok() {
                    break;
                }
            }
        }

        if let Some(start_time) = self.start_time {
            log::info!(
                "Torrent ran for {} s",
                start_time.elapsed().as_secs()
            );
        }

        let _ = self.disk.shutdown();
    }
}

/// The exponential reconnect backoff: the configured minimum doubled with
/// every consecutive failure, up to the configured ceiling.
fn reconnect_backoff(conf: &Conf, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(10);
    (conf.min_reconnect_backoff * 2u32.pow(exp))
        .min(conf.max_reconnect_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff() {
        let conf = Conf::new("/tmp");
        assert_eq!(
            reconnect_backoff(&conf, 1),
            Duration::from_secs(15)
        );
        assert_eq!(
            reconnect_backoff(&conf, 2),
            Duration::from_secs(30)
        );
        assert_eq!(
            reconnect_backoff(&conf, 3),
            Duration::from_secs(60)
        );
        // capped at five minutes
        assert_eq!(
            reconnect_backoff(&conf, 10),
            Duration::from_secs(300)
        );
    }
}
