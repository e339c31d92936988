use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    disk::DiskHandle, piece_map::BlockReceipt, torrent::TorrentContext,
    Bitfield, BlockInfo, PieceIndex, BLOCK_LEN,
};
use codec::*;
use error::*;
use state::*;

#[macro_use]
mod peer_log;
pub(crate) mod codec;
pub(crate) mod error;
mod state;

/// The channel on which the coordinator can send a command to the peer
/// session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Some of the session's requests went unanswered for too long and were
    /// released in the piece map by the timeout reaper; the session must
    /// drop them from its own pipeline accounting.
    ReqsTimedOut(Vec<BlockInfo>),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// A connection with another BitTorrent peer.
///
/// This entity implements the leeching half of the BitTorrent wire protocol:
/// it exchanges the messages that drive a download and feeds received blocks
/// into the shared piece map. Disk IO is delegated to the
/// [disk task](crate::disk::DiskHandle).
///
/// Sessions are always outbound; this build does not accept incoming
/// connections. Only the BitTorrent v1 base protocol is implemented, without
/// any extensions.
pub(crate) struct PeerSession {
    /// Shared information and the piece map of the torrent.
    torrent: Arc<TorrentContext>,
    /// The entity used to save assembled pieces to disk.
    disk: DiskHandle,
    /// The port on which the peer session receives commands.
    cmd_port: Receiver,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related state.
    state: SessionState,
    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting.
    ///
    /// A block for which a `Piece` message arrives is removed from this set,
    /// freeing a pipeline slot. The set is cleared when we're choked, as in
    /// that case we don't expect the outstanding requests to be served.
    outgoing_requests: HashSet<BlockInfo>,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address.
    ///
    /// This constructor only initializes the session components but does not
    /// actually start it. See [`Self::start`].
    pub fn new(
        torrent: Arc<TorrentContext>,
        disk: DiskHandle,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                disk,
                cmd_port,
                addr,
                state: SessionState::default(),
                outgoing_requests: HashSet::new(),
            },
            cmd_chan,
        )
    }

    /// Connects to the peer and runs the session until the download
    /// completes, the coordinator shuts it down, or an error occurs.
    ///
    /// Termination is idempotent: on every exit path the session's
    /// outstanding requests are released back to the piece map and the
    /// transport is closed.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.run().await;
        self.torrent.piece_map.write().await.remove_peer(self.addr);
        self.state.connection = ConnectionState::Disconnected;
        result
    }

    async fn run(&mut self) -> Result<()> {
        peer_info!(self, "Starting outbound session");
        self.state.connection = ConnectionState::Connecting;
        let socket = time::timeout(
            self.torrent.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;
        peer_info!(self, "Connected to peer");

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state.connection = ConnectionState::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        self.state.uploaded_protocol_counter += handshake.len();
        socket.send(handshake).await?;

        peer_info!(self, "Waiting for peer handshake");
        let peer_handshake = match time::timeout(
            self.torrent.conf.connect_timeout,
            socket.next(),
        )
        .await
        {
            Err(_) => return Err(PeerError::ConnectTimeout),
            Ok(None) => return Err(PeerError::ConnectionClosed),
            Ok(Some(peer_handshake)) => peer_handshake?,
        };
        peer_info!(self, "Received peer handshake");
        self.state.downloaded_protocol_counter += peer_handshake.len();

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            peer_info!(self, "Peer handshake invalid info hash");
            return Err(PeerError::InvalidInfoHash);
        }
        self.state.peer = Some(PeerInfo {
            id: peer_handshake.peer_id,
        });

        // Now that we have the handshake we switch to the peer message
        // codec. We need to keep the buffers of the original codec as they
        // may contain bytes of any message the peer sent after the
        // handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(
            old_parts.io,
            PeerCodec::new(self.torrent.storage.piece_len),
        );
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state.connection = ConnectionState::AvailabilityExchange;
        peer_info!(self, "Session state: {:?}", self.state.connection);
        // the handshake exchange counts as traffic in both directions, so
        // the keepalive and inactivity timers start from here even if no
        // frame is ever sent
        self.state.last_recv_time = Some(Instant::now());
        self.state.last_send_time = Some(Instant::now());

        let (mut sink, mut stream) = socket.split();

        // This is the beginning of the session, which is the only time a
        // peer is allowed to advertise its pieces. If we have pieces
        // available, send a bitfield message. Its raw byte representation is
        // already padded to the wire format.
        let own_pieces = {
            let piece_map = self.torrent.piece_map.read().await;
            piece_map.own_pieces().clone()
        };
        if own_pieces.any() {
            peer_info!(self, "Sending piece availability");
            self.send_msg(&mut sink, Message::Bitfield(own_pieces)).await?;
        }

        let mut tick_timer = time::interval(Duration::from_secs(1));

        // the main session loop: receive messages from the peer and
        // commands from the coordinator, and run the once-a-second
        // housekeeping
        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    self.tick(&mut sink).await?;
                }
                maybe_msg = stream.next() => {
                    let msg = match maybe_msg {
                        Some(msg) => msg?,
                        None => return Err(PeerError::ConnectionClosed),
                    };
                    peer_debug!(self, "Received message {:?}", msg.id());
                    self.state.last_recv_time = Some(Instant::now());
                    match &msg {
                        Message::Block { data, .. } => {
                            self.state.downloaded_protocol_counter +=
                                msg.protocol_len() - data.len() as u64;
                        }
                        _ => {
                            self.state.downloaded_protocol_counter +=
                                msg.protocol_len();
                        }
                    }

                    // The bitfield message may only be received directly
                    // after the handshake; in every other position it is a
                    // protocol violation.
                    if self.state.connection
                        == ConnectionState::AvailabilityExchange
                    {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                        } else {
                            self.handle_msg(&mut sink, msg).await?;
                        }
                        self.state.connection = ConnectionState::Connected;
                        peer_info!(
                            self,
                            "Session state: {:?}",
                            self.state.connection
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::ReqsTimedOut(blocks)) => {
                            peer_warn!(
                                self,
                                "{} request(s) timed out",
                                blocks.len()
                            );
                            for block in &blocks {
                                self.outgoing_requests.remove(block);
                            }
                            self.make_requests(&mut sink).await?;
                        }
                        Some(Command::Shutdown) | None => {
                            peer_info!(self, "Shutting down session");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// The session's once-a-second housekeeping: keepalive, inactivity
    /// timeout, pipeline top-up, and statistics.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        if let Some(last_recv) = self.state.last_recv_time {
            let silent = now.saturating_duration_since(last_recv);
            if silent >= self.torrent.conf.inactivity_timeout {
                peer_warn!(
                    self,
                    "Nothing received for {} s, dropping peer",
                    silent.as_secs()
                );
                return Err(PeerError::InactivityTimeout);
            }
        }

        let needs_keep_alive = match self.state.last_send_time {
            Some(last_send) => {
                now.saturating_duration_since(last_send)
                    >= self.torrent.conf.keep_alive_interval
            }
            None => false,
        };
        if needs_keep_alive {
            peer_debug!(self, "Sending keepalive");
            self.send_msg(sink, Message::KeepAlive).await?;
        }

        // blocks released by the timeout reaper or freed up by other
        // sessions may have become pickable since the last message arrived
        self.make_requests(sink).await?;

        peer_debug!(
            self,
            "Download rate: {} b/s (total: {} b), pipeline: {}",
            self.state.downloaded_payload_counter.avg(),
            self.state.downloaded_payload_counter.total(),
            self.outgoing_requests.len(),
        );
        self.state.tick();

        Ok(())
    }

    /// Handles the bitfield message, expected only in the
    /// `AvailabilityExchange` state.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(
            self.state.connection,
            ConnectionState::AvailabilityExchange
        );
        peer_info!(self, "Handling peer Bitfield message");

        // the piece map validates the bitfield's length and padding;
        // a malformed bitfield drops the session
        let interesting = self
            .torrent
            .piece_map
            .write()
            .await
            .register_peer_bitfield(self.addr, bitfield)?;

        self.update_interest(sink, interesting).await?;
        self.make_requests(sink).await?;

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                peer_debug!(self, "Peer sent keep alive");
            }
            Message::Bitfield(_) => {
                peer_info!(
                    self,
                    "Peer sent bitfield message not after handshake"
                );
                return Err(PeerError::UnexpectedBitfield);
            }
            Message::Choke => {
                if self.state.on_peer_choke(true) {
                    peer_info!(self, "Peer choked us");
                    // the remote is not obligated to serve requests it
                    // already accepted, so hand the pipelined requests back
                    // to the selector
                    self.torrent
                        .piece_map
                        .write()
                        .await
                        .release_requests_of(self.addr);
                    self.outgoing_requests.clear();
                }
            }
            Message::Unchoke => {
                if self.state.on_peer_choke(false) {
                    peer_info!(self, "Peer unchoked us");
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.state.peer_interested {
                    peer_info!(self, "Peer became interested");
                    // acknowledged only: we never unchoke in this build
                    self.state.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.state.peer_interested {
                    peer_info!(self, "Peer no longer interested");
                    self.state.peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                let index = piece_index as PieceIndex;
                if index >= self.torrent.storage.piece_count {
                    return Err(PeerError::InvalidPieceIndex);
                }
                peer_debug!(self, "Peer has piece {}", index);
                let interesting = self
                    .torrent
                    .piece_map
                    .write()
                    .await
                    .register_peer_have(self.addr, index);
                self.update_interest(sink, interesting).await?;
                self.make_requests(sink).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Request(block) => {
                // we never unchoke, so a well-behaved peer won't send
                // requests; log and ignore
                if block.len > BLOCK_LEN {
                    peer_warn!(
                        self,
                        "Peer requested block over 16 KiB: {}",
                        block
                    );
                } else {
                    peer_debug!(
                        self,
                        "Ignoring request {} (leech only)",
                        block
                    );
                }
            }
            Message::Cancel(block) => {
                peer_debug!(self, "Ignoring cancel {} (leech only)", block);
            }
        }

        Ok(())
    }

    /// Delivers a received block to the piece map and, if it completed its
    /// piece, hands the assembled payload to the disk task.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        peer_debug!(self, "Received block {}", block_info);

        let was_requested = self.outgoing_requests.remove(&block_info);
        if !was_requested {
            peer_warn!(
                self,
                "Received block we did not request: {}",
                block_info
            );
        }

        let receipt = self
            .torrent
            .piece_map
            .write()
            .await
            .on_block(self.addr, block_info, &data);
        match receipt {
            BlockReceipt::Stored => {
                self.state.downloaded_payload_counter += data.len() as u64;
            }
            BlockReceipt::PieceComplete(piece) => {
                self.state.downloaded_payload_counter += data.len() as u64;
                peer_info!(
                    self,
                    "Piece {} fully received, handing to disk",
                    block_info.piece_index
                );
                self.disk
                    .write_piece(block_info.piece_index, piece)
                    .map_err(|_| PeerError::Channel)?;
            }
            BlockReceipt::Ignored => {
                peer_warn!(self, "Dropped block {}", block_info);
            }
        }

        Ok(())
    }

    /// Sends the edge-triggered interest update, if our interest flipped.
    async fn update_interest(
        &mut self,
        sink: &mut MessageSink,
        interesting: bool,
    ) -> Result<()> {
        if let Some(msg) = self.state.update_interest(interesting) {
            match msg {
                Message::Interested => {
                    peer_info!(self, "Interested in peer")
                }
                _ => peer_info!(self, "No longer interested in peer"),
            }
            self.send_msg(sink, msg).await?;
        }
        Ok(())
    }

    /// Fills the session's download pipeline: while the peer doesn't choke
    /// us and we're interested, keep up to the configured number of block
    /// requests outstanding.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.peer_choking || !self.state.am_interested {
            return Ok(());
        }

        let pipeline_len = self.torrent.conf.pipeline_len;
        let mut requests = Vec::new();
        {
            let mut piece_map = self.torrent.piece_map.write().await;
            while self.outgoing_requests.len() + requests.len() < pipeline_len
            {
                match piece_map.next_request(self.addr) {
                    Some(block) => requests.push(block),
                    None => break,
                }
            }
        }

        if requests.is_empty() {
            return Ok(());
        }
        peer_debug!(
            self,
            "Requesting {} block(s) ({} pending)",
            requests.len(),
            self.outgoing_requests.len()
        );
        for block in requests {
            self.outgoing_requests.insert(block);
            self.send_msg(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        self.state.uploaded_protocol_counter += msg.protocol_len();
        sink.send(msg).await?;
        self.state.last_send_time = Some(Instant::now());
        Ok(())
    }
}
