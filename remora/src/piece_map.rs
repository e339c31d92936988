use std::{
    collections::HashMap,
    mem,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{
    block_count, block_len, storage_info::StorageInfo, Bitfield, BlockInfo,
    PieceIndex, BLOCK_LEN,
};

/// Returned when a peer advertises a bitfield whose length doesn't match the
/// torrent or whose trailing padding bits are not zero.
#[derive(Debug)]
pub(crate) struct MalformedBitfield;

/// The download state of a single piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceStatus {
    /// No block of the piece has been received or requested.
    Missing,
    /// At least one block is outstanding or received, or all blocks are
    /// received and the piece awaits hash verification.
    InFlight,
    /// The piece was verified and handed to the disk task.
    Complete,
}

/// Per piece block accounting: which blocks have arrived and the buffer the
/// payloads are assembled in.
struct PieceState {
    status: PieceStatus,
    /// The piece's length in bytes (the last piece may be shorter).
    len: u32,
    /// One flag per block, set when the block's payload has been received.
    received: Vec<bool>,
    received_count: usize,
    /// The assembly buffer, allocated when the first block arrives and taken
    /// out when the last block completes the piece.
    buf: Vec<u8>,
    /// The peers that supplied blocks of this piece, kept so that the
    /// offenders can be penalized if the piece fails verification.
    contributors: Vec<SocketAddr>,
}

impl PieceState {
    fn new(len: u32) -> Self {
        Self {
            status: PieceStatus::Missing,
            len,
            received: vec![false; block_count(len)],
            received_count: 0,
            buf: Vec::new(),
            contributors: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.status = PieceStatus::Missing;
        self.received.iter_mut().for_each(|b| *b = false);
        self.received_count = 0;
        self.buf = Vec::new();
    }
}

/// A block request handed out to a peer but not yet answered.
struct OutstandingRequest {
    peer: SocketAddr,
    len: u32,
    since: Instant,
}

/// The result of feeding a received block to the piece map.
#[derive(Debug)]
pub(crate) enum BlockReceipt {
    /// The block was stored; the piece is not yet complete.
    Stored,
    /// The block completed its piece. The buffer holds the full piece
    /// payload, ready for hash verification and flushing.
    PieceComplete(Vec<u8>),
    /// The block was a duplicate, stale, or malformed, and was dropped.
    Ignored,
}

/// The global piece and block accounting shared by all peer sessions.
///
/// The map tracks which pieces we have, which blocks are outstanding to which
/// peer, and what every connected peer advertises. Sessions identify
/// themselves by their remote address; the map holds no handles back to
/// sessions.
///
/// The request ledger guarantees that a block is outstanding to at most one
/// peer at a time. A request that times out is evicted by
/// [`PieceMap::reap_timeouts`] and becomes pickable again.
pub(crate) struct PieceMap {
    /// Our have-bitfield: one bit per piece, set iff the piece has been
    /// verified and flushed.
    own_pieces: Bitfield,
    pieces: Vec<PieceState>,
    /// What each connected peer advertises, updated by bitfield and have
    /// messages.
    availability: HashMap<SocketAddr, Bitfield>,
    /// The outstanding request ledger, keyed by (piece, offset).
    outstanding: HashMap<(PieceIndex, u32), OutstandingRequest>,
    /// Payload bytes accepted this run.
    downloaded: u64,
    /// Bytes not yet verified and flushed.
    left: u64,
}

impl PieceMap {
    pub fn new(storage: &StorageInfo) -> Self {
        let pieces = (0..storage.piece_count)
            .map(|index| {
                // index is always valid here
                let len = storage.piece_len(index).expect("valid piece index");
                PieceState::new(len)
            })
            .collect();
        Self {
            own_pieces: Bitfield::repeat(false, storage.piece_count),
            pieces,
            availability: HashMap::new(),
            outstanding: HashMap::new(),
            downloaded: 0,
            left: storage.download_len,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn is_complete(&self) -> bool {
        self.own_pieces.all()
    }

    pub fn missing_count(&self) -> usize {
        self.own_pieces.count_zeros()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn left(&self) -> u64 {
        self.left
    }

    /// Marks the pieces found complete on disk by the resume scan. Must be
    /// called before any session is started.
    pub fn register_resumed(&mut self, resumed: &Bitfield) {
        debug_assert_eq!(resumed.len(), self.pieces.len());
        for index in resumed.iter_ones() {
            let piece = &mut self.pieces[index];
            piece.status = PieceStatus::Complete;
            piece.received.iter_mut().for_each(|b| *b = true);
            piece.received_count = piece.received.len();
            self.own_pieces.set(index, true);
            self.left -= piece.len as u64;
        }
    }

    /// Records a peer's full piece availability, as sent right after the
    /// handshake.
    ///
    /// The raw bitfield must be exactly as long as the wire representation of
    /// the torrent's piece count and its trailing padding bits must be zero.
    /// Returns whether the peer has any piece we still need.
    pub fn register_peer_bitfield(
        &mut self,
        peer: SocketAddr,
        mut bits: Bitfield,
    ) -> Result<bool, MalformedBitfield> {
        let piece_count = self.pieces.len();
        let wire_len = (piece_count + 7) / 8 * 8;
        if bits.len() != wire_len {
            return Err(MalformedBitfield);
        }
        if bits[piece_count..].any() {
            return Err(MalformedBitfield);
        }
        bits.resize(piece_count, false);

        log::trace!("Registering {} piece availability", peer);
        self.availability.insert(peer, bits);
        Ok(self.is_peer_interesting(&peer))
    }

    /// Records that a peer announced one new piece. The index must have been
    /// validated against the torrent's piece count. Returns whether the peer
    /// now has any piece we still need.
    pub fn register_peer_have(
        &mut self,
        peer: SocketAddr,
        index: PieceIndex,
    ) -> bool {
        debug_assert!(index < self.pieces.len());
        let piece_count = self.pieces.len();
        self.availability
            .entry(peer)
            .or_insert_with(|| Bitfield::repeat(false, piece_count))
            .set(index, true);
        self.is_peer_interesting(&peer)
    }

    /// Returns true if the peer advertises at least one piece we don't have.
    pub fn is_peer_interesting(&self, peer: &SocketAddr) -> bool {
        match self.availability.get(peer) {
            Some(bits) => bits
                .iter()
                .by_vals()
                .zip(self.own_pieces.iter().by_vals())
                .any(|(peer_has, own)| peer_has && !own),
            None => false,
        }
    }

    /// Selects the next block to request from this peer and records it as
    /// outstanding.
    ///
    /// The selection is sequential: the smallest piece index that is not
    /// complete, that the peer advertises, and that has a block neither
    /// received nor outstanding; within the piece, blocks are picked in
    /// ascending offset order. Returns `None` when the peer can offer no
    /// progress.
    pub fn next_request(&mut self, peer: SocketAddr) -> Option<BlockInfo> {
        let peer_pieces = self.availability.get(&peer)?.clone();
        for index in 0..self.pieces.len() {
            if self.pieces[index].status == PieceStatus::Complete {
                continue;
            }
            if !peer_pieces[index] {
                continue;
            }
            let piece_len = self.pieces[index].len;
            for block in 0..block_count(piece_len) {
                if self.pieces[index].received[block] {
                    continue;
                }
                let offset = block as u32 * BLOCK_LEN;
                if self.outstanding.contains_key(&(index, offset)) {
                    continue;
                }

                let info = BlockInfo {
                    piece_index: index,
                    offset,
                    len: block_len(piece_len, block),
                };
                self.outstanding.insert(
                    (index, offset),
                    OutstandingRequest {
                        peer,
                        len: info.len,
                        since: Instant::now(),
                    },
                );
                self.pieces[index].status = PieceStatus::InFlight;
                return Some(info);
            }
        }
        None
    }

    /// Stores a received block.
    ///
    /// Blocks we did not request are accepted if they fill a block that is
    /// still missing; anything else (duplicates, blocks of complete pieces,
    /// lengths that don't match the block grid) is dropped.
    pub fn on_block(
        &mut self,
        peer: SocketAddr,
        info: BlockInfo,
        data: &[u8],
    ) -> BlockReceipt {
        if info.piece_index >= self.pieces.len() {
            return BlockReceipt::Ignored;
        }
        let piece_len = self.pieces[info.piece_index].len;
        if info.offset % BLOCK_LEN != 0 || info.offset >= piece_len {
            return BlockReceipt::Ignored;
        }
        let block = (info.offset / BLOCK_LEN) as usize;
        if data.len() != block_len(piece_len, block) as usize {
            return BlockReceipt::Ignored;
        }
        if self.pieces[info.piece_index].status == PieceStatus::Complete
            || self.pieces[info.piece_index].received[block]
        {
            return BlockReceipt::Ignored;
        }

        // the block may have been outstanding to another peer; either way it
        // is no longer pending
        self.outstanding.remove(&(info.piece_index, info.offset));

        let piece = &mut self.pieces[info.piece_index];
        if piece.buf.is_empty() {
            piece.buf = vec![0; piece.len as usize];
        }
        let start = info.offset as usize;
        piece.buf[start..start + data.len()].copy_from_slice(data);
        piece.received[block] = true;
        piece.received_count += 1;
        piece.status = PieceStatus::InFlight;
        if !piece.contributors.contains(&peer) {
            piece.contributors.push(peer);
        }
        self.downloaded += data.len() as u64;

        if piece.received_count == piece.received.len() {
            BlockReceipt::PieceComplete(mem::take(&mut piece.buf))
        } else {
            BlockReceipt::Stored
        }
    }

    /// Flips the have-bit: the piece's hash matched and its bytes were handed
    /// to the disk task.
    pub fn on_verified(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert_eq!(piece.received_count, piece.received.len());
        piece.status = PieceStatus::Complete;
        piece.contributors.clear();
        self.own_pieces.set(index, true);
        self.left -= piece.len as u64;
    }

    /// Resets a piece whose hash did not match back to missing, clearing its
    /// buffer and block bitmap. Returns the peers that contributed blocks so
    /// they can be penalized.
    pub fn on_verify_failed(&mut self, index: PieceIndex) -> Vec<SocketAddr> {
        let piece = &mut self.pieces[index];
        piece.reset();
        mem::take(&mut piece.contributors)
    }

    /// Releases all outstanding requests of the peer, making the blocks
    /// pickable again. Called when the peer chokes us or its session ends.
    pub fn release_requests_of(&mut self, peer: SocketAddr) -> Vec<BlockInfo> {
        let released: Vec<BlockInfo> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| entry.peer == peer)
            .map(|((index, offset), entry)| BlockInfo {
                piece_index: *index,
                offset: *offset,
                len: entry.len,
            })
            .collect();
        for block in &released {
            self.outstanding.remove(&(block.piece_index, block.offset));
            self.downgrade_status(block.piece_index);
        }
        released
    }

    /// Removes all state kept about a disconnecting peer: its advertised
    /// pieces and its outstanding requests.
    pub fn remove_peer(&mut self, peer: SocketAddr) {
        self.availability.remove(&peer);
        self.release_requests_of(peer);
    }

    /// Evicts every outstanding request older than `ttl` and returns them
    /// grouped with the peer they were issued to, so the sessions can free
    /// their pipeline slots. Calling this twice with the same clock yields
    /// the same state as calling it once.
    pub fn reap_timeouts(
        &mut self,
        now: Instant,
        ttl: Duration,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let timed_out: Vec<(SocketAddr, BlockInfo)> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.since) >= ttl
            })
            .map(|((index, offset), entry)| {
                (
                    entry.peer,
                    BlockInfo {
                        piece_index: *index,
                        offset: *offset,
                        len: entry.len,
                    },
                )
            })
            .collect();
        for (peer, block) in &timed_out {
            log::debug!(
                "Request {} to {} timed out, releasing",
                block,
                peer
            );
            self.outstanding.remove(&(block.piece_index, block.offset));
            self.downgrade_status(block.piece_index);
        }
        timed_out
    }

    #[cfg(test)]
    pub fn piece_status(&self, index: PieceIndex) -> PieceStatus {
        self.pieces[index].status
    }

    #[cfg(test)]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// An in-flight piece with no received blocks and no outstanding
    /// requests is missing again.
    fn downgrade_status(&mut self, index: PieceIndex) {
        let has_outstanding =
            self.outstanding.keys().any(|(i, _)| *i == index);
        let piece = &mut self.pieces[index];
        if piece.status == PieceStatus::InFlight
            && piece.received_count == 0
            && !has_outstanding
        {
            piece.status = PieceStatus::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::metainfo::{Info, Metainfo};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// A map for a torrent of `piece_count` pieces, all of nominal length
    /// except the last, which is `last_piece_len` bytes.
    fn make_map(
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
    ) -> PieceMap {
        let metainfo = Metainfo {
            announce: None,
            announce_list: None,
            info: Info {
                name: "test".into(),
                pieces: vec![0; piece_count * 20],
                piece_len,
                length: Some(
                    piece_len as u64 * (piece_count as u64 - 1)
                        + last_piece_len as u64,
                ),
                files: None,
                private: None,
            },
            info_hash: [0; 20],
        };
        let storage = StorageInfo::new(&metainfo, Path::new("/tmp"));
        PieceMap::new(&storage)
    }

    fn full_wire_bitfield(piece_count: usize) -> Bitfield {
        let wire_len = (piece_count + 7) / 8 * 8;
        let mut bits = Bitfield::repeat(false, wire_len);
        for i in 0..piece_count {
            bits.set(i, true);
        }
        bits
    }

    #[test]
    fn test_sequential_block_selection() {
        let mut map = make_map(2, 2 * BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(2)).unwrap();

        // blocks come in ascending piece and offset order
        let b0 = map.next_request(peer).unwrap();
        assert_eq!((b0.piece_index, b0.offset, b0.len), (0, 0, BLOCK_LEN));
        let b1 = map.next_request(peer).unwrap();
        assert_eq!((b1.piece_index, b1.offset), (0, BLOCK_LEN));
        let b2 = map.next_request(peer).unwrap();
        assert_eq!((b2.piece_index, b2.offset), (1, 0));
        // nothing left
        assert!(map.next_request(peer).is_none());
    }

    #[test]
    fn test_block_outstanding_to_at_most_one_peer() {
        let mut map = make_map(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN);
        let (a, b) = (addr(1), addr(2));
        map.register_peer_bitfield(a, full_wire_bitfield(1)).unwrap();
        map.register_peer_bitfield(b, full_wire_bitfield(1)).unwrap();

        let from_a = map.next_request(a).unwrap();
        let from_b = map.next_request(b).unwrap();
        assert_ne!(from_a, from_b);
        // both blocks are now outstanding, no more picks for anyone
        assert!(map.next_request(a).is_none());
        assert!(map.next_request(b).is_none());
    }

    #[test]
    fn test_skips_pieces_the_peer_does_not_have() {
        let mut map = make_map(2, BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);
        // peer only has piece 1
        let mut bits = Bitfield::repeat(false, 8);
        bits.set(1, true);
        map.register_peer_bitfield(peer, bits).unwrap();

        let block = map.next_request(peer).unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn test_no_request_without_availability() {
        let mut map = make_map(2, BLOCK_LEN, BLOCK_LEN);
        assert!(map.next_request(addr(1)).is_none());
    }

    #[test]
    fn test_last_piece_block_is_short() {
        let mut map = make_map(2, BLOCK_LEN, 6);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(2)).unwrap();

        let b0 = map.next_request(peer).unwrap();
        assert_eq!(b0.len, BLOCK_LEN);
        let b1 = map.next_request(peer).unwrap();
        assert_eq!((b1.piece_index, b1.offset, b1.len), (1, 0, 6));
        // no block past the end of the download is ever offered
        assert!(map.next_request(peer).is_none());
    }

    #[test]
    fn test_piece_completion_and_verification() {
        let mut map = make_map(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(1)).unwrap();

        let b0 = map.next_request(peer).unwrap();
        let b1 = map.next_request(peer).unwrap();

        let receipt = map.on_block(peer, b0, &vec![1; b0.len as usize]);
        assert!(matches!(receipt, BlockReceipt::Stored));
        assert_eq!(map.piece_status(0), PieceStatus::InFlight);
        assert!(!map.is_complete());

        let receipt = map.on_block(peer, b1, &vec![2; b1.len as usize]);
        let buf = match receipt {
            BlockReceipt::PieceComplete(buf) => buf,
            other => panic!("expected complete piece, got {:?}", other),
        };
        assert_eq!(buf.len(), 2 * BLOCK_LEN as usize);
        assert!(buf[..BLOCK_LEN as usize].iter().all(|b| *b == 1));
        assert!(buf[BLOCK_LEN as usize..].iter().all(|b| *b == 2));

        // the have-bit only flips once the writer verified the piece
        assert!(!map.own_pieces()[0]);
        map.on_verified(0);
        assert!(map.own_pieces()[0]);
        assert!(map.is_complete());
        assert_eq!(map.left(), 0);
        assert_eq!(map.downloaded(), 2 * BLOCK_LEN as u64);
    }

    #[test]
    fn test_verify_failure_resets_piece() {
        let mut map = make_map(1, BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(1)).unwrap();

        let block = map.next_request(peer).unwrap();
        let receipt = map.on_block(peer, block, &vec![0; BLOCK_LEN as usize]);
        assert!(matches!(receipt, BlockReceipt::PieceComplete(_)));

        let contributors = map.on_verify_failed(0);
        assert_eq!(contributors, vec![peer]);
        assert_eq!(map.piece_status(0), PieceStatus::Missing);
        assert!(!map.is_complete());

        // the blocks are pickable again
        let again = map.next_request(peer).unwrap();
        assert_eq!(again, block);
    }

    #[test]
    fn test_unsolicited_block_rules() {
        let mut map = make_map(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(1)).unwrap();

        // an unrequested block that fills a missing slot is accepted
        let unsolicited = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let receipt =
            map.on_block(peer, unsolicited, &vec![0; BLOCK_LEN as usize]);
        assert!(matches!(receipt, BlockReceipt::Stored));

        // a duplicate of it is dropped
        let receipt =
            map.on_block(peer, unsolicited, &vec![0; BLOCK_LEN as usize]);
        assert!(matches!(receipt, BlockReceipt::Ignored));
        assert_eq!(map.downloaded(), BLOCK_LEN as u64);

        // a block with a bogus length is dropped
        let bogus = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 3,
        };
        assert!(matches!(
            map.on_block(peer, bogus, &[0; 3]),
            BlockReceipt::Ignored
        ));

        // as is one with an unaligned offset
        let unaligned = BlockInfo {
            piece_index: 0,
            offset: 7,
            len: BLOCK_LEN,
        };
        assert!(matches!(
            map.on_block(peer, unaligned, &vec![0; BLOCK_LEN as usize]),
            BlockReceipt::Ignored
        ));

        // and one for an invalid piece
        let invalid = BlockInfo {
            piece_index: 9,
            offset: 0,
            len: BLOCK_LEN,
        };
        assert!(matches!(
            map.on_block(peer, invalid, &vec![0; BLOCK_LEN as usize]),
            BlockReceipt::Ignored
        ));
    }

    #[test]
    fn test_release_requests_on_choke() {
        let mut map = make_map(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN);
        let (a, b) = (addr(1), addr(2));
        map.register_peer_bitfield(a, full_wire_bitfield(1)).unwrap();
        map.register_peer_bitfield(b, full_wire_bitfield(1)).unwrap();

        let b0 = map.next_request(a).unwrap();
        let b1 = map.next_request(a).unwrap();
        assert!(map.next_request(b).is_none());

        let mut released = map.release_requests_of(a);
        released.sort();
        assert_eq!(released, vec![b0, b1]);
        assert_eq!(map.outstanding_count(), 0);
        assert_eq!(map.piece_status(0), PieceStatus::Missing);

        // the other peer can now pick the released blocks
        assert_eq!(map.next_request(b).unwrap(), b0);
    }

    #[test]
    fn test_reap_timeouts_is_idempotent() {
        let mut map = make_map(1, BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(1)).unwrap();

        let block = map.next_request(peer).unwrap();
        let ttl = Duration::from_secs(30);

        // nothing is stale right away
        assert!(map.reap_timeouts(Instant::now(), ttl).is_empty());
        assert_eq!(map.outstanding_count(), 1);

        let later = Instant::now() + Duration::from_secs(31);
        let reaped = map.reap_timeouts(later, ttl);
        assert_eq!(reaped, vec![(peer, block)]);
        assert_eq!(map.outstanding_count(), 0);
        assert_eq!(map.piece_status(0), PieceStatus::Missing);

        // reaping again with the same clock changes nothing
        assert!(map.reap_timeouts(later, ttl).is_empty());
        assert_eq!(map.piece_status(0), PieceStatus::Missing);

        // the block is pickable again
        assert_eq!(map.next_request(peer).unwrap(), block);
    }

    #[test]
    fn test_bitfield_validation() {
        let mut map = make_map(2, BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);

        // too short
        assert!(map
            .register_peer_bitfield(peer, Bitfield::repeat(true, 2))
            .is_err());
        // too long
        assert!(map
            .register_peer_bitfield(peer, Bitfield::repeat(true, 16))
            .is_err());
        // correct length but nonzero padding
        let mut padded = Bitfield::repeat(false, 8);
        padded.set(7, true);
        assert!(map.register_peer_bitfield(peer, padded).is_err());

        // a valid bitfield is truncated to the piece count
        let mut good = Bitfield::repeat(false, 8);
        good.set(0, true);
        assert!(map.register_peer_bitfield(peer, good).unwrap());
        assert!(map.next_request(peer).is_some());
    }

    #[test]
    fn test_have_updates_interest() {
        let mut map = make_map(2, BLOCK_LEN, BLOCK_LEN);
        let peer = addr(1);

        assert!(!map.is_peer_interesting(&peer));
        assert!(map.register_peer_have(peer, 1));
        assert!(map.is_peer_interesting(&peer));

        // once we have the piece the peer is no longer interesting
        let other = addr(2);
        let b = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        let receipt = map.on_block(other, b, &vec![0; b.len as usize]);
        assert!(matches!(receipt, BlockReceipt::PieceComplete(_)));
        map.on_verified(1);
        assert!(!map.is_peer_interesting(&peer));
    }

    #[test]
    fn test_resume_marks_pieces_complete() {
        let mut map = make_map(2, BLOCK_LEN, 6);
        let mut resumed = Bitfield::repeat(false, 2);
        resumed.set(0, true);
        resumed.set(1, true);
        map.register_resumed(&resumed);

        assert!(map.is_complete());
        assert_eq!(map.left(), 0);
        assert_eq!(map.downloaded(), 0);

        // a resumed torrent issues no requests
        let peer = addr(1);
        map.register_peer_bitfield(peer, full_wire_bitfield(2)).unwrap();
        assert!(map.next_request(peer).is_none());
    }

    #[test]
    fn test_remove_peer_releases_requests() {
        let mut map = make_map(1, BLOCK_LEN, BLOCK_LEN);
        let (a, b) = (addr(1), addr(2));
        map.register_peer_bitfield(a, full_wire_bitfield(1)).unwrap();
        map.register_peer_bitfield(b, full_wire_bitfield(1)).unwrap();

        let block = map.next_request(a).unwrap();
        map.remove_peer(a);
        assert!(!map.is_peer_interesting(&a));
        assert_eq!(map.next_request(b).unwrap(), block);
    }
}
