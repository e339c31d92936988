use std::{convert::TryFrom, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PieceIndex, BLOCK_LEN};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68 byte preamble exchanged once per connection, before any
/// message frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// A reserved field, all zeros as we support no extensions. Ignored on
    /// receive.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// The length of the encoded handshake, for protocol chatter accounting.
    pub fn len(&self) -> u64 {
        19 + 49
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // protocol length prefix
        debug_assert_eq!(prot.len(), 19);
        buf.put_u8(prot.len() as u8);
        // payload
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is fixed, so a mismatch in the first
        // byte already condemns the handshake
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string length",
            ));
        }

        // wait for the full payload before parsing; the buffer must not be
        // consumed until then
        let payload_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string",
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    /// The length of the message's frame header (length prefix and id), for
    /// protocol chatter accounting.
    pub fn header_len(&self) -> u64 {
        4 + 1
    }
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            id if id == Choke as u8 => Ok(Choke),
            id if id == Unchoke as u8 => Ok(Unchoke),
            id if id == Interested as u8 => Ok(Interested),
            id if id == NotInterested as u8 => Ok(NotInterested),
            id if id == Have as u8 => Ok(Have),
            id if id == Bitfield as u8 => Ok(Bitfield),
            id if id == Request as u8 => Ok(Request),
            id if id == Block as u8 => Ok(Block),
            id if id == Cancel as u8 => Ok(Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// The messages of the peer wire protocol, decoded into a tagged variant that
/// sessions dispatch on with an exhaustive match.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's id, or `None` for a keepalive, which has none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }

    /// The number of bytes the encoded message takes up on the wire.
    pub fn protocol_len(&self) -> u64 {
        match self {
            Self::KeepAlive => 4,
            Self::Bitfield(bitfield) => {
                4 + 1 + bitfield.as_raw_slice().len() as u64
            }
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 4 + 1,
            Self::Have { .. } => 4 + 1 + 4,
            Self::Request(_) | Self::Cancel(_) => 4 + 1 + 3 * 4,
            Self::Block { data, .. } => 4 + 1 + 2 * 4 + data.len() as u64,
        }
    }
}

/// Codec for the message frames that follow the handshake.
///
/// Decoding is bounded: a frame declaring a length above the policy cap (a
/// piece length plus the frame overhead plus one block of margin) is rejected
/// rather than buffered.
pub(crate) struct PeerCodec {
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(piece_len: u32) -> Self {
        Self {
            max_frame_len: piece_len as usize + 9 + BLOCK_LEN as usize,
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                // a zero length prefix and no payload
                buf.put_u32(0);
            }
            Bitfield(bitfield) => {
                // NOTE: take the length of the underlying storage to get the
                // number of _bytes_, as `bitfield.len()` returns the number
                // of _bits_
                let msg_len = 1 + bitfield.as_raw_slice().len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                let msg_len = 1 + 2 * 4 + data.len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it: on a partial frame
        // we must leave the buffer intact for the next read
        let mut header = [0; 4];
        header.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(header) as usize;

        // the message length is only 0 if this is a keep alive message (all
        // other message types have at least one more field, the message id)
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if msg_len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds length cap",
            ));
        }

        if buf.len() < 4 + msg_len {
            // reserve upfront so the transport can read the whole frame
            // without further reallocations
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        let msg_id = MessageId::try_from(buf.get_u8())?;

        // fixed-size messages must declare exactly their size; a mismatch
        // would desynchronize the frame stream
        let expected_len = match msg_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(1),
            MessageId::Have => Some(1 + 4),
            MessageId::Request | MessageId::Cancel => Some(1 + 3 * 4),
            MessageId::Bitfield | MessageId::Block => None,
        };
        if let Some(expected_len) = expected_len {
            if msg_len != expected_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message payload length mismatch",
                ));
            }
        }

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                let piece_index = buf.get_u32();
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
            MessageId::Block => {
                if msg_len < 9 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block frame too short",
                    ));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
        };

        Ok(Some(msg))
    }
}
