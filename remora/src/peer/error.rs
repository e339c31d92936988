use std::{fmt, io};

pub use tokio::sync::mpsc::error::SendError;

use crate::piece_map::MalformedBitfield;

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type returned on failed peer sessions.
///
/// These errors are session-fatal but engine-recoverable: the coordinator
/// logs them, applies reconnect backoff, and the download carries on with
/// the remaining peers.
#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum PeerError {
    /// The channel on which some component in engine was listening or
    /// sending died.
    Channel,
    /// The TCP connect or the handshake exchange did not finish in time.
    ConnectTimeout,
    /// The peer closed the connection.
    ConnectionClosed,
    /// The peer sent nothing at all for too long.
    InactivityTimeout,
    /// The peer's handshake advertised a torrent other than ours.
    InvalidInfoHash,
    /// The peer's bitfield length did not match the torrent or its padding
    /// bits were not zero.
    InvalidBitfield,
    /// The bitfield message was sent at some point other than right after
    /// the handshake.
    UnexpectedBitfield,
    /// The peer referenced a piece index out of bounds for the torrent.
    InvalidPieceIndex,
    /// The peer violated the wire protocol framing: an oversized frame, an
    /// unknown message id, a malformed handshake, or a connection closed in
    /// the middle of a frame.
    Protocol(io::Error),
    /// A transport error occurred.
    Io(io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            Channel => write!(f, "channel error"),
            ConnectTimeout => write!(f, "connect timeout"),
            ConnectionClosed => write!(f, "connection closed by peer"),
            InactivityTimeout => write!(f, "inactivity timeout"),
            InvalidInfoHash => write!(f, "invalid info hash"),
            InvalidBitfield => write!(f, "malformed bitfield"),
            UnexpectedBitfield => {
                write!(f, "bitfield not sent after handshake")
            }
            InvalidPieceIndex => write!(f, "invalid piece index"),
            Protocol(e) => write!(f, "protocol error: {}", e),
            Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        // the codecs report framing violations as invalid data, everything
        // else is a transport failure
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Protocol(e)
        } else {
            Self::Io(e)
        }
    }
}

impl From<MalformedBitfield> for PeerError {
    fn from(_: MalformedBitfield) -> Self {
        Self::InvalidBitfield
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
