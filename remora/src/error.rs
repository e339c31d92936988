//! The errors that abort a whole download.
//!
//! Errors that are contained within a single peer session live in
//! [`crate::peer::error`], disk read and write failures in
//! [`crate::disk::error`]. Session errors are logged and recovered from;
//! everything here propagates up to the engine and triggers an orderly
//! shutdown.

use std::fmt;

pub use serde_bencode::Error as BencodeError;
pub use tokio::sync::mpsc::error::SendError;

pub use crate::{
    disk::error::{ReadError, WriteError},
    tracker::TrackerError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The channel on which some component in engine was listening or sending
    /// died.
    Channel,
    /// The metainfo could not be decoded from its bencoded form.
    Bencode(BencodeError),
    /// The metainfo decoded but its contents are inconsistent (e.g. the
    /// pieces string is not a multiple of 20 bytes, or it has neither
    /// a length nor a file list).
    InvalidMetainfo(&'static str),
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex,
    /// The torrent has no trackers and no explicitly given peers, so no data
    /// source whatsoever.
    NoPeerSource,
    /// Holds global IO related errors.
    Io(std::io::Error),
    /// The disk task failed to persist a piece. This is fatal, as opposed to
    /// peer errors: if we cannot write, there is no point in downloading.
    Storage(WriteError),
    /// The disk task failed to read back the destination during the startup
    /// resume scan. As fatal as a failed write.
    Scan(ReadError),
    /// An error that occurred while announcing to the tracker(s). Transient
    /// tracker errors are retried and only reported here once no progress can
    /// be made.
    Tracker(TrackerError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Channel => write!(f, "channel error"),
            Bencode(e) => write!(f, "bencode error: {}", e),
            InvalidMetainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            InvalidPieceIndex => write!(f, "invalid piece index"),
            NoPeerSource => {
                write!(f, "no trackers and no peers to download from")
            }
            Io(e) => e.fmt(f),
            Storage(e) => write!(f, "storage error: {}", e),
            Scan(e) => write!(f, "storage error during resume scan: {}", e),
            Tracker(e) => write!(f, "tracker error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BencodeError> for Error {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Storage(e)
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Self::Scan(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
