use std::fmt;

/// Error type returned on failed piece writes.
///
/// Unlike peer errors, a storage failure is fatal to the whole download: if
/// we cannot persist pieces there is no point in fetching them.
#[derive(Debug)]
pub enum WriteError {
    /// The piece index is invalid for the torrent.
    InvalidPieceIndex,
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Error type returned when the resume scan fails to read the destination.
///
/// Missing or short files are not errors (their pieces are simply reported
/// as not present); this covers the rest, e.g. permission failures, which
/// are as fatal as a failed write: the state of the files cannot be
/// trusted.
#[derive(Debug)]
pub enum ReadError {
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}
