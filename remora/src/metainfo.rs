use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{error::*, PieceIndex, Sha1Hash};

/// The parsed and validated torrent metainfo file.
///
/// Only the fields the download engine needs are kept; unknown keys in the
/// metainfo dictionary are ignored by the bencode deserializer.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The URL of the torrent's primary tracker, if any.
    pub announce: Option<String>,
    /// Tiers of backup tracker URLs, as per BEP 12.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
    /// The SHA-1 of the raw bencoded `info` dictionary, identifying the
    /// swarm. Computed once at parse time.
    #[serde(skip)]
    pub info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses the raw bencoded metainfo file and verifies that its contents
    /// are consistent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut metainfo: Self = serde_bencode::from_bytes(buf)?;

        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a multiple of 20
        if metainfo.info.pieces.is_empty()
            || metainfo.info.pieces.len() % 20 != 0
        {
            return Err(Error::InvalidMetainfo(
                "pieces must be a non-empty multiple of 20 bytes",
            ));
        }
        if metainfo.info.piece_len == 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive"));
        }

        // a torrent is either a single file or an archive of files, never
        // both and never neither
        match (&metainfo.info.length, &metainfo.info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "both length and files present",
                ));
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "neither length nor files present",
                ));
            }
            (None, Some(files)) if files.is_empty() => {
                return Err(Error::InvalidMetainfo("empty file list"));
            }
            _ => (),
        }

        // the hashes must cover the download exactly
        let total_len = metainfo.total_len();
        let piece_len = metainfo.info.piece_len as u64;
        let expected_piece_count = (total_len + piece_len - 1) / piece_len;
        if total_len == 0 {
            return Err(Error::InvalidMetainfo("download length is zero"));
        }
        if expected_piece_count != metainfo.piece_count() as u64 {
            return Err(Error::InvalidMetainfo(
                "piece hash count does not match download length",
            ));
        }

        metainfo.info_hash = metainfo.info.create_hash()?;

        Ok(metainfo)
    }

    /// The number of pieces the download is split into.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The sum of the length of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (_, Some(files)) => files.iter().map(|f| f.length).sum(),
            _ => unreachable!("validated in from_bytes"),
        }
    }

    /// The expected SHA-1 hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.info.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[pos..pos + 20]);
        Ok(hash)
    }

    /// All tracker URLs in announce order: the announce-list tiers flattened,
    /// falling back to the single announce URL, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        if let Some(url) = &self.announce {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_len: u32,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

impl Info {
    /// Computes the info hash by re-serializing the dictionary.
    fn create_hash(&self) -> Result<Sha1Hash> {
        let encoded = serde_bencode::to_bytes(self)?;
        let digest = Sha1::digest(&encoded);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        Ok(hash)
    }
}

/// An entry of a multi-file torrent's file list.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    /// The file's path components, relative to the torrent name directory.
    pub path: Vec<String>,
    pub length: u64,
}
