use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::{de, Deserialize};

use crate::{error::BencodeError, PeerId, Sha1Hash};

pub use reqwest::Error as HttpError;

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// The possible errors that may occur when contacting the tracker.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// Holds bencode serialization or deserialization related errors.
    Bencode(BencodeError),
    /// HTTP related errors when contacting the tracker.
    Http(HttpError),
    /// The tracker itself rejected the announce with a human readable
    /// failure reason.
    Failure(String),
}

impl From<BencodeError> for TrackerError {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<HttpError> for TrackerError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::Failure(reason) => {
                write!(f, "tracker failure: {}", reason)
            }
        }
    }
}

/// Parameters for announcing to a tracker.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,

    /// The port on which we would accept connections. Advertised because
    /// announces require it; this build never listens.
    pub port: u16,
    /// True IP address of the client, only necessary if the request does not
    /// originate from the host the peer traffic would use (e.g. a proxy).
    pub ip: Option<IpAddr>,

    /// Number of payload bytes downloaded so far.
    pub downloaded: u64,
    /// Number of payload bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,

    /// The number of peers the client wishes to receive from the tracker.
    /// If omitted, HTTP trackers typically hand out 30 to 50.
    pub peer_count: Option<usize>,

    /// Set for the lifecycle events; a plain periodic announce carries no
    /// event.
    pub event: Option<Event>,
}

/// The announce event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first request to the tracker must include this value.
    Started,
    /// Sent exactly once, when the download completes.
    Completed,
    /// Sent when the client shuts down gracefully.
    Stopped,
}

impl Event {
    fn name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// The tracker announce response.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct Response {
    /// If set, no other fields in the response are valid. It contains
    /// a human-readable error message as to why the request was invalid.
    #[serde(default)]
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Similar to failure reason, but the response is still processed.
    #[serde(default)]
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    /// The number of seconds the client should wait before recontacting the
    /// tracker.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    /// If present, the client must not reannounce itself before the end of
    /// this interval.
    #[serde(default)]
    #[serde(rename = "min interval")]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub min_interval: Option<Duration>,

    #[serde(default)]
    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(default)]
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

impl Response {
    /// The interval to wait before the next periodic announce, honoring the
    /// tracker's minimum if it gave one.
    pub fn announce_interval(&self) -> Option<Duration> {
        match (self.interval, self.min_interval) {
            (Some(interval), Some(min_interval)) => {
                Some(interval.max(min_interval))
            }
            (interval, min_interval) => interval.or(min_interval),
        }
    }
}

/// An HTTP tracker for a torrent, from which we can request peers and to
/// which we report transfer progress.
pub(crate) struct Tracker {
    /// The HTTP client.
    client: Client,
    /// The URL of the tracker.
    url: Url,
}

impl Tracker {
    /// The cap on how long a single announce request may take. Announces
    /// run inline in the coordinator loop, so a dead tracker must not be
    /// able to stall it indefinitely.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(url: Url) -> Self {
        Self {
            client: Client::builder()
                .timeout(Self::REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            url,
        }
    }

    /// Sends an announce request to the tracker with the specified
    /// parameters.
    ///
    /// This is used to request peers to download from and to report
    /// statistics to the tracker.
    ///
    /// # Important
    ///
    /// The tracker may not be contacted more often than the minimum interval
    /// returned in the first announce response.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        // announce parameters are built up in the query string, see:
        // https://www.bittorrent.org/beps/bep_0003.html trackers section
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            // Indicate that the client accepts a compact response (each peer
            // takes up only 6 bytes where the first four bytes constitute the
            // IP address and the last 2 the port number, in network byte
            // order). This is always true to save network traffic (many
            // trackers don't consider this and send compact lists anyway).
            ("compact", "1".to_string()),
        ];
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip", ip.to_string()));
        }
        if let Some(event) = params.event {
            query.push(("event", event.name().to_string()));
        }

        // Hack: reqwest uses serde_urlencoded which doesn't support encoding
        // a raw byte array into a percent encoded string, but the tracker
        // expects the url encoded form of the raw info hash and peer id. So
        // the encoded values are interpolated into the url string directly;
        // all other ways (mutating the query parameters on the `Url` object,
        // serializing with `serde_bytes`) expect valid utf8 and fail on raw
        // bytes.
        let url = format!(
            "{url}\
            ?info_hash={info_hash}\
            &peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            ),
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let mut resp: Response = serde_bencode::from_bytes(&resp)?;

        if let Some(reason) = resp.failure_reason.take() {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self, warning);
        }

        Ok(resp)
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// Peers can be sent in two ways: as a bencoded list of dicts including full
/// peer metadata, or as a single bencoded string that contains only the peer
/// IP and port (compact representation). This helper deserializes both into
/// the same type, discarding the peer id present in the full representation,
/// as the engine doesn't make use of it at the stage of receiving a peer
/// list.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or list of dicts representing peers")
        }

        /// Deserializes a compact string of peers.
        ///
        /// Each entry is 6 bytes long, where the first 4 bytes are the IPv4
        /// address of the peer, and the last 2 bytes are the port of the
        /// peer. Both are in network byte order.
        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            // in the compact representation each peer must be 6 bytes long
            const ENTRY_LEN: usize = 6;
            let buf_len = b.len();

            if buf_len % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }

            let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);
            for _ in (0..buf_len).step_by(ENTRY_LEN) {
                let addr = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(addr), port));
            }

            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                let ip = if let Ok(ip) = ip.parse() {
                    ip
                } else {
                    continue;
                };
                peers.push(SocketAddr::new(ip, port));
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Deserializes an integer representing seconds into a `Duration`.
fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};

    use super::*;

    #[derive(Deserialize)]
    struct PeersResponse {
        #[serde(deserialize_with = "deserialize_peers")]
        peers: Vec<SocketAddr>,
    }

    #[test]
    fn should_parse_compact_peer_list() {
        let ip = Ipv4Addr::new(192, 168, 0, 10);
        let port = 49123;

        // build up encoded byte string
        let mut encoded = Vec::new();
        encoded.extend_from_slice(b"d5:peers");
        encoded.extend_from_slice(&encode_compact_peers_list(&[(ip, port)]));
        encoded.push(b'e');

        let decoded: PeersResponse = serde_bencode::from_bytes(&encoded)
            .expect("cannot decode bencode string of peers");
        let addr = SocketAddr::new(ip.into(), port);
        assert_eq!(decoded.peers, vec![addr]);
    }

    #[test]
    fn should_parse_full_peer_list() {
        #[derive(Debug, serde::Serialize)]
        struct RawPeer {
            ip: String,
            port: u16,
        }

        #[derive(Debug, serde::Serialize)]
        struct RawPeers {
            peers: Vec<RawPeer>,
        }

        let peers = RawPeers {
            peers: vec![
                RawPeer {
                    ip: "192.168.1.10".into(),
                    port: 55123,
                },
                RawPeer {
                    ip: "1.45.96.2".into(),
                    port: 1234,
                },
                RawPeer {
                    ip: "123.123.123.123".into(),
                    port: 49950,
                },
            ],
        };

        let encoded = serde_bencode::to_string(&peers).unwrap();

        let decoded: PeersResponse = serde_bencode::from_str(&encoded)
            .expect("cannot decode bencode list of peers");
        let expected: Vec<_> = peers
            .peers
            .iter()
            .map(|p| SocketAddr::new(p.ip.parse().unwrap(), p.port))
            .collect();
        assert_eq!(decoded.peers, expected);
    }

    #[tokio::test]
    async fn should_return_peers_on_announce() {
        let addr = mockito::server_url();
        let tracker = Tracker::new(addr.parse().unwrap());

        let info_hash_str = "abcdefghij1234567890";
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(info_hash_str.as_bytes());

        let peer_id_str = "-RM0010-123456789012";
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(peer_id_str.as_bytes());

        let announce = Announce {
            info_hash,
            peer_id,
            port: 16,
            downloaded: 1234,
            uploaded: 0,
            left: 1234,
            peer_count: Some(2),
            ip: None,
            event: Some(Event::Started),
        };
        let peer_ip = Ipv4Addr::new(2, 156, 201, 254);
        let peer_port = 49123;
        let expected_resp = Response {
            failure_reason: None,
            warning_message: None,
            interval: Some(Duration::from_secs(15)),
            min_interval: Some(Duration::from_secs(10)),
            seeder_count: Some(5),
            leecher_count: Some(3),
            peers: vec![SocketAddr::new(peer_ip.into(), peer_port)],
        };

        let mut encoded_resp = Vec::new();
        // unterminated dict
        encoded_resp.extend_from_slice(
            b"d\
            8:completei5e\
            10:incompletei3e\
            8:intervali15e\
            12:min intervali10e",
        );
        // insert peers field into dict
        encoded_resp.extend_from_slice(b"5:peers");
        encoded_resp.extend_from_slice(&encode_compact_peers_list(&[(
            peer_ip, peer_port,
        )]));
        // terminate dict
        encoded_resp.push(b'e');

        let _m = mock("GET", "/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("compact".into(), "1".into()),
                Matcher::UrlEncoded("info_hash".into(), info_hash_str.into()),
                Matcher::UrlEncoded("peer_id".into(), peer_id_str.into()),
                Matcher::UrlEncoded("port".into(), announce.port.to_string()),
                Matcher::UrlEncoded(
                    "downloaded".into(),
                    announce.downloaded.to_string(),
                ),
                Matcher::UrlEncoded(
                    "uploaded".into(),
                    announce.uploaded.to_string(),
                ),
                Matcher::UrlEncoded("left".into(), announce.left.to_string()),
                Matcher::UrlEncoded(
                    "numwant".into(),
                    announce.peer_count.unwrap().to_string(),
                ),
                Matcher::UrlEncoded("event".into(), "started".into()),
            ]))
            .with_status(200)
            .with_body(encoded_resp)
            .create();

        let resp = tracker.announce(announce).await.unwrap();
        assert_eq!(resp, expected_resp);
        assert_eq!(
            resp.announce_interval(),
            Some(Duration::from_secs(15))
        );
    }

    #[tokio::test]
    async fn should_report_tracker_failure() {
        let addr = mockito::server_url();
        let tracker = Tracker::new(addr.parse().unwrap());

        let _m = mock("GET", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason15:unknown torrente".to_vec())
            .create();

        let announce = Announce {
            info_hash: [0; 20],
            peer_id: [0; 20],
            port: 16,
            downloaded: 0,
            uploaded: 0,
            left: 0,
            peer_count: None,
            ip: None,
            event: None,
        };
        match tracker.announce(announce).await {
            Err(TrackerError::Failure(reason)) => {
                assert_eq!(reason, "unknown torrent")
            }
            other => panic!("expected tracker failure, got {:?}", other.err()),
        }
    }

    fn encode_compact_peers_list(peers: &[(Ipv4Addr, u16)]) -> Vec<u8> {
        let encoded_peers: Vec<_> = peers
            .iter()
            .flat_map(|(ip, port)| {
                ip.octets()
                    .iter()
                    .chain([(port >> 8) as u8, (port & 0xff) as u8].iter())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut encoded = Vec::new();
        encoded.extend_from_slice(encoded_peers.len().to_string().as_bytes());
        encoded.push(b':');
        encoded.extend_from_slice(&encoded_peers);

        encoded
    }
}
