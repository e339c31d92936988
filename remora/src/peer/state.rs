use std::time::Instant;

use super::codec::Message;
use crate::{counter::Counter, PeerId};

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConnectionState {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is set once the handshakes are exchanged and left as soon
    /// as we receive the bitfield or the first message that is not a
    /// bitfield. Any subsequent bitfield messages are rejected and the
    /// connection is dropped, as per the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
#[derive(Debug)]
pub(super) struct PeerInfo {
    /// The peer's 20 byte BitTorrent id.
    #[allow(dead_code)]
    pub id: PeerId,
}

/// The mutable state of a peer session.
///
/// The four booleans mirror the wire protocol's flow control: both sides of
/// a fresh connection start out choked and not interested. Since this build
/// never unchokes anyone, `am_choking` stays true for the session's whole
/// life.
pub(super) struct SessionState {
    pub connection: ConnectionState,
    pub peer: Option<PeerInfo>,

    /// Whether we choke the peer. Always true in this leech-only build.
    pub am_choking: bool,
    /// Whether the peer has pieces we still need.
    pub am_interested: bool,
    /// While the peer chokes us we issue no requests.
    pub peer_choking: bool,
    /// Whether the peer wants pieces of us. Acknowledged but never acted
    /// upon.
    pub peer_interested: bool,

    /// When we last wrote to the peer, seeded by the handshake. Drives the
    /// keepalive timer.
    pub last_send_time: Option<Instant>,
    /// When we last heard from the peer, seeded by the handshake. Drives
    /// the inactivity drop.
    pub last_recv_time: Option<Instant>,

    /// Counts the payload bytes received.
    pub downloaded_payload_counter: Counter,
    /// Counts the bytes received during protocol chatter.
    pub downloaded_protocol_counter: Counter,
    /// Counts the bytes sent during protocol chatter.
    pub uploaded_protocol_counter: Counter,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            peer: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            last_send_time: None,
            last_recv_time: None,
            downloaded_payload_counter: Counter::default(),
            downloaded_protocol_counter: Counter::default(),
            uploaded_protocol_counter: Counter::default(),
        }
    }
}

impl SessionState {
    /// Applies the remote's new choke state. Returns true if the state
    /// changed.
    pub fn on_peer_choke(&mut self, choking: bool) -> bool {
        let changed = self.peer_choking != choking;
        self.peer_choking = choking;
        changed
    }

    /// Re-evaluates our interest in the peer. Interest messages are
    /// edge-triggered: a message is only returned (to be sent) when the
    /// state actually flips.
    pub fn update_interest(&mut self, interesting: bool) -> Option<Message> {
        if interesting && !self.am_interested {
            self.am_interested = true;
            Some(Message::Interested)
        } else if !interesting && self.am_interested {
            self.am_interested = false;
            Some(Message::NotInterested)
        } else {
            None
        }
    }

    /// Marks the end of a statistics round. Called once a second.
    pub fn tick(&mut self) {
        self.downloaded_payload_counter.reset();
        self.downloaded_protocol_counter.reset();
        self.uploaded_protocol_counter.reset();
    }

    #[cfg(test)]
    fn flags(&self) -> (bool, bool, bool, bool) {
        (
            self.am_choking,
            self.am_interested,
            self.peer_choking,
            self.peer_interested,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Drives the session flags with a protocol trace and verifies that the
    // (am_choking, am_interested, peer_choking, peer_interested) tuple is
    // the expected projection of the trace at every step.
    #[test]
    fn test_flag_projection() {
        let mut state = SessionState::default();
        assert_eq!(state.flags(), (true, false, true, false));

        // peer advertises pieces we need
        assert_eq!(state.update_interest(true), Some(Message::Interested));
        assert_eq!(state.flags(), (true, true, true, false));

        // repeated evaluation does not re-send
        assert_eq!(state.update_interest(true), None);

        // peer unchokes us
        assert!(state.on_peer_choke(false));
        assert_eq!(state.flags(), (true, true, false, false));
        // a duplicate unchoke is no change
        assert!(!state.on_peer_choke(false));

        // peer becomes interested in us; we acknowledge but never unchoke
        state.peer_interested = true;
        assert_eq!(state.flags(), (true, true, false, true));

        // peer chokes us again
        assert!(state.on_peer_choke(true));
        assert_eq!(state.flags(), (true, true, true, true));

        // nothing left we need from the peer
        assert_eq!(
            state.update_interest(false),
            Some(Message::NotInterested)
        );
        assert_eq!(state.flags(), (true, false, true, true));
        assert_eq!(state.update_interest(false), None);
    }
}
