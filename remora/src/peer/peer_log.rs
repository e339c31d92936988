//! Logging macros for use solely by `peer::PeerSession`.
//!
//! The first parameter has to be `self` of the `peer::PeerSession` instance,
//! the rest are the format string and its arguments. The macros prepend the
//! log message with the peer's address, which makes it possible to filter
//! the log down to a single peer.

macro_rules! peer_log {
    ($self:ident, $lvl:expr, $($arg:tt)*) => {
        ::log::log!($lvl, "[{}] {}", $self.addr, format_args!($($arg)*))
    };
}

macro_rules! peer_warn {
    ($self:ident, $($arg:tt)*) => {
        peer_log!($self, ::log::Level::Warn, $($arg)*)
    };
}

macro_rules! peer_info {
    ($self:ident, $($arg:tt)*) => {
        peer_log!($self, ::log::Level::Info, $($arg)*)
    };
}

macro_rules! peer_debug {
    ($self:ident, $($arg:tt)*) => {
        peer_log!($self, ::log::Level::Debug, $($arg)*)
    };
}

macro_rules! peer_trace {
    ($self:ident, $($arg:tt)*) => {
        peer_log!($self, ::log::Level::Trace, $($arg)*)
    };
}
