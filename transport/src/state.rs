use bytes::Bytes;
use std::fmt;

/// Connection lifecycle of a transport instance.
///
/// Transitions run strictly forward, except that `Connected` and `Failed`
/// both lead back to `Disconnected` on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, and the state after a close or stream teardown.
    Disconnected,
    /// Resolution succeeded and a candidate attempt is in flight.
    Connecting,
    /// The TCP connect completed, or an adopted socket was confirmed live.
    Connected,
    /// Every candidate address was exhausted without success. Terminal.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Upward delivery from the transport.
///
/// `Idle` is the zero-length heartbeat tick ("no data, still connected");
/// `Closed` marks the end of the stream. Consumers can always tell the two
/// apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A non-empty chunk of received bytes.
    Data(Bytes),
    /// Idle tick, no data. The connection is still open.
    Idle,
    /// The stream ended: peer closed cleanly or the connection was lost.
    Closed,
}
