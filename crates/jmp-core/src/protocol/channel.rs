//! Connectivity contract for one physical RPC channel.

use std::fmt;

/// Connectivity state of a channel, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A physical channel to a peer.
///
/// Implementations are provided by the transport layer.
pub trait Channel: Send + Sync {
    /// Human-readable target, used in logs (e.g. `"direct:10.0.0.5:8082"`).
    fn target(&self) -> &str;

    /// Returns the current connectivity state.
    ///
    /// When `try_to_connect` is true an idle channel starts connecting as a
    /// side effect of the check.
    fn state(&self, try_to_connect: bool) -> ConnectivityState;
}
