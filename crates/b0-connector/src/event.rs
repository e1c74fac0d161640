//! Socket lifecycle events
//!
//! The reconciler emits these into a bounded channel; the dispatcher is the
//! single reader, which preserves per-socket ordering.

use b0_core::Socket;

/// Connect/disconnect commands flowing from the reconciler to the
/// dispatcher.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Open a tunnel for this socket unless one is already live.
    Connect { socket: Socket },
    /// Close and deregister the socket's tunnel.
    Disconnect { socket_id: String },
}
