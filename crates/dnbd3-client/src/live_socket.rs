use dnbd3_proto::Host;
use tokio::net::tcp::OwnedWriteHalf;

/// The live-socket state machine: `Initializing → Live → Shutting → Gone`.
/// Only code holding the manager's send-mutex may move it to `Shutting`;
/// only the background task may move it `Gone -> Live` (during a switch).
pub enum LiveSocket {
    Initializing,
    Live { write_half: OwnedWriteHalf, host: Host },
    Shutting,
    Gone,
}

impl LiveSocket {
    pub fn host(&self) -> Option<Host> {
        match self {
            LiveSocket::Live { host, .. } => Some(*host),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, LiveSocket::Live { .. })
    }
}
