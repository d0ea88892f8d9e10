use tokio::sync::broadcast;
use tracing::trace;

use crate::message::{MessageId, SenderId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnreachableReason {
    /// nothing was received from the peer for longer than the configured threshold
    Timeout,
    /// a message was retransmitted the maximum number of times without being acknowledged
    RetransmitLimit,
    /// a message the peer did not confirm yet was evicted from the full message log, so the
    ///  peer can never receive it
    MessageLost,
}

/// Connection lifecycle events. Transient conditions (duplicates, corruption, gaps) are handled
///  inside the engine and never show up here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Connected { peer: SenderId },
    /// All clients listed in the server's `expected_client_ids` are connected
    AllExpectedClientsConnected,
    Disconnected { peer: SenderId },
    PeerUnreachable { peer: SenderId, reason: UnreachableReason },
    /// A part of a multi-part message arrived while the peer had the maximum number of
    ///  incomplete multi-part messages pending. The part was rejected.
    ReassemblyConflict { peer: SenderId, pending_parent_id: MessageId, rejected_parent_id: MessageId },
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        ConnectionEventNotifier::new()
    }
}
