use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::message::{MessageId, ReliableMode, SenderId};

/// An application message after it passed all reliability stages: reassembled, deduplicated,
///  and (for SEQUENCE messages) in order
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub sender_id: SenderId,
    pub id: MessageId,
    pub reliable_mode: ReliableMode,
    pub payload: Bytes,
}

/// The application's callback for received messages. It is called with the sender's receive
///  gate held, so messages from one sender arrive one at a time and in delivery order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageReceiver: Sync + Send {
    async fn on_message(&self, message: ReceivedMessage);
}
