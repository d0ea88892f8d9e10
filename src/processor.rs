use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::trace;

use crate::events::ConnectionEvent;
use crate::id_provider::StreamKey;
use crate::message::{Message, MessageBody, ReliableMode, SenderId};

/// A stage of the [crate::pipeline::Pipeline]. Every message that is sent or received passes
///  through all stages in their fixed order, and every stage gets a chance to do periodic work
///  on each tick.
///
/// Hooks are synchronous and must return promptly. Stages that need to send messages (acks,
///  retransmissions, id requests) describe them as [Effects], and the engine sends them after
///  the hook returns.
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_send(&self, _message: &mut Message, _ctx: &SendContext) {
    }

    fn after_send(&self, _message: &Message, _ctx: &SendContext) {
    }

    fn before_receive(&self, message: Message, _ctx: &mut ReceiveContext) -> ReceiveVerdict {
        ReceiveVerdict::Continue(message)
    }

    /// Called for messages that passed all stages and are about to be delivered
    fn after_receive(&self, _message: &Message, _ctx: &mut ReceiveContext) {
    }

    /// Called if a later stage rejected a message that this stage let pass. Stages that
    ///  recorded a message as processed must undo that, so a retransmission of the message
    ///  is processed again.
    fn on_rejected(&self, _message: &Message, _ctx: &mut ReceiveContext) {
    }

    fn on_tick(&self, _now: Instant, _effects: &mut Effects) {
    }

    /// All state held for the peer must be removed before this returns
    fn on_peer_removed(&self, _peer: SenderId) {
    }
}

pub struct SendContext<'a> {
    pub recipients: &'a [SenderId],
    pub stream: StreamKey,
    pub now: Instant,
}

#[derive(Debug)]
pub enum ReceiveVerdict {
    /// pass the (possibly replaced) message on to the next stage
    Continue(Message),
    /// the stage keeps the message, and may release it later
    Hold,
    /// the message is consumed, e.g. because it is a duplicate
    Discard,
    /// the message can not be processed now: earlier stages must forget they saw it
    Reject(Message),
}

/// A message the engine sends on behalf of a stage
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outgoing {
    /// a new message, which gets an id and passes the send pipeline like any other
    New { to: SenderId, mode: ReliableMode, body: MessageBody },
    /// a previously sent message, sent again as it is
    Resend { to: SenderId, message: Message },
}

#[derive(Debug, Default)]
pub struct Effects {
    pub outgoing: Vec<Outgoing>,
    pub events: Vec<ConnectionEvent>,
    /// peers whose state must be removed from the engine
    pub removed_peers: Vec<SenderId>,
}
impl Effects {
    pub fn send(&mut self, to: SenderId, mode: ReliableMode, body: MessageBody) {
        self.outgoing.push(Outgoing::New { to, mode, body });
    }

    pub fn resend(&mut self, to: SenderId, message: Message) {
        self.outgoing.push(Outgoing::Resend { to, message });
    }

    pub fn event(&mut self, event: ConnectionEvent) {
        self.events.push(event);
    }

    pub fn remove_peer(&mut self, peer: SenderId) {
        if !self.removed_peers.contains(&peer) {
            self.removed_peers.push(peer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty() && self.removed_peers.is_empty()
    }
}

/// The state of processing one received datagram
pub struct ReceiveContext {
    /// the peer the message was received from
    pub peer: SenderId,
    pub from: SocketAddr,
    pub now: Instant,
    pub effects: Effects,
    released: Vec<Message>,
}
impl ReceiveContext {
    pub fn new(peer: SenderId, from: SocketAddr, now: Instant) -> ReceiveContext {
        ReceiveContext {
            peer,
            from,
            now,
            effects: Default::default(),
            released: Vec::new(),
        }
    }

    /// Releases a message the current stage held back. It continues with the stage after the
    ///  current one, after the message currently being processed.
    pub fn release(&mut self, message: Message) {
        self.released.push(message);
    }

    pub fn take_released(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.released)
    }
}

/// The last stage before delivery: engine-internal messages are consumed here after all
///  reliability stages saw them.
pub struct DiscardInternalProcessor;

impl Processor for DiscardInternalProcessor {
    fn name(&self) -> &'static str {
        "discard-internal"
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        if message.is_internal() {
            trace!("consumed {:?} message {} from {}", message.body.kind(), message.id, ctx.peer);
            ReceiveVerdict::Discard
        }
        else {
            ReceiveVerdict::Continue(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::test_util::receive_ctx;
    use bytes::Bytes;

    #[test]
    fn test_discard_internal() {
        let mut ctx = receive_ctx(SenderId::from_raw(1));
        let leave = Message::new(MessageId::from_raw(1), SenderId::from_raw(1), ReliableMode::Unreliable, MessageBody::Leave);
        assert!(matches!(DiscardInternalProcessor.before_receive(leave, &mut ctx), ReceiveVerdict::Discard));

        let payload = Message::new(MessageId::from_raw(2), SenderId::from_raw(1), ReliableMode::Unreliable, MessageBody::Payload(Bytes::new()));
        assert!(matches!(DiscardInternalProcessor.before_receive(payload, &mut ctx), ReceiveVerdict::Continue(_)));
    }

    #[test]
    fn test_effects_remove_peer_once() {
        let mut effects = Effects::default();
        effects.remove_peer(SenderId::from_raw(2));
        effects.remove_peer(SenderId::from_raw(2));
        assert_eq!(effects.removed_peers, vec![SenderId::from_raw(2)]);
        assert!(!effects.is_empty());
    }
}
