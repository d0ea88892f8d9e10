use std::collections::VecDeque;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::trace;

use crate::checksum::ChecksumProcessor;
use crate::chunking::ReassemblyProcessor;
use crate::config::ReliabilityConfig;
use crate::handshake::{ConnectionHandshake, Role};
use crate::id_provider::IdProvider;
use crate::keepalive::KeepAliveProcessor;
use crate::message::{Message, MessageId, ReliableMode, SenderId};
use crate::message_log::MessageLogProcessor;
use crate::peers::{LocalIdentity, PeerRegistry};
use crate::processor::{DiscardInternalProcessor, Effects, Processor, ReceiveContext, ReceiveVerdict, SendContext};
use crate::reliability::ack::AckProcessor;
use crate::reliability::sequence::SequenceProcessor;

/// The chain of [Processor]s every message passes. The order is fixed when the pipeline is
///  built: the checksum is checked first, bookkeeping of sent messages comes before the
///  reliability stages, and internal messages are dropped last.
///
/// The built-in stages are kept as typed references as well, so stages that coordinate with
///  each other (and the engine) call each other directly.
pub struct Pipeline {
    checksum: Arc<ChecksumProcessor>,
    handshake: Arc<ConnectionHandshake>,
    keep_alive: Arc<KeepAliveProcessor>,
    message_log: Arc<MessageLogProcessor>,
    ack: Arc<AckProcessor>,
    sequence: Arc<SequenceProcessor>,
    reassembly: Arc<ReassemblyProcessor>,
    id_provider: Arc<dyn IdProvider>,
    stages: Vec<Arc<dyn Processor>>,
}

/// Builds the standard pipeline for an end point
pub fn default_pipeline(
    config: Arc<ReliabilityConfig>,
    role: Role,
    local: Arc<LocalIdentity>,
    registry: Arc<PeerRegistry>,
    id_provider: Arc<dyn IdProvider>,
) -> Pipeline {
    let adopt_first_id = role == Role::Server && config.auto_register_peers;

    let checksum = Arc::new(ChecksumProcessor);
    let message_log = Arc::new(MessageLogProcessor::new(&config));
    let sequence = Arc::new(SequenceProcessor::new(config.clone(), id_provider.clone(), message_log.clone(), adopt_first_id));
    let ack = Arc::new(AckProcessor::new(config.clone(), id_provider.clone(), message_log.clone()));
    let handshake = Arc::new(ConnectionHandshake::new(role, config.clone(), local, registry, id_provider.clone(), sequence.clone()));
    let keep_alive = Arc::new(KeepAliveProcessor::new(config.clone(), id_provider.clone(), sequence.clone()));
    let reassembly = Arc::new(ReassemblyProcessor::new(config));

    let stages: Vec<Arc<dyn Processor>> = vec![
        checksum.clone(),
        handshake.clone(),
        keep_alive.clone(),
        message_log.clone(),
        ack.clone(),
        sequence.clone(),
        reassembly.clone(),
        Arc::new(DiscardInternalProcessor),
    ];

    Pipeline {
        checksum,
        handshake,
        keep_alive,
        message_log,
        ack,
        sequence,
        reassembly,
        id_provider,
        stages,
    }
}

impl Pipeline {
    /// Adds a stage after the built-in stages, but before internal messages are dropped
    pub fn add_processor(&mut self, processor: Arc<dyn Processor>) {
        let idx = self.stages.len() - 1;
        self.stages.insert(idx, processor);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter()
            .map(|s| s.name())
            .collect()
    }

    pub fn checksum(&self) -> &Arc<ChecksumProcessor> {
        &self.checksum
    }

    pub fn handshake(&self) -> &Arc<ConnectionHandshake> {
        &self.handshake
    }

    pub fn keep_alive(&self) -> &Arc<KeepAliveProcessor> {
        &self.keep_alive
    }

    pub fn message_log(&self) -> &Arc<MessageLogProcessor> {
        &self.message_log
    }

    pub fn ack(&self) -> &Arc<AckProcessor> {
        &self.ack
    }

    pub fn sequence(&self) -> &Arc<SequenceProcessor> {
        &self.sequence
    }

    pub fn reassembly(&self) -> &Arc<ReassemblyProcessor> {
        &self.reassembly
    }

    pub fn before_send(&self, message: &mut Message, ctx: &SendContext) {
        // stages run in reverse so the checksum is computed last, over the final message
        for stage in self.stages.iter().rev() {
            stage.before_send(message, ctx);
        }
    }

    pub fn after_send(&self, message: &Message, ctx: &SendContext) {
        for stage in &self.stages {
            stage.after_send(message, ctx);
        }
    }

    /// Passes a received message through all stages, returning the messages to deliver to the
    ///  application in the order of delivery. That may be no message at all if the message
    ///  was consumed or held back, or several if it released held messages.
    pub fn receive(&self, message: Message, ctx: &mut ReceiveContext) -> Vec<Message> {
        let mut delivered = Vec::new();
        let mut work = VecDeque::from([(0usize, message)]);

        while let Some((start, message)) = work.pop_front() {
            let mut released = Vec::new();
            if let Some(message) = self.run_stages(start, message, ctx, &mut released) {
                for stage in &self.stages {
                    stage.after_receive(&message, ctx);
                }
                delivered.push(message);
            }

            // messages released while processing this message follow it, before anything
            //  that was queued earlier
            for item in released.into_iter().rev() {
                work.push_front(item);
            }
        }

        delivered
    }

    fn run_stages(&self, start: usize, mut message: Message, ctx: &mut ReceiveContext, released: &mut Vec<(usize, Message)>) -> Option<Message> {
        for (idx, stage) in self.stages.iter().enumerate().skip(start) {
            let verdict = stage.before_receive(message, ctx);
            released.extend(ctx.take_released().into_iter().map(|m| (idx + 1, m)));

            message = match verdict {
                ReceiveVerdict::Continue(message) => message,
                ReceiveVerdict::Hold | ReceiveVerdict::Discard => return None,
                ReceiveVerdict::Reject(message) => {
                    trace!("message {} from {} was rejected by {}", message.id, ctx.peer, stage.name());
                    for earlier in self.stages[start..idx].iter().rev() {
                        earlier.on_rejected(&message, ctx);
                    }
                    return None;
                }
            };
        }
        Some(message)
    }

    pub fn tick(&self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        for stage in &self.stages {
            stage.on_tick(now, &mut effects);
        }
        effects
    }

    /// Removes all state held for a peer
    pub fn remove_peer(&self, peer: SenderId) {
        for stage in &self.stages {
            stage.on_peer_removed(peer);
        }
        self.id_provider.remove_scope(peer);
    }

    /// The last SEQUENCE id sent to a peer
    pub fn last_sequence_id_sent(&self, peer: SenderId) -> MessageId {
        self.id_provider.last_id(self.id_provider.stream_of(peer, ReliableMode::Sequence))
    }
}
