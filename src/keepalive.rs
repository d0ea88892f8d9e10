use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ReliabilityConfig;
use crate::events::{ConnectionEvent, UnreachableReason};
use crate::id_provider::IdProvider;
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::peers::PeerMap;
use crate::processor::{Effects, Processor, ReceiveContext, ReceiveVerdict, SendContext};
use crate::reliability::sequence::SequenceProcessor;

struct Liveness {
    last_sent: Instant,
    last_received: Instant,
}
impl Liveness {
    fn new(now: Instant) -> Liveness {
        Liveness {
            last_sent: now,
            last_received: now,
        }
    }
}

/// Keeps idle connections alive, and detects peers that went silent.
///
/// A keepalive carries the local sequence cursor for the peer, which confirms everything up to
///  it, and the last SEQUENCE id sent to the peer, which lets the peer detect that the tail of
///  a sequence got lost.
pub struct KeepAliveProcessor {
    config: Arc<ReliabilityConfig>,
    id_provider: Arc<dyn IdProvider>,
    sequence: Arc<SequenceProcessor>,
    peers: PeerMap<Liveness>,
}

impl KeepAliveProcessor {
    pub fn new(config: Arc<ReliabilityConfig>, id_provider: Arc<dyn IdProvider>, sequence: Arc<SequenceProcessor>) -> KeepAliveProcessor {
        KeepAliveProcessor {
            config,
            id_provider,
            sequence,
            peers: PeerMap::new(),
        }
    }

    pub fn is_tracked(&self, peer: SenderId) -> bool {
        self.peers.contains(peer)
    }
}

impl Processor for KeepAliveProcessor {
    fn name(&self) -> &'static str {
        "keepalive"
    }

    fn after_send(&self, _message: &Message, ctx: &SendContext) {
        for &peer in ctx.recipients {
            self.peers.with_or_insert(peer, || Liveness::new(ctx.now), |l| l.last_sent = ctx.now);
        }
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        self.peers.with_or_insert(ctx.peer, || Liveness::new(ctx.now), |l| l.last_received = ctx.now);
        ReceiveVerdict::Continue(message)
    }

    fn on_tick(&self, now: Instant, effects: &mut Effects) {
        self.peers.for_each(|peer, l| {
            let silent_for = now.saturating_duration_since(l.last_received);
            if silent_for > self.config.timeout_threshold {
                warn!("nothing received from {} for {:?} - peer is unreachable", peer, silent_for);
                effects.event(ConnectionEvent::PeerUnreachable { peer, reason: UnreachableReason::Timeout });
                effects.remove_peer(peer);
                return;
            }

            if now.saturating_duration_since(l.last_sent) >= self.config.keepalive_interval {
                debug!("sending keepalive to {}", peer);
                effects.send(peer, ReliableMode::Unreliable, MessageBody::KeepAlive {
                    last_received_seq_id: self.sequence.cursor(peer).unwrap_or(MessageId::ZERO),
                    last_sent_seq_id: self.id_provider.last_id(self.id_provider.stream_of(peer, ReliableMode::Sequence)),
                });
                // sending goes through the pipeline, but a peer must not get two keepalives if
                //  the send is delayed past the next tick
                l.last_sent = now;
            }
        });
    }

    fn on_peer_removed(&self, peer: SenderId) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_provider::{ClientScopedIdProvider, StreamKey};
    use crate::message_log::MessageLogProcessor;
    use crate::processor::Outgoing;
    use crate::test_util::{payload, receive_ctx_at};
    use std::time::Duration;

    fn sender(raw: u32) -> SenderId {
        SenderId::from_raw(raw)
    }

    fn processor() -> (KeepAliveProcessor, Arc<dyn IdProvider>, Arc<SequenceProcessor>) {
        let config = Arc::new(ReliabilityConfig {
            keepalive_interval: Duration::from_secs(3),
            timeout_threshold: Duration::from_secs(18),
            ..ReliabilityConfig::new()
        });
        let id_provider: Arc<dyn IdProvider> = Arc::new(ClientScopedIdProvider::new());
        let log = Arc::new(MessageLogProcessor::new(&config));
        let sequence = Arc::new(SequenceProcessor::new(config.clone(), id_provider.clone(), log, false));
        (KeepAliveProcessor::new(config, id_provider.clone(), sequence.clone()), id_provider, sequence)
    }

    fn sent(processor: &KeepAliveProcessor, to: SenderId, now: Instant) {
        processor.after_send(&payload(SenderId::SERVER, 1, ReliableMode::Unreliable), &SendContext {
            recipients: &[to],
            stream: StreamKey::new(ReliableMode::Unreliable, None),
            now,
        });
    }

    #[test]
    fn test_keepalive_after_idle_interval() {
        let (processor, id_provider, sequence) = processor();
        let start = Instant::now();
        sequence.seed_baseline(sender(2), MessageId::from_raw(8));
        id_provider.reserve(id_provider.stream_of(sender(2), ReliableMode::Sequence), 5);
        sent(&processor, sender(2), start);

        let mut effects = Effects::default();
        processor.on_tick(start + Duration::from_millis(2999), &mut effects);
        assert!(effects.is_empty());

        processor.on_tick(start + Duration::from_secs(3), &mut effects);
        assert_eq!(effects.outgoing, vec![Outgoing::New {
            to: sender(2),
            mode: ReliableMode::Unreliable,
            body: MessageBody::KeepAlive { last_received_seq_id: MessageId::from_raw(8), last_sent_seq_id: MessageId::from_raw(5) },
        }]);

        let mut effects = Effects::default();
        processor.on_tick(start + Duration::from_millis(3050), &mut effects);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_silent_peer_is_unreachable() {
        let (processor, _, _) = processor();
        let start = Instant::now();
        processor.before_receive(payload(sender(3), 1, ReliableMode::Unreliable), &mut receive_ctx_at(sender(3), start));

        let mut effects = Effects::default();
        processor.on_tick(start + Duration::from_secs(18), &mut effects);
        assert!(effects.events.is_empty());

        let mut effects = Effects::default();
        processor.on_tick(start + Duration::from_millis(18_001), &mut effects);
        assert_eq!(effects.events, vec![ConnectionEvent::PeerUnreachable { peer: sender(3), reason: UnreachableReason::Timeout }]);
        assert_eq!(effects.removed_peers, vec![sender(3)]);

        processor.on_peer_removed(sender(3));
        assert!(!processor.is_tracked(sender(3)));
    }

    #[test]
    fn test_receiving_keeps_peer_alive() {
        let (processor, _, _) = processor();
        let start = Instant::now();
        for secs in [0, 10, 20, 30] {
            processor.before_receive(payload(sender(3), 1, ReliableMode::Unreliable), &mut receive_ctx_at(sender(3), start + Duration::from_secs(secs)));
            sent(&processor, sender(3), start + Duration::from_secs(secs));
        }

        let mut effects = Effects::default();
        processor.on_tick(start + Duration::from_secs(32), &mut effects);
        assert!(effects.is_empty());
    }
}
