use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::max_ids_per_datagram;
use crate::config::ReliabilityConfig;
use crate::events::{ConnectionEvent, UnreachableReason};
use crate::id_provider::IdProvider;
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::message_log::{AckOutcome, MessageKey, MessageLogProcessor};
use crate::peers::PeerMap;
use crate::processor::{Effects, Processor, ReceiveContext, ReceiveVerdict};

#[derive(Default)]
struct PeerAcks {
    /// ACK_PACKET ids received from the peer, bounded by the configured maximum
    received: BTreeSet<MessageId>,
    /// ids up to here count as received once they dropped out of `received`
    floor: MessageId,
    /// received ids waiting to be acknowledged with the next tick
    queued: BTreeSet<MessageId>,
}

/// Reliability for ACK_PACKET messages: the receiver acknowledges every message, and the sender
///  retransmits messages verbatim until all their recipients acknowledged them.
///
/// Acks are not sent per message, but collected and sent in batches on each tick. A duplicate
///  means the sender did not get the previous ack, so it is acknowledged again.
pub struct AckProcessor {
    config: Arc<ReliabilityConfig>,
    id_provider: Arc<dyn IdProvider>,
    message_log: Arc<MessageLogProcessor>,
    peers: PeerMap<PeerAcks>,
}

impl AckProcessor {
    pub fn new(config: Arc<ReliabilityConfig>, id_provider: Arc<dyn IdProvider>, message_log: Arc<MessageLogProcessor>) -> AckProcessor {
        AckProcessor {
            config,
            id_provider,
            message_log,
            peers: PeerMap::new(),
        }
    }

    pub fn queued_acks(&self, peer: SenderId) -> Vec<MessageId> {
        self.peers.with_existing(peer, |acks| acks.queued.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn on_ack_ids(&self, peer: SenderId, ids: &[MessageId]) {
        let stream = self.id_provider.stream_of(peer, ReliableMode::AckPacket);
        let mut log = self.message_log.lock();
        for &id in ids {
            match log.acknowledge(&MessageKey { stream, id }, peer) {
                AckOutcome::Completed => trace!("message {} is acknowledged completely", id),
                AckOutcome::StillPending => trace!("{} acknowledged message {}, other recipients are pending", peer, id),
                AckOutcome::Unknown => trace!("{} acknowledged message {}, which is not pending", peer, id),
            }
        }
    }

    fn flush_acks(&self, effects: &mut Effects) {
        let max_ids = self.config.max_ack_ids_per_message
            .min(max_ids_per_datagram(self.config.max_datagram_payload))
            .max(1);
        self.peers.for_each(|peer, acks| {
            if acks.queued.is_empty() {
                return;
            }
            let ids = std::mem::take(&mut acks.queued).into_iter().collect::<Vec<_>>();
            for chunk in ids.chunks(max_ids) {
                effects.send(peer, ReliableMode::Unreliable, MessageBody::Ack { ids: chunk.to_vec() });
            }
        });
    }

    fn retransmit(&self, now: Instant, effects: &mut Effects) {
        let mut log = self.message_log.lock();

        let due = log.entries_due_for_retransmit(now, self.config.ack_timeout)
            .filter(|(key, _)| key.stream.mode == ReliableMode::AckPacket)
            .map(|(key, entry)| (key, entry.retransmit_count))
            .collect::<Vec<_>>();

        for (key, retransmit_count) in due {
            if let Some(max_attempts) = self.config.max_retransmit_attempts {
                if retransmit_count >= max_attempts {
                    if let Some(entry) = log.evict(key) {
                        let mut unreachable = entry.pending.into_iter().collect::<Vec<_>>();
                        unreachable.sort();
                        for peer in unreachable {
                            if effects.removed_peers.contains(&peer) {
                                continue;
                            }
                            warn!("message {} was not acknowledged by {} after {} retransmissions - peer is unreachable", key.id, peer, retransmit_count);
                            effects.event(ConnectionEvent::PeerUnreachable { peer, reason: UnreachableReason::RetransmitLimit });
                            effects.remove_peer(peer);
                        }
                    }
                    continue;
                }
            }

            log.mark_retransmitted(&key, now);
            if let Some(entry) = log.get(&key) {
                let mut pending = entry.pending.iter().cloned().collect::<Vec<_>>();
                pending.sort();
                for peer in pending {
                    debug!("message {} was not acknowledged by {} - retransmitting", key.id, peer);
                    effects.resend(peer, entry.message.clone());
                }
            }
        }
    }
}

impl Processor for AckProcessor {
    fn name(&self) -> &'static str {
        "ack"
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        let ack_ids = message.ack_ids();
        if !ack_ids.is_empty() {
            self.on_ack_ids(ctx.peer, ack_ids);
        }

        if message.reliable_mode != ReliableMode::AckPacket {
            return ReceiveVerdict::Continue(message);
        }

        let max_tracked = self.config.max_tracked_received_ids;
        self.peers.with(ctx.peer, |acks| {
            acks.queued.insert(message.id);

            if message.id <= acks.floor {
                warn!("message {} from {} is at or below the tracking floor {} - treating it as a duplicate, it is lost if it was never received before", message.id, ctx.peer, acks.floor);
                return ReceiveVerdict::Discard;
            }
            if !acks.received.insert(message.id) {
                debug!("duplicate message {} from {} - acknowledging it again", message.id, ctx.peer);
                return ReceiveVerdict::Discard;
            }

            while acks.received.len() > max_tracked {
                if let Some(oldest) = acks.received.pop_first() {
                    acks.floor = acks.floor.max(oldest);
                }
            }
            ReceiveVerdict::Continue(message)
        })
    }

    fn on_rejected(&self, message: &Message, ctx: &mut ReceiveContext) {
        if message.reliable_mode != ReliableMode::AckPacket {
            return;
        }
        self.peers.with_existing(ctx.peer, |acks| {
            trace!("un-registering rejected message {} from {}", message.id, ctx.peer);
            acks.received.remove(&message.id);
            acks.queued.remove(&message.id);
        });
    }

    fn on_tick(&self, now: Instant, effects: &mut Effects) {
        self.flush_acks(effects);
        self.retransmit(now, effects);
    }

    fn on_peer_removed(&self, peer: SenderId) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_provider::{GlobalIdProvider, StreamKey};
    use crate::processor::{Outgoing, SendContext};
    use crate::test_util::{payload, receive_ctx_at};
    use std::time::Duration;

    fn id(raw: u64) -> MessageId {
        MessageId::from_raw(raw)
    }

    fn sender(raw: u32) -> SenderId {
        SenderId::from_raw(raw)
    }

    struct Fixture {
        log: Arc<MessageLogProcessor>,
        processor: AckProcessor,
    }

    fn fixture(modify_config: impl FnOnce(&mut ReliabilityConfig)) -> Fixture {
        let mut config = ReliabilityConfig::new();
        modify_config(&mut config);
        let config = Arc::new(config);
        let log = Arc::new(MessageLogProcessor::new(&config));
        Fixture {
            processor: AckProcessor::new(config, Arc::new(GlobalIdProvider::new()), log.clone()),
            log,
        }
    }

    fn ack_stream() -> StreamKey {
        StreamKey::new(ReliableMode::AckPacket, None)
    }

    fn record_sent(log: &MessageLogProcessor, raw_id: u64, recipients: &[SenderId], now: Instant) {
        let ctx = SendContext { recipients, stream: ack_stream(), now };
        log.after_send(&payload(SenderId::SERVER, raw_id, ReliableMode::AckPacket), &ctx);
    }

    fn ack(from: SenderId, ids: &[u64]) -> Message {
        Message::new(id(100), from, ReliableMode::Unreliable, MessageBody::Ack { ids: ids.iter().cloned().map(id).collect() })
    }

    #[test]
    fn test_ack_from_two_recipients() {
        let f = fixture(|_| {});
        let now = Instant::now();
        record_sent(&f.log, 1, &[sender(1), sender(2)], now);

        let mut ctx = receive_ctx_at(sender(1), now);
        f.processor.before_receive(ack(sender(1), &[1]), &mut ctx);
        let pending = f.log.lock().get(&MessageKey { stream: ack_stream(), id: id(1) }).map(|e| e.pending.len());
        assert_eq!(pending, Some(1));

        let mut ctx = receive_ctx_at(sender(2), now);
        f.processor.before_receive(ack(sender(2), &[1]), &mut ctx);
        assert!(f.log.lock().is_empty());
    }

    #[test]
    fn test_received_messages_are_acked_in_batches() {
        let f = fixture(|c| c.max_ack_ids_per_message = 2);
        let now = Instant::now();
        let mut ctx = receive_ctx_at(sender(3), now);
        for i in [5, 3, 4] {
            let verdict = f.processor.before_receive(payload(sender(3), i, ReliableMode::AckPacket), &mut ctx);
            assert!(matches!(verdict, ReceiveVerdict::Continue(_)));
        }
        assert_eq!(f.processor.queued_acks(sender(3)), vec![id(3), id(4), id(5)]);

        let mut effects = Effects::default();
        f.processor.on_tick(now, &mut effects);
        assert_eq!(effects.outgoing, vec![
            Outgoing::New { to: sender(3), mode: ReliableMode::Unreliable, body: MessageBody::Ack { ids: vec![id(3), id(4)] } },
            Outgoing::New { to: sender(3), mode: ReliableMode::Unreliable, body: MessageBody::Ack { ids: vec![id(5)] } },
        ]);
        assert!(f.processor.queued_acks(sender(3)).is_empty());
    }

    #[test]
    fn test_duplicate_is_discarded_and_acked_again() {
        let f = fixture(|_| {});
        let now = Instant::now();
        let mut ctx = receive_ctx_at(sender(3), now);
        f.processor.before_receive(payload(sender(3), 1, ReliableMode::AckPacket), &mut ctx);
        f.processor.on_tick(now, &mut Effects::default());

        let verdict = f.processor.before_receive(payload(sender(3), 1, ReliableMode::AckPacket), &mut ctx);
        assert!(matches!(verdict, ReceiveVerdict::Discard));
        assert_eq!(f.processor.queued_acks(sender(3)), vec![id(1)]);
    }

    #[test]
    fn test_tracked_ids_are_bounded() {
        let f = fixture(|c| c.max_tracked_received_ids = 2);
        let mut ctx = receive_ctx_at(sender(3), Instant::now());
        for i in 1..=4 {
            f.processor.before_receive(payload(sender(3), i, ReliableMode::AckPacket), &mut ctx);
        }
        // 1 and 2 dropped out of the tracked set, but still count as received
        assert!(matches!(f.processor.before_receive(payload(sender(3), 1, ReliableMode::AckPacket), &mut ctx), ReceiveVerdict::Discard));
        assert!(matches!(f.processor.before_receive(payload(sender(3), 4, ReliableMode::AckPacket), &mut ctx), ReceiveVerdict::Discard));
        assert!(matches!(f.processor.before_receive(payload(sender(3), 5, ReliableMode::AckPacket), &mut ctx), ReceiveVerdict::Continue(_)));
    }

    #[test]
    fn test_unseen_id_below_floor_is_dropped_and_acked() {
        let f = fixture(|c| c.max_tracked_received_ids = 2);
        let mut ctx = receive_ctx_at(sender(3), Instant::now());
        for i in 2..=5 {
            f.processor.before_receive(payload(sender(3), i, ReliableMode::AckPacket), &mut ctx);
        }
        f.processor.on_tick(Instant::now(), &mut Effects::default());

        // 1 never arrived, but it is below the floor of 3
        assert!(matches!(f.processor.before_receive(payload(sender(3), 1, ReliableMode::AckPacket), &mut ctx), ReceiveVerdict::Discard));
        assert_eq!(f.processor.queued_acks(sender(3)), vec![id(1)]);
    }

    #[test]
    fn test_rejected_message_is_forgotten() {
        let f = fixture(|_| {});
        let mut ctx = receive_ctx_at(sender(3), Instant::now());
        let msg = payload(sender(3), 1, ReliableMode::AckPacket);
        f.processor.before_receive(msg.clone(), &mut ctx);
        f.processor.on_rejected(&msg, &mut ctx);

        assert!(f.processor.queued_acks(sender(3)).is_empty());
        assert!(matches!(f.processor.before_receive(msg, &mut ctx), ReceiveVerdict::Continue(_)));
    }

    #[test]
    fn test_unacknowledged_is_retransmitted() {
        let f = fixture(|_| {});
        let start = Instant::now();
        record_sent(&f.log, 1, &[sender(1), sender(2)], start);

        let mut ctx = receive_ctx_at(sender(1), start);
        f.processor.before_receive(ack(sender(1), &[1]), &mut ctx);

        let mut effects = Effects::default();
        f.processor.on_tick(start + Duration::from_millis(499), &mut effects);
        assert!(effects.outgoing.is_empty());

        f.processor.on_tick(start + Duration::from_millis(500), &mut effects);
        assert_eq!(effects.outgoing, vec![Outgoing::Resend { to: sender(2), message: payload(SenderId::SERVER, 1, ReliableMode::AckPacket) }]);

        let key = MessageKey { stream: ack_stream(), id: id(1) };
        assert_eq!(f.log.lock().get(&key).map(|e| e.retransmit_count), Some(1));

        // the timeout starts over with the retransmission
        let mut effects = Effects::default();
        f.processor.on_tick(start + Duration::from_millis(900), &mut effects);
        assert!(effects.outgoing.is_empty());
    }

    #[test]
    fn test_retransmit_limit_makes_peer_unreachable() {
        let f = fixture(|c| c.max_retransmit_attempts = Some(2));
        let start = Instant::now();
        record_sent(&f.log, 1, &[sender(1)], start);
        record_sent(&f.log, 2, &[sender(1)], start);

        let mut now = start;
        for _ in 0..2 {
            now += Duration::from_millis(500);
            let mut effects = Effects::default();
            f.processor.on_tick(now, &mut effects);
            assert_eq!(effects.outgoing.len(), 2);
            assert!(effects.events.is_empty());
        }

        now += Duration::from_millis(500);
        let mut effects = Effects::default();
        f.processor.on_tick(now, &mut effects);
        assert!(effects.outgoing.is_empty());
        assert_eq!(effects.events, vec![ConnectionEvent::PeerUnreachable { peer: sender(1), reason: UnreachableReason::RetransmitLimit }]);
        assert_eq!(effects.removed_peers, vec![sender(1)]);
        assert!(f.log.lock().is_empty());
    }
}
