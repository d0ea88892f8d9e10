use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ReliabilityConfig;
use crate::events::{ConnectionEvent, UnreachableReason};
use crate::id_provider::StreamKey;
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::processor::{Effects, Processor, SendContext};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MessageKey {
    pub stream: StreamKey,
    pub id: MessageId,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    /// the message exactly as it was sent, so retransmissions are byte-identical
    pub message: Message,
    pub sent_at: Instant,
    pub retransmit_count: u32,
    /// recipients that did not confirm receipt yet
    pub pending: FxHashSet<SenderId>,
    /// position in recording order
    order: u64,
}

/// SEQUENCE entries sort before ACK_PACKET entries, each in recording order
type EvictionRank = (bool, u64);

fn eviction_rank(key: &MessageKey, order: u64) -> EvictionRank {
    (key.stream.mode == ReliableMode::AckPacket, order)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckOutcome {
    /// no such entry, e.g. because this is a duplicate ack
    Unknown,
    StillPending,
    /// the last pending recipient acknowledged, and the entry was removed
    Completed,
}

/// Retains every reliable message that was sent until all its recipients confirmed receipt -
///  either by acknowledging it (ACK_PACKET) or by reporting a sequence cursor past it (SEQUENCE).
///  This is the only place where sent messages are kept, and the source for all retransmissions.
///
/// Every entry leaves the log eventually: by confirmation, by eviction when its recipient is
///  removed or it exceeds the retransmit limit, or because the log is full. An entry that is
///  evicted because the log is full is lost for its pending recipients. They are collected, and
///  [MessageLogProcessor] disconnects them on the next tick.
pub struct MessageLog {
    streams: FxHashMap<StreamKey, BTreeMap<MessageId, LogEntry>>,
    eviction_order: BTreeMap<EvictionRank, MessageKey>,
    next_order: u64,
    len: usize,
    max_entries: usize,
    lost_recipients: Vec<SenderId>,
}

impl MessageLog {
    pub fn new(max_entries: usize) -> MessageLog {
        MessageLog {
            streams: Default::default(),
            eviction_order: Default::default(),
            next_order: 0,
            len: 0,
            max_entries,
            lost_recipients: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unreliable messages are not recorded
    pub fn record(&mut self, stream: StreamKey, message: Message, recipients: &[SenderId], now: Instant) {
        if message.reliable_mode == ReliableMode::Unreliable || recipients.is_empty() {
            return;
        }

        let key = MessageKey { stream, id: message.id };
        let order = self.next_order;
        self.next_order += 1;
        let entry = LogEntry {
            message,
            sent_at: now,
            retransmit_count: 0,
            pending: recipients.iter().cloned().collect(),
            order,
        };

        match self.streams.entry(stream).or_default().insert(key.id, entry) {
            Some(replaced) => {
                self.eviction_order.remove(&eviction_rank(&key, replaced.order));
            }
            None => self.len += 1,
        }
        self.eviction_order.insert(eviction_rank(&key, order), key);

        while self.len > self.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// SEQUENCE entries go first, oldest first within each mode
    fn evict_oldest(&mut self) -> bool {
        let key = match self.eviction_order.pop_first() {
            Some((_, key)) => key,
            None => return false,
        };

        if let Some(entry) = self.evict(key) {
            let mut lost = entry.pending.into_iter().collect::<Vec<_>>();
            lost.sort();
            warn!("message log is full ({} entries) - evicting message {} of {:?}, which is lost for {:?}", self.max_entries, key.id, key.stream, lost);
            for peer in lost {
                if !self.lost_recipients.contains(&peer) {
                    self.lost_recipients.push(peer);
                }
            }
        }
        true
    }

    /// Recipients that can never receive a message because it was evicted, in the order they
    ///  lost it
    pub fn take_lost_recipients(&mut self) -> Vec<SenderId> {
        std::mem::take(&mut self.lost_recipients)
    }

    pub fn get(&self, key: &MessageKey) -> Option<&LogEntry> {
        self.streams.get(&key.stream)?
            .get(&key.id)
    }

    pub fn acknowledge(&mut self, key: &MessageKey, from: SenderId) -> AckOutcome {
        let entry = match self.streams.get_mut(&key.stream).and_then(|entries| entries.get_mut(&key.id)) {
            Some(entry) => entry,
            None => return AckOutcome::Unknown,
        };

        if !entry.pending.remove(&from) {
            return AckOutcome::Unknown;
        }
        if !entry.pending.is_empty() {
            return AckOutcome::StillPending;
        }

        trace!("message {} acknowledged by all recipients", key.id);
        self.evict(*key);
        AckOutcome::Completed
    }

    /// A recipient confirmed it received everything in a SEQUENCE stream up to and including
    ///  `up_to`. Returns the number of entries that were removed as a result.
    pub fn confirm_sequence(&mut self, stream: StreamKey, from: SenderId, up_to: MessageId) -> usize {
        let entries = match self.streams.get_mut(&stream) {
            Some(entries) => entries,
            None => return 0,
        };

        let mut completed = Vec::new();
        for (id, entry) in entries.range_mut(..=up_to) {
            if entry.pending.remove(&from) && entry.pending.is_empty() {
                completed.push(*id);
            }
        }
        for &id in &completed {
            self.evict(MessageKey { stream, id });
        }
        completed.len()
    }

    /// Removes all entries matching `criteria`, returning their number
    pub fn prune(&mut self, mut criteria: impl FnMut(&MessageKey, &LogEntry) -> bool) -> usize {
        let matching = self.streams.iter()
            .flat_map(|(stream, entries)| entries.iter().map(move |(id, entry)| (MessageKey { stream: *stream, id: *id }, entry)))
            .filter(|(key, entry)| criteria(key, entry))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        for &key in &matching {
            self.evict(key);
        }
        matching.len()
    }

    /// The entries that were (re)sent at least `timeout` ago. The sequence is evaluated lazily.
    pub fn entries_due_for_retransmit(&self, now: Instant, timeout: Duration) -> impl Iterator<Item = (MessageKey, &LogEntry)> + '_ {
        self.streams.iter()
            .flat_map(|(stream, entries)| entries.iter().map(move |(id, entry)| (MessageKey { stream: *stream, id: *id }, entry)))
            .filter(move |(_, entry)| now.saturating_duration_since(entry.sent_at) >= timeout)
    }

    /// Returns the new retransmit count
    pub fn mark_retransmitted(&mut self, key: &MessageKey, now: Instant) -> Option<u32> {
        let entry = self.streams.get_mut(&key.stream)?
            .get_mut(&key.id)?;
        entry.sent_at = now;
        entry.retransmit_count += 1;
        Some(entry.retransmit_count)
    }

    pub fn evict(&mut self, key: MessageKey) -> Option<LogEntry> {
        let entries = self.streams.get_mut(&key.stream)?;
        let removed = entries.remove(&key.id)?;
        if entries.is_empty() {
            self.streams.remove(&key.stream);
        }
        self.eviction_order.remove(&eviction_rank(&key, removed.order));
        self.len -= 1;
        Some(removed)
    }

    /// Removes a recipient from all entries. Entries that no longer have pending recipients are
    ///  removed, as are streams scoped to the recipient.
    pub fn remove_peer(&mut self, peer: SenderId) -> usize {
        let num_removed = self.prune(|key, entry| {
            key.stream.scope == Some(peer) || (entry.pending.len() == 1 && entry.pending.contains(&peer))
        });
        for entries in self.streams.values_mut() {
            for entry in entries.values_mut() {
                entry.pending.remove(&peer);
            }
        }
        self.lost_recipients.retain(|p| *p != peer);
        debug!("removed {} message log entries for {}", num_removed, peer);
        num_removed
    }
}

/// Makes the [MessageLog] a pipeline stage: every reliable message is recorded after it passed
///  all send stages. The reliability processors work on the log through [Self::lock].
///
/// Peers that lost a message to log overflow are told to leave, and are removed.
pub struct MessageLogProcessor {
    log: Mutex<MessageLog>,
}

impl MessageLogProcessor {
    pub fn new(config: &ReliabilityConfig) -> MessageLogProcessor {
        MessageLogProcessor {
            log: Mutex::new(MessageLog::new(config.max_log_entries)),
        }
    }

    /// The lock is never held across I/O or an `.await`
    pub fn lock(&self) -> MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap()
    }
}

impl Processor for MessageLogProcessor {
    fn name(&self) -> &'static str {
        "message-log"
    }

    fn after_send(&self, message: &Message, ctx: &SendContext) {
        if message.reliable_mode != ReliableMode::Unreliable {
            self.lock().record(ctx.stream, message.clone(), ctx.recipients, ctx.now);
        }
    }

    fn on_tick(&self, _now: Instant, effects: &mut Effects) {
        let lost = self.lock().take_lost_recipients();
        for peer in lost {
            if effects.removed_peers.contains(&peer) {
                continue;
            }
            warn!("{} lost a message to message log overflow - disconnecting it", peer);
            effects.event(ConnectionEvent::PeerUnreachable { peer, reason: UnreachableReason::MessageLost });
            effects.send(peer, ReliableMode::Unreliable, MessageBody::Leave);
            effects.remove_peer(peer);
        }
    }

    fn on_peer_removed(&self, peer: SenderId) {
        self.lock().remove_peer(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Outgoing;
    use bytes::Bytes;

    fn sender(raw: u32) -> SenderId {
        SenderId::from_raw(raw)
    }

    fn msg(id: u64, mode: ReliableMode) -> Message {
        Message::new(MessageId::from_raw(id), SenderId::SERVER, mode, MessageBody::Payload(Bytes::from_static(b"x")))
    }

    fn ack_stream() -> StreamKey {
        StreamKey::new(ReliableMode::AckPacket, None)
    }

    fn seq_stream(scope: Option<SenderId>) -> StreamKey {
        StreamKey::new(ReliableMode::Sequence, scope)
    }

    fn key(stream: StreamKey, id: u64) -> MessageKey {
        MessageKey { stream, id: MessageId::from_raw(id) }
    }

    #[test]
    fn test_unreliable_is_not_recorded() {
        let mut log = MessageLog::new(10);
        log.record(StreamKey::new(ReliableMode::Unreliable, None), msg(1, ReliableMode::Unreliable), &[sender(1)], Instant::now());
        assert!(log.is_empty());
    }

    #[test]
    fn test_ack_from_two_recipients() {
        let mut log = MessageLog::new(10);
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1), sender(2)], Instant::now());

        assert_eq!(log.acknowledge(&key(ack_stream(), 1), sender(1)), AckOutcome::StillPending);
        let entry = log.get(&key(ack_stream(), 1)).unwrap();
        assert_eq!(entry.pending, [sender(2)].into_iter().collect::<FxHashSet<_>>());

        assert_eq!(log.acknowledge(&key(ack_stream(), 1), sender(1)), AckOutcome::Unknown);
        assert_eq!(log.acknowledge(&key(ack_stream(), 1), sender(2)), AckOutcome::Completed);
        assert!(log.get(&key(ack_stream(), 1)).is_none());
        assert!(log.is_empty());

        assert_eq!(log.acknowledge(&key(ack_stream(), 1), sender(2)), AckOutcome::Unknown);
    }

    #[test]
    fn test_confirm_sequence() {
        let mut log = MessageLog::new(10);
        let stream = seq_stream(None);
        let now = Instant::now();
        for id in 1..=5 {
            log.record(stream, msg(id, ReliableMode::Sequence), &[sender(1), sender(2)], now);
        }

        assert_eq!(log.confirm_sequence(stream, sender(1), MessageId::from_raw(3)), 0);
        assert_eq!(log.len(), 5);
        assert_eq!(log.confirm_sequence(stream, sender(2), MessageId::from_raw(2)), 2);
        assert_eq!(log.len(), 3);
        assert_eq!(log.confirm_sequence(stream, sender(2), MessageId::from_raw(5)), 1);
        assert_eq!(log.len(), 2);
        assert!(log.get(&key(stream, 4)).is_some());
    }

    #[test]
    fn test_entries_due_for_retransmit() {
        let mut log = MessageLog::new(10);
        let start = Instant::now();
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1)], start);
        log.record(ack_stream(), msg(2, ReliableMode::AckPacket), &[sender(1)], start + Duration::from_millis(300));

        let timeout = Duration::from_millis(500);
        assert_eq!(log.entries_due_for_retransmit(start + Duration::from_millis(499), timeout).count(), 0);

        let due = log.entries_due_for_retransmit(start + Duration::from_millis(600), timeout)
            .map(|(k, _)| k.id.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(due, vec![1]);

        assert_eq!(log.mark_retransmitted(&key(ack_stream(), 1), start + Duration::from_millis(600)), Some(1));
        assert_eq!(log.entries_due_for_retransmit(start + Duration::from_millis(900), timeout).count(), 1);
        assert_eq!(log.mark_retransmitted(&key(ack_stream(), 1), start + Duration::from_millis(1100)), Some(2));
        assert_eq!(log.mark_retransmitted(&key(ack_stream(), 7), start), None);
    }

    #[test]
    fn test_remove_peer() {
        let mut log = MessageLog::new(10);
        let now = Instant::now();
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1), sender(2)], now);
        log.record(ack_stream(), msg(2, ReliableMode::AckPacket), &[sender(1)], now);
        log.record(seq_stream(Some(sender(1))), msg(1, ReliableMode::Sequence), &[sender(1)], now);
        log.record(seq_stream(Some(sender(2))), msg(1, ReliableMode::Sequence), &[sender(2)], now);

        assert_eq!(log.remove_peer(sender(1)), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&key(ack_stream(), 1)).unwrap().pending, [sender(2)].into_iter().collect::<FxHashSet<_>>());
        assert!(log.get(&key(seq_stream(Some(sender(2))), 1)).is_some());
    }

    #[test]
    fn test_full_log_evicts_sequence_first() {
        let mut log = MessageLog::new(3);
        let now = Instant::now();
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1)], now);
        log.record(seq_stream(None), msg(1, ReliableMode::Sequence), &[sender(2)], now);
        log.record(seq_stream(None), msg(2, ReliableMode::Sequence), &[sender(2)], now);
        log.record(ack_stream(), msg(2, ReliableMode::AckPacket), &[sender(3)], now);

        assert_eq!(log.len(), 3);
        assert!(log.get(&key(seq_stream(None), 1)).is_none());
        assert!(log.get(&key(seq_stream(None), 2)).is_some());
        assert!(log.get(&key(ack_stream(), 1)).is_some());

        log.record(ack_stream(), msg(3, ReliableMode::AckPacket), &[sender(3)], now);
        log.record(ack_stream(), msg(4, ReliableMode::AckPacket), &[sender(3)], now);
        assert_eq!(log.len(), 3);
        assert!(log.get(&key(seq_stream(None), 2)).is_none());
        assert!(log.get(&key(ack_stream(), 1)).is_none());
        assert!(log.get(&key(ack_stream(), 2)).is_some());

        assert_eq!(log.take_lost_recipients(), vec![sender(2), sender(1)]);
        assert!(log.take_lost_recipients().is_empty());
    }

    #[test]
    fn test_eviction_order_follows_recording_not_retransmission() {
        let mut log = MessageLog::new(2);
        let start = Instant::now();
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1)], start);
        log.record(ack_stream(), msg(2, ReliableMode::AckPacket), &[sender(2)], start);
        log.mark_retransmitted(&key(ack_stream(), 1), start + Duration::from_millis(500));

        log.record(ack_stream(), msg(3, ReliableMode::AckPacket), &[sender(3)], start + Duration::from_millis(600));
        assert!(log.get(&key(ack_stream(), 1)).is_none());
        assert_eq!(log.take_lost_recipients(), vec![sender(1)]);
    }

    #[test]
    fn test_confirmed_entries_leave_the_eviction_order() {
        let mut log = MessageLog::new(2);
        let now = Instant::now();
        let stream = seq_stream(None);
        log.record(stream, msg(1, ReliableMode::Sequence), &[sender(1)], now);
        log.record(stream, msg(2, ReliableMode::Sequence), &[sender(1)], now);
        assert_eq!(log.confirm_sequence(stream, sender(1), MessageId::from_raw(2)), 2);

        log.record(stream, msg(3, ReliableMode::Sequence), &[sender(1)], now);
        log.record(stream, msg(4, ReliableMode::Sequence), &[sender(1)], now);
        assert_eq!(log.len(), 2);
        assert!(log.take_lost_recipients().is_empty());
    }

    #[test]
    fn test_removed_peer_is_not_reported_as_lost() {
        let mut log = MessageLog::new(1);
        let now = Instant::now();
        log.record(ack_stream(), msg(1, ReliableMode::AckPacket), &[sender(1)], now);
        log.record(ack_stream(), msg(2, ReliableMode::AckPacket), &[sender(2)], now);
        log.remove_peer(sender(1));
        assert!(log.take_lost_recipients().is_empty());
    }

    #[test]
    fn test_overflow_disconnects_on_tick() {
        let processor = MessageLogProcessor::new(&ReliabilityConfig {
            max_log_entries: 1,
            ..ReliabilityConfig::new()
        });
        let now = Instant::now();
        for raw_id in 1..=3 {
            processor.after_send(&msg(raw_id, ReliableMode::AckPacket), &SendContext { recipients: &[sender(4)], stream: ack_stream(), now });
        }
        assert_eq!(processor.lock().len(), 1);

        let mut effects = Effects::default();
        processor.on_tick(now, &mut effects);
        assert_eq!(effects.events, vec![ConnectionEvent::PeerUnreachable { peer: sender(4), reason: UnreachableReason::MessageLost }]);
        assert_eq!(effects.outgoing, vec![Outgoing::New { to: sender(4), mode: ReliableMode::Unreliable, body: MessageBody::Leave }]);
        assert_eq!(effects.removed_peers, vec![sender(4)]);

        let mut effects = Effects::default();
        processor.on_tick(now, &mut effects);
        assert!(effects.is_empty());
    }
}
