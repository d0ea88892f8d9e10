use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ReliabilityConfig;
use crate::id_provider::IdProvider;
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::message_log::{MessageKey, MessageLogProcessor};
use crate::peers::PeerMap;
use crate::processor::{Effects, Processor, ReceiveContext, ReceiveVerdict};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SequenceState {
    /// no baseline yet - messages are held until the handshake provides one
    BeforeConnect,
    /// everything up to the cursor was received, nothing is known to be missing
    Synced,
    /// at least one id above the cursor is known to exist but was not received yet
    GapDetected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SeedOutcome {
    Seeded,
    /// the baseline was set before and was left unchanged
    AlreadySet(MessageId),
}

#[derive(Default)]
struct PeerSequence {
    /// the highest id up to which all messages were received. `None` before there is a baseline.
    cursor: Option<MessageId>,
    /// received messages above `cursor + 1`
    out_of_order: BTreeMap<MessageId, Message>,
    /// the highest id known to exist, either because it was received or because the sender
    ///  announced it
    highest_known: MessageId,
    gap_detected_at: Option<Instant>,
    last_request_at: Option<Instant>,
}

impl PeerSequence {
    fn state(&self) -> SequenceState {
        match self.cursor {
            None => SequenceState::BeforeConnect,
            Some(cursor) if self.highest_known > cursor => SequenceState::GapDetected,
            Some(_) => SequenceState::Synced,
        }
    }

    /// Removes all messages that follow the cursor without a gap, advancing the cursor past them
    fn drain_contiguous(&mut self) -> Vec<Message> {
        let mut cursor = match self.cursor {
            Some(cursor) => cursor,
            None => return Vec::new(),
        };

        let mut result = Vec::new();
        while let Some(entry) = self.out_of_order.first_entry() {
            if *entry.key() != cursor.next() {
                break;
            }
            let message = entry.remove();
            cursor = message.id;
            result.push(message);
        }
        self.cursor = Some(cursor);
        result
    }

    fn buffer(&mut self, message: Message) {
        self.highest_known = self.highest_known.max(message.id);
        self.out_of_order.insert(message.id, message);
    }

    /// Discards the highest buffered ids, which are needed last. Contiguous messages must be
    ///  drained before, so they are never discarded.
    fn enforce_cap(&mut self, peer: SenderId, max_buffered: usize) {
        while self.out_of_order.len() > max_buffered {
            if let Some((highest, _)) = self.out_of_order.pop_last() {
                warn!("out-of-order buffer for {} is full - discarding message {}, it will have to be requested again", peer, highest);
            }
        }
    }

    fn update_gap_timer(&mut self, now: Instant) {
        match self.state() {
            SequenceState::GapDetected => {
                self.gap_detected_at.get_or_insert(now);
            }
            _ => {
                self.gap_detected_at = None;
                self.last_request_at = None;
            }
        }
    }

    fn missing_ids(&self, max: usize) -> Vec<MessageId> {
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => return Vec::new(),
        };

        (cursor.next().to_raw()..=self.highest_known.to_raw())
            .map(MessageId::from_raw)
            .filter(|id| !self.out_of_order.contains_key(id))
            .take(max)
            .collect()
    }
}

/// Delivers SEQUENCE messages in id order without duplicates. Per peer, the receiver tracks a
///  cursor (the highest id received without gaps) and buffers messages that arrive ahead of
///  it. If a gap persists, the missing ids are requested from the sender, which resends them from
///  its message log.
///
/// This is also the sending side's counterpart: id requests and keepalives carry the receiver's
///  cursor, which confirms receipt and lets the message log drop everything up to it.
pub struct SequenceProcessor {
    config: Arc<ReliabilityConfig>,
    id_provider: Arc<dyn IdProvider>,
    message_log: Arc<MessageLogProcessor>,
    /// use the first received id as baseline instead of waiting for a handshake
    adopt_first_id: bool,
    peers: PeerMap<PeerSequence>,
}

impl SequenceProcessor {
    pub fn new(config: Arc<ReliabilityConfig>, id_provider: Arc<dyn IdProvider>, message_log: Arc<MessageLogProcessor>, adopt_first_id: bool) -> SequenceProcessor {
        SequenceProcessor {
            config,
            id_provider,
            message_log,
            adopt_first_id,
            peers: PeerMap::new(),
        }
    }

    pub fn cursor(&self, peer: SenderId) -> Option<MessageId> {
        self.peers.with_existing(peer, |s| s.cursor)
            .flatten()
    }

    pub fn state(&self, peer: SenderId) -> SequenceState {
        self.peers.with_existing(peer, |s| s.state())
            .unwrap_or(SequenceState::BeforeConnect)
    }

    pub fn buffered_ids(&self, peer: SenderId) -> Vec<MessageId> {
        self.peers.with_existing(peer, |s| s.out_of_order.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sets the id after which a peer's SEQUENCE messages are expected. This happens once per
    ///  connection: an existing baseline is never overwritten, since a retransmitted handshake
    ///  would otherwise reset a cursor that moved on already.
    ///
    /// Messages held back for lack of a baseline are released the next time a message from the
    ///  peer passes this stage.
    pub fn seed_baseline(&self, peer: SenderId, baseline: MessageId) -> SeedOutcome {
        self.peers.with(peer, |s| {
            if let Some(existing) = s.cursor {
                warn!("sequence baseline for {} is already set to {} - ignoring {}", peer, existing, baseline);
                return SeedOutcome::AlreadySet(existing);
            }

            debug!("sequence baseline for {} is {}", peer, baseline);
            s.cursor = Some(baseline);
            s.out_of_order = s.out_of_order.split_off(&baseline.next());
            s.highest_known = s.highest_known.max(baseline);
            SeedOutcome::Seeded
        })
    }

    fn on_sequenced(&self, s: &mut PeerSequence, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        let cursor = match s.cursor {
            Some(cursor) => cursor,
            None if self.adopt_first_id => {
                debug!("adopting {} as sequence baseline for {}", message.id, ctx.peer);
                s.cursor = Some(message.id);
                s.highest_known = s.highest_known.max(message.id);
                return ReceiveVerdict::Continue(message);
            }
            None => {
                trace!("holding message {} from {} until there is a sequence baseline", message.id, ctx.peer);
                s.buffer(message);
                s.enforce_cap(ctx.peer, self.config.max_out_of_order_messages);
                return ReceiveVerdict::Hold;
            }
        };

        if message.id <= cursor || s.out_of_order.contains_key(&message.id) {
            debug!("duplicate message {} from {} - discarding", message.id, ctx.peer);
            for released in s.drain_contiguous() {
                ctx.release(released);
            }
            s.update_gap_timer(ctx.now);
            return ReceiveVerdict::Discard;
        }

        s.buffer(message);
        let mut contiguous = s.drain_contiguous().into_iter();
        s.enforce_cap(ctx.peer, self.config.max_out_of_order_messages);
        s.update_gap_timer(ctx.now);

        match contiguous.next() {
            Some(first) => {
                for later in contiguous {
                    ctx.release(later);
                }
                ReceiveVerdict::Continue(first)
            }
            None => {
                trace!("gap before message {} from {} - holding it", s.highest_known, ctx.peer);
                ReceiveVerdict::Hold
            }
        }
    }

    /// The peer asks for messages it is missing - and confirms everything up to `last_received`
    fn on_id_request(&self, peer: SenderId, last_received: MessageId, ids: &[MessageId], effects: &mut Effects) {
        let stream = self.id_provider.stream_of(peer, ReliableMode::Sequence);
        let mut log = self.message_log.lock();
        log.confirm_sequence(stream, peer, last_received);

        for &id in ids.iter().take(self.config.max_request_absent_ids) {
            match log.get(&MessageKey { stream, id }) {
                Some(entry) if entry.pending.contains(&peer) => {
                    trace!("resending message {} to {} on request", id, peer);
                    effects.resend(peer, entry.message.clone());
                }
                _ => debug!("{} requested message {} which is no longer in the message log", peer, id),
            }
        }
    }
}

impl Processor for SequenceProcessor {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        let peer = ctx.peer;
        self.peers.with(peer, |s| {
            if message.reliable_mode == ReliableMode::Sequence {
                return self.on_sequenced(s, message, ctx);
            }

            // messages may have become contiguous because a baseline was seeded
            for released in s.drain_contiguous() {
                ctx.release(released);
            }
            s.update_gap_timer(ctx.now);

            match &message.body {
                MessageBody::RequestSeqIds { last_received, ids } => {
                    self.on_id_request(peer, *last_received, ids, &mut ctx.effects);
                }
                MessageBody::KeepAlive { last_received_seq_id, last_sent_seq_id } => {
                    let stream = self.id_provider.stream_of(peer, ReliableMode::Sequence);
                    self.message_log.lock().confirm_sequence(stream, peer, *last_received_seq_id);

                    if s.cursor.is_some() && *last_sent_seq_id > s.highest_known {
                        debug!("{} announced sequence id {}, last received was {} - requesting the tail", peer, last_sent_seq_id, s.highest_known);
                        s.highest_known = *last_sent_seq_id;
                        s.update_gap_timer(ctx.now);
                    }
                }
                _ => {}
            }
            ReceiveVerdict::Continue(message)
        })
    }

    fn on_tick(&self, now: Instant, effects: &mut Effects) {
        let delay = self.config.id_request_delay;
        self.peers.for_each(|peer, s| {
            if s.state() != SequenceState::GapDetected {
                return;
            }
            let gap_detected_at = *s.gap_detected_at.get_or_insert(now);
            if now.saturating_duration_since(gap_detected_at) < delay {
                return;
            }
            if let Some(last_request_at) = s.last_request_at {
                if now.saturating_duration_since(last_request_at) < delay {
                    return;
                }
            }

            let ids = s.missing_ids(self.config.max_request_absent_ids);
            if ids.is_empty() {
                return;
            }
            if let Some(last_received) = s.cursor {
                debug!("requesting missing messages {:?} from {}", ids, peer);
                effects.send(peer, ReliableMode::Unreliable, MessageBody::RequestSeqIds { last_received, ids });
                s.last_request_at = Some(now);
            }
        });
    }

    fn on_peer_removed(&self, peer: SenderId) {
        self.peers.remove(peer);
    }
}
