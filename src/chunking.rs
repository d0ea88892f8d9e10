//! Messages that do not fit into a single datagram are split into parts on the sending side and
//!  reassembled on the receiving side.
//!
//! The sender serializes the complete message (without checksum), cuts the result into pieces
//!  and sends each piece as a payload message of its own, with consecutive ids starting at the
//!  original message's id. Every part passes the pipeline individually, so parts get the
//!  original's reliability semantics. The receiver collects the parts per parent id and decodes
//!  the original message once all parts are there.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::codec::CHECKSUM_LEN;
use crate::config::ReliabilityConfig;
use crate::events::ConnectionEvent;
use crate::message::{Message, MessageBody, MessageId, PartHeader, ReliableMode, SenderId};
use crate::peers::PeerMap;
use crate::processor::{Effects, Processor, ReceiveContext, ReceiveVerdict};

/// Upper bound for the encoded size of a part without its piece of payload:
///  flags, checksum, kind, sender id, message id, parent id and two varints of up to 5 bytes.
pub const PART_OVERHEAD: usize = 1 + CHECKSUM_LEN + 1 + 4 + 8 + 8 + 5 + 5;

pub struct Chunker {
    max_datagram_payload: usize,
}

impl Chunker {
    pub fn new(config: &ReliabilityConfig) -> Chunker {
        Chunker {
            max_datagram_payload: config.max_datagram_payload,
        }
    }

    fn piece_len(&self) -> usize {
        self.max_datagram_payload - PART_OVERHEAD
    }

    /// The number of datagrams a message needs - `1` if it fits into a single datagram
    pub fn parts_needed(&self, message: &Message) -> u32 {
        let len = message.serialized_len();
        if len <= self.max_datagram_payload {
            return 1;
        }
        (len - CHECKSUM_LEN).div_ceil(self.piece_len()) as u32
    }

    /// Splits a message into parts with ids `message.id`, `message.id + 1`, ... The caller must
    ///  have reserved those ids.
    pub fn split(&self, message: &Message) -> Vec<Message> {
        let mut buf = BytesMut::new();
        message.ser_without_checksum(&mut buf);
        let content = buf.freeze();

        let piece_len = self.piece_len();
        let total_parts = content.len().div_ceil(piece_len) as u32;

        (0..total_parts)
            .map(|part_index| {
                let start = part_index as usize * piece_len;
                let end = (start + piece_len).min(content.len());
                Message {
                    id: message.id.plus(part_index),
                    sender_id: message.sender_id,
                    reliable_mode: message.reliable_mode,
                    checksum: None,
                    part: Some(PartHeader {
                        parent_id: message.id,
                        part_index,
                        total_parts,
                    }),
                    body: MessageBody::Payload(content.slice(start..end)),
                }
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum ReassemblyOutcome {
    Complete(Message),
    Incomplete,
    /// The part belongs to a new message, but the maximum number of incomplete messages is
    ///  pending already
    Conflict { pending_parent_id: MessageId },
    Invalid(anyhow::Error),
}

struct ReassemblyBuffer {
    reliable_mode: ReliableMode,
    total_parts: u32,
    parts: BTreeMap<u32, Bytes>,
    last_activity: Instant,
}

/// The reassembly buffers of one peer, keyed by parent id
#[derive(Default)]
pub struct Reassembler {
    buffers: FxHashMap<MessageId, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn offer(&mut self, part: &Message, now: Instant, max_pending: usize, max_parts: u32) -> ReassemblyOutcome {
        match self.try_offer(part, now, max_pending, max_parts) {
            Ok(outcome) => outcome,
            Err(e) => ReassemblyOutcome::Invalid(e),
        }
    }

    fn try_offer(&mut self, part: &Message, now: Instant, max_pending: usize, max_parts: u32) -> anyhow::Result<ReassemblyOutcome> {
        let header = part.part
            .ok_or_else(|| anyhow!("message {} is no part", part.id))?;
        let piece = match &part.body {
            MessageBody::Payload(piece) => piece.clone(),
            other => bail!("part {} carries a {:?} message", part.id, other.kind()),
        };
        if header.total_parts == 0 || header.total_parts > max_parts {
            bail!("invalid number of parts {} for message {}", header.total_parts, header.parent_id);
        }
        if header.part_index >= header.total_parts {
            bail!("part index {} out of range for {} parts", header.part_index, header.total_parts);
        }
        if part.id != header.parent_id.plus(header.part_index) {
            bail!("part {} of message {} has id {}", header.part_index, header.parent_id, part.id);
        }

        if !self.buffers.contains_key(&header.parent_id) {
            let pending = self.buffers.iter()
                .filter(|(_, b)| b.reliable_mode == part.reliable_mode)
                .map(|(parent_id, _)| *parent_id)
                .collect::<Vec<_>>();
            if pending.len() >= max_pending {
                if let Some(pending_parent_id) = pending.into_iter().min() {
                    return Ok(ReassemblyOutcome::Conflict { pending_parent_id });
                }
            }
        }

        let buffer = self.buffers.entry(header.parent_id)
            .or_insert_with(|| ReassemblyBuffer {
                reliable_mode: part.reliable_mode,
                total_parts: header.total_parts,
                parts: BTreeMap::new(),
                last_activity: now,
            });
        if buffer.total_parts != header.total_parts || buffer.reliable_mode != part.reliable_mode {
            bail!("part {} of message {} does not match the parts received before", header.part_index, header.parent_id);
        }
        buffer.parts.entry(header.part_index).or_insert(piece);
        buffer.last_activity = now;

        if buffer.parts.len() < buffer.total_parts as usize {
            return Ok(ReassemblyOutcome::Incomplete);
        }

        let buffer = self.buffers.remove(&header.parent_id)
            .ok_or_else(|| anyhow!("reassembly buffer for {} disappeared", header.parent_id))?;
        let mut content = BytesMut::new();
        for piece in buffer.parts.values() {
            content.extend_from_slice(piece);
        }

        let message = Message::deser(&mut content.freeze())?;
        if message.id != header.parent_id || message.sender_id != part.sender_id || message.reliable_mode != part.reliable_mode {
            bail!("reassembled message {} does not match its parts", message.id);
        }
        Ok(ReassemblyOutcome::Complete(message))
    }

    /// Drops buffers that did not receive a part for `timeout`, returning their parent ids
    pub fn expire(&mut self, now: Instant, timeout: std::time::Duration) -> Vec<MessageId> {
        let expired = self.buffers.iter()
            .filter(|(_, b)| now.saturating_duration_since(b.last_activity) >= timeout)
            .map(|(parent_id, _)| *parent_id)
            .collect::<Vec<_>>();
        for parent_id in &expired {
            self.buffers.remove(parent_id);
        }
        expired
    }

    pub fn pending_parent_ids(&self) -> Vec<MessageId> {
        let mut result = self.buffers.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }
}

/// Collects parts and passes the reassembled message on in place of its last part. A part of a
///  new message is rejected while the peer has the maximum number of incomplete messages of the
///  same reliability mode: for ACK_PACKET messages, the rejection withdraws the part's ack so the
///  sender retransmits it later.
pub struct ReassemblyProcessor {
    config: Arc<ReliabilityConfig>,
    peers: PeerMap<Reassembler>,
}

impl ReassemblyProcessor {
    pub fn new(config: Arc<ReliabilityConfig>) -> ReassemblyProcessor {
        ReassemblyProcessor {
            config,
            peers: PeerMap::new(),
        }
    }

    pub fn pending_parent_ids(&self, peer: SenderId) -> Vec<MessageId> {
        self.peers.with_existing(peer, |r| r.pending_parent_ids())
            .unwrap_or_default()
    }
}

impl Processor for ReassemblyProcessor {
    fn name(&self) -> &'static str {
        "reassembly"
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        let header = match message.part {
            Some(header) => header,
            None => return ReceiveVerdict::Continue(message),
        };

        let outcome = self.peers.with(ctx.peer, |r| {
            r.offer(&message, ctx.now, self.config.max_pending_reassemblies, self.config.max_parts_per_message)
        });

        match outcome {
            ReassemblyOutcome::Complete(reassembled) => {
                trace!("reassembled message {} from {} parts", reassembled.id, header.total_parts);
                ReceiveVerdict::Continue(reassembled)
            }
            ReassemblyOutcome::Incomplete => ReceiveVerdict::Hold,
            ReassemblyOutcome::Conflict { pending_parent_id } => {
                error!("reassembly conflict: {} sent a part of message {} while message {} is incomplete - rejecting the part", ctx.peer, header.parent_id, pending_parent_id);
                ctx.effects.event(ConnectionEvent::ReassemblyConflict {
                    peer: ctx.peer,
                    pending_parent_id,
                    rejected_parent_id: header.parent_id,
                });
                ReceiveVerdict::Reject(message)
            }
            ReassemblyOutcome::Invalid(e) => {
                warn!("invalid part {} from {}: {} - discarding", message.id, ctx.peer, e);
                ReceiveVerdict::Discard
            }
        }
    }

    fn on_tick(&self, now: Instant, _effects: &mut Effects) {
        let timeout = self.config.reassembly_timeout;
        self.peers.for_each(|peer, r| {
            for parent_id in r.expire(now, timeout) {
                warn!("message {} from {} was not completed within {:?} - dropping its parts", parent_id, peer, timeout);
            }
        });
    }

    fn on_peer_removed(&self, peer: SenderId) {
        self.peers.remove(peer);
    }
}
