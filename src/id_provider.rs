//! Message ids are allocated per *id stream*. A stream is identified by the reliability mode and,
//!  for client-scoped numbering, by the recipient. Ids in a stream start at 1 and are gap-free:
//!  for SEQUENCE traffic, a gap is how a receiver detects loss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use rustc_hash::FxHashMap;

use crate::message::{MessageId, ReliableMode, SenderId};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct StreamKey {
    pub mode: ReliableMode,
    /// `None` for streams shared by all recipients
    pub scope: Option<SenderId>,
}
impl StreamKey {
    pub fn new(mode: ReliableMode, scope: Option<SenderId>) -> StreamKey {
        StreamKey { mode, scope }
    }
}

pub trait IdProvider: Send + Sync {
    /// The stream that messages of a given mode to a given recipient are numbered in
    fn stream_of(&self, recipient: SenderId, mode: ReliableMode) -> StreamKey;

    /// Reserves `count` consecutive ids in a stream, returning the first of them
    fn reserve(&self, stream: StreamKey, count: u32) -> MessageId;

    fn next_id(&self, stream: StreamKey) -> MessageId {
        self.reserve(stream, 1)
    }

    /// The id handed out last, [MessageId::ZERO] if there was none
    fn last_id(&self, stream: StreamKey) -> MessageId;

    /// Continues numbering after a given id. Ids that were handed out already are never handed
    ///  out again, so this fails if the id is below the last id handed out.
    fn resume_after(&self, stream: StreamKey, id: MessageId) -> anyhow::Result<()>;

    /// Forgets all streams scoped to a recipient
    fn remove_scope(&self, recipient: SenderId);
}

#[derive(Default)]
struct IdCounter(AtomicU64);
impl IdCounter {
    fn reserve(&self, count: u32) -> MessageId {
        debug_assert!(count > 0);
        MessageId::from_raw(self.0.fetch_add(count as u64, Ordering::SeqCst) + 1)
    }

    fn last(&self) -> MessageId {
        MessageId::from_raw(self.0.load(Ordering::SeqCst))
    }

    fn resume_after(&self, id: MessageId) -> anyhow::Result<()> {
        self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            if id.to_raw() >= last { Some(id.to_raw()) } else { None }
        })
            .map(|_| ())
            .map_err(|last| anyhow!("can not continue numbering after {}: {} was handed out already", id, last))
    }
}

fn mode_index(mode: ReliableMode) -> usize {
    let raw: u8 = mode.into();
    raw as usize
}

/// One counter per reliability mode, shared by all recipients. This is what a client uses, and
///  what a server uses if it sends SEQUENCE traffic only as broadcasts.
#[derive(Default)]
pub struct GlobalIdProvider {
    counters: [IdCounter; 3],
}
impl GlobalIdProvider {
    pub fn new() -> GlobalIdProvider {
        Default::default()
    }
}

impl IdProvider for GlobalIdProvider {
    fn stream_of(&self, _recipient: SenderId, mode: ReliableMode) -> StreamKey {
        StreamKey::new(mode, None)
    }

    fn reserve(&self, stream: StreamKey, count: u32) -> MessageId {
        self.counters[mode_index(stream.mode)].reserve(count)
    }

    fn last_id(&self, stream: StreamKey) -> MessageId {
        self.counters[mode_index(stream.mode)].last()
    }

    fn resume_after(&self, stream: StreamKey, id: MessageId) -> anyhow::Result<()> {
        self.counters[mode_index(stream.mode)].resume_after(id)
    }

    fn remove_scope(&self, _recipient: SenderId) {
    }
}

/// SEQUENCE ids are numbered per recipient, so each client sees a gap-free stream even if the
///  server sends it a different subset of messages than other clients. Other modes share one
///  counter per mode.
#[derive(Default)]
pub struct ClientScopedIdProvider {
    shared: [IdCounter; 3],
    per_client: RwLock<FxHashMap<SenderId, Arc<IdCounter>>>,
}
impl ClientScopedIdProvider {
    pub fn new() -> ClientScopedIdProvider {
        Default::default()
    }

    fn with_counter<R>(&self, stream: StreamKey, f: impl FnOnce(&IdCounter) -> R) -> R {
        let recipient = match stream.scope {
            Some(recipient) => recipient,
            None => return f(&self.shared[mode_index(stream.mode)]),
        };

        let existing = self.per_client.read().unwrap()
            .get(&recipient)
            .cloned();
        let counter = match existing {
            Some(counter) => counter,
            None => self.per_client.write().unwrap()
                .entry(recipient)
                .or_default()
                .clone(),
        };
        f(&counter)
    }
}

impl IdProvider for ClientScopedIdProvider {
    fn stream_of(&self, recipient: SenderId, mode: ReliableMode) -> StreamKey {
        match mode {
            ReliableMode::Sequence => StreamKey::new(mode, Some(recipient)),
            _ => StreamKey::new(mode, None),
        }
    }

    fn reserve(&self, stream: StreamKey, count: u32) -> MessageId {
        self.with_counter(stream, |c| c.reserve(count))
    }

    fn last_id(&self, stream: StreamKey) -> MessageId {
        self.with_counter(stream, |c| c.last())
    }

    fn resume_after(&self, stream: StreamKey, id: MessageId) -> anyhow::Result<()> {
        self.with_counter(stream, |c| c.resume_after(id))
    }

    fn remove_scope(&self, recipient: SenderId) {
        self.per_client.write().unwrap()
            .remove(&recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(raw: u64) -> MessageId {
        MessageId::from_raw(raw)
    }

    #[rstest]
    #[case::global(Box::new(GlobalIdProvider::new()))]
    #[case::client_scoped(Box::new(ClientScopedIdProvider::new()))]
    fn test_ids_are_consecutive(#[case] provider: Box<dyn IdProvider>) {
        let stream = provider.stream_of(SenderId::from_raw(1), ReliableMode::Sequence);
        assert_eq!(provider.last_id(stream), MessageId::ZERO);
        assert_eq!(provider.next_id(stream), id(1));
        assert_eq!(provider.next_id(stream), id(2));
        assert_eq!(provider.reserve(stream, 3), id(3));
        assert_eq!(provider.last_id(stream), id(5));
        assert_eq!(provider.next_id(stream), id(6));
    }

    #[test]
    fn test_modes_are_numbered_separately() {
        let provider = GlobalIdProvider::new();
        let seq = provider.stream_of(SenderId::from_raw(1), ReliableMode::Sequence);
        let ack = provider.stream_of(SenderId::from_raw(1), ReliableMode::AckPacket);
        provider.next_id(seq);
        provider.next_id(seq);
        assert_eq!(provider.next_id(ack), id(1));
    }

    #[test]
    fn test_global_is_shared_between_recipients() {
        let provider = GlobalIdProvider::new();
        let a = provider.stream_of(SenderId::from_raw(1), ReliableMode::Sequence);
        let b = provider.stream_of(SenderId::from_raw(2), ReliableMode::Sequence);
        assert_eq!(a, b);
        provider.next_id(a);
        assert_eq!(provider.next_id(b), id(2));
    }

    #[test]
    fn test_client_scoped_sequence_per_recipient() {
        let provider = ClientScopedIdProvider::new();
        let a = provider.stream_of(SenderId::from_raw(1), ReliableMode::Sequence);
        let b = provider.stream_of(SenderId::from_raw(2), ReliableMode::Sequence);
        assert_ne!(a, b);
        assert_eq!(provider.next_id(a), id(1));
        assert_eq!(provider.next_id(a), id(2));
        assert_eq!(provider.next_id(b), id(1));

        let ack_a = provider.stream_of(SenderId::from_raw(1), ReliableMode::AckPacket);
        let ack_b = provider.stream_of(SenderId::from_raw(2), ReliableMode::AckPacket);
        assert_eq!(ack_a, ack_b);
    }

    #[test]
    fn test_remove_scope_restarts_numbering() {
        let provider = ClientScopedIdProvider::new();
        let a = provider.stream_of(SenderId::from_raw(1), ReliableMode::Sequence);
        provider.reserve(a, 10);
        provider.remove_scope(SenderId::from_raw(1));
        assert_eq!(provider.last_id(a), MessageId::ZERO);
        assert_eq!(provider.next_id(a), id(1));
    }

    #[test]
    fn test_resume_after() {
        let provider = GlobalIdProvider::new();
        let stream = provider.stream_of(SenderId::SERVER, ReliableMode::Sequence);
        provider.reserve(stream, 5);

        provider.resume_after(stream, id(5)).unwrap();
        provider.resume_after(stream, id(20)).unwrap();
        assert_eq!(provider.next_id(stream), id(21));

        assert!(provider.resume_after(stream, id(7)).is_err());
        assert_eq!(provider.next_id(stream), id(22));
    }
}
