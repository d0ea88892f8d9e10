//! Helpers for tests: message and context factories, an in-memory datagram network that is
//!  pumped explicitly, and a receiver that collects what it gets.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::{Serializer, WireSerializer};
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::processor::ReceiveContext;
use crate::receiver::{MessageReceiver, ReceivedMessage};
use crate::transport::{DatagramHandler, Transport};

/// convenience method for unit test code: create a [SocketAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// An application message with a payload derived from its id
pub fn payload(sender_id: SenderId, raw_id: u64, mode: ReliableMode) -> Message {
    Message::new(MessageId::from_raw(raw_id), sender_id, mode, MessageBody::Payload(Bytes::from(format!("message {}", raw_id))))
}

pub fn receive_ctx(peer: SenderId) -> ReceiveContext {
    receive_ctx_at(peer, Instant::now())
}

pub fn receive_ctx_at(peer: SenderId, now: Instant) -> ReceiveContext {
    ReceiveContext::new(peer, test_addr(peer.to_raw() as u16), now)
}

#[derive(Debug, Clone)]
pub struct TestDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub buf: Bytes,
}
impl TestDatagram {
    pub fn message(&self) -> Option<Message> {
        WireSerializer.decode(&self.buf).ok()
    }
}

#[derive(Default)]
struct NetworkState {
    in_flight: VecDeque<TestDatagram>,
    handlers: FxHashMap<SocketAddr, Arc<dyn DatagramHandler>>,
}

/// Datagrams sent through this network's transports are queued until a test delivers them,
///  so tests control loss, duplication and reordering exactly.
#[derive(Clone, Default)]
pub struct TestNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl TestNetwork {
    pub fn new() -> TestNetwork {
        Default::default()
    }

    pub fn transport(&self, addr: SocketAddr) -> Arc<TestTransport> {
        Arc::new(TestTransport {
            addr,
            state: self.state.clone(),
            cancel: Notify::new(),
        })
    }

    /// Datagrams to the address are passed to the handler from now on
    pub fn attach(&self, addr: SocketAddr, handler: Arc<dyn DatagramHandler>) {
        self.state.lock().unwrap()
            .handlers.insert(addr, handler);
    }

    /// Datagrams to the address are lost from now on
    pub fn detach(&self, addr: SocketAddr) {
        self.state.lock().unwrap()
            .handlers.remove(&addr);
    }

    pub fn in_flight(&self) -> Vec<TestDatagram> {
        self.state.lock().unwrap()
            .in_flight.iter()
            .cloned()
            .collect()
    }

    /// Drops all queued datagrams with a matching message, returning how many were dropped
    pub fn drop_where(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        let mut state = self.state.lock().unwrap();
        let before = state.in_flight.len();
        state.in_flight.retain(|d| !d.message().is_some_and(|m| predicate(&m)));
        before - state.in_flight.len()
    }

    /// Queues every datagram in flight a second time, right after the original
    pub fn duplicate_in_flight(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = std::mem::take(&mut state.in_flight).into_iter()
            .flat_map(|d| [d.clone(), d])
            .collect();
    }

    pub fn reverse_in_flight(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.make_contiguous().reverse();
    }

    /// Delivers the oldest queued datagram, returning `false` if there was none
    pub async fn deliver_next(&self) -> bool {
        let next = {
            let mut state = self.state.lock().unwrap();
            let datagram = state.in_flight.pop_front();
            datagram.map(|d| {
                let handler = state.handlers.get(&d.to).cloned();
                (d, handler)
            })
        };

        match next {
            Some((datagram, Some(handler))) => {
                handler.handle_datagram(&datagram.buf, datagram.from).await;
                true
            }
            Some((_, None)) => true,
            None => false,
        }
    }

    /// Delivers datagrams until none are left, including those sent while delivering. Returns
    ///  the number of datagrams that were taken from the queue.
    pub async fn deliver_all(&self) -> usize {
        let mut count = 0;
        while self.deliver_next().await {
            count += 1;
            assert!(count < 100_000, "datagrams keep coming - is there a message loop?");
        }
        count
    }
}

pub struct TestTransport {
    addr: SocketAddr,
    state: Arc<Mutex<NetworkState>>,
    cancel: Notify,
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.state.lock().unwrap()
            .in_flight.push_back(TestDatagram {
                from: self.addr,
                to,
                buf: Bytes::copy_from_slice(buf),
            });
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        self.state.lock().unwrap()
            .handlers.insert(self.addr, handler);
        self.cancel.notified().await;
        self.state.lock().unwrap()
            .handlers.remove(&self.addr);
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }
}

#[derive(Default)]
pub struct CollectingReceiver {
    received: Mutex<Vec<ReceivedMessage>>,
}
impl CollectingReceiver {
    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.received.lock().unwrap()
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessageReceiver for CollectingReceiver {
    async fn on_message(&self, message: ReceivedMessage) {
        self.received.lock().unwrap().push(message);
    }
}
