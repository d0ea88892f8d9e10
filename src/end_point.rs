use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::chunking::Chunker;
use crate::codec::{Serializer, WireSerializer};
use crate::config::ReliabilityConfig;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::fault_injection::{FaultInjector, Random, RngRandom};
use crate::handshake::Role;
use crate::id_provider::{ClientScopedIdProvider, GlobalIdProvider, IdProvider, StreamKey};
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::peers::{LocalIdentity, PeerRegistry};
use crate::pipeline::{default_pipeline, Pipeline};
use crate::processor::{Effects, Outgoing, Processor, ReceiveContext, SendContext};
use crate::receiver::{MessageReceiver, ReceivedMessage};
use crate::time::{Clock, SystemClock};
use crate::transport::{DatagramHandler, Transport};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Recipient {
    Peer(SenderId),
    /// every registered peer - for a client, that is the server
    AllPeers,
}

/// Collaborators that have a sensible default, but can be replaced
pub struct EndPointOptions {
    pub clock: Arc<dyn Clock>,
    pub serializer: Arc<dyn Serializer>,
    pub random: Box<dyn Random>,
    /// additional pipeline stages, running after the built-in reliability stages
    pub processors: Vec<Arc<dyn Processor>>,
}
impl Default for EndPointOptions {
    fn default() -> Self {
        EndPointOptions {
            clock: Arc::new(SystemClock),
            serializer: Arc::new(WireSerializer),
            random: Box::new(RngRandom),
            processors: Vec::new(),
        }
    }
}

/// The reliable messaging engine for one local socket: either a server with any number of
///  clients, or a client of one server.
///
/// Received datagrams are passed to [EndPoint::handle_datagram] (usually by running
///  [EndPoint::run_receive_loop]), and time-driven work happens in [EndPoint::tick] (usually by
///  running [EndPoint::spawn_tick_loop]).
pub struct EndPoint {
    config: Arc<ReliabilityConfig>,
    role: Role,
    local: Arc<LocalIdentity>,
    registry: Arc<PeerRegistry>,
    id_provider: Arc<dyn IdProvider>,
    pipeline: Pipeline,
    chunker: Chunker,
    transport: Arc<dyn Transport>,
    receiver: Arc<dyn MessageReceiver>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    events: ConnectionEventNotifier,
    fault_injector: Arc<FaultInjector>,
    /// serializes receive processing per peer
    receive_gates: Mutex<FxHashMap<SenderId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EndPoint {
    pub fn new_server(config: ReliabilityConfig, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>) -> anyhow::Result<EndPoint> {
        EndPoint::new_server_with(config, transport, receiver, Default::default())
    }

    pub fn new_server_with(config: ReliabilityConfig, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>, options: EndPointOptions) -> anyhow::Result<EndPoint> {
        EndPoint::new(config, Role::Server, Arc::new(ClientScopedIdProvider::new()), transport, receiver, options)
    }

    pub fn new_client(config: ReliabilityConfig, server_addr: SocketAddr, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>) -> anyhow::Result<EndPoint> {
        EndPoint::new_client_with(config, server_addr, transport, receiver, Default::default())
    }

    pub fn new_client_with(config: ReliabilityConfig, server_addr: SocketAddr, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>, options: EndPointOptions) -> anyhow::Result<EndPoint> {
        let end_point = EndPoint::new(config, Role::Client, Arc::new(GlobalIdProvider::new()), transport, receiver, options)?;
        end_point.registry.register(SenderId::SERVER, server_addr, None);
        Ok(end_point)
    }

    fn new(
        config: ReliabilityConfig,
        role: Role,
        id_provider: Arc<dyn IdProvider>,
        transport: Arc<dyn Transport>,
        receiver: Arc<dyn MessageReceiver>,
        options: EndPointOptions,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let local_id = match role {
            Role::Server => SenderId::SERVER,
            Role::Client => config.claimed_sender_id.unwrap_or(SenderId::SERVER),
        };
        let local = Arc::new(LocalIdentity::new(local_id));
        let registry = Arc::new(PeerRegistry::new());

        let mut pipeline = default_pipeline(config.clone(), role, local.clone(), registry.clone(), id_provider.clone());
        for processor in options.processors {
            pipeline.add_processor(processor);
        }

        Ok(EndPoint {
            chunker: Chunker::new(&config),
            fault_injector: Arc::new(FaultInjector::new(&config, options.random)),
            config,
            role,
            local,
            registry,
            id_provider,
            pipeline,
            transport,
            receiver,
            serializer: options.serializer,
            clock: options.clock,
            events: ConnectionEventNotifier::new(),
            receive_gates: Default::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Arc<ReliabilityConfig> {
        &self.config
    }

    /// The local sender id. For a client, this changes when the server assigns an id.
    pub fn sender_id(&self) -> SenderId {
        self.local.sender_id()
    }

    pub fn is_connected(&self) -> bool {
        self.pipeline.handshake().is_connected()
    }

    pub fn peers(&self) -> Vec<SenderId> {
        self.registry.ids()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Drops the next outgoing datagram, for testing an application's reaction to loss
    pub fn drop_next(&self) {
        self.fault_injector.drop_next();
    }

    /// Sends a connect request to the server. Any previous connection is dropped first.
    pub async fn connect(&self) -> anyhow::Result<()> {
        if self.role != Role::Client {
            bail!("only a client can connect");
        }

        self.remove_peer(SenderId::SERVER).await;
        let body = self.pipeline.handshake().connect_request_body();
        info!("connecting to the server at {:?}", self.registry.addr_of(SenderId::SERVER));
        self.send_to(&[SenderId::SERVER], ReliableMode::AckPacket, body).await
    }

    pub async fn send(&self, recipient: Recipient, mode: ReliableMode, payload: Bytes) -> anyhow::Result<()> {
        let body = MessageBody::Payload(payload);
        self.pipeline.handshake().ensure_can_send(&body)?;

        let recipients = match recipient {
            Recipient::Peer(peer) => {
                if !self.registry.contains(peer) {
                    bail!("unknown peer {}", peer);
                }
                vec![peer]
            }
            Recipient::AllPeers => self.registry.ids(),
        };
        if recipients.is_empty() {
            debug!("no peers - nothing to send");
            return Ok(());
        }

        self.send_to(&recipients, mode, body).await
    }

    async fn send_to(&self, recipients: &[SenderId], mode: ReliableMode, body: MessageBody) -> anyhow::Result<()> {
        let mut by_stream: Vec<(StreamKey, Vec<SenderId>)> = Vec::new();
        for &recipient in recipients {
            let stream = self.id_provider.stream_of(recipient, mode);
            match by_stream.iter_mut().find(|(s, _)| *s == stream) {
                Some((_, group)) => group.push(recipient),
                None => by_stream.push((stream, vec![recipient])),
            }
        }

        for (stream, group) in by_stream {
            self.send_to_stream(stream, &group, mode, body.clone()).await?;
        }
        Ok(())
    }

    async fn send_to_stream(&self, stream: StreamKey, recipients: &[SenderId], mode: ReliableMode, body: MessageBody) -> anyhow::Result<()> {
        let mut message = Message::new(MessageId::ZERO, self.local.sender_id(), mode, body);

        let num_parts = self.chunker.parts_needed(&message);
        if num_parts > self.config.max_parts_per_message {
            bail!("message needs {} parts, the maximum is {}", num_parts, self.config.max_parts_per_message);
        }
        if num_parts > 1 && message.is_internal() {
            bail!("{:?} message does not fit into a datagram", message.body.kind());
        }

        message.id = self.id_provider.reserve(stream, num_parts);
        let messages = if num_parts == 1 {
            vec![message]
        }
        else {
            trace!("splitting message {} into {} parts", message.id, num_parts);
            self.chunker.split(&message)
        };

        let ctx = SendContext {
            recipients,
            stream,
            now: self.clock.now(),
        };
        let mut datagrams = Vec::with_capacity(messages.len());
        for mut message in messages {
            self.pipeline.before_send(&mut message, &ctx);
            datagrams.push(self.serializer.encode(&message));
            self.pipeline.after_send(&message, &ctx);
        }

        let addrs = recipients.iter()
            .filter_map(|&peer| {
                let addr = self.registry.addr_of(peer);
                if addr.is_none() {
                    warn!("no address for {} - not sending", peer);
                }
                addr
            })
            .collect::<Vec<_>>();

        match self.config.queued_messages_delay {
            Some(delay) if datagrams.len() > 1 => {
                let transport = self.transport.clone();
                let fault_injector = self.fault_injector.clone();
                tokio::spawn(async move {
                    for (i, datagram) in datagrams.iter().enumerate() {
                        if i > 0 {
                            tokio::time::sleep(delay).await;
                        }
                        for &addr in &addrs {
                            if let Err(e) = transmit(transport.as_ref(), &fault_injector, addr, datagram).await {
                                warn!("error sending queued datagram to {}: {}", addr, e);
                            }
                        }
                    }
                });
            }
            _ => {
                for datagram in &datagrams {
                    for &addr in &addrs {
                        transmit(self.transport.as_ref(), &self.fault_injector, addr, datagram).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn resend(&self, to: SenderId, message: &Message) -> anyhow::Result<()> {
        let addr = match self.registry.addr_of(to) {
            Some(addr) => addr,
            None => bail!("no address for {}", to),
        };
        let datagram = self.serializer.encode(message);
        transmit(self.transport.as_ref(), &self.fault_injector, addr, &datagram).await
    }

    /// Processes a received datagram: malformed datagrams and datagrams from unknown peers are
    ///  dropped, everything else passes the receive pipeline. Delivered messages are passed to
    ///  the receiver before this returns.
    pub async fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        let message = match self.serializer.decode(buf) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed datagram from {}: {} - dropping", from, e);
                return;
            }
        };

        let mut effects = Effects::default();
        let peer = match self.resolve_peer(&message, from, &mut effects) {
            Some(peer) => peer,
            None => return,
        };

        let mut ctx = ReceiveContext::new(peer, from, self.clock.now());
        ctx.effects = effects;
        {
            let gate = self.receive_gate(peer);
            let _guard = gate.lock().await;
            if !self.is_current_gate(peer, &gate) {
                debug!("{} was removed while a datagram from {} was waiting - dropping it", peer, from);
                return;
            }

            for message in self.pipeline.receive(message, &mut ctx) {
                if let MessageBody::Payload(payload) = message.body {
                    self.receiver.on_message(ReceivedMessage {
                        sender_id: peer,
                        id: message.id,
                        reliable_mode: message.reliable_mode,
                        payload,
                    }).await;
                }
            }
        }

        self.apply_effects(ctx.effects).await;
    }

    fn resolve_peer(&self, message: &Message, from: SocketAddr, effects: &mut Effects) -> Option<SenderId> {
        if self.role == Role::Client {
            if self.registry.addr_of(SenderId::SERVER) == Some(from) {
                return Some(SenderId::SERVER);
            }
            debug!("datagram from {}, which is not the server - dropping", from);
            return None;
        }

        if let Some(known) = self.registry.lookup_addr(from) {
            if known.sender_id != message.sender_id && !matches!(message.body, MessageBody::ConnectRequest { .. }) {
                warn!("message from {} claims to be from {}, but the address belongs to {} - dropping", from, message.sender_id, known.sender_id);
                return None;
            }
            return Some(known.sender_id);
        }

        if let MessageBody::ConnectRequest { claimed_sender_id, .. } = &message.body {
            return Some(claimed_sender_id.unwrap_or(SenderId::SERVER));
        }

        if !self.config.auto_register_peers {
            debug!("message from unregistered peer at {} - dropping", from);
            return None;
        }
        if message.sender_id == SenderId::SERVER || self.registry.contains(message.sender_id) {
            warn!("{} at {} can not be registered - dropping its message", message.sender_id, from);
            return None;
        }

        info!("registering {} at {}", message.sender_id, from);
        self.registry.register(message.sender_id, from, None);
        effects.event(ConnectionEvent::Connected { peer: message.sender_id });
        Some(message.sender_id)
    }

    fn receive_gate(&self, peer: SenderId) -> Arc<tokio::sync::Mutex<()>> {
        self.receive_gates.lock().unwrap()
            .entry(peer)
            .or_default()
            .clone()
    }

    fn is_current_gate(&self, peer: SenderId, gate: &Arc<tokio::sync::Mutex<()>>) -> bool {
        self.receive_gates.lock().unwrap()
            .get(&peer)
            .is_some_and(|current| Arc::ptr_eq(current, gate))
    }

    async fn apply_effects(&self, effects: Effects) {
        for event in effects.events {
            self.events.send_event(event);
        }

        for outgoing in effects.outgoing {
            let result = match &outgoing {
                Outgoing::New { to, mode, body } => {
                    let stream = self.id_provider.stream_of(*to, *mode);
                    self.send_to_stream(stream, &[*to], *mode, body.clone()).await
                }
                Outgoing::Resend { to, message } => self.resend(*to, message).await,
            };
            if let Err(e) = result {
                warn!("error sending {:?}: {}", outgoing, e);
            }
        }

        for peer in effects.removed_peers {
            self.remove_peer(peer).await;
        }
    }

    /// Runs the time-driven work of all pipeline stages once
    pub async fn tick(&self) {
        let effects = self.pipeline.tick(self.clock.now());
        self.apply_effects(effects).await;
    }

    /// Calls [EndPoint::tick] every `tick_interval` until the end point is dropped
    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let end_point = Arc::downgrade(self);
        let tick_interval = self.config.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match end_point.upgrade() {
                    Some(end_point) => end_point.tick().await,
                    None => break,
                }
            }
            trace!("tick loop stopped");
        })
    }

    /// Passes datagrams from the transport to this end point until [EndPoint::stop_receive_loop]
    ///  is called
    pub async fn run_receive_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        self.transport.recv_loop(self.clone()).await
    }

    pub fn stop_receive_loop(&self) {
        self.transport.cancel_recv_loop();
    }

    /// Sends a `Leave` message to a peer and removes all state held for it.
    ///
    /// Removal waits for a datagram from the peer that is being processed, so this must not be
    ///  awaited inside [MessageReceiver::on_message] for a message from the same peer.
    pub async fn disconnect(&self, peer: SenderId) -> anyhow::Result<()> {
        if !self.registry.contains(peer) {
            bail!("unknown peer {}", peer);
        }

        let result = self.send_to(&[peer], ReliableMode::Unreliable, MessageBody::Leave).await;
        info!("disconnected from {}", peer);
        self.events.send_event(ConnectionEvent::Disconnected { peer });
        self.remove_peer(peer).await;
        result
    }

    /// Disconnects from all peers
    pub async fn leave(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for peer in self.registry.ids() {
            if let Err(e) = self.disconnect(peer).await {
                warn!("error disconnecting from {}: {}", peer, e);
                result = Err(e);
            }
        }
        result
    }

    /// Removal happens under the peer's receive gate, and retires the gate. Datagrams that
    ///  were waiting for it are dropped, so they can not recreate state for the removed peer.
    async fn remove_peer(&self, peer: SenderId) {
        let gate = self.receive_gate(peer);
        let _guard = gate.lock().await;

        debug!("removing all state for {}", peer);
        self.pipeline.remove_peer(peer);
        self.receive_gates.lock().unwrap().remove(&peer);
    }
}

async fn transmit(transport: &dyn Transport, fault_injector: &FaultInjector, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
    if fault_injector.should_drop() {
        trace!("simulated loss of a datagram to {}", to);
        return Ok(());
    }
    transport.send(to, datagram).await
}

#[async_trait]
impl DatagramHandler for EndPoint {
    async fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        EndPoint::handle_datagram(self, buf, from).await
    }
}
