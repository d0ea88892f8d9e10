//! The connection handshake: a client sends a `ConnectRequest` to the server, and the server
//!  answers with a `ConnectResponse` that assigns the client's sender id. Both messages are
//!  ACK_PACKET reliable, and the response doubles as the acknowledgement of the request.
//!
//! Each side tells the other the last SEQUENCE id it sent, which becomes the other side's
//!  sequence baseline: SEQUENCE messages that arrive before the baseline is known are held back.

use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::{debug, info, trace, warn};

use crate::config::ReliabilityConfig;
use crate::events::ConnectionEvent;
use crate::id_provider::IdProvider;
use crate::message::{Message, MessageBody, MessageId, ReliableMode, SenderId};
use crate::peers::{LocalIdentity, PeerRegistry};
use crate::processor::{Processor, ReceiveContext, ReceiveVerdict, SendContext};
use crate::reliability::sequence::{SeedOutcome, SequenceProcessor};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Default)]
struct ClientState {
    connect_request_id: Option<MessageId>,
    connected: bool,
}

pub struct ConnectionHandshake {
    role: Role,
    config: Arc<ReliabilityConfig>,
    local: Arc<LocalIdentity>,
    registry: Arc<PeerRegistry>,
    id_provider: Arc<dyn IdProvider>,
    sequence: Arc<SequenceProcessor>,
    client: Mutex<ClientState>,
}

impl ConnectionHandshake {
    pub fn new(
        role: Role,
        config: Arc<ReliabilityConfig>,
        local: Arc<LocalIdentity>,
        registry: Arc<PeerRegistry>,
        id_provider: Arc<dyn IdProvider>,
        sequence: Arc<SequenceProcessor>,
    ) -> ConnectionHandshake {
        ConnectionHandshake {
            role,
            config,
            local,
            registry,
            id_provider,
            sequence,
            client: Default::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// A server is always 'connected', a client once it received the response to its current
    ///  connect request
    pub fn is_connected(&self) -> bool {
        match self.role {
            Role::Server => true,
            Role::Client => self.client.lock().unwrap().connected,
        }
    }

    pub fn ensure_can_send(&self, body: &MessageBody) -> anyhow::Result<()> {
        if matches!(body, MessageBody::Payload(_)) && !self.is_connected() {
            bail!("not connected to the server");
        }
        Ok(())
    }

    pub fn connect_request_body(&self) -> MessageBody {
        MessageBody::ConnectRequest {
            claimed_sender_id: self.config.claimed_sender_id,
            last_reliable_seq_id: self.id_provider.last_id(self.id_provider.stream_of(SenderId::SERVER, ReliableMode::Sequence)),
        }
    }

    fn on_connect_request(&self, request: &Message, claimed_sender_id: Option<SenderId>, last_reliable_seq_id: MessageId, ctx: &mut ReceiveContext) {
        if let Some(known) = self.registry.lookup_addr(ctx.from) {
            if known.connect_request_id == Some(request.id) {
                trace!("duplicate connect request {} from {}", request.id, known.sender_id);
            }
            else {
                info!("{} at {} reconnects with request {} - dropping its previous connection", known.sender_id, ctx.from, request.id);
                ctx.effects.event(ConnectionEvent::Disconnected { peer: known.sender_id });
                ctx.effects.remove_peer(known.sender_id);
            }
            return;
        }

        let assigned = self.registry.free_sender_id(claimed_sender_id);
        if assigned == SenderId::SERVER {
            warn!("no free sender id for a client at {} - ignoring its connect request", ctx.from);
            return;
        }
        if claimed_sender_id.is_some_and(|claimed| claimed != assigned) {
            debug!("claimed sender id {:?} is taken - assigning {} to the client at {}", claimed_sender_id, assigned, ctx.from);
        }

        self.registry.register(assigned, ctx.from, Some(request.id));
        self.sequence.seed_baseline(assigned, last_reliable_seq_id);

        let response = MessageBody::ConnectResponse {
            assigned_sender_id: assigned,
            last_reliable_seq_id: self.id_provider.last_id(self.id_provider.stream_of(assigned, ReliableMode::Sequence)),
            connect_request_msg_id: request.id,
        };
        ctx.effects.send(assigned, ReliableMode::AckPacket, response);

        info!("client {} connected from {}", assigned, ctx.from);
        ctx.effects.event(ConnectionEvent::Connected { peer: assigned });
        if self.config.expected_client_ids.contains(&assigned)
            && self.config.expected_client_ids.iter().all(|id| self.registry.contains(*id))
        {
            info!("all expected clients are connected");
            ctx.effects.event(ConnectionEvent::AllExpectedClientsConnected);
        }
    }

    fn on_connect_response(&self, assigned_sender_id: SenderId, last_reliable_seq_id: MessageId, connect_request_msg_id: MessageId, ctx: &mut ReceiveContext) {
        {
            let mut client = self.client.lock().unwrap();
            if client.connect_request_id != Some(connect_request_msg_id) {
                debug!("connect response for request {}, which is not the current request {:?} - ignoring it", connect_request_msg_id, client.connect_request_id);
                return;
            }

            if !client.connected {
                client.connected = true;
                self.local.set_sender_id(assigned_sender_id);
                info!("connected to the server as {}", assigned_sender_id);
                ctx.effects.event(ConnectionEvent::Connected { peer: SenderId::SERVER });
            }
        }

        if let SeedOutcome::AlreadySet(existing) = self.sequence.seed_baseline(SenderId::SERVER, last_reliable_seq_id) {
            debug!("repeated connect response: keeping sequence baseline {}", existing);
        }
    }
}

impl Processor for ConnectionHandshake {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn before_send(&self, message: &mut Message, _ctx: &SendContext) {
        if let MessageBody::ConnectRequest { .. } = &message.body {
            let mut client = self.client.lock().unwrap();
            client.connect_request_id = Some(message.id);
            client.connected = false;
        }
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        match (&message.body, self.role) {
            (MessageBody::ConnectRequest { claimed_sender_id, last_reliable_seq_id }, Role::Server) => {
                self.on_connect_request(&message, *claimed_sender_id, *last_reliable_seq_id, ctx);
                ReceiveVerdict::Discard
            }
            (MessageBody::ConnectResponse { assigned_sender_id, last_reliable_seq_id, connect_request_msg_id }, Role::Client) => {
                self.on_connect_response(*assigned_sender_id, *last_reliable_seq_id, *connect_request_msg_id, ctx);
                // the remaining stages acknowledge the request and the response itself
                ReceiveVerdict::Continue(message)
            }
            (MessageBody::ConnectRequest { .. }, Role::Client) | (MessageBody::ConnectResponse { .. }, Role::Server) => {
                debug!("{:?} message from {} does not fit the local role - discarding", message.body.kind(), ctx.peer);
                ReceiveVerdict::Discard
            }
            (MessageBody::Leave, _) => {
                info!("{} left", ctx.peer);
                ctx.effects.event(ConnectionEvent::Disconnected { peer: ctx.peer });
                ctx.effects.remove_peer(ctx.peer);
                ReceiveVerdict::Discard
            }
            _ => ReceiveVerdict::Continue(message),
        }
    }

    fn on_peer_removed(&self, peer: SenderId) {
        match self.role {
            Role::Server => {
                self.registry.remove(peer);
            }
            Role::Client => {
                if peer == SenderId::SERVER {
                    self.client.lock().unwrap().connected = false;
                }
            }
        }
    }
}
