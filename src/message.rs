use std::fmt::{Display, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::checksum::Checksum;

/// Message ids are unique per id stream (see [crate::id_provider]) and strictly increasing.
///  `0` is never handed out, so it can serve as the 'nothing sent / received yet' value.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct MessageId(u64);
impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn from_raw(raw: u64) -> MessageId {
        MessageId(raw)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0 + 1)
    }

    pub fn plus(&self, offset: u32) -> MessageId {
        MessageId(self.0 + offset as u64)
    }
}
impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the logical end point that sent a message, independent of its transport address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct SenderId(u32);
impl SenderId {
    /// The server's id. In a connect request, this value means 'please assign an id'.
    pub const SERVER: SenderId = SenderId(0);

    pub fn from_raw(raw: u32) -> SenderId {
        SenderId(raw)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}
impl Display for SenderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReliableMode {
    /// fire and forget
    Unreliable = 0,
    /// gap detected, ordered stream: the receiver requests missing ids
    Sequence = 1,
    /// every message is acknowledged and retransmitted until it is
    AckPacket = 2,
}

/// Tags a message as one part of a bigger message that was split for transport. The parent id
///  is the id of the message's first part.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PartHeader {
    pub parent_id: MessageId,
    pub part_index: u32,
    pub total_parts: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BodyKind {
    Payload = 0,
    ConnectRequest = 1,
    ConnectResponse = 2,
    Ack = 3,
    RequestSeqIds = 4,
    KeepAlive = 5,
    Leave = 6,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageBody {
    /// application data, opaque to the engine
    Payload(Bytes),
    ConnectRequest {
        claimed_sender_id: Option<SenderId>,
        /// the client's last SEQUENCE id sent to the server, i.e. the server's baseline
        last_reliable_seq_id: MessageId,
    },
    ConnectResponse {
        assigned_sender_id: SenderId,
        /// the server's last SEQUENCE id sent to this client, i.e. the client's baseline
        last_reliable_seq_id: MessageId,
        connect_request_msg_id: MessageId,
    },
    Ack {
        ids: Vec<MessageId>,
    },
    RequestSeqIds {
        last_received: MessageId,
        ids: Vec<MessageId>,
    },
    KeepAlive {
        last_received_seq_id: MessageId,
        last_sent_seq_id: MessageId,
    },
    Leave,
}
impl MessageBody {
    pub fn kind(&self) -> BodyKind {
        match self {
            MessageBody::Payload(_) => BodyKind::Payload,
            MessageBody::ConnectRequest { .. } => BodyKind::ConnectRequest,
            MessageBody::ConnectResponse { .. } => BodyKind::ConnectResponse,
            MessageBody::Ack { .. } => BodyKind::Ack,
            MessageBody::RequestSeqIds { .. } => BodyKind::RequestSeqIds,
            MessageBody::KeepAlive { .. } => BodyKind::KeepAlive,
            MessageBody::Leave => BodyKind::Leave,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: SenderId,
    pub reliable_mode: ReliableMode,
    pub checksum: Option<Checksum>,
    pub part: Option<PartHeader>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(id: MessageId, sender_id: SenderId, reliable_mode: ReliableMode, body: MessageBody) -> Message {
        Message {
            id,
            sender_id,
            reliable_mode,
            checksum: None,
            part: None,
            body,
        }
    }

    /// The ids of previously sent messages that this message acknowledges. A connect response
    ///  doubles as the acknowledgement of the request it answers.
    pub fn ack_ids(&self) -> &[MessageId] {
        match &self.body {
            MessageBody::Ack { ids } => ids,
            MessageBody::ConnectResponse { connect_request_msg_id, .. } => std::slice::from_ref(connect_request_msg_id),
            _ => &[],
        }
    }

    /// Internal messages are consumed by the engine and never delivered to the application.
    ///  Parts are not internal: they carry (pieces of) application messages.
    pub fn is_internal(&self) -> bool {
        !matches!(self.body, MessageBody::Payload(_))
    }

    pub fn is_part(&self) -> bool {
        self.part.is_some()
    }
}
