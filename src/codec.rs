//! Encoding of [Message]s on the wire. See the crate level documentation for the format.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;

use crate::checksum::Checksum;
use crate::message::{BodyKind, Message, MessageBody, MessageId, PartHeader, ReliableMode, SenderId};

const FLAG_MODE_MASK: u8 = 0b0000_0011;
const FLAG_CHECKSUM: u8 = 0b0000_0100;
const FLAG_PART: u8 = 0b0000_1000;

/// The number of bytes a checksum adds to an encoded message
pub const CHECKSUM_LEN: usize = size_of::<u64>();

/// The encoded size of a message without part header and body
pub const HEADER_LEN: usize = 1 + CHECKSUM_LEN + 1 + 4 + 8;

/// The number of ids an `Ack` or `RequestSeqIds` message can carry without being split
pub fn max_ids_per_datagram(max_datagram_payload: usize) -> usize {
    // RequestSeqIds has a u64 before the ids, and the id count is a varint of up to 5 bytes
    max_datagram_payload.saturating_sub(HEADER_LEN + 8 + 5) / size_of::<u64>()
}

/// Turns messages into datagrams and back. The engine only ever inspects the fields it defines
///  itself, the payload of application messages is opaque.
pub trait Serializer: Send + Sync {
    fn encode(&self, message: &Message) -> Bytes;
    fn decode(&self, buf: &[u8]) -> anyhow::Result<Message>;
}

pub struct WireSerializer;
impl Serializer for WireSerializer {
    fn encode(&self, message: &Message) -> Bytes {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        buf.freeze()
    }

    fn decode(&self, mut buf: &[u8]) -> anyhow::Result<Message> {
        Message::deser(&mut buf)
    }
}

impl Message {
    fn flags_without_checksum(&self) -> u8 {
        let mut flags: u8 = self.reliable_mode.into();
        if self.part.is_some() {
            flags |= FLAG_PART;
        }
        flags
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self.checksum {
            Some(checksum) => {
                buf.put_u8(self.flags_without_checksum() | FLAG_CHECKSUM);
                buf.put_u64(checksum.0);
            }
            None => buf.put_u8(self.flags_without_checksum()),
        }
        self.ser_content(buf);
    }

    /// Writes everything a checksum covers, i.e. the full encoding minus the checksum itself
    pub fn ser_without_checksum(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags_without_checksum());
        self.ser_content(buf);
    }

    /// The encoded size of this message, assuming it carries a checksum
    pub fn serialized_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.ser_without_checksum(&mut buf);
        buf.len() + CHECKSUM_LEN
    }

    fn ser_content(&self, buf: &mut BytesMut) {
        buf.put_u8(self.body.kind().into());
        buf.put_u32(self.sender_id.to_raw());
        buf.put_u64(self.id.to_raw());
        if let Some(part) = &self.part {
            buf.put_u64(part.parent_id.to_raw());
            buf.put_usize_varint(part.part_index as usize);
            buf.put_usize_varint(part.total_parts as usize);
        }

        match &self.body {
            MessageBody::Payload(payload) => buf.put_slice(payload),
            MessageBody::ConnectRequest { claimed_sender_id, last_reliable_seq_id } => {
                buf.put_u32(claimed_sender_id.unwrap_or(SenderId::SERVER).to_raw());
                buf.put_u64(last_reliable_seq_id.to_raw());
            }
            MessageBody::ConnectResponse { assigned_sender_id, last_reliable_seq_id, connect_request_msg_id } => {
                buf.put_u32(assigned_sender_id.to_raw());
                buf.put_u64(last_reliable_seq_id.to_raw());
                buf.put_u64(connect_request_msg_id.to_raw());
            }
            MessageBody::Ack { ids } => {
                Self::ser_ids(ids, buf);
            }
            MessageBody::RequestSeqIds { last_received, ids } => {
                buf.put_u64(last_received.to_raw());
                Self::ser_ids(ids, buf);
            }
            MessageBody::KeepAlive { last_received_seq_id, last_sent_seq_id } => {
                buf.put_u64(last_received_seq_id.to_raw());
                buf.put_u64(last_sent_seq_id.to_raw());
            }
            MessageBody::Leave => {}
        }
    }

    fn ser_ids(ids: &[MessageId], buf: &mut BytesMut) {
        buf.put_usize_varint(ids.len());
        for id in ids {
            buf.put_u64(id.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let flags = buf.try_get_u8()?;
        if flags & !(FLAG_MODE_MASK | FLAG_CHECKSUM | FLAG_PART) != 0 {
            bail!("unsupported flags {:02x}", flags);
        }
        let reliable_mode = ReliableMode::try_from_primitive(flags & FLAG_MODE_MASK)
            .map_err(|e| anyhow!("invalid reliable mode: {}", e))?;

        let checksum = if flags & FLAG_CHECKSUM != 0 {
            Some(Checksum(buf.try_get_u64()?))
        }
        else {
            None
        };

        let kind = BodyKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid message kind: {}", e))?;
        let sender_id = SenderId::from_raw(buf.try_get_u32()?);
        let id = MessageId::from_raw(buf.try_get_u64()?);

        let part = if flags & FLAG_PART != 0 {
            Some(PartHeader {
                parent_id: MessageId::from_raw(buf.try_get_u64()?),
                part_index: Self::try_get_u32_varint(buf)?,
                total_parts: Self::try_get_u32_varint(buf)?,
            })
        }
        else {
            None
        };

        let body = match kind {
            BodyKind::Payload => MessageBody::Payload(buf.copy_to_bytes(buf.remaining())),
            BodyKind::ConnectRequest => {
                let claimed = SenderId::from_raw(buf.try_get_u32()?);
                MessageBody::ConnectRequest {
                    claimed_sender_id: if claimed == SenderId::SERVER { None } else { Some(claimed) },
                    last_reliable_seq_id: MessageId::from_raw(buf.try_get_u64()?),
                }
            }
            BodyKind::ConnectResponse => MessageBody::ConnectResponse {
                assigned_sender_id: SenderId::from_raw(buf.try_get_u32()?),
                last_reliable_seq_id: MessageId::from_raw(buf.try_get_u64()?),
                connect_request_msg_id: MessageId::from_raw(buf.try_get_u64()?),
            },
            BodyKind::Ack => MessageBody::Ack {
                ids: Self::try_get_ids(buf)?,
            },
            BodyKind::RequestSeqIds => MessageBody::RequestSeqIds {
                last_received: MessageId::from_raw(buf.try_get_u64()?),
                ids: Self::try_get_ids(buf)?,
            },
            BodyKind::KeepAlive => MessageBody::KeepAlive {
                last_received_seq_id: MessageId::from_raw(buf.try_get_u64()?),
                last_sent_seq_id: MessageId::from_raw(buf.try_get_u64()?),
            },
            BodyKind::Leave => MessageBody::Leave,
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} message", buf.remaining(), kind);
        }

        Ok(Message {
            id,
            sender_id,
            reliable_mode,
            checksum,
            part,
            body,
        })
    }

    fn try_get_ids(buf: &mut impl Buf) -> anyhow::Result<Vec<MessageId>> {
        let len = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid id count: {:?}", e))?;
        if len > buf.remaining() / size_of::<u64>() {
            bail!("id count {} exceeds the message", len);
        }

        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            result.push(MessageId::from_raw(buf.try_get_u64()?));
        }
        Ok(result)
    }

    fn try_get_u32_varint(buf: &mut impl Buf) -> anyhow::Result<u32> {
        let raw = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid varint: {:?}", e))?;
        Ok(u32::try_from(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload_message() -> Message {
        Message {
            id: MessageId::from_raw(0x0102),
            sender_id: SenderId::from_raw(7),
            reliable_mode: ReliableMode::Sequence,
            checksum: Some(Checksum(0x1122334455667788)),
            part: None,
            body: MessageBody::Payload(Bytes::from_static(b"ab")),
        }
    }

    #[test]
    fn test_ser_payload() {
        let mut buf = BytesMut::new();
        payload_message().ser(&mut buf);
        assert_eq!(&buf, b"\x05\x11\x22\x33\x44\x55\x66\x77\x88\x00\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x01\x02ab".as_slice());
    }

    #[test]
    fn test_ser_part_without_checksum() {
        let mut msg = payload_message();
        msg.checksum = None;
        msg.reliable_mode = ReliableMode::AckPacket;
        msg.part = Some(PartHeader { parent_id: MessageId::from_raw(0x0101), part_index: 1, total_parts: 3 });

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(&buf, b"\x0a\x00\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x01\x02\x00\x00\x00\x00\x00\x00\x01\x01\x01\x03ab".as_slice());
    }

    #[test]
    fn test_serialized_len_includes_checksum() {
        let mut msg = payload_message();
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(msg.serialized_len(), buf.len());

        msg.checksum = None;
        assert_eq!(msg.serialized_len(), buf.len());
    }

    #[rstest]
    #[case::payload(MessageBody::Payload(Bytes::from_static(b"hello")))]
    #[case::empty_payload(MessageBody::Payload(Bytes::new()))]
    #[case::connect_request_unassigned(MessageBody::ConnectRequest { claimed_sender_id: None, last_reliable_seq_id: MessageId::ZERO })]
    #[case::connect_request_claimed(MessageBody::ConnectRequest { claimed_sender_id: Some(SenderId::from_raw(3)), last_reliable_seq_id: MessageId::from_raw(17) })]
    #[case::connect_response(MessageBody::ConnectResponse {
        assigned_sender_id: SenderId::from_raw(7),
        last_reliable_seq_id: MessageId::from_raw(42),
        connect_request_msg_id: MessageId::from_raw(1),
    })]
    #[case::ack(MessageBody::Ack { ids: vec![MessageId::from_raw(1), MessageId::from_raw(99)] })]
    #[case::request_seq_ids(MessageBody::RequestSeqIds { last_received: MessageId::from_raw(10), ids: vec![MessageId::from_raw(11)] })]
    #[case::keep_alive(MessageBody::KeepAlive { last_received_seq_id: MessageId::from_raw(4), last_sent_seq_id: MessageId::from_raw(8) })]
    #[case::leave(MessageBody::Leave)]
    fn test_decode_inverts_encode(#[case] body: MessageBody) {
        let mut msg = payload_message();
        msg.body = body;

        let encoded = WireSerializer.encode(&msg);
        assert_eq!(WireSerializer.decode(&encoded).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::truncated_header(b"\x01\x00\x00\x00\x00\x07\x00\x00")]
    #[case::invalid_mode(b"\x03\x00\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x01")]
    #[case::unknown_flag(b"\x41\x00\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x01")]
    #[case::unknown_kind(b"\x01\x09\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x01")]
    #[case::truncated_checksum(b"\x05\x00\x00")]
    #[case::trailing_bytes(b"\x00\x06\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x01x")]
    #[case::ack_count_too_big(b"\x00\x03\x00\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x01\x05\x00\x00\x00\x00\x00\x00\x00\x01")]
    fn test_decode_malformed(#[case] buf: &[u8]) {
        assert!(WireSerializer.decode(buf).is_err());
    }
}
