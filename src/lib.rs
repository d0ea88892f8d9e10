//! Reliable messaging over UDP.
//!
//! An [end_point::EndPoint] sends application messages in one of three reliability modes:
//!
//! * UNRELIABLE: fire and forget
//! * SEQUENCE: messages are numbered consecutively, and the receiver delivers them in order. It
//!    detects gaps and asks the sender for the missing messages.
//! * ACK_PACKET: every message is acknowledged by its receiver, and retransmitted by the sender
//!    until it is. The receiver drops duplicates.
//!
//! Every message passes a [pipeline::Pipeline] of processing stages on the way out and on the
//!  way in. Messages that do not fit into a datagram are split into parts, which pass the
//!  pipeline individually and are reassembled on the receiving side.
//!
//! A server has any number of clients, which connect with a handshake that assigns them a
//!  sender id and exchanges the SEQUENCE baselines in both directions.
//!
//! All numbers on the wire are big endian:
//!
//! ```ascii
//! 0:  flags (u8)
//!      bits 0-1: reliable mode
//!      bit 2:    checksum present
//!      bit 3:    part header present
//! 1:  checksum (u64, CRC-64/REDIS), if present. It covers the rest of the message, and the
//!      flags without the checksum bit
//! *:  body kind (u8)
//! *:  sender id (u32)
//! *:  message id (u64)
//! *:  part header, if present:
//!      parent id (u64)
//!      part index (varint)
//!      total number of parts (varint)
//! *:  body, depending on the kind. An application payload is the rest of the datagram.
//! ```

pub mod checksum;
pub mod chunking;
pub mod codec;
pub mod config;
pub mod end_point;
pub mod events;
pub mod fault_injection;
pub mod handshake;
pub mod id_provider;
pub mod keepalive;
pub mod message;
pub mod message_log;
pub mod peers;
pub mod pipeline;
pub mod processor;
pub mod receiver;
pub mod reliability;
pub mod time;
pub mod transport;
pub mod test_util;
