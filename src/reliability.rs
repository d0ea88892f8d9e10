//! The two reliability strategies. Both work on the [crate::message_log::MessageLog] as the
//!  single source of sent messages:
//!
//! * [ack::AckProcessor] for ACK_PACKET messages: explicit acknowledgement of every message,
//!   timeout-based retransmission by the sender
//! * [sequence::SequenceProcessor] for SEQUENCE messages: the receiver detects gaps in a
//!   consecutively numbered stream and requests the missing ids

pub mod ack;
pub mod sequence;
