use std::fmt::{Debug, Formatter};

use bytes::BytesMut;
use crc::Crc;
use tracing::warn;

use crate::message::Message;
use crate::processor::{Processor, ReceiveContext, ReceiveVerdict, SendContext};

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    /// Covers everything that goes on the wire except the checksum itself
    pub fn of(message: &Message) -> Checksum {
        let mut buf = BytesMut::new();
        message.ser_without_checksum(&mut buf);

        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(&buf);

        Checksum(
            digest.finalize()
        )
    }
}

/// Attaches a checksum to every outgoing message, and discards incoming messages whose checksum
///  does not match. This guards against corruption, it is no authentication mechanism.
pub struct ChecksumProcessor;

impl Processor for ChecksumProcessor {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn before_send(&self, message: &mut Message, _ctx: &SendContext) {
        let checksum = Checksum::of(message);
        message.checksum = Some(checksum);
    }

    fn before_receive(&self, message: Message, ctx: &mut ReceiveContext) -> ReceiveVerdict {
        match message.checksum {
            Some(checksum) if checksum == Checksum::of(&message) => ReceiveVerdict::Continue(message),
            Some(checksum) => {
                warn!("checksum error in message {} from {} ({:?} received, {:?} expected) - skipping", message.id, ctx.peer, checksum, Checksum::of(&message));
                ReceiveVerdict::Discard
            }
            None => {
                warn!("message {} from {} has no checksum - skipping", message.id, ctx.peer);
                ReceiveVerdict::Discard
            }
        }
    }
}
