use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::chunking::PART_OVERHEAD;
use crate::codec::max_ids_per_datagram;
use crate::message::SenderId;

/// Configuration of a reliability engine. It is constructed once, validated, and then shared
///  as an `Arc<ReliabilityConfig>` between all components - there is no way to change it
///  after an engine was created.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// The sender id a client asks for in its connect request. `None` lets the server assign
    ///  an id. Ignored for servers, which always have [SenderId::SERVER].
    pub claimed_sender_id: Option<SenderId>,

    /// Interval at which the engine's periodic work (retransmission, ack flushing, id requests,
    ///  keepalive) runs. This bounds the precision of all timeouts.
    pub tick_interval: Duration,

    /// A keepalive is sent to a peer if nothing else was sent to it for this long.
    pub keepalive_interval: Duration,
    /// A peer that was not heard from for this long is considered unreachable.
    pub timeout_threshold: Duration,

    /// Maximum size of a single datagram's payload. Messages that exceed this after encoding are
    ///  split into parts.
    pub max_datagram_payload: usize,

    /// Upper bound for the number of missing ids requested in a single id request.
    pub max_request_absent_ids: usize,
    /// Time a sequence gap must persist before missing ids are requested, and the minimum time
    ///  between subsequent requests for the same peer.
    pub id_request_delay: Duration,

    /// If set, the parts of a chunked message are handed to the transport with this delay
    ///  between them rather than in a burst.
    pub queued_messages_delay: Option<Duration>,

    /// An ACK_PACKET message is retransmitted if it was not acknowledged within this time.
    pub ack_timeout: Duration,
    /// Number of retransmissions after which pending recipients of a message are considered
    ///  unreachable. `None` means messages are retransmitted until they are acknowledged or the
    ///  peer times out.
    pub max_retransmit_attempts: Option<u32>,

    pub max_out_of_order_messages: usize,
    /// Number of incomplete multi-part messages a peer may have per reliability mode. A part
    ///  of yet another message is rejected as a reassembly conflict.
    pub max_pending_reassemblies: usize,
    pub max_parts_per_message: u32,
    pub reassembly_timeout: Duration,

    pub max_log_entries: usize,
    pub max_ack_ids_per_message: usize,
    pub max_tracked_received_ids: usize,

    /// Percentage (0-100) of outgoing datagrams that are dropped deliberately, for testing
    ///  behavior under packet loss.
    pub packet_loss_percentage: u8,

    /// Server only: the client ids the application waits for before it starts.
    pub expected_client_ids: FxHashSet<SenderId>,
    /// Server only: accept messages from sender ids that did not perform a handshake, registering
    ///  them on first contact.
    pub auto_register_peers: bool,
}

impl ReliabilityConfig {
    pub fn new() -> ReliabilityConfig {
        ReliabilityConfig {
            claimed_sender_id: None,
            tick_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(3),
            timeout_threshold: Duration::from_secs(18),
            max_datagram_payload: 1024,
            max_request_absent_ids: 5,
            id_request_delay: Duration::from_millis(100),
            queued_messages_delay: None,
            ack_timeout: Duration::from_millis(500),
            max_retransmit_attempts: None,
            max_out_of_order_messages: 256,
            max_pending_reassemblies: 1,
            max_parts_per_message: 4096,
            reassembly_timeout: Duration::from_secs(30),
            max_log_entries: 8192,
            max_ack_ids_per_message: 64,
            max_tracked_received_ids: 4096,
            packet_loss_percentage: 0,
            expected_client_ids: FxHashSet::default(),
            auto_register_peers: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_payload <= PART_OVERHEAD {
            bail!("maximum datagram payload must be bigger than the part overhead of {} bytes", PART_OVERHEAD);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.timeout_threshold <= self.keepalive_interval {
            bail!("timeout threshold must be greater than the keepalive interval");
        }
        if self.max_request_absent_ids == 0 {
            bail!("at least one absent id must fit into an id request");
        }
        if max_ids_per_datagram(self.max_datagram_payload) < self.max_request_absent_ids {
            bail!("an id request for {} absent ids does not fit into a datagram of {} bytes", self.max_request_absent_ids, self.max_datagram_payload);
        }
        if self.max_ack_ids_per_message == 0 {
            bail!("at least one id must fit into an ack message");
        }
        if self.max_out_of_order_messages == 0 || self.max_pending_reassemblies == 0 || self.max_parts_per_message == 0 {
            bail!("buffer caps must not be zero");
        }
        if self.max_log_entries == 0 || self.max_tracked_received_ids == 0 {
            bail!("tracking caps must not be zero");
        }
        if self.packet_loss_percentage > 100 {
            bail!("packet loss percentage must be between 0 and 100, was {}", self.packet_loss_percentage);
        }
        if self.expected_client_ids.contains(&SenderId::SERVER) {
            bail!("{} is reserved for the server", SenderId::SERVER);
        }
        if self.claimed_sender_id == Some(SenderId::SERVER) {
            bail!("a client can not claim the server's sender id");
        }
        Ok(())
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig::new()
    }
}
