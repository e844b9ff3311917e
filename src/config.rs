use std::time::Duration;
use anyhow::bail;

/// Configuration of an RTPS/UDP link. It is read-only after construction and shared between
///  the link's tasks.
#[derive(Clone, Debug)]
pub struct RtpsUdpConfig {
    /// The initial interval for sending HEARTBEATs to readers that are not known to have all
    ///  data. While there is no progress, the interval grows along the Fibonacci sequence up to
    ///  `max_heartbeat_period`; any progress resets it.
    pub heartbeat_period: Duration,
    pub max_heartbeat_period: Duration,

    /// The time a reader waits after a HEARTBEAT before sending its ACKNACK, which allows
    ///  several HEARTBEATs (e.g. from different writers of a participant) to be answered in a
    ///  single datagram
    pub heartbeat_response_delay: Duration,

    /// The time a writer waits after a (non-final) ACKNACK before resending. Nacks from several
    ///  readers that arrive in this window are answered together.
    pub nack_response_delay: Duration,

    /// This is the maximum size of an RTPS message, i.e. the UDP payload. It should not exceed
    ///  the path MTU to avoid IP fragmentation - with full Ethernet frames and no optional IP
    ///  headers, this is `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    ///
    /// Larger samples are sent as DATA_FRAG sub-messages, one fragment per sub-message.
    pub max_message_size: usize,

    /// The payload size of a single DATA_FRAG fragment. This should be a multiple of 4 to avoid
    ///  padding between fragments.
    pub fragment_size: usize,

    /// The number of samples a writer retains for resending. Older samples are answered with
    ///  GAPs when they are requested.
    pub retained_sample_depth: usize,

    pub receive_buffer_count: usize,
    pub receive_buffer_size: usize,
    /// A receive buffer with less free space than this is not used for further reads, but
    ///  replaced by a fresh buffer once it is fully consumed
    pub receive_buffer_low_water: usize,

    /// Partially received fragmented samples are discarded after this time
    pub fragment_reassembly_timeout: Duration,

    /// The maximum time a flush of the send queue waits for concurrently running transactions
    ///  to finish before sending what is there
    pub send_queue_drain_timeout: Duration,
}

impl Default for RtpsUdpConfig {
    fn default() -> Self {
        Self::default_ipv4()
    }
}

impl RtpsUdpConfig {
    /// ipv4 with end-to-end full Ethernet MTU - without optional headers
    pub fn default_ipv4() -> RtpsUdpConfig {
        RtpsUdpConfig {
            heartbeat_period: Duration::from_secs(1),
            max_heartbeat_period: Duration::from_secs(30),
            heartbeat_response_delay: Duration::from_millis(500),
            nack_response_delay: Duration::from_millis(200),
            max_message_size: 1472,
            fragment_size: 1344,
            retained_sample_depth: 64,
            receive_buffer_count: 16,
            receive_buffer_size: 65536,
            receive_buffer_low_water: 4096,
            fragment_reassembly_timeout: Duration::from_secs(300),
            send_queue_drain_timeout: Duration::from_millis(100),
        }
    }

    /// RTPS header + INFO_DST + DATA_FRAG header
    const DATA_FRAG_OVERHEAD: usize = 20 + 16 + 36;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size > 65507 {
            bail!("max message size {} exceeds the maximum UDP payload", self.max_message_size);
        }
        if self.fragment_size == 0 || self.fragment_size > u16::MAX as usize {
            bail!("fragment size must be between 1 and {}", u16::MAX);
        }
        if self.fragment_size + Self::DATA_FRAG_OVERHEAD > self.max_message_size {
            bail!("fragment size {} does not fit into max message size {}", self.fragment_size, self.max_message_size);
        }
        if self.retained_sample_depth == 0 {
            bail!("retained sample depth must be at least 1");
        }
        if self.receive_buffer_count < 2 {
            bail!("at least two receive buffers are required");
        }
        if self.receive_buffer_low_water >= self.receive_buffer_size {
            bail!("receive buffer low water mark must be smaller than the buffer size");
        }
        if self.receive_buffer_size < self.max_message_size {
            bail!("receive buffer size {} is smaller than max message size {}", self.receive_buffer_size, self.max_message_size);
        }
        if self.heartbeat_period.is_zero() {
            bail!("heartbeat period must be positive");
        }
        if self.max_heartbeat_period < self.heartbeat_period {
            bail!("max heartbeat period must not be smaller than the heartbeat period");
        }
        Ok(())
    }
}
