//! Tunables for the network stack.
//!
//! Collects every timer/limit named in the component design into one value
//! type so the CLI binary can override individual fields from command-line
//! flags instead of library code reaching for environment variables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// How long an ARP request waits for a reply before retransmitting.
    pub arp_timeout: Duration,
    /// Number of ARP request retransmissions before giving up.
    pub arp_max_retry: u32,

    /// How long the TCP blocking sender waits for an ACK before retransmitting.
    pub tcp_timeout: Duration,
    /// Number of TCP retransmissions before a segment is abandoned.
    pub tcp_max_retrans: u32,

    /// Period of the SDP periodic advertisement/aging loop.
    pub route_loop_interval: Duration,
    /// Upper bound on the jitter added to `route_loop_interval`.
    pub route_loop_jitter: Duration,
    /// Number of loop intervals a learned route may go unrefreshed before
    /// it is marked `TIMEOUT`.
    pub sdp_metric_timeout: u32,

    /// Maximum Segment Lifetime; `TIMED_WAIT` lasts `2 * msl`.
    pub msl: Duration,

    /// Default `listen` backlog when the caller passes 0 (unbounded).
    pub listen_backlog_default: usize,
    /// First ephemeral port handed out by `connect`'s per-destination counter.
    pub ephemeral_port_base: u16,

    /// Minimum spacing between duplicate/out-of-window pure ACKs emitted by
    /// one socket, to avoid ACK storms against a misbehaving peer.
    pub dup_ack_min_interval: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            arp_timeout: Duration::from_secs(1),
            arp_max_retry: 3,
            tcp_timeout: Duration::from_secs(3),
            tcp_max_retrans: 2,
            route_loop_interval: Duration::from_secs(5),
            route_loop_jitter: Duration::from_secs(9),
            sdp_metric_timeout: 2,
            msl: Duration::from_secs(2),
            listen_backlog_default: 16,
            ephemeral_port_base: 2048,
            dup_ack_min_interval: Duration::from_millis(200),
        }
    }
}
