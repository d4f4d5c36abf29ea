//! Per-flow windowed TCP statistics and congestion window decisions.
//!
//! Each flow rolls ACK, loss and ECN signals into a fixed ring of time
//! windows ("qwindows"), keeps lifetime extrema, and on every congestion
//! control tick bounds a cwnd proposed by an external policy source.

pub mod config;
pub mod datapath;
pub mod engine;
pub mod flow;
pub mod history;
pub mod policy;
pub mod qwindow;
pub mod runner;
pub mod state;

pub use config::Config;
pub use engine::DecisionEngine;
pub use flow::HeuristicFlow;
pub use history::FlowHistory;
pub use policy::{CwndMap, CwndStore, PolicySource};
pub use qwindow::QWindowSample;
pub use state::FlowStats;

/// Number of qwindows retained per flow.
pub const NUMBER_OF_QWINDOWS: usize = 10;

/// Shortest qwindow, in nanoseconds.
pub const MIN_QWINDOW_DURATION_NS: u64 = 1_000_000;

/// Smallest cwnd ever handed back to the host, in segments.
pub const MIN_CWND: u32 = 2;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_USEC: u64 = 1_000;

/// Connection 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
}

impl FlowKey {
    /// Stable id for dispatch tables.
    pub fn id(&self) -> u64 {
        let addrs = (u64::from(self.saddr) << 32) | u64::from(self.daddr);
        let ports = (u64::from(self.sport) << 16) | u64::from(self.dport);
        addrs ^ ports.rotate_left(17)
    }
}

/// One ACK as reported by the host stack
#[derive(Debug, Clone, Copy)]
pub struct AckSample {
    /// Nanoseconds since flow start
    pub now: u64,
    /// Round-trip time in microseconds, negative when the host had no sample
    pub rtt_us: i64,
    /// Packets newly acknowledged by this ACK
    pub packets_acked: u32,
    /// Cumulative bytes acknowledged on the connection
    pub bytes_acked_total: u64,
    /// Cumulative bytes sent on the connection
    pub bytes_sent_total: u64,
}

/// Congestion signal kinds delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionEvent {
    Loss,
    /// ECN congestion experienced
    EcnCe,
    /// ECN capable, no congestion mark
    EcnNoCe,
    /// Host event this core does not track
    Other(u8),
}

/// TCP congestion state of the connection when a tick fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaState {
    #[default]
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

/// Host rate sample accompanying a congestion control tick
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSample {
    /// Packets delivered over the interval
    pub delivered: i32,
    pub interval_us: i64,
    /// RTT of the last (S)ACKed packet, -1 if none
    pub rtt_us: i64,
    pub losses: i32,
    pub acked_sacked: u32,
    pub prior_in_flight: u32,
    pub is_app_limited: bool,
}

/// Periodic congestion control tick
#[derive(Debug, Clone, Copy)]
pub struct TickSample {
    pub now: u64,
    pub rate: RateSample,
    pub ca_state: CaState,
    /// Current cwnd in segments
    pub cwnd: u32,
    /// Connection's configured cwnd ceiling in segments
    pub cwnd_clamp: u32,
}

/// Lifecycle hooks the host drives for every connection.
///
/// The host serializes calls per flow; implementations hold no locks.
pub trait CongestionOps: Sized {
    /// Where proposed cwnd values come from.
    type Policy;

    /// Build state when a connection is established.
    fn on_create(config: &Config, policy: Self::Policy) -> Self;

    /// Tear down state when the connection closes.
    fn on_destroy(self) {}

    fn on_ack(&mut self, sample: &AckSample);

    fn on_congestion_event(&mut self, now: u64, event: CongestionEvent);

    /// Returns the cwnd the host should apply.
    fn on_tick(&mut self, tick: &TickSample) -> u32;
}
