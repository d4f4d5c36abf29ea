//! The congestion control ops the host drives for each connection.

use tracing::info;

use crate::config::Config;
use crate::engine::DecisionEngine;
use crate::policy::PolicySource;
use crate::state::FlowStats;
use crate::{AckSample, CongestionEvent, CongestionOps, TickSample};

/// Per-connection statistics plus the engine that bounds policy proposals.
#[derive(Debug)]
pub struct HeuristicFlow<P> {
    stats: FlowStats,
    engine: DecisionEngine<P>,
    last_cwnd: Option<u32>,
}

impl<P: PolicySource> HeuristicFlow<P> {
    pub fn new(config: &Config, policy: P) -> Self {
        Self {
            stats: FlowStats::new(config),
            engine: DecisionEngine::new(policy, config),
            last_cwnd: None,
        }
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn engine(&self) -> &DecisionEngine<P> {
        &self.engine
    }

    /// cwnd emitted on the most recent tick.
    pub fn last_cwnd(&self) -> Option<u32> {
        self.last_cwnd
    }
}

impl<P: PolicySource> CongestionOps for HeuristicFlow<P> {
    type Policy = P;

    fn on_create(config: &Config, policy: P) -> Self {
        Self::new(config, policy)
    }

    fn on_destroy(self) {
        let stats = &self.stats;
        info!(
            windows_opened = stats.history().total_opened(),
            min_rtt_us = ?stats.global_min_rtt_us(),
            max_rtt_us = stats.global_max_rtt_us(),
            min_bw_bps = ?stats.global_min_bw_bps(),
            max_bw_bps = stats.global_max_bw_bps(),
            max_cwnd = stats.global_max_cwnd_seen(),
            "flow summary"
        );
    }

    fn on_ack(&mut self, sample: &AckSample) {
        self.stats.on_ack(sample);
    }

    fn on_congestion_event(&mut self, now: u64, event: CongestionEvent) {
        self.stats.on_congestion_event(now, event);
    }

    fn on_tick(&mut self, tick: &TickSample) -> u32 {
        self.stats.on_cong_control_tick(tick);
        let next = self.engine.decide(&mut self.stats, tick.cwnd, tick.cwnd_clamp);
        self.last_cwnd = Some(next);
        next
    }
}
