//! Per-flow statistics and the event ingestion entry points.
//!
//! `FlowStats` owns the qwindow history plus lifetime extrema. The host
//! feeds it ACKs, congestion events and control ticks; every entry point
//! first makes sure the current qwindow is still open, rotating it when
//! it has lasted `max(min_window_duration, global_min_rtt)`.
//!
//! None of the entry points allocate or block.

use tracing::trace;

use crate::config::Config;
use crate::history::FlowHistory;
use crate::qwindow::QWindowSample;
use crate::{AckSample, CaState, CongestionEvent, RateSample, TickSample, NSEC_PER_USEC};

#[derive(Debug, Clone)]
pub struct FlowStats {
    history: FlowHistory,
    min_window_ns: u64,

    bytes_acked_at_window_start: u64,
    last_bytes_acked_total: u64,

    last_ack_time_ns: u64,
    inflight_bytes: u64,

    global_min_rtt_us: Option<u32>,
    global_max_rtt_us: u32,
    global_min_bw_bps: Option<u64>,
    global_max_bw_bps: u64,
    global_max_cwnd_seen: u32,

    last_rate_sample: RateSample,
    last_ca_state: CaState,
}

impl FlowStats {
    pub fn new(config: &Config) -> Self {
        let mut history = FlowHistory::new(config.history_capacity.max(1));
        history.reset();
        Self {
            history,
            min_window_ns: config.min_window_ns(),
            bytes_acked_at_window_start: 0,
            last_bytes_acked_total: 0,
            last_ack_time_ns: 0,
            inflight_bytes: 0,
            global_min_rtt_us: None,
            global_max_rtt_us: 0,
            global_min_bw_bps: None,
            global_max_bw_bps: 0,
            global_max_cwnd_seen: 0,
            last_rate_sample: RateSample::default(),
            last_ca_state: CaState::Open,
        }
    }

    pub fn history(&self) -> &FlowHistory {
        &self.history
    }

    /// Most recent qwindow, if tracking has started.
    pub fn current(&self) -> Option<&QWindowSample> {
        self.history.at_age(0)
    }

    /// No event has arrived yet.
    pub fn is_uninitialized(&self) -> bool {
        self.history.is_empty()
    }

    pub fn bytes_acked_at_window_start(&self) -> u64 {
        self.bytes_acked_at_window_start
    }

    pub fn last_ack_time_ns(&self) -> u64 {
        self.last_ack_time_ns
    }

    pub fn inflight_bytes(&self) -> u64 {
        self.inflight_bytes
    }

    pub fn global_min_rtt_us(&self) -> Option<u32> {
        self.global_min_rtt_us
    }

    pub fn global_max_rtt_us(&self) -> u32 {
        self.global_max_rtt_us
    }

    pub fn global_min_bw_bps(&self) -> Option<u64> {
        self.global_min_bw_bps
    }

    pub fn global_max_bw_bps(&self) -> u64 {
        self.global_max_bw_bps
    }

    pub fn global_max_cwnd_seen(&self) -> u32 {
        self.global_max_cwnd_seen
    }

    pub fn last_rate_sample(&self) -> &RateSample {
        &self.last_rate_sample
    }

    pub fn last_ca_state(&self) -> CaState {
        self.last_ca_state
    }

    /// Age a qwindow must reach before it is closed. Never zero.
    pub fn rotation_threshold_ns(&self) -> u64 {
        let floor = self.min_window_ns.max(1);
        match self.global_min_rtt_us {
            Some(rtt_us) => floor.max(u64::from(rtt_us).saturating_mul(NSEC_PER_USEC)),
            None => floor,
        }
    }

    pub fn on_ack(&mut self, sample: &AckSample) {
        let now = sample.now;
        self.last_ack_time_ns = now;
        self.inflight_bytes = sample
            .bytes_sent_total
            .saturating_sub(sample.bytes_acked_total);
        self.last_bytes_acked_total = sample.bytes_acked_total;

        self.ensure_window(now, sample.bytes_acked_total);

        let base = self.bytes_acked_at_window_start;
        let Some(window) = self.history.current() else {
            return;
        };
        window.end_time_ns = window.end_time_ns.max(now);
        window.packets_delivered = window.packets_delivered.saturating_add(sample.packets_acked);
        window.bytes_acked = sample.bytes_acked_total.saturating_sub(base);
        window.update_live_bandwidth(now);

        // negative means the host had no RTT for this ACK
        if sample.rtt_us <= 0 {
            return;
        }
        let rtt_us = u32::try_from(sample.rtt_us).unwrap_or(u32::MAX);
        window.record_rtt(rtt_us);
        self.global_min_rtt_us = Some(
            self.global_min_rtt_us
                .map_or(rtt_us, |min| min.min(rtt_us)),
        );
        self.global_max_rtt_us = self.global_max_rtt_us.max(rtt_us);
    }

    pub fn on_congestion_event(&mut self, now: u64, event: CongestionEvent) {
        self.ensure_window(now, self.last_bytes_acked_total);

        let Some(window) = self.history.current() else {
            return;
        };
        window.end_time_ns = window.end_time_ns.max(now);
        match event {
            CongestionEvent::Loss => window.loss_count = window.loss_count.saturating_add(1),
            CongestionEvent::EcnCe => {
                window.ecn_count = window.ecn_count.saturating_add(1);
                window.ecn_enabled = true;
            }
            CongestionEvent::EcnNoCe => window.ecn_enabled = true,
            CongestionEvent::Other(_) => {}
        }
    }

    /// Keep the history current on a control tick. Does not decide cwnd.
    pub fn on_cong_control_tick(&mut self, tick: &TickSample) {
        self.ensure_window(tick.now, self.last_bytes_acked_total);

        if let Some(window) = self.history.current() {
            window.end_time_ns = window.end_time_ns.max(tick.now);
        }
        self.last_rate_sample = tick.rate;
        self.last_ca_state = tick.ca_state;
    }

    pub(crate) fn record_cwnd(&mut self, cwnd: u32) {
        self.global_max_cwnd_seen = self.global_max_cwnd_seen.max(cwnd);
    }

    /// Open the first qwindow, or close the current one once it is old enough.
    ///
    /// A window opened at `now` has zero age at `now`, and the threshold is
    /// at least 1 ns even for an unvalidated config, so repeated calls with
    /// one timestamp rotate at most once.
    fn ensure_window(&mut self, now: u64, bytes_acked_total: u64) {
        let threshold = self.rotation_threshold_ns();

        let Some(window) = self.history.current() else {
            // baseline stays at the flow-start snapshot
            self.history.append_new_window(now);
            trace!(now, "opened first qwindow");
            return;
        };

        let elapsed = now.saturating_sub(window.start_time_ns);
        if elapsed < threshold {
            return;
        }

        let bandwidth_bps = window.finalize(now);
        let closed_bytes = window.bytes_acked;
        self.global_max_bw_bps = self.global_max_bw_bps.max(bandwidth_bps);
        self.global_min_bw_bps = Some(
            self.global_min_bw_bps
                .map_or(bandwidth_bps, |min| min.min(bandwidth_bps)),
        );

        self.history.append_new_window(now);
        self.bytes_acked_at_window_start = bytes_acked_total;
        trace!(
            now,
            elapsed,
            threshold,
            bandwidth_bps,
            bytes = closed_bytes,
            "rotated qwindow"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, Rng, SeedableRng};
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    fn ack(now: u64, rtt_us: i64, acked: u64) -> AckSample {
        AckSample {
            now,
            rtt_us,
            packets_acked: 1,
            bytes_acked_total: acked,
            bytes_sent_total: acked + 10_000,
        }
    }

    fn tick(now: u64) -> TickSample {
        TickSample {
            now,
            rate: RateSample::default(),
            ca_state: CaState::Open,
            cwnd: 10,
            cwnd_clamp: 1_000,
        }
    }

    #[test]
    fn starts_uninitialized_with_sentinels() {
        let st = FlowStats::new(&Config::default());
        assert!(st.is_uninitialized());
        assert_eq!(st.global_min_rtt_us(), None);
        assert_eq!(st.global_min_bw_bps(), None);
        assert_eq!(st.global_max_rtt_us(), 0);
        assert_eq!(st.global_max_cwnd_seen(), 0);
        assert_eq!(st.rotation_threshold_ns(), MS);
    }

    #[test]
    fn first_event_starts_tracking() {
        let mut st = FlowStats::new(&Config::default());
        st.on_cong_control_tick(&tick(3 * MS));
        assert!(!st.is_uninitialized());
        assert_eq!(st.current().map(|w| w.start_time_ns), Some(3 * MS));
    }

    #[test]
    fn ack_updates_scalars_and_window() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, 2_000, 1_448));
        st.on_ack(&ack(MS / 2, 4_000, 2_896));

        assert_eq!(st.last_ack_time_ns(), MS / 2);
        assert_eq!(st.inflight_bytes(), 10_000);
        let w = st.current().unwrap();
        assert_eq!(w.packets_delivered, 2);
        assert_eq!(w.bytes_acked, 2_896);
        assert_eq!(w.avg_rtt_us, 3_000);
        // 2896 bytes in 0.5 ms
        assert_eq!(w.bandwidth_bps, 2_896 * 8 * 2_000);
        assert_eq!(st.global_min_rtt_us(), Some(2_000));
        assert_eq!(st.global_max_rtt_us(), 4_000);
    }

    #[test]
    fn invalid_rtt_only_skips_rtt_aggregation() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, -1, 5_000));

        let w = st.current().unwrap();
        assert_eq!(w.packets_delivered, 1);
        assert_eq!(w.bytes_acked, 5_000);
        assert_eq!(w.rtt_samples(), 0);
        assert_eq!((w.min_rtt_us, w.avg_rtt_us, w.max_rtt_us), (0, 0, 0));
        assert_eq!(st.global_min_rtt_us(), None);
        assert_eq!(st.global_max_rtt_us(), 0);
    }

    #[test]
    fn window_never_closes_before_threshold() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, 5_000, 0));
        assert_eq!(st.rotation_threshold_ns(), 5 * MS);

        st.on_ack(&ack(5 * MS - 1, 5_000, 1_000));
        assert_eq!(st.history().len(), 1);

        st.on_ack(&ack(5 * MS, 5_000, 2_000));
        assert_eq!(st.history().len(), 2);
        let closed = st.history().at_age(1).unwrap();
        assert_eq!(closed.duration_ns(), 5 * MS);
        // 1000 bytes in 5 ms
        assert_eq!(closed.bandwidth_bps, 1_600_000);
        assert_eq!(st.global_max_bw_bps(), 1_600_000);
        assert_eq!(st.global_min_bw_bps(), Some(1_600_000));
        assert_eq!(st.bytes_acked_at_window_start(), 2_000);
        assert_eq!(st.current().unwrap().bytes_acked, 0);
    }

    #[test]
    fn min_window_duration_floors_small_rtts() {
        let config = Config {
            min_window_duration: Duration::from_millis(4),
            ..Config::default()
        };
        let mut st = FlowStats::new(&config);
        st.on_ack(&ack(0, 100, 0));
        assert_eq!(st.rotation_threshold_ns(), 4 * MS);
        st.on_ack(&ack(3 * MS, 100, 10));
        assert_eq!(st.history().len(), 1);
        st.on_ack(&ack(4 * MS, 100, 20));
        assert_eq!(st.history().len(), 2);
    }

    #[test]
    fn same_timestamp_rotates_at_most_once() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, 1_000, 0));
        let at = 7 * MS;
        st.on_ack(&ack(at, 1_000, 100));
        st.on_congestion_event(at, CongestionEvent::Loss);
        st.on_cong_control_tick(&tick(at));
        assert_eq!(st.history().total_opened(), 2);
        assert_eq!(st.current().unwrap().loss_count, 1);
    }

    #[test]
    fn zero_window_floor_still_rotates_once_per_timestamp() {
        let config = Config {
            min_window_duration: Duration::ZERO,
            ..Config::default()
        };
        let mut st = FlowStats::new(&config);
        assert_eq!(st.rotation_threshold_ns(), 1);
        for _ in 0..3 {
            st.on_congestion_event(5, CongestionEvent::Loss);
        }
        assert_eq!(st.history().total_opened(), 1);
        assert_eq!(st.current().unwrap().loss_count, 3);

        st.on_congestion_event(6, CongestionEvent::Loss);
        st.on_congestion_event(6, CongestionEvent::Loss);
        assert_eq!(st.history().total_opened(), 2);
        assert_eq!(st.current().unwrap().loss_count, 2);
    }

    #[test]
    fn empty_history_capacity_keeps_one_window() {
        let config = Config {
            history_capacity: 0,
            ..Config::default()
        };
        let mut st = FlowStats::new(&config);
        st.on_ack(&ack(0, 1_000, 100));
        st.on_ack(&ack(2 * MS, 1_000, 200));
        assert_eq!(st.history().capacity(), 1);
        assert_eq!(st.history().len(), 1);
        assert_eq!(st.history().total_opened(), 2);
    }

    #[test]
    fn huge_rtt_still_counts_as_a_minimum() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, i64::from(u32::MAX) + 5, 100));
        assert_eq!(st.global_min_rtt_us(), Some(u32::MAX));
        assert_eq!(st.global_max_rtt_us(), u32::MAX);
        assert_eq!(st.current().unwrap().rtt_samples(), 1);

        st.on_ack(&ack(1, 3_000, 200));
        assert_eq!(st.global_min_rtt_us(), Some(3_000));
    }

    #[test]
    fn loss_and_ecn_share_a_window() {
        let mut st = FlowStats::new(&Config::default());
        st.on_congestion_event(0, CongestionEvent::Loss);
        st.on_congestion_event(MS / 4, CongestionEvent::EcnCe);
        st.on_congestion_event(MS / 2, CongestionEvent::Other(7));

        let w = st.current().unwrap();
        assert_eq!(w.loss_count, 1);
        assert_eq!(w.ecn_count, 1);
        assert!(w.ecn_enabled);
        assert_eq!(w.end_time_ns, MS / 2);
    }

    #[test]
    fn ecn_no_ce_only_marks_capability() {
        let mut st = FlowStats::new(&Config::default());
        st.on_congestion_event(0, CongestionEvent::EcnNoCe);
        let w = st.current().unwrap();
        assert!(w.ecn_enabled);
        assert_eq!(w.ecn_count, 0);
    }

    #[test]
    fn rotation_from_events_uses_last_seen_byte_counter() {
        let mut st = FlowStats::new(&Config::default());
        st.on_ack(&ack(0, 500, 3_000));
        st.on_congestion_event(2 * MS, CongestionEvent::Loss);
        assert_eq!(st.history().len(), 2);
        assert_eq!(st.bytes_acked_at_window_start(), 3_000);

        st.on_ack(&ack(2 * MS + 1, 500, 4_000));
        assert_eq!(st.current().unwrap().bytes_acked, 1_000);
    }

    #[test]
    fn tick_records_host_inputs() {
        let mut st = FlowStats::new(&Config::default());
        let mut t = tick(MS);
        t.ca_state = CaState::Recovery;
        t.rate.losses = 3;
        st.on_cong_control_tick(&t);
        assert_eq!(st.last_ca_state(), CaState::Recovery);
        assert_eq!(st.last_rate_sample().losses, 3);
    }

    #[test]
    fn extrema_only_tighten() {
        let mut st = FlowStats::new(&Config::default());
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut now = 0;
        let mut acked = 0;
        let mut prev = (u32::MAX, 0u32, u64::MAX, 0u64);

        for _ in 0..2_000 {
            now += rng.gen_range(0..3 * MS);
            acked += rng.gen_range(0..20_000u64);
            // a few samples land at or below zero
            let rtt = rng.gen_range(-1_000..49_000i64);
            st.on_ack(&ack(now, rtt, acked));

            let cur = (
                st.global_min_rtt_us().unwrap_or(u32::MAX),
                st.global_max_rtt_us(),
                st.global_min_bw_bps().unwrap_or(u64::MAX),
                st.global_max_bw_bps(),
            );
            assert!(cur.0 <= prev.0);
            assert!(cur.1 >= prev.1);
            assert!(cur.2 <= prev.2);
            assert!(cur.3 >= prev.3);
            prev = cur;

            for w in st.history().iter() {
                if w.rtt_samples() > 0 {
                    assert!(w.min_rtt_us <= w.avg_rtt_us && w.avg_rtt_us <= w.max_rtt_us);
                }
                assert!(w.end_time_ns >= w.start_time_ns);
            }
        }
        assert!(st.history().total_opened() > 10);
    }
}
