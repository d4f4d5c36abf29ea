//! A single qwindow: statistics aggregated over one bounded time interval.

use crate::NSEC_PER_SEC;

/// Delivery, RTT and congestion counters for one time window.
///
/// Timestamps are nanoseconds since flow start, RTTs are microseconds.
/// RTT fields stay zero until the first RTT sample lands in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QWindowSample {
    pub start_time_ns: u64,
    pub end_time_ns: u64,

    pub packets_delivered: u32,
    pub bytes_acked: u64,

    pub loss_count: u32,
    pub ecn_count: u32,
    pub ecn_enabled: bool,

    pub min_rtt_us: u32,
    pub avg_rtt_us: u32,
    pub max_rtt_us: u32,
    sum_rtt_us: u64,
    n_rtt: u64,

    /// Bits per second. Live estimate while open, final once closed.
    pub bandwidth_bps: u64,
}

impl QWindowSample {
    pub(crate) fn open(now: u64) -> Self {
        Self {
            start_time_ns: now,
            end_time_ns: now,
            ..Self::default()
        }
    }

    pub fn rtt_samples(&self) -> u64 {
        self.n_rtt
    }

    pub fn rtt_sum_us(&self) -> u64 {
        self.sum_rtt_us
    }

    pub fn duration_ns(&self) -> u64 {
        self.end_time_ns.saturating_sub(self.start_time_ns)
    }

    /// Fold one RTT sample into min/max/avg. Zero is not a sample.
    pub(crate) fn record_rtt(&mut self, rtt_us: u32) {
        if rtt_us == 0 {
            return;
        }
        if self.n_rtt == 0 {
            self.min_rtt_us = rtt_us;
            self.max_rtt_us = rtt_us;
        } else {
            self.min_rtt_us = self.min_rtt_us.min(rtt_us);
            self.max_rtt_us = self.max_rtt_us.max(rtt_us);
        }
        self.n_rtt += 1;
        self.sum_rtt_us += u64::from(rtt_us);
        // avg lies between min and max, so it fits in u32
        self.avg_rtt_us = (self.sum_rtt_us / self.n_rtt) as u32;
    }

    /// Refresh the in-progress bandwidth using bytes acked so far.
    ///
    /// Left untouched when no time has passed since the window opened.
    pub(crate) fn update_live_bandwidth(&mut self, now: u64) {
        if let Some(bps) = bandwidth_bps(self.bytes_acked, now.saturating_sub(self.start_time_ns)) {
            self.bandwidth_bps = bps;
        }
    }

    /// Close the window at `now` and return its final bandwidth.
    pub(crate) fn finalize(&mut self, now: u64) -> u64 {
        self.end_time_ns = now.max(self.start_time_ns);
        if let Some(bps) = bandwidth_bps(self.bytes_acked, self.duration_ns()) {
            self.bandwidth_bps = bps;
        }
        self.bandwidth_bps
    }
}

/// `bytes * 8 * 1e9 / elapsed_ns`, or `None` for an empty interval.
pub fn bandwidth_bps(bytes: u64, elapsed_ns: u64) -> Option<u64> {
    if elapsed_ns == 0 {
        return None;
    }
    let bits = u128::from(bytes) * 8 * u128::from(NSEC_PER_SEC);
    Some(u64::try_from(bits / u128::from(elapsed_ns)).unwrap_or(u64::MAX))
}
