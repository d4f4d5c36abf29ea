//! Per-flow tuning knobs.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::{MIN_CWND, MIN_QWINDOW_DURATION_NS, NUMBER_OF_QWINDOWS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// qwindows retained per flow
    pub history_capacity: usize,
    /// Floor for the rotation threshold
    pub min_window_duration: Duration,
    /// Fallback and lower clamp for the emitted cwnd, in segments (at least 2)
    pub min_cwnd: u32,
    /// Slot the policy source is read from
    pub policy_key: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_capacity: NUMBER_OF_QWINDOWS,
            min_window_duration: Duration::from_nanos(MIN_QWINDOW_DURATION_NS),
            min_cwnd: MIN_CWND,
            policy_key: 0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            bail!("history capacity must hold at least one qwindow");
        }
        if self.min_window_duration.is_zero() {
            bail!("minimum qwindow duration must be non-zero");
        }
        if u64::try_from(self.min_window_duration.as_nanos()).is_err() {
            bail!(
                "minimum qwindow duration {:?} does not fit in nanoseconds",
                self.min_window_duration
            );
        }
        if self.min_cwnd < MIN_CWND {
            bail!(
                "minimum cwnd {} is below the {} segment floor",
                self.min_cwnd,
                MIN_CWND
            );
        }
        Ok(())
    }

    pub(crate) fn min_window_ns(&self) -> u64 {
        u64::try_from(self.min_window_duration.as_nanos()).unwrap_or(u64::MAX)
    }
}
