//! Turns an externally proposed cwnd into the value handed to the host.

use tracing::debug;

use crate::config::Config;
use crate::policy::PolicySource;
use crate::state::FlowStats;
use crate::MIN_CWND;

/// Bound a proposal to `[min_cwnd, max_cwnd]`.
///
/// An unavailable proposal falls back to `min_cwnd`. A ceiling below the
/// floor is raised to the floor.
pub fn clamp_cwnd(proposed: Option<u32>, min_cwnd: u32, max_cwnd: u32) -> u32 {
    let ceiling = max_cwnd.max(min_cwnd);
    match proposed {
        Some(cwnd) => cwnd.clamp(min_cwnd, ceiling),
        None => min_cwnd,
    }
}

/// Next cwnd for a flow given the policy's proposal.
///
/// Records the result in the flow's lifetime maximum.
pub fn compute_cwnd(
    state: &mut FlowStats,
    proposed: Option<u32>,
    previous_cwnd: u32,
    max_cwnd: u32,
) -> u32 {
    bound_and_record(state, proposed, previous_cwnd, MIN_CWND, max_cwnd)
}

fn bound_and_record(
    state: &mut FlowStats,
    proposed: Option<u32>,
    previous_cwnd: u32,
    min_cwnd: u32,
    max_cwnd: u32,
) -> u32 {
    let next = clamp_cwnd(proposed, min_cwnd, max_cwnd);
    state.record_cwnd(next);
    if next != previous_cwnd {
        debug!(previous_cwnd, next, ?proposed, "cwnd decision");
    }
    next
}

/// Reads proposals from an injected policy source and bounds them.
#[derive(Debug)]
pub struct DecisionEngine<P> {
    policy: P,
    key: u32,
    min_cwnd: u32,
}

impl<P: PolicySource> DecisionEngine<P> {
    pub fn new(policy: P, config: &Config) -> Self {
        Self {
            policy,
            key: config.policy_key,
            min_cwnd: config.min_cwnd.max(MIN_CWND),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// One non-blocking read of the policy slot.
    pub fn proposed_cwnd(&self) -> Option<u32> {
        self.policy.get(self.key)
    }

    /// Show the policy the flow, read its proposal and bound it.
    pub fn decide(&self, state: &mut FlowStats, previous_cwnd: u32, max_cwnd: u32) -> u32 {
        self.policy.observe(self.key, state, previous_cwnd);
        let proposed = self.proposed_cwnd();
        if proposed.is_none() {
            debug!(key = self.key, fallback = self.min_cwnd, "policy lookup unavailable");
        }
        bound_and_record(state, proposed, previous_cwnd, self.min_cwnd, max_cwnd)
    }
}
