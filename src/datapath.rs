//! Host-side events and a synthetic datapath that produces them.
//!
//! `SimDatapath` models a set of bulk flows sharing one bottleneck link
//! with a fixed propagation delay. Each flow is ACK-clocked by the smaller
//! of its fair share and its cwnd, and standing queue above the link's BDP
//! shows up as extra RTT.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::{
    AckSample, CaState, CongestionEvent, FlowKey, RateSample, TickSample, NSEC_PER_SEC,
    NSEC_PER_USEC,
};

#[derive(Debug, Clone, Copy)]
pub enum DatapathEvent {
    FlowCreated {
        flow_id: u64,
        init_cwnd: u32,
    },
    FlowClosed {
        flow_id: u64,
    },
    Ack {
        flow_id: u64,
        sample: AckSample,
    },
    Congestion {
        flow_id: u64,
        now: u64,
        event: CongestionEvent,
    },
    Tick {
        flow_id: u64,
        sample: TickSample,
    },
}

impl DatapathEvent {
    pub fn flow_id(&self) -> u64 {
        match self {
            Self::FlowCreated { flow_id, .. }
            | Self::FlowClosed { flow_id }
            | Self::Ack { flow_id, .. }
            | Self::Congestion { flow_id, .. }
            | Self::Tick { flow_id, .. } => *flow_id,
        }
    }
}

/// Bottleneck link and traffic shape for the simulation.
#[derive(Debug, Clone)]
pub struct LinkModel {
    pub flows: u16,
    pub duration: Duration,
    pub rtt: Duration,
    pub bandwidth_bps: u64,
    pub mss: u32,
    pub init_cwnd: u32,
    pub cwnd_clamp: u32,
    /// Every n-th ACK of a flow also reports a loss
    pub loss_every: Option<u32>,
    /// Every n-th ACK of a flow carries an ECN CE mark
    pub ecn_every: Option<u32>,
}

impl Default for LinkModel {
    fn default() -> Self {
        Self {
            flows: 1,
            duration: Duration::from_secs(2),
            rtt: Duration::from_millis(20),
            bandwidth_bps: 12_000_000,
            mss: 1448,
            init_cwnd: 10,
            cwnd_clamp: 10_000,
            loss_every: None,
            ecn_every: None,
        }
    }
}

struct SimFlow {
    flow_id: u64,
    cwnd: u32,
    next_ack_at: u64,
    acks: u64,
    bytes_acked: u64,
    closed: bool,
}

pub struct SimDatapath {
    link: LinkModel,
    end_ns: u64,
    rtt_ns: u64,
    share_bps: u64,
    flows: Vec<SimFlow>,
    started: bool,
}

impl SimDatapath {
    pub fn new(link: LinkModel) -> Result<Self> {
        if link.flows == 0 {
            bail!("simulation needs at least one flow");
        }
        if link.mss == 0 || link.bandwidth_bps == 0 {
            bail!("mss and bandwidth must be non-zero");
        }
        if link.init_cwnd == 0 {
            bail!("initial cwnd must be non-zero");
        }
        let rtt_ns = u64::try_from(link.rtt.as_nanos())
            .ok()
            .filter(|ns| *ns > 0)
            .with_context(|| format!("invalid rtt {:?}", link.rtt))?;
        let end_ns = u64::try_from(link.duration.as_nanos())
            .with_context(|| format!("duration {:?} too long", link.duration))?;
        let share_bps = (link.bandwidth_bps / u64::from(link.flows)).max(1);

        let flows = (0..link.flows)
            .map(|i| SimFlow {
                flow_id: FlowKey {
                    saddr: 0x0a00_0001,
                    daddr: 0x0a00_0002,
                    sport: 40_000u16.wrapping_add(i),
                    dport: 5201,
                }
                .id(),
                cwnd: link.init_cwnd,
                next_ack_at: rtt_ns,
                acks: 0,
                bytes_acked: 0,
                closed: false,
            })
            .collect();

        Ok(Self {
            end_ns,
            rtt_ns,
            share_bps,
            flows,
            started: false,
            link,
        })
    }

    pub fn flow_ids(&self) -> Vec<u64> {
        self.flows.iter().map(|f| f.flow_id).collect()
    }

    /// Next batch of events in timestamp order; empty once every flow closed.
    pub fn poll(&mut self) -> Vec<DatapathEvent> {
        if !self.started {
            self.started = true;
            return self
                .flows
                .iter()
                .map(|f| DatapathEvent::FlowCreated {
                    flow_id: f.flow_id,
                    init_cwnd: self.link.init_cwnd,
                })
                .collect();
        }

        let Some(idx) = self
            .flows
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.closed)
            .min_by_key(|(_, f)| f.next_ack_at)
            .map(|(i, _)| i)
        else {
            return Vec::new();
        };

        if self.flows[idx].next_ack_at > self.end_ns {
            // past the end of the run: close everything still open
            return self
                .flows
                .iter_mut()
                .filter(|f| !f.closed)
                .map(|f| {
                    f.closed = true;
                    DatapathEvent::FlowClosed { flow_id: f.flow_id }
                })
                .collect();
        }

        self.step(idx)
    }

    /// Apply a cwnd decision coming back from the control plane.
    pub fn update_cwnd(&mut self, flow_id: u64, cwnd: u32) -> Result<()> {
        let flow = self
            .flows
            .iter_mut()
            .find(|f| f.flow_id == flow_id)
            .with_context(|| format!("no simulated flow {:016x}", flow_id))?;
        if flow.closed {
            warn!("cwnd update for closed flow {:016x}", flow_id);
            return Ok(());
        }
        flow.cwnd = cwnd.clamp(1, self.link.cwnd_clamp);
        Ok(())
    }

    fn step(&mut self, idx: usize) -> Vec<DatapathEvent> {
        let mss = u64::from(self.link.mss);
        let bdp_bytes = mul_div(self.share_bps, self.rtt_ns, 8 * NSEC_PER_SEC);
        let loss_every = self.link.loss_every;
        let ecn_every = self.link.ecn_every;
        let cwnd_clamp = self.link.cwnd_clamp;
        let share_bps = self.share_bps;
        let base_rtt_ns = self.rtt_ns;

        let flow = &mut self.flows[idx];
        let now = flow.next_ack_at;
        flow.acks += 1;
        flow.bytes_acked += mss;

        let window_bytes = u64::from(flow.cwnd) * mss;
        let queue_ns = mul_div(
            window_bytes.saturating_sub(bdp_bytes),
            8 * NSEC_PER_SEC,
            share_bps,
        );
        let rtt_ns = base_rtt_ns + queue_ns;
        let window_bps = mul_div(window_bytes * 8, NSEC_PER_SEC, rtt_ns);
        let rate_bps = window_bps.min(share_bps).max(1);
        flow.next_ack_at = now + mul_div(mss * 8, NSEC_PER_SEC, rate_bps).max(1);

        let rtt_us = i64::try_from(rtt_ns / NSEC_PER_USEC).unwrap_or(i64::MAX);
        let lost = loss_every.is_some_and(|n| n > 0 && flow.acks % u64::from(n) == 0);
        let marked = ecn_every.is_some_and(|n| n > 0 && flow.acks % u64::from(n) == 0);

        let mut events = Vec::with_capacity(4);
        events.push(DatapathEvent::Ack {
            flow_id: flow.flow_id,
            sample: AckSample {
                now,
                rtt_us,
                packets_acked: 1,
                bytes_acked_total: flow.bytes_acked,
                bytes_sent_total: flow.bytes_acked + window_bytes,
            },
        });
        if lost {
            debug!(flow_id = flow.flow_id, now, "simulated loss");
            events.push(DatapathEvent::Congestion {
                flow_id: flow.flow_id,
                now,
                event: CongestionEvent::Loss,
            });
        }
        if marked {
            events.push(DatapathEvent::Congestion {
                flow_id: flow.flow_id,
                now,
                event: CongestionEvent::EcnCe,
            });
        } else if ecn_every.is_some() {
            events.push(DatapathEvent::Congestion {
                flow_id: flow.flow_id,
                now,
                event: CongestionEvent::EcnNoCe,
            });
        }
        events.push(DatapathEvent::Tick {
            flow_id: flow.flow_id,
            sample: TickSample {
                now,
                rate: RateSample {
                    delivered: 1,
                    interval_us: i64::try_from(rtt_ns / NSEC_PER_USEC).unwrap_or(i64::MAX),
                    rtt_us,
                    losses: i32::from(lost),
                    acked_sacked: 1,
                    prior_in_flight: flow.cwnd,
                    is_app_limited: false,
                },
                ca_state: if lost { CaState::Recovery } else { CaState::Open },
                cwnd: flow.cwnd,
                cwnd_clamp,
            },
        });
        events
    }
}

fn mul_div(a: u64, b: u64, c: u64) -> u64 {
    if c == 0 {
        return u64::MAX;
    }
    u64::try_from(u128::from(a) * u128::from(b) / u128::from(c)).unwrap_or(u64::MAX)
}
