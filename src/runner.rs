//! Routes datapath events to per-flow state.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::datapath::DatapathEvent;
use crate::flow::HeuristicFlow;
use crate::policy::PolicySource;
use crate::CongestionOps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwndUpdate {
    pub flow_id: u64,
    pub cwnd: u32,
}

/// Owns one `HeuristicFlow` per live connection.
///
/// Every flow gets its own clone of the policy handle.
pub struct FlowRunner<P> {
    config: Config,
    policy: P,
    flows: HashMap<u64, HeuristicFlow<P>>,
}

impl<P: PolicySource + Clone> FlowRunner<P> {
    pub fn new(config: Config, policy: P) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            policy,
            flows: HashMap::new(),
        })
    }

    pub fn flow(&self, flow_id: u64) -> Option<&HeuristicFlow<P>> {
        self.flows.get(&flow_id)
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Feed one event; ticks that change a flow's cwnd yield an update.
    pub fn handle_event(&mut self, event: DatapathEvent) -> Result<Option<CwndUpdate>> {
        match event {
            DatapathEvent::FlowCreated { flow_id, init_cwnd } => {
                info!("Flow created: {:016x}, init_cwnd={} segments", flow_id, init_cwnd);
                let flow = HeuristicFlow::on_create(&self.config, self.policy.clone());
                if let Some(stale) = self.flows.insert(flow_id, flow) {
                    warn!("Flow {:016x} created twice, dropping old state", flow_id);
                    stale.on_destroy();
                }
                Ok(None)
            }

            DatapathEvent::FlowClosed { flow_id } => {
                info!("Flow closed: {:016x}", flow_id);
                match self.flows.remove(&flow_id) {
                    Some(flow) => flow.on_destroy(),
                    None => warn!("Close for unknown flow: {:016x}", flow_id),
                }
                Ok(None)
            }

            DatapathEvent::Ack { flow_id, sample } => {
                self.flow_mut(flow_id)?.on_ack(&sample);
                Ok(None)
            }

            DatapathEvent::Congestion {
                flow_id,
                now,
                event,
            } => {
                debug!("Flow {:016x}: {:?} at {}ns", flow_id, event, now);
                self.flow_mut(flow_id)?.on_congestion_event(now, event);
                Ok(None)
            }

            DatapathEvent::Tick { flow_id, sample } => {
                let cwnd = self.flow_mut(flow_id)?.on_tick(&sample);
                // Only send update if cwnd actually changed
                if cwnd != sample.cwnd {
                    Ok(Some(CwndUpdate { flow_id, cwnd }))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Destroy every remaining flow.
    pub fn cleanup(&mut self) {
        info!("Cleaning up {} active flows", self.flows.len());
        for (_, flow) in self.flows.drain() {
            flow.on_destroy();
        }
    }

    fn flow_mut(&mut self, flow_id: u64) -> Result<&mut HeuristicFlow<P>> {
        self.flows
            .get_mut(&flow_id)
            .ok_or_else(|| anyhow!("Unknown flow {:016x}", flow_id))
    }
}
