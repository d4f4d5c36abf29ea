use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};

use qwindow_cc::datapath::{LinkModel, SimDatapath};
use qwindow_cc::runner::FlowRunner;
use qwindow_cc::{Config, CwndMap, CwndStore};

#[derive(Parser)]
#[command(name = "qwindow-cc")]
#[command(about = "Windowed flow statistics and cwnd decisions over a simulated link")]
struct Args {
    /// Concurrent flows sharing the bottleneck
    #[arg(long, default_value = "1")]
    flows: u16,

    #[arg(long, default_value = "2000")]
    duration_ms: u64,

    /// Propagation round-trip time
    #[arg(long, default_value = "20")]
    rtt_ms: u64,

    #[arg(long, default_value = "12")]
    bandwidth_mbps: u64,

    #[arg(long, default_value = "1448")]
    mss: u32,

    #[arg(long, default_value = "10")]
    init_cwnd_pkts: u32,

    #[arg(long, default_value = "10000")]
    cwnd_clamp: u32,

    /// Report a loss on every n-th ACK
    #[arg(long)]
    loss_every: Option<u32>,

    /// Mark every n-th ACK with ECN CE
    #[arg(long)]
    ecn_every: Option<u32>,

    /// Publish this cwnd into the policy slot; without it the slot stays
    /// unregistered and flows fall back to the minimum cwnd
    #[arg(long)]
    policy_cwnd: Option<u32>,

    #[arg(long, default_value = "10")]
    history_capacity: usize,

    #[arg(long, default_value = "1000")]
    min_window_us: u64,

    #[arg(long, default_value = "2")]
    min_cwnd: u32,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = Config {
        history_capacity: args.history_capacity,
        min_window_duration: Duration::from_micros(args.min_window_us),
        min_cwnd: args.min_cwnd,
        ..Config::default()
    };
    config.validate().context("invalid flow configuration")?;

    info!("Starting qwindow congestion control");
    info!("  history: {} qwindows", config.history_capacity);
    info!("  min qwindow: {:?}", config.min_window_duration);
    info!("  link: {} Mbit/s, {} ms rtt, {} flows", args.bandwidth_mbps, args.rtt_ms, args.flows);

    let store = Arc::new(CwndStore::new());
    if let Some(cwnd) = args.policy_cwnd {
        let map = Arc::new(CwndMap::default());
        map.set(config.policy_key, cwnd)?;
        store.register(map);
        info!("Policy slot publishes cwnd={} segments", cwnd);
    }

    let mut runner = FlowRunner::new(config, store.clone())?;
    let mut datapath = SimDatapath::new(LinkModel {
        flows: args.flows,
        duration: Duration::from_millis(args.duration_ms),
        rtt: Duration::from_millis(args.rtt_ms),
        bandwidth_bps: args.bandwidth_mbps.saturating_mul(1_000_000),
        mss: args.mss,
        init_cwnd: args.init_cwnd_pkts,
        cwnd_clamp: args.cwnd_clamp,
        loss_every: args.loss_every,
        ecn_every: args.ecn_every,
    })?;

    info!("Entering event loop...");
    let mut updates = 0u64;

    loop {
        let events = datapath.poll();
        if events.is_empty() {
            break;
        }

        for event in events {
            let flow_id = event.flow_id();
            match runner.handle_event(event) {
                Ok(Some(update)) => {
                    updates += 1;
                    debug!("Flow {:016x}: cwnd -> {}", update.flow_id, update.cwnd);
                    if let Err(e) = datapath.update_cwnd(update.flow_id, update.cwnd) {
                        error!("Failed to update cwnd for flow {:016x}: {}", update.flow_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Failed to handle event for flow {:016x}: {}", flow_id, e),
            }
        }
    }

    runner.cleanup();
    store.unregister();
    info!(updates, "Simulation finished");
    Ok(())
}
