use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use qwindow_cc::datapath::{DatapathEvent, LinkModel, SimDatapath};
use qwindow_cc::runner::FlowRunner;
use qwindow_cc::{Config, CwndMap, CwndStore};

/// Drive a simulated link through the runner, returning every cwnd update.
fn run(
    link: LinkModel,
    store: Arc<CwndStore>,
    inspect: impl Fn(&FlowRunner<Arc<CwndStore>>),
) -> Vec<u32> {
    let clamp = link.cwnd_clamp;
    let mut runner = FlowRunner::new(Config::default(), store).unwrap();
    let mut datapath = SimDatapath::new(link).unwrap();
    let mut updates = Vec::new();

    loop {
        let events = datapath.poll();
        if events.is_empty() {
            break;
        }
        for event in events {
            // check state just before the flow goes away
            if matches!(event, DatapathEvent::FlowClosed { .. }) {
                inspect(&runner);
            }
            if let Some(update) = runner.handle_event(event).unwrap() {
                assert!(update.cwnd >= 2 && update.cwnd <= clamp);
                datapath.update_cwnd(update.flow_id, update.cwnd).unwrap();
                updates.push(update.cwnd);
            }
        }
    }
    assert_eq!(runner.active_flows(), 0);
    updates
}

#[rstest]
#[case::single_flow(1, None)]
#[case::shared_link(4, None)]
#[case::lossy(2, Some(25))]
fn published_cwnd_reaches_every_flow(#[case] flows: u16, #[case] loss_every: Option<u32>) {
    let store = Arc::new(CwndStore::new());
    let map = Arc::new(CwndMap::default());
    map.set(0, 24).unwrap();
    store.register(map);

    let link = LinkModel {
        flows,
        duration: Duration::from_millis(300),
        loss_every,
        ..LinkModel::default()
    };
    let updates = run(link, store, |runner| {
        assert!(runner.active_flows() > 0);
    });

    // each flow moves from its initial cwnd to the published one exactly once
    assert_eq!(updates.len(), usize::from(flows));
    assert!(updates.iter().all(|&cwnd| cwnd == 24));
}

#[test]
fn unregistered_policy_pins_flows_to_the_floor() {
    let link = LinkModel {
        flows: 2,
        duration: Duration::from_millis(300),
        ecn_every: Some(10),
        ..LinkModel::default()
    };
    let updates = run(link, Arc::new(CwndStore::new()), |_| {});
    assert_eq!(updates, vec![2, 2]);
}

#[test]
fn simulated_flows_fill_their_history() {
    let store = Arc::new(CwndStore::new());
    let map = Arc::new(CwndMap::default());
    map.set(0, 40).unwrap();
    store.register(map);

    let link = LinkModel {
        duration: Duration::from_millis(500),
        ..LinkModel::default()
    };
    let ids = SimDatapath::new(link.clone()).unwrap().flow_ids();
    run(link, store, |runner| {
        let Some(flow) = ids.iter().find_map(|id| runner.flow(*id)) else {
            return;
        };
        let stats = flow.stats();
        assert_eq!(stats.history().len(), 10);
        assert!(stats.history().total_opened() > 10);
        assert!(stats.global_min_rtt_us().unwrap() >= 20_000);
        assert!(stats.global_max_bw_bps() > 0);
        assert_eq!(stats.global_max_cwnd_seen(), 40);
    });
}
