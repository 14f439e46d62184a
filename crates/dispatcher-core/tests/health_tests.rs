use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_dispatcher_core::health::{DestinationNotification, ProbeRequest};
use rvoip_dispatcher_core::registry::{DestinationRow, StaticResolver, StaticSource};
use rvoip_dispatcher_core::types::ProbingMode;
use rvoip_dispatcher_core::{
    BroadcastEventRouter, DestinationEvent, DestinationState, Dispatcher, DispatcherConfig, DispatcherError, Prober,
    Result, StateRequest,
};

/// Answers every probe with the code configured for its target, 200 otherwise
#[derive(Default)]
struct ScriptedProber {
    codes: Mutex<HashMap<String, u16>>,
    sent: Mutex<Vec<ProbeRequest>>,
    unreachable: AtomicUsize,
}

impl ScriptedProber {
    fn answer(&self, uri: &str, code: u16) {
        self.codes.lock().insert(uri.to_string(), code);
    }

    fn sent_to(&self, uri: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.target_uri == uri).count()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn send(&self, request: ProbeRequest) -> Result<u16> {
        let code = self.codes.lock().get(&request.target_uri).copied().unwrap_or(200);
        self.sent.lock().push(request);
        if code == 0 {
            self.unreachable.fetch_add(1, Ordering::Relaxed);
            return Err(DispatcherError::Message("transport down".to_string()));
        }
        Ok(code)
    }
}

fn setup(config: DispatcherConfig, rows: Vec<DestinationRow>) -> Result<(Dispatcher, BroadcastEventRouter)> {
    let events = BroadcastEventRouter::default();
    let dispatcher = Dispatcher::with_resolver(config, Arc::new(events.clone()), Arc::new(StaticResolver::new()))?;
    dispatcher.reload(&mut StaticSource::new(rows))?;
    Ok((dispatcher, events))
}

fn state_of(dispatcher: &Dispatcher, uri: &str) -> DestinationState {
    dispatcher
        .registry()
        .snapshot()
        .lookup(1)
        .and_then(|set| set.find_by_uri(uri))
        .map(|d| d.health().state)
        .expect("destination")
}

#[tokio::test]
async fn test_failing_probes_take_destination_down_and_back() -> Result<()> {
    let config = DispatcherConfig {
        probing_threshold: 3,
        inactive_threshold: 2,
        probing_mode: ProbingMode::All,
        ..Default::default()
    };
    let (dispatcher, events) = setup(
        config,
        vec![DestinationRow::new(1, "sip:10.0.0.1"), DestinationRow::new(1, "sip:10.0.0.2")],
    )?;
    let mut notifications = events.subscribe();
    let prober = Arc::new(ScriptedProber::default());
    prober.answer("sip:10.0.0.2", 503);
    let monitor = dispatcher.health_monitor(prober.clone())?;

    assert_eq!(monitor.probe_round().await, 2);
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.2"), DestinationState::Trying);
    monitor.probe_round().await;
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.2"), DestinationState::Trying);
    monitor.probe_round().await;
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.2"), DestinationState::Inactive);
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.1"), DestinationState::Active);

    let down: DestinationNotification = notifications.recv().await.expect("down event");
    assert_eq!(down.event, DestinationEvent::Down);
    assert_eq!(down.route, "dispatcher:dst-down");
    assert_eq!(down.uri, "sip:10.0.0.2");

    prober.answer("sip:10.0.0.2", 200);
    monitor.probe_round().await;
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.2"), DestinationState::Inactive);
    monitor.probe_round().await;
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.2"), DestinationState::Active);

    let up = notifications.recv().await.expect("up event");
    assert_eq!(up.event, DestinationEvent::Up);
    assert_eq!(up.group, 1);
    Ok(())
}

#[tokio::test]
async fn test_probe_targets_follow_mode_and_flags() -> Result<()> {
    let rows = vec![
        DestinationRow::new(1, "sip:10.0.0.1"),
        DestinationRow::new(1, "sip:10.0.0.2").with_flags(8),
        DestinationRow::new(1, "sip:10.0.0.3").with_flags(4 | 8),
    ];
    let config = DispatcherConfig {
        probing_mode: ProbingMode::OnlyFlagged,
        ..Default::default()
    };
    let (dispatcher, _events) = setup(config, rows)?;
    let prober = Arc::new(ScriptedProber::default());
    let monitor = dispatcher.health_monitor(prober.clone())?;

    // only flagged, never disabled
    assert_eq!(monitor.probe_round().await, 1);
    assert_eq!(prober.sent_to("sip:10.0.0.2"), 1);
    assert_eq!(prober.sent_to("sip:10.0.0.3"), 0);

    let request = prober.sent.lock()[0].clone();
    assert_eq!(request.method, "OPTIONS");
    assert_eq!(request.from_uri, "sip:dispatcher@localhost");

    dispatcher.set_ping_active(false);
    assert_eq!(monitor.probe_round().await, 0);
    dispatcher.set_ping_active(true);
    assert_eq!(monitor.probe_round().await, 1);
    assert_eq!(prober.sent_to("sip:10.0.0.2"), 2);
    Ok(())
}

#[tokio::test]
async fn test_success_clears_probing_without_mode() -> Result<()> {
    let (dispatcher, _events) = setup(
        DispatcherConfig::default(),
        vec![DestinationRow::new(1, "sip:10.0.0.1").with_flags(8)],
    )?;
    let prober = Arc::new(ScriptedProber::default());
    let monitor = dispatcher.health_monitor(prober.clone())?;

    assert_eq!(monitor.probe_round().await, 1);
    assert_eq!(monitor.probe_round().await, 0);
    assert_eq!(dispatcher.list().sets[0].destinations[0].flags, "AX");
    Ok(())
}

#[tokio::test]
async fn test_send_failure_changes_nothing() -> Result<()> {
    let config = DispatcherConfig {
        probing_mode: ProbingMode::All,
        ..Default::default()
    };
    let (dispatcher, _events) = setup(config, vec![DestinationRow::new(1, "sip:10.0.0.1")])?;
    let prober = Arc::new(ScriptedProber::default());
    prober.answer("sip:10.0.0.1", 0);
    let monitor = dispatcher.health_monitor(prober.clone())?;

    monitor.probe_round().await;
    assert_eq!(prober.unreachable.load(Ordering::Relaxed), 1);
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.1"), DestinationState::Active);
    Ok(())
}

#[tokio::test]
async fn test_reply_codes_and_disabled_override() -> Result<()> {
    let config = DispatcherConfig {
        probing_mode: ProbingMode::All,
        ping_reply_codes: Some("code=404".to_string()),
        ping_latency_stats: true,
        ..Default::default()
    };
    let (dispatcher, _events) = setup(config, vec![DestinationRow::new(1, "sip:10.0.0.1")])?;
    let monitor = dispatcher.health_monitor(Arc::new(ScriptedProber::default()))?;

    let change = monitor
        .handle_reply(1, "sip:10.0.0.1", 404, Duration::from_millis(12))?
        .expect("applied");
    assert_eq!(change.new.state, DestinationState::Active);
    assert!(change.new.probing);

    monitor.handle_reply(1, "sip:10.0.0.1", 408, Duration::from_secs(32))?;
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.1"), DestinationState::Inactive);

    dispatcher.set_state(1, "sip:10.0.0.1", StateRequest::disabled())?;
    assert!(monitor.handle_reply(1, "sip:10.0.0.1", 200, Duration::from_millis(5))?.is_none());
    assert_eq!(state_of(&dispatcher, "sip:10.0.0.1"), DestinationState::Disabled);

    let listing = dispatcher.list();
    let latency = listing.sets[0].destinations[0].latency.clone().expect("latency");
    assert_eq!(latency.count, 2);
    assert_eq!(latency.timeouts, 1);
    assert_eq!(latency.min, 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_background_probing() -> Result<()> {
    let config = DispatcherConfig {
        ping_interval: 1,
        probing_mode: ProbingMode::All,
        load_hash_size: 8,
        ..Default::default()
    };
    let (dispatcher, _events) = setup(config, vec![DestinationRow::new(1, "sip:10.0.0.1")])?;
    let prober = Arc::new(ScriptedProber::default());

    let tasks = dispatcher.start(prober.clone())?;
    assert_eq!(tasks.len(), 2);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(prober.sent_to("sip:10.0.0.1") >= 2);

    tasks.shutdown().await;
    let after = prober.sent_to("sip:10.0.0.1");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(prober.sent_to("sip:10.0.0.1"), after);
    Ok(())
}
