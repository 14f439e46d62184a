//! The dispatcher service
//!
//! [`Dispatcher`] wires the registry, the call-load tracker, the selection
//! engine and the health monitor together from one [`DispatcherConfig`] and
//! exposes the operations a SIP proxy calls per message plus the management
//! plane (reload, state overrides, listings).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DispatcherConfig;
use crate::error::{DispatcherError, Result};
use crate::health::{apply_state_request, EventRouter, HealthMonitor, Prober, StateChange, StateRequest};
use crate::load::CallLoadTracker;
use crate::management::RegistryView;
use crate::message::DispatchMessage;
use crate::registry::{
    DestinationSource, HostResolver, ListFileSource, Registry, ReloadReport, SystemResolver,
};
use crate::select::{FailoverEntry, Selection, SelectionEngine};
use crate::types::{Algorithm, SetId, Transport, UpdateMode};

/// Which parts of an address [`Dispatcher::is_from_list`] ignores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchMode {
    pub ignore_port: bool,
    pub ignore_transport: bool,
}

impl MatchMode {
    /// Address and port must match, any transport
    pub fn ignore_transport() -> Self {
        Self {
            ignore_port: false,
            ignore_transport: true,
        }
    }
}

/// A destination matched by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatch {
    pub group: SetId,
    pub uri: String,
    pub attrs: String,
}

/// Background tasks started by [`Dispatcher::start`]
#[derive(Debug)]
pub struct DispatcherTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl DispatcherTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<Registry>,
    tracker: Option<Arc<CallLoadTracker>>,
    events: Arc<dyn EventRouter>,
    engine: SelectionEngine,
    ping_active: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Build a dispatcher resolving hosts through the system resolver. No
    /// destinations are loaded until [`reload`](Self::reload).
    pub fn new(config: DispatcherConfig, events: Arc<dyn EventRouter>) -> Result<Self> {
        Self::with_resolver(config, events, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: DispatcherConfig,
        events: Arc<dyn EventRouter>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::with_resolver(config.registry_options()?, resolver));
        let tracker = config
            .tracker_settings()
            .map(|settings| Arc::new(CallLoadTracker::new(Arc::clone(&registry), settings)));
        let engine = SelectionEngine::new(
            Arc::clone(&registry),
            tracker.clone(),
            Arc::clone(&events),
            config.select_options(),
        );

        Ok(Self {
            config,
            registry,
            tracker,
            events,
            engine,
            ping_active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tracker(&self) -> Option<&Arc<CallLoadTracker>> {
        self.tracker.as_ref()
    }

    pub fn engine(&self) -> &SelectionEngine {
        &self.engine
    }

    /// Load a new generation from `source`. Tracked calls are forgotten since
    /// their load belongs to the old generation.
    pub fn reload(&self, source: &mut dyn DestinationSource) -> Result<ReloadReport> {
        let report = self.registry.reload(source)?;
        if let Some(tracker) = &self.tracker {
            tracker.clear();
        }
        Ok(report)
    }

    /// Reload from the configured list file
    pub fn reload_list_file(&self) -> Result<ReloadReport> {
        let path = self
            .config
            .list_file
            .as_deref()
            .ok_or_else(|| DispatcherError::Config("no list file configured".to_string()))?;
        info!("reloading destinations from {}", path.display());
        self.reload(&mut ListFileSource::new(path))
    }

    pub fn select<M: DispatchMessage + ?Sized>(
        &self,
        msg: &mut M,
        group: SetId,
        algorithm: Algorithm,
        mode: UpdateMode,
    ) -> Result<Selection> {
        self.engine.select(msg, group, algorithm, mode)
    }

    pub fn select_limited<M: DispatchMessage + ?Sized>(
        &self,
        msg: &mut M,
        group: SetId,
        algorithm: Algorithm,
        limit: usize,
        mode: UpdateMode,
    ) -> Result<Selection> {
        self.engine.select_limited(msg, group, algorithm, limit, mode)
    }

    pub fn next<M: DispatchMessage + ?Sized>(&self, msg: &mut M, mode: UpdateMode) -> Result<FailoverEntry> {
        self.engine.next(msg, mode)
    }

    pub fn mark<M: DispatchMessage + ?Sized>(&self, msg: &M, request: StateRequest) -> Result<StateChange> {
        self.engine.mark(msg, request)
    }

    pub fn fork_alternates<M: DispatchMessage + ?Sized>(&self, msg: &mut M, mode: UpdateMode) -> Result<usize> {
        self.engine.fork_alternates(msg, mode)
    }

    pub fn load_update<M: DispatchMessage + ?Sized>(&self, msg: &M) -> Result<bool> {
        self.engine.load_update(msg)
    }

    pub fn load_unset<M: DispatchMessage + ?Sized>(&self, msg: &M) -> Result<bool> {
        self.engine.load_unset(msg)
    }

    /// Administrative state override
    pub fn set_state(&self, group: SetId, address: &str, request: StateRequest) -> Result<StateChange> {
        let change = apply_state_request(
            &self.registry,
            self.events.as_ref(),
            self.config.thresholds(),
            group,
            address,
            request,
        )?;
        info!("state of {} in set {} set to {}", address, group, change.new);
        Ok(change)
    }

    /// [`set_state`](Self::set_state) with a state token such as `ip` or `d`
    pub fn set_state_token(&self, group: SetId, address: &str, token: &str) -> Result<StateChange> {
        self.set_state(group, address, token.parse()?)
    }

    pub fn list(&self) -> RegistryView {
        RegistryView::from_generation(&self.registry.snapshot(), self.config.ping_latency_stats)
    }

    /// Human readable listing
    pub fn dump(&self) -> String {
        self.list().to_string()
    }

    pub fn list_exists(&self, group: SetId) -> bool {
        self.registry.snapshot().lookup(group).is_some()
    }

    /// Find a destination by network address, in `group` or in every set
    /// when `group` is `None`. A destination without a port matches any
    /// port.
    pub fn is_from_list(
        &self,
        group: Option<SetId>,
        address: IpAddr,
        port: u16,
        transport: Transport,
        mode: MatchMode,
    ) -> Option<AddressMatch> {
        let generation = self.registry.snapshot();
        let found = generation
            .sets()
            .filter(|set| group.map_or(true, |g| set.id() == g))
            .find_map(|set| {
                set.destinations()
                    .iter()
                    .find(|d| {
                        d.address == address
                            && (mode.ignore_port || d.port.map_or(true, |p| p == port))
                            && (mode.ignore_transport || d.transport == transport)
                    })
                    .map(|d| AddressMatch {
                        group: set.id(),
                        uri: d.uri.clone(),
                        attrs: d.attrs.body.clone(),
                    })
            });
        found
    }

    /// Probing is not paused
    pub fn ping_active(&self) -> bool {
        self.ping_active.load(Ordering::Acquire)
    }

    pub fn set_ping_active(&self, active: bool) {
        debug!("pinging {}", if active { "resumed" } else { "paused" });
        self.ping_active.store(active, Ordering::Release);
    }

    /// Health monitor sharing this dispatcher's registry and pause switch
    pub fn health_monitor(&self, prober: Arc<dyn Prober>) -> Result<Arc<HealthMonitor>> {
        Ok(Arc::new(HealthMonitor::new(
            Arc::clone(&self.registry),
            prober,
            Arc::clone(&self.events),
            self.config.probe_settings()?,
            Arc::clone(&self.ping_active),
        )))
    }

    /// Start the probe timer (when `ping_interval` is set) and the tracker
    /// sweeper (when call-load tracking is on). Must run inside a tokio
    /// runtime.
    pub fn start(&self, prober: Arc<dyn Prober>) -> Result<DispatcherTasks> {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        if let Some(interval) = self.config.ping_interval() {
            let monitor = self.health_monitor(prober)?;
            handles.push(monitor.spawn(interval, cancel.child_token()));
        }
        if let Some(tracker) = &self.tracker {
            handles.push(Arc::clone(tracker).spawn_sweeper(self.config.load_check_interval(), cancel.child_token()));
        }

        info!("dispatcher started {} background tasks", handles.len());
        Ok(DispatcherTasks { cancel, handles })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("ping_active", &self.ping_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{DestinationState, NoopEventRouter};
    use crate::registry::{DestinationRow, StaticResolver, StaticSource};
    use std::net::Ipv4Addr;

    fn dispatcher(config: DispatcherConfig) -> Dispatcher {
        let dispatcher = Dispatcher::with_resolver(
            config,
            Arc::new(NoopEventRouter),
            Arc::new(StaticResolver::new().with_host("gw.example.com", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))),
        )
        .unwrap();
        dispatcher
            .reload(&mut StaticSource::new(vec![
                DestinationRow::new(1, "sip:10.0.0.1:5060").with_attrs("duid=a"),
                DestinationRow::new(1, "sip:10.0.0.2;transport=tcp"),
                DestinationRow::new(2, "sip:gw.example.com"),
            ]))
            .unwrap();
        dispatcher
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_is_from_list() {
        let dispatcher = dispatcher(DispatcherConfig::default());

        let hit = dispatcher
            .is_from_list(None, ip(1), 5060, Transport::Udp, MatchMode::default())
            .unwrap();
        assert_eq!(hit.group, 1);
        assert_eq!(hit.attrs, "duid=a");

        assert!(dispatcher
            .is_from_list(None, ip(1), 5070, Transport::Udp, MatchMode::default())
            .is_none());
        assert!(dispatcher
            .is_from_list(
                None,
                ip(1),
                5070,
                Transport::Udp,
                MatchMode {
                    ignore_port: true,
                    ignore_transport: false
                }
            )
            .is_some());

        // no port written: any port matches, transport must agree
        assert!(dispatcher
            .is_from_list(Some(1), ip(2), 1234, Transport::Udp, MatchMode::default())
            .is_none());
        assert!(dispatcher
            .is_from_list(Some(1), ip(2), 1234, Transport::Udp, MatchMode::ignore_transport())
            .is_some());

        assert_eq!(
            dispatcher
                .is_from_list(None, ip(9), 5060, Transport::Udp, MatchMode::default())
                .unwrap()
                .group,
            2
        );
        assert!(dispatcher
            .is_from_list(Some(1), ip(9), 5060, Transport::Udp, MatchMode::default())
            .is_none());
    }

    #[test]
    fn test_set_state_tokens() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let change = dispatcher.set_state_token(1, "sip:10.0.0.2;transport=tcp", "ip").unwrap();
        assert_eq!(change.new.state, DestinationState::Inactive);
        assert!(change.new.probing);

        assert!(dispatcher.set_state_token(1, "sip:10.0.0.2;transport=tcp", "x").is_err());
        assert!(matches!(
            dispatcher.set_state_token(1, "sip:10.9.9.9", "a"),
            Err(DispatcherError::DestinationNotFound { .. })
        ));
        assert!(matches!(
            dispatcher.set_state_token(3, "sip:10.0.0.1", "a"),
            Err(DispatcherError::SetNotFound(3))
        ));
        assert!(dispatcher.dump().contains("URI: sip:10.0.0.2;transport=tcp FLAGS: IP"));
    }

    #[test]
    fn test_list_exists_and_ping_switch() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        assert!(dispatcher.list_exists(1));
        assert!(!dispatcher.list_exists(5));
        assert_eq!(dispatcher.list().sets.len(), 2);

        assert!(dispatcher.ping_active());
        dispatcher.set_ping_active(false);
        assert!(!dispatcher.ping_active());
    }

    #[test]
    fn test_reload_without_list_file() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        assert!(matches!(dispatcher.reload_list_file(), Err(DispatcherError::Config(_))));
    }

    #[test]
    fn test_reload_clears_tracker() {
        let dispatcher = dispatcher(DispatcherConfig {
            load_hash_size: 16,
            ..Default::default()
        });
        let tracker = dispatcher.tracker().unwrap();
        tracker.add("call-1", "a", 1).unwrap();
        assert_eq!(tracker.len(), 1);

        dispatcher
            .reload(&mut StaticSource::new(vec![
                DestinationRow::new(1, "sip:10.0.0.1").with_attrs("duid=a")
            ]))
            .unwrap();
        assert!(tracker.is_empty());
        let generation = dispatcher.registry().snapshot();
        assert_eq!(generation.lookup(1).unwrap().find_by_duid("a").unwrap().load(), 0);
    }
}
