//! Periodic probing of destinations
//!
//! Every tick the monitor sends a probe (an OPTIONS request by default) to
//! each destination that is not disabled and is either flagged for probing
//! or covered by [`ProbingMode::All`]. The reply code is turned into a
//! [`StateRequest`] and applied through [`transition`](super::transition):
//!
//! ```text
//!  reply 2xx / accepted code ──> Active  (+P for mode All, or OnlyFlagged when flagged)
//!  anything else             ──> Trying  (+P unless mode None)
//! ```
//!
//! Timeouts are reported by the transport layer as 408; this module sets no
//! timers of its own on a probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{apply_state_request, DestinationState, EventRouter, StateChange, StateRequest, Thresholds};
use crate::error::{DispatcherError, Result};
use crate::registry::Registry;
use crate::types::{ProbingMode, SetId, SocketSpec};

/// Requests the probe for one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub group: SetId,
    pub method: String,
    pub target_uri: String,
    pub from_uri: String,
    pub socket: Option<SocketSpec>,
    pub outbound_proxy: Option<String>,
}

/// Sends probes on behalf of the monitor
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `request` and resolve to the final reply code once the
    /// transaction completes. `Err` means the probe could not be sent.
    async fn send(&self, request: ProbeRequest) -> Result<u16>;
}

/// Reply codes accepted as a successful probe besides 2xx
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyCodes {
    codes: Vec<u16>,
    classes: Vec<u16>,
}

impl ReplyCodes {
    /// Parse `code=404;class=3`. Codes outside 100..699 and classes outside
    /// 1..6 are ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let mut codes = ReplyCodes::default();
        for entry in input.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| DispatcherError::Config(format!("bad reply code entry '{}'", entry)))?;
            let value: u16 = value
                .trim()
                .parse()
                .map_err(|_| DispatcherError::Config(format!("bad reply code entry '{}'", entry)))?;
            match name.trim().to_ascii_lowercase().as_str() {
                "code" if (100..700).contains(&value) => codes.codes.push(value),
                "class" if (1..7).contains(&value) => codes.classes.push(value),
                "code" | "class" => debug!("ignoring reply code entry '{}'", entry),
                _ => {
                    return Err(DispatcherError::Config(format!(
                        "unknown reply code entry '{}'",
                        entry
                    )))
                }
            }
        }
        Ok(codes)
    }

    pub fn contains(&self, code: u16) -> bool {
        self.codes.contains(&code) || self.classes.contains(&(code / 100))
    }

    /// 2xx or one of the configured codes
    pub fn is_success(&self, code: u16) -> bool {
        (200..300).contains(&code) || self.contains(code)
    }
}

/// Probe round-trip statistics of a destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u32,
    pub min: u32,
    pub max: u32,
    pub average: f64,
    pub std_dev: f64,
    /// Exponentially weighted moving average
    pub estimate: f64,
    /// Probes that ended in 408
    pub timeouts: u32,
    #[serde(skip)]
    m2: f64,
}

/// Past this many samples the average turns into a weighted average
const LATENCY_WINDOW: u32 = 2_097_152;

impl LatencyStats {
    pub fn record(&mut self, latency_ms: u32, alpha: f64) {
        let latency = f64::from(latency_ms);
        if self.count < LATENCY_WINDOW {
            self.count += 1;
        } else {
            self.m2 -= self.m2 / f64::from(self.count);
        }

        if self.count == 1 {
            self.std_dev = 0.0;
            self.m2 = 0.0;
            self.min = latency_ms;
            self.max = latency_ms;
            self.average = latency;
            self.estimate = latency;
        }
        self.min = self.min.min(latency_ms);
        self.max = self.max.max(latency_ms);

        // Welford
        if self.count > 1 {
            let delta = latency - self.average;
            self.average += delta / f64::from(self.count);
            let delta2 = latency - self.average;
            self.m2 += delta * delta2;
            self.std_dev = (self.m2 / f64::from(self.count - 1)).sqrt();
        }

        if self.count < 10 {
            self.estimate = self.average;
        } else {
            self.estimate = self.estimate * alpha + latency * (1.0 - alpha);
        }
    }

    pub fn record_timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
    }
}

/// How probes are sent and judged
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub method: String,
    pub from_uri: String,
    pub mode: ProbingMode,
    pub reply_codes: ReplyCodes,
    pub outbound_proxy: Option<String>,
    pub thresholds: Thresholds,
    pub latency_stats: bool,
    pub latency_alpha: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            method: "OPTIONS".to_string(),
            from_uri: "sip:dispatcher@localhost".to_string(),
            mode: ProbingMode::None,
            reply_codes: ReplyCodes::default(),
            outbound_proxy: None,
            thresholds: Thresholds::default(),
            latency_stats: false,
            latency_alpha: 0.9,
        }
    }
}

/// Drives probes and feeds their results into destination health
pub struct HealthMonitor {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    events: Arc<dyn EventRouter>,
    settings: ProbeSettings,
    active: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<dyn Prober>,
        events: Arc<dyn EventRouter>,
        settings: ProbeSettings,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            prober,
            events,
            settings,
            active,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Probing is not paused
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Probes due in the current generation
    pub fn targets(&self) -> Vec<ProbeRequest> {
        let generation = self.registry.snapshot();
        let targets = generation
            .sets()
            .flat_map(|set| {
                set.destinations().iter().filter_map(move |destination| {
                    let health = destination.health();
                    if health.state == DestinationState::Disabled {
                        return None;
                    }
                    if self.settings.mode != ProbingMode::All && !health.probing {
                        return None;
                    }
                    Some(ProbeRequest {
                        group: set.id(),
                        method: self.settings.method.clone(),
                        target_uri: destination.uri.clone(),
                        from_uri: self.settings.from_uri.clone(),
                        socket: destination.socket.clone(),
                        outbound_proxy: self.settings.outbound_proxy.clone(),
                    })
                })
            })
            .collect();
        targets
    }

    /// Send every due probe and wait for all replies. Returns the number of
    /// probes sent.
    pub async fn probe_round(self: &Arc<Self>) -> usize {
        if !self.is_active() {
            debug!("pinging destinations is paused");
            return 0;
        }

        let targets = self.targets();
        let count = targets.len();
        let mut probes = JoinSet::new();
        for request in targets {
            let monitor = Arc::clone(self);
            probes.spawn(async move {
                let group = request.group;
                let uri = request.target_uri.clone();
                let started = Instant::now();
                match monitor.prober.send(request).await {
                    Ok(code) => {
                        if let Err(e) = monitor.handle_reply(group, &uri, code, started.elapsed()) {
                            debug!("probe reply for {} in set {} not applied: {}", uri, group, e);
                        }
                    }
                    Err(e) => error!("unable to ping {}: {}", uri, e),
                }
            });
        }
        while probes.join_next().await.is_some() {}
        count
    }

    /// Apply the final reply `code` of a probe to `uri` in `group`.
    ///
    /// Returns `None` when the destination was disabled while the probe was
    /// in flight; the administrator's state is kept.
    pub fn handle_reply(&self, group: SetId, uri: &str, code: u16, elapsed: Duration) -> Result<Option<StateChange>> {
        let generation = self.registry.snapshot();
        let set = generation.lookup(group).ok_or(DispatcherError::SetNotFound(group))?;
        let destination = set.find_by_uri(uri).ok_or_else(|| DispatcherError::DestinationNotFound {
            group,
            address: uri.to_string(),
        })?;

        if self.settings.latency_stats {
            let alpha = self.settings.latency_alpha;
            destination.record_latency(|stats| {
                if code == 408 {
                    stats.record_timeout();
                } else {
                    let ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX);
                    stats.record(ms, alpha);
                }
            });
        }

        let current = destination.health();
        if current.state == DestinationState::Disabled {
            debug!("{} in set {} was disabled during the probe", uri, group);
            return Ok(None);
        }

        let request = if self.settings.reply_codes.is_success(code) {
            let probing = match self.settings.mode {
                ProbingMode::All => true,
                ProbingMode::OnlyFlagged => current.probing,
                ProbingMode::None => false,
            };
            StateRequest::new(DestinationState::Active, probing)
        } else {
            StateRequest::new(DestinationState::Trying, self.settings.mode != ProbingMode::None)
        };

        debug!("probe of {} in set {} finished with {}", uri, group, code);
        apply_state_request(
            &self.registry,
            self.events.as_ref(),
            self.settings.thresholds,
            group,
            uri,
            request,
        )
        .map(Some)
    }

    /// Run [`probe_round`](Self::probe_round) every `interval` until
    /// `cancel` fires. Rounds run in their own tasks so a slow probe does not
    /// delay the next tick.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            info!("destination probing every {:?}", interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let monitor = Arc::clone(&self);
                        tokio::spawn(async move {
                            monitor.probe_round().await;
                        });
                    }
                    _ = cancel.cancelled() => {
                        debug!("destination probing stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.settings)
            .field("active", &self.is_active())
            .finish()
    }
}
