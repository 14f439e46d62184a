//! Destination health
//!
//! A destination is in exactly one primary state ([`DestinationState`]) and
//! independently may carry the probing flag. [`transition`] is the single
//! place where state changes are computed; probe results, `mark` from the
//! routing script and administrative overrides all go through it.
//!
//! The current status lives in a [`HealthCell`], one atomic word per
//! destination. Updates are load/compute/store without a lock, so a probe
//! result racing an administrative override of the same destination may
//! overwrite it. This is accepted: the next probe or override corrects it.

pub mod events;
pub mod monitor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::{DispatcherError, Result};
use crate::registry::Registry;
use crate::types::SetId;

pub use events::{BroadcastEventRouter, DestinationEvent, DestinationNotification, EventRouter, NoopEventRouter};
pub use monitor::{HealthMonitor, LatencyStats, ProbeRequest, ProbeSettings, Prober, ReplyCodes};

/// Row flag: destination starts inactive
pub const FLAG_INACTIVE: u32 = 1;
/// Row flag: destination starts in trying state
pub const FLAG_TRYING: u32 = 2;
/// Row flag: destination starts administratively disabled
pub const FLAG_DISABLED: u32 = 4;
/// Row flag: destination is probed
pub const FLAG_PROBING: u32 = 8;

/// Primary destination state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationState {
    Active,
    /// Failures seen, still below the probing threshold. Still used.
    Trying,
    /// Failing, skipped by selection until it recovers
    Inactive,
    /// Switched off by an administrator, never recovered automatically
    Disabled,
}

impl DestinationState {
    fn code(self) -> u64 {
        match self {
            DestinationState::Active => 0,
            DestinationState::Trying => 1,
            DestinationState::Inactive => 2,
            DestinationState::Disabled => 3,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            1 => DestinationState::Trying,
            2 => DestinationState::Inactive,
            3 => DestinationState::Disabled,
            _ => DestinationState::Active,
        }
    }

    pub fn letter(self) -> char {
        match self {
            DestinationState::Active => 'A',
            DestinationState::Trying => 'T',
            DestinationState::Inactive => 'I',
            DestinationState::Disabled => 'D',
        }
    }
}

/// Snapshot of a destination's health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: DestinationState,
    pub probing: bool,
    /// Consecutive failures while active/trying, consecutive successes while inactive
    pub counter: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            state: DestinationState::Active,
            probing: false,
            counter: 0,
        }
    }
}

impl HealthStatus {
    pub fn new(state: DestinationState, probing: bool) -> Self {
        Self {
            state,
            probing,
            counter: 0,
        }
    }

    /// Initial status from the flags column of a destination row
    pub fn from_row_flags(flags: u32) -> Self {
        let state = if flags & FLAG_DISABLED != 0 {
            DestinationState::Disabled
        } else if flags & FLAG_INACTIVE != 0 {
            DestinationState::Inactive
        } else if flags & FLAG_TRYING != 0 {
            DestinationState::Trying
        } else {
            DestinationState::Active
        };
        Self::new(state, flags & FLAG_PROBING != 0)
    }

    /// Selection may use the destination
    pub fn is_usable(&self) -> bool {
        matches!(self.state, DestinationState::Active | DestinationState::Trying)
    }

    /// Short form used in listings: `AP`, `IX`, ...
    pub fn letters(&self) -> String {
        format!("{}{}", self.state.letter(), if self.probing { 'P' } else { 'X' })
    }

    fn pack(&self) -> u64 {
        self.state.code() | (u64::from(self.probing) << 8) | (u64::from(self.counter) << 32)
    }

    fn unpack(word: u64) -> Self {
        Self {
            state: DestinationState::from_code(word & 0xff),
            probing: (word >> 8) & 1 == 1,
            counter: (word >> 32) as u32,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.letters())
    }
}

/// A requested state: a probe outcome, a `mark` from the routing script or
/// an administrative override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    pub state: DestinationState,
    pub probing: bool,
}

impl StateRequest {
    pub fn new(state: DestinationState, probing: bool) -> Self {
        Self { state, probing }
    }

    pub fn active() -> Self {
        Self::new(DestinationState::Active, false)
    }

    pub fn trying() -> Self {
        Self::new(DestinationState::Trying, false)
    }

    pub fn inactive() -> Self {
        Self::new(DestinationState::Inactive, false)
    }

    pub fn disabled() -> Self {
        Self::new(DestinationState::Disabled, false)
    }

    pub fn with_probing(mut self) -> Self {
        self.probing = true;
        self
    }
}

impl FromStr for StateRequest {
    type Err = DispatcherError;

    /// Parses `a`, `ap`, `i`, `ip`, `d`, `t`, `tp` or the numeric forms
    /// `1`, `0`, `2`, `3` (optionally followed by `p`).
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        let state = match chars.next().map(|c| c.to_ascii_lowercase()) {
            Some('a') | Some('1') => DestinationState::Active,
            Some('i') | Some('0') => DestinationState::Inactive,
            Some('d') | Some('2') => DestinationState::Disabled,
            Some('t') | Some('3') => DestinationState::Trying,
            _ => return Err(DispatcherError::Config(format!("unknown state value '{}'", s))),
        };
        let probing = matches!(chars.next(), Some('p') | Some('P'))
            && state != DestinationState::Disabled;
        Ok(Self::new(state, probing))
    }
}

/// Thresholds driving [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Failures before a destination goes inactive
    pub probing: u32,
    /// Successes before an inactive destination is used again
    pub inactive: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            probing: 1,
            inactive: 1,
        }
    }
}

/// Compute the next status of a destination.
///
/// - A request for `Trying` on an inactive destination keeps it inactive: it
///   has to prove healthy before failures are counted again.
/// - `Trying` counts a failure; at `thresholds.probing` failures the
///   destination goes `Inactive` and the counter restarts.
/// - Any non-trying request on an inactive destination counts a success; it
///   stays `Inactive` until `thresholds.inactive` successes were seen.
/// - Everything else resets the counter.
pub fn transition(current: HealthStatus, request: StateRequest, thresholds: Thresholds) -> HealthStatus {
    let requested_trying = request.state == DestinationState::Trying;
    let mut requested = request.state;
    if requested_trying && current.state == DestinationState::Inactive {
        requested = DestinationState::Inactive;
    }

    let probing = request.probing && requested != DestinationState::Disabled;

    match requested {
        DestinationState::Trying => {
            let counter = current.counter.saturating_add(1);
            if counter >= thresholds.probing.max(1) {
                HealthStatus::new(DestinationState::Inactive, probing)
            } else {
                HealthStatus {
                    state: DestinationState::Trying,
                    probing,
                    counter,
                }
            }
        }
        DestinationState::Disabled => HealthStatus::new(DestinationState::Disabled, false),
        _ if !requested_trying && current.state == DestinationState::Inactive => {
            let counter = current.counter.saturating_add(1);
            if counter < thresholds.inactive {
                HealthStatus {
                    state: DestinationState::Inactive,
                    probing,
                    counter,
                }
            } else {
                HealthStatus::new(requested, probing)
            }
        }
        _ => HealthStatus::new(requested, probing),
    }
}

/// Usability change between two statuses, if any
pub fn usability_event(old: &HealthStatus, new: &HealthStatus) -> Option<DestinationEvent> {
    match (old.is_usable(), new.is_usable()) {
        (true, false) => Some(DestinationEvent::Down),
        (false, true) => Some(DestinationEvent::Up),
        _ => None,
    }
}

/// Lock-free holder of a destination's [`HealthStatus`]
#[derive(Debug)]
pub struct HealthCell(AtomicU64);

impl HealthCell {
    pub fn new(status: HealthStatus) -> Self {
        Self(AtomicU64::new(status.pack()))
    }

    pub fn load(&self) -> HealthStatus {
        HealthStatus::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: HealthStatus) {
        self.0.store(status.pack(), Ordering::Release);
    }
}

/// Result of applying a [`StateRequest`] to a registry destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: HealthStatus,
    pub new: HealthStatus,
    pub event: Option<DestinationEvent>,
}

/// Apply `request` to the destination `address` of `group` in the current
/// generation and fire the up/down event when usability changed.
pub fn apply_state_request(
    registry: &Registry,
    events: &dyn EventRouter,
    thresholds: Thresholds,
    group: SetId,
    address: &str,
    request: StateRequest,
) -> Result<StateChange> {
    let generation = registry.snapshot();
    if generation.is_empty() {
        return Err(DispatcherError::NoDestinations);
    }
    let set = generation.lookup(group).ok_or(DispatcherError::SetNotFound(group))?;
    let destination = set
        .find_by_uri(address)
        .ok_or_else(|| DispatcherError::DestinationNotFound {
            group,
            address: address.to_string(),
        })?;

    let old = destination.health();
    let new = transition(old, request, thresholds);
    destination.set_health(new);

    let event = usability_event(&old, &new);
    match event {
        Some(event) => {
            info!("destination {} in set {} is {} ({} -> {})", address, group, event, old, new);
            events.run(event, group, address);
        }
        None => debug!("destination {} in set {}: {} -> {}", address, group, old, new),
    }

    Ok(StateChange { old, new, event })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(probing: u32, inactive: u32) -> Thresholds {
        Thresholds { probing, inactive }
    }

    #[test]
    fn test_three_failures_take_destination_inactive() {
        let t = thresholds(3, 1);
        let mut status = HealthStatus::default();

        status = transition(status, StateRequest::trying(), t);
        assert_eq!(status.state, DestinationState::Trying);
        assert_eq!(status.counter, 1);
        assert!(status.is_usable());

        status = transition(status, StateRequest::trying(), t);
        assert_eq!(status.state, DestinationState::Trying);
        assert_eq!(status.counter, 2);

        status = transition(status, StateRequest::trying(), t);
        assert_eq!(status.state, DestinationState::Inactive);
        assert_eq!(status.counter, 0);
        assert!(!status.is_usable());
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let t = thresholds(3, 1);
        let mut status = HealthStatus::default();
        status = transition(status, StateRequest::trying(), t);
        status = transition(status, StateRequest::trying(), t);
        status = transition(status, StateRequest::active(), t);
        assert_eq!(status, HealthStatus::default());

        status = transition(status, StateRequest::trying(), t);
        assert_eq!(status.state, DestinationState::Trying);
        assert_eq!(status.counter, 1);
    }

    #[test]
    fn test_recovery_needs_inactive_threshold_successes() {
        let t = thresholds(1, 2);
        let inactive = HealthStatus::new(DestinationState::Inactive, true);

        let status = transition(inactive, StateRequest::active().with_probing(), t);
        assert_eq!(status.state, DestinationState::Inactive);
        assert_eq!(status.counter, 1);

        let status = transition(status, StateRequest::active().with_probing(), t);
        assert_eq!(status.state, DestinationState::Active);
        assert_eq!(status.counter, 0);
        assert!(status.probing);
    }

    #[test]
    fn test_failure_while_inactive_stays_inactive() {
        let t = thresholds(1, 3);
        let mut status = HealthStatus::new(DestinationState::Inactive, false);
        status = transition(status, StateRequest::active(), t);
        assert_eq!(status.counter, 1);

        // a failure does not produce Trying and restarts the recovery count
        status = transition(status, StateRequest::trying().with_probing(), t);
        assert_eq!(status.state, DestinationState::Inactive);
        assert_eq!(status.counter, 0);
        assert!(status.probing);
    }

    #[test]
    fn test_disable_clears_probing() {
        let t = Thresholds::default();
        let status = HealthStatus::new(DestinationState::Active, true);
        let status = transition(status, StateRequest::new(DestinationState::Disabled, true), t);
        assert_eq!(status.state, DestinationState::Disabled);
        assert!(!status.probing);
        assert!(!status.is_usable());

        let status = transition(status, StateRequest::active(), t);
        assert_eq!(status.state, DestinationState::Active);
    }

    #[test]
    fn test_usability_events() {
        let active = HealthStatus::default();
        let trying = HealthStatus::new(DestinationState::Trying, false);
        let inactive = HealthStatus::new(DestinationState::Inactive, false);

        assert_eq!(usability_event(&active, &trying), None);
        assert_eq!(usability_event(&trying, &inactive), Some(DestinationEvent::Down));
        assert_eq!(usability_event(&inactive, &active), Some(DestinationEvent::Up));
    }

    #[test]
    fn test_row_flags_and_cell_round_trip() {
        let status = HealthStatus::from_row_flags(FLAG_INACTIVE | FLAG_PROBING);
        assert_eq!(status.state, DestinationState::Inactive);
        assert!(status.probing);
        assert_eq!(status.letters(), "IP");

        let status = HealthStatus::from_row_flags(FLAG_DISABLED | FLAG_INACTIVE);
        assert_eq!(status.state, DestinationState::Disabled);

        let cell = HealthCell::new(HealthStatus {
            state: DestinationState::Trying,
            probing: true,
            counter: 7,
        });
        let loaded = cell.load();
        assert_eq!(loaded.state, DestinationState::Trying);
        assert!(loaded.probing);
        assert_eq!(loaded.counter, 7);
    }

    #[test]
    fn test_parse_state_tokens() {
        assert_eq!("ap".parse::<StateRequest>().unwrap(), StateRequest::active().with_probing());
        assert_eq!("I".parse::<StateRequest>().unwrap(), StateRequest::inactive());
        assert_eq!("2".parse::<StateRequest>().unwrap(), StateRequest::disabled());
        assert_eq!("dp".parse::<StateRequest>().unwrap(), StateRequest::disabled());
        assert_eq!("tp".parse::<StateRequest>().unwrap(), StateRequest::trying().with_probing());
        assert!("x".parse::<StateRequest>().is_err());
        assert!("".parse::<StateRequest>().is_err());
    }
}
