//! # Selection engine
//!
//! Picks one usable destination of a set for a message and applies it:
//!
//! 1. the algorithm yields a hash (or an index for round robin, weight and
//!    least-loaded)
//! 2. the hash is reduced modulo the number of regular slots; the last slot
//!    is kept out when it is reserved as the default
//! 3. unusable destinations are skipped by probing forward with wraparound;
//!    after a full wrap only the default slot is left to try
//!
//! With failover enabled the remaining candidates are recorded on the
//! message ([`DispatchState`](crate::message::DispatchState)) for
//! [`SelectionEngine::next`] to pop.

pub mod failover;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DispatcherError, Result};
use crate::hash::{ds_hash, hash_value, UriHashKeys};
use crate::health::{apply_state_request, EventRouter, StateChange, StateRequest, Thresholds};
use crate::load::CallLoadTracker;
use crate::message::DispatchMessage;
use crate::registry::{Destination, DestinationSet, Registry};
use crate::types::{Algorithm, SetId, SocketSpec, UpdateMode};
use crate::uri::SipUri;

pub use failover::{FailoverEntry, FailoverStack};

/// Behaviour switches of the selection engine
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Overwrite a destination URI already set on the message
    pub force_dst: bool,
    /// The last destination of each set is only used when all others fail
    pub use_default: bool,
    /// Record alternates for failover
    pub failover: bool,
    /// URI hashes use only the user part
    pub hash_user_only: bool,
    /// Expression hashed by [`Algorithm::HashExpression`]
    pub hash_expression: Option<String>,
    pub thresholds: Thresholds,
    /// Seed for random selection, random when unset
    pub rng_seed: Option<u64>,
}

/// Result of a successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub group: SetId,
    pub index: usize,
    pub uri: String,
    pub duid: Option<String>,
    pub socket: Option<SocketSpec>,
    /// Alternates recorded for failover
    pub alternates: usize,
    /// The call was accounted in the call-load tracker
    pub load_tracked: bool,
}

/// Where the starting index of a selection comes from
#[derive(Debug, Clone, Copy)]
enum HashSource {
    /// Reduced modulo the regular slots, then probed forward
    Value(u32),
    /// Already resolved to a usable destination
    Index(usize),
    RoundRobin,
    Weighted,
}

/// Cursor value a selection started from, claimed once it succeeds
#[derive(Debug, Clone, Copy)]
enum Cursor {
    RoundRobin(usize),
    Weighted(usize),
}

pub struct SelectionEngine {
    registry: Arc<Registry>,
    tracker: Option<Arc<CallLoadTracker>>,
    events: Arc<dyn EventRouter>,
    options: SelectOptions,
    rng: Mutex<SmallRng>,
}

impl SelectionEngine {
    pub fn new(
        registry: Arc<Registry>,
        tracker: Option<Arc<CallLoadTracker>>,
        events: Arc<dyn EventRouter>,
        options: SelectOptions,
    ) -> Self {
        let rng = match options.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            registry,
            tracker,
            events,
            options,
            rng: Mutex::new(rng),
        }
    }

    pub fn options(&self) -> &SelectOptions {
        &self.options
    }

    /// Select a destination of `group` with `algorithm` and apply it to `msg`
    pub fn select<M: DispatchMessage + ?Sized>(
        &self,
        msg: &mut M,
        group: SetId,
        algorithm: Algorithm,
        mode: UpdateMode,
    ) -> Result<Selection> {
        self.select_limited(msg, group, algorithm, 0, mode)
    }

    /// Like [`select`](Self::select), recording at most `limit` destinations
    /// (the selected one included). A limit of 0 records all.
    pub fn select_limited<M: DispatchMessage + ?Sized>(
        &self,
        msg: &mut M,
        group: SetId,
        algorithm: Algorithm,
        limit: usize,
        mode: UpdateMode,
    ) -> Result<Selection> {
        let generation = self.registry.snapshot();
        if generation.is_empty() {
            return Err(DispatcherError::NoDestinations);
        }

        if mode == UpdateMode::DestinationUri && !self.options.force_dst {
            if let Some(current) = msg.destination_uri() {
                return Err(DispatcherError::DestinationAlreadySet(current.to_string()));
            }
        }

        let set = generation.lookup(group).ok_or(DispatcherError::SetNotFound(group))?;
        debug!("selecting from set {} with algorithm {}", group, algorithm.id());

        let mut track_load = false;
        let source = match algorithm {
            Algorithm::CallLoad => self.least_loaded_source(msg, set, &mut track_load)?,
            _ => self.hash_source(msg, set, algorithm)?,
        };
        let (index, destination) = loop {
            let (index, cursor) = match source {
                HashSource::Value(hash) => (self.resolve_index(set, hash as usize), None),
                HashSource::Index(index) => (Some(index), None),
                HashSource::RoundRobin => {
                    let seen = set.round_robin_cursor();
                    (self.resolve_index(set, seen), Some(Cursor::RoundRobin(seen)))
                }
                HashSource::Weighted => {
                    let seen = set.weighted_cursor();
                    let hash = set.weighted_index(seen).unwrap_or(0);
                    (self.resolve_index(set, hash), Some(Cursor::Weighted(seen)))
                }
            };
            let index = index.ok_or(DispatcherError::SelectionExhausted(group))?;
            let destination = set.get(index).ok_or(DispatcherError::SelectionExhausted(group))?;

            apply_destination(msg, &destination.uri, destination.socket.as_ref(), mode)?;
            let claimed = match cursor {
                None => true,
                Some(Cursor::RoundRobin(seen)) => set.advance_round_robin(seen, index),
                Some(Cursor::Weighted(seen)) => set.advance_weighted(seen),
            };
            if claimed {
                break (index, destination);
            }
            // another selection moved the cursor, start over from its new value
        };
        debug!("selected [{}-{}/{}] <{}>", algorithm.id(), group, index, destination.uri);

        if track_load {
            track_load = self.track_call(msg, group, destination);
        }

        let state = msg.dispatch_state_mut();
        state.clear();
        state.group = Some(group);
        state.current = Some(entry_for(group, destination));
        state.load_tracked = track_load;

        if self.options.failover {
            let default = self.default_slot(set);
            let regular = default.unwrap_or(set.len());
            let eligible = |i: usize| {
                set.get(i).is_some_and(|d| {
                    d.is_usable() && (!track_load || (d.has_capacity() && d.duid().is_some()))
                })
            };
            let mut order = failover::push_order(index, regular, default, eligible);
            if limit > 0 {
                // keep the alternates popped first
                let keep = limit - 1;
                if order.len() > keep {
                    order.drain(..order.len() - keep);
                }
            }
            for i in order {
                if let Some(alternate) = set.get(i) {
                    state.failover.push(entry_for(group, alternate));
                }
            }
        }
        state.count = 1 + state.failover.len();

        Ok(Selection {
            group,
            index,
            uri: destination.uri.clone(),
            duid: destination.attrs.duid.clone(),
            socket: destination.socket.clone(),
            alternates: state.failover.len(),
            load_tracked: track_load,
        })
    }

    /// Apply the next recorded alternate to `msg`
    pub fn next<M: DispatchMessage + ?Sized>(&self, msg: &mut M, mode: UpdateMode) -> Result<FailoverEntry> {
        if !self.options.failover {
            warn!("failover support disabled");
            return Err(DispatcherError::FailoverDisabled);
        }

        let entry = msg
            .dispatch_state_mut()
            .failover
            .pop()
            .ok_or(DispatcherError::FailoverExhausted)?;

        apply_destination(msg, &entry.uri, entry.socket.as_ref(), mode)?;
        debug!("failover to {}", entry.uri);

        if msg.dispatch_state().load_tracked {
            let tracker = self.load_tracker()?;
            let call_id = msg
                .call_id()
                .ok_or_else(|| DispatcherError::MissingKey("Call-ID".to_string()))?;
            let duid = entry
                .duid
                .as_deref()
                .ok_or_else(|| DispatcherError::MissingKey(format!("duid of {}", entry.uri)))?;
            tracker.replace(call_id, duid)?;
        }

        msg.dispatch_state_mut().current = Some(entry.clone());
        Ok(entry)
    }

    /// Change the health of the destination currently applied to `msg`
    pub fn mark<M: DispatchMessage + ?Sized>(&self, msg: &M, request: StateRequest) -> Result<StateChange> {
        if !self.options.failover {
            warn!("failover support disabled");
            return Err(DispatcherError::FailoverDisabled);
        }
        let state = msg.dispatch_state();
        let (group, current) = match (state.group, state.current.as_ref()) {
            (Some(group), Some(current)) => (group, current),
            _ => return Err(DispatcherError::Message("no destination recorded on message".to_string())),
        };
        apply_state_request(
            &self.registry,
            self.events.as_ref(),
            self.options.thresholds,
            group,
            &current.uri,
            request,
        )
    }

    /// Add a branch for every recorded alternate, in failover order
    pub fn fork_alternates<M: DispatchMessage + ?Sized>(&self, msg: &mut M, mode: UpdateMode) -> Result<usize> {
        let alternates = msg.dispatch_state_mut().failover.drain();
        let count = alternates.len();
        for entry in alternates {
            let target = match mode {
                UpdateMode::DestinationUri | UpdateMode::RequestUri => entry.uri.clone(),
                UpdateMode::HostPort => rewrite_host_port(msg.request_uri(), &entry.uri)?,
            };
            msg.append_branch(&target, entry.socket.as_ref())?;
        }
        Ok(count)
    }

    /// Follow the call of `msg` in the tracker: BYE and CANCEL release its
    /// load, a 2xx to INVITE confirms it. Returns whether the tracker changed.
    pub fn load_update<M: DispatchMessage + ?Sized>(&self, msg: &M) -> Result<bool> {
        let tracker = self.load_tracker()?;
        let call_id = msg
            .call_id()
            .ok_or_else(|| DispatcherError::MissingKey("Call-ID".to_string()))?;

        if msg.is_request() {
            let method = msg.method();
            if method.eq_ignore_ascii_case("BYE") || method.eq_ignore_ascii_case("CANCEL") {
                tracker.remove(call_id)?;
                return Ok(true);
            }
            return Ok(false);
        }

        match msg.status_code() {
            Some(code) if (200..300).contains(&code) && msg.method().eq_ignore_ascii_case("INVITE") => {
                tracker.confirm(call_id)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release the load of the call of `msg`. An INVITE only releases load it
    /// was accounted for.
    pub fn load_unset<M: DispatchMessage + ?Sized>(&self, msg: &M) -> Result<bool> {
        let tracker = self.load_tracker()?;
        if msg.is_request() && msg.method().eq_ignore_ascii_case("INVITE") && !msg.dispatch_state().load_tracked {
            return Ok(false);
        }
        let call_id = msg
            .call_id()
            .ok_or_else(|| DispatcherError::MissingKey("Call-ID".to_string()))?;
        tracker.remove(call_id)?;
        Ok(true)
    }

    fn load_tracker(&self) -> Result<&CallLoadTracker> {
        self.tracker
            .as_deref()
            .ok_or_else(|| DispatcherError::TrackerMiss("call-load tracking disabled".to_string()))
    }

    fn default_slot(&self, set: &DestinationSet) -> Option<usize> {
        if self.options.use_default && set.len() > 1 {
            Some(set.len() - 1)
        } else {
            None
        }
    }

    /// First usable index at or after `hash`, wrapping over the regular
    /// slots, then the default slot
    fn resolve_index(&self, set: &DestinationSet, hash: usize) -> Option<usize> {
        let len = set.len();
        if len == 0 {
            return None;
        }
        let regular = self.default_slot(set).unwrap_or(len);
        let usable = |i: usize| set.get(i).is_some_and(Destination::is_usable);

        let start = hash % regular;
        let mut index = start;
        while !usable(index) {
            index = (index + 1) % regular;
            if index == start {
                if self.options.use_default {
                    let default = len - 1;
                    return usable(default).then_some(default);
                }
                return None;
            }
        }
        Some(index)
    }

    fn hash_source<M: DispatchMessage + ?Sized>(
        &self,
        msg: &M,
        set: &DestinationSet,
        algorithm: Algorithm,
    ) -> Result<HashSource> {
        let user_only = self.options.hash_user_only;
        let hash = match algorithm {
            Algorithm::HashCallId => {
                let call_id = msg
                    .call_id()
                    .ok_or_else(|| DispatcherError::MissingKey("Call-ID".to_string()))?;
                hash_value(call_id)?
            }
            Algorithm::HashFromUri => {
                let from = msg
                    .from_uri()
                    .ok_or_else(|| DispatcherError::MissingKey("From URI".to_string()))?;
                UriHashKeys::from_uri(from.trim(), user_only)?.hash()
            }
            Algorithm::HashToUri => {
                let to = msg
                    .to_uri()
                    .ok_or_else(|| DispatcherError::MissingKey("To URI".to_string()))?;
                UriHashKeys::from_uri(to.trim(), user_only)?.hash()
            }
            Algorithm::HashRequestUri => UriHashKeys::from_uri(msg.request_uri().trim(), user_only)?.hash(),
            Algorithm::RoundRobin => return Ok(HashSource::RoundRobin),
            Algorithm::HashAuthUsername => {
                let username = msg
                    .proxy_auth_username()
                    .or_else(|| msg.auth_username())
                    .map(str::trim)
                    .filter(|u| !u.is_empty());
                match username {
                    Some(username) => ds_hash(Some(username), None),
                    None => {
                        debug!("no credentials, using round robin");
                        return Ok(HashSource::RoundRobin);
                    }
                }
            }
            Algorithm::Random => self.rng.lock().gen_range(0..set.len().max(1)) as u32,
            Algorithm::HashExpression => {
                let expression = self
                    .options
                    .hash_expression
                    .as_deref()
                    .ok_or_else(|| DispatcherError::MissingKey("no hash expression configured".to_string()))?;
                let value = msg
                    .evaluate(expression)
                    .ok_or_else(|| DispatcherError::MissingKey(format!("no value for {}", expression)))?;
                hash_value(&value)?
            }
            Algorithm::Serial => 0,
            Algorithm::Weight if set.weights().is_some() => return Ok(HashSource::Weighted),
            Algorithm::Weight => 0,
            Algorithm::CallLoad => 0,
        };
        Ok(HashSource::Value(hash))
    }

    fn least_loaded_source<M: DispatchMessage + ?Sized>(
        &self,
        msg: &M,
        set: &DestinationSet,
        track_load: &mut bool,
    ) -> Result<HashSource> {
        if !msg.is_request() || !msg.method().eq_ignore_ascii_case("INVITE") {
            debug!("{} does not start a call, using first entry", msg.method());
            return Ok(HashSource::Value(0));
        }
        if self.tracker.is_none() || msg.call_id().is_none() {
            warn!("no call-load tracking for load distribution, using first entry");
            return Ok(HashSource::Value(0));
        }
        // the default slot only takes calls when no regular slot can
        let regular = self.default_slot(set).unwrap_or(set.len());
        let index = set
            .least_loaded(regular)
            .or_else(|| {
                self.default_slot(set)
                    .filter(|&i| set.get(i).is_some_and(|d| d.is_usable() && d.has_capacity()))
            })
            .ok_or(DispatcherError::SelectionExhausted(set.id()))?;
        *track_load = true;
        Ok(HashSource::Index(index))
    }

    fn track_call<M: DispatchMessage + ?Sized>(&self, msg: &M, group: SetId, destination: &Destination) -> bool {
        let (Some(tracker), Some(call_id)) = (self.tracker.as_ref(), msg.call_id()) else {
            return false;
        };
        let Some(duid) = destination.duid() else {
            warn!("no duid for destination {} in set {}, classic dispatching", destination.uri, group);
            return false;
        };
        match tracker.add(call_id, duid, group) {
            Ok(_) => true,
            Err(e) => {
                warn!("unable to update destination load, classic dispatching: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for SelectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionEngine")
            .field("options", &self.options)
            .field("load_tracking", &self.tracker.is_some())
            .finish()
    }
}

fn entry_for(group: SetId, destination: &Destination) -> FailoverEntry {
    FailoverEntry {
        group,
        uri: destination.uri.clone(),
        socket: destination.socket.clone(),
        attrs: destination.attrs.body.clone(),
        duid: destination.attrs.duid.clone(),
    }
}

/// Request-URI with host and port taken from `target`
fn rewrite_host_port(request_uri: &str, target: &str) -> Result<String> {
    let ruri: SipUri = request_uri.parse()?;
    let target: SipUri = target.parse()?;
    Ok(ruri.with_host_port_of(&target).to_string())
}

/// Apply `uri` to `msg` the way `mode` asks for
pub(crate) fn apply_destination<M: DispatchMessage + ?Sized>(
    msg: &mut M,
    uri: &str,
    socket: Option<&SocketSpec>,
    mode: UpdateMode,
) -> Result<()> {
    match mode {
        UpdateMode::DestinationUri => msg.set_destination_uri(uri)?,
        UpdateMode::RequestUri => msg.set_request_uri(uri)?,
        UpdateMode::HostPort => {
            let rewritten = rewrite_host_port(msg.request_uri(), uri)?;
            msg.set_request_uri(&rewritten)?;
        }
    }
    if socket.is_some() {
        msg.set_force_socket(socket);
    }
    Ok(())
}
