//! Destinations and destination sets

use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{DispatcherError, Result};
use crate::health::{HealthCell, HealthStatus, LatencyStats};
use crate::types::{SetId, SocketSpec, Transport};
use crate::uri::SipUri;

/// Slots in the weighted distribution table
pub const WEIGHT_SLOTS: usize = 100;

/// Attributes from the last column of a destination row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationAttrs {
    /// The attribute string as written
    pub body: String,
    pub duid: Option<String>,
    /// Share of the weighted table, in percent
    pub weight: u32,
    /// Concurrent calls allowed by the load algorithm, 0 for unlimited
    pub maxload: u32,
    pub socket: Option<SocketSpec>,
    /// Every other `name=value` pair
    pub custom: IndexMap<String, String>,
}

impl DestinationAttrs {
    /// Parse `name=value;name=value`. A trailing `;` is ignored.
    pub fn parse(body: &str) -> Result<Self> {
        let body = body.trim();
        let mut attrs = DestinationAttrs {
            body: body.to_string(),
            ..Default::default()
        };

        for part in body.trim_end_matches(';').split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (part, ""),
            };
            match name.to_ascii_lowercase().as_str() {
                "duid" => {
                    attrs.duid = if value.is_empty() { None } else { Some(value.to_string()) };
                }
                "weight" => attrs.weight = parse_number(name, value)?,
                "maxload" => attrs.maxload = parse_number(name, value)?,
                "socket" => attrs.socket = Some(value.parse()?),
                _ => {
                    attrs.custom.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(attrs)
    }
}

fn parse_number(name: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| DispatcherError::Config(format!("bad {} value '{}'", name, value)))
}

/// One upstream target of a destination set
#[derive(Debug)]
pub struct Destination {
    /// URI as loaded, after scheme repair
    pub uri: String,
    pub parsed: SipUri,
    pub address: IpAddr,
    /// Port as written; `None` matches any port in address checks
    pub port: Option<u16>,
    pub transport: Transport,
    pub priority: i32,
    pub attrs: DestinationAttrs,
    /// Socket to send from: the `socket` attribute or the configured default
    pub socket: Option<SocketSpec>,
    health: HealthCell,
    load: AtomicU32,
    latency: Mutex<LatencyStats>,
}

impl Destination {
    pub fn new(
        uri: String,
        parsed: SipUri,
        address: IpAddr,
        priority: i32,
        attrs: DestinationAttrs,
        socket: Option<SocketSpec>,
        health: HealthStatus,
    ) -> Self {
        Self {
            port: parsed.port,
            transport: parsed.transport(),
            uri,
            parsed,
            address,
            priority,
            attrs,
            socket,
            health: HealthCell::new(health),
            load: AtomicU32::new(0),
            latency: Mutex::new(LatencyStats::default()),
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.health.load()
    }

    pub(crate) fn set_health(&self, status: HealthStatus) {
        self.health.store(status);
    }

    pub fn is_usable(&self) -> bool {
        self.health().is_usable()
    }

    pub fn duid(&self) -> Option<&str> {
        self.attrs.duid.as_deref()
    }

    /// Calls currently accounted to this destination
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }

    /// Below `maxload`, or unlimited
    pub fn has_capacity(&self) -> bool {
        self.attrs.maxload == 0 || self.load() < self.attrs.maxload
    }

    pub(crate) fn increment_load(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_load(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| load.checked_sub(1));
    }

    pub fn latency(&self) -> LatencyStats {
        self.latency.lock().clone()
    }

    pub(crate) fn record_latency(&self, f: impl FnOnce(&mut LatencyStats)) {
        f(&mut self.latency.lock());
    }
}

/// A group of destinations, ordered by ascending priority
#[derive(Debug)]
pub struct DestinationSet {
    id: SetId,
    destinations: Vec<Destination>,
    weights: Option<Vec<usize>>,
    rr_cursor: AtomicUsize,
    weight_cursor: AtomicUsize,
}

impl DestinationSet {
    pub(crate) fn new(id: SetId, destinations: Vec<Destination>, weights: Option<Vec<usize>>) -> Self {
        Self {
            id,
            destinations,
            weights,
            rr_cursor: AtomicUsize::new(0),
            weight_cursor: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> SetId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn get(&self, index: usize) -> Option<&Destination> {
        self.destinations.get(index)
    }

    /// URIs are compared case-insensitively
    pub fn find_by_uri(&self, uri: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.uri.eq_ignore_ascii_case(uri))
    }

    pub fn find_by_duid(&self, duid: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.duid() == Some(duid))
    }

    /// The weighted distribution table, `None` for unweighted sets
    pub fn weights(&self) -> Option<&[usize]> {
        self.weights.as_deref()
    }

    pub fn round_robin_cursor(&self) -> usize {
        self.rr_cursor.load(Ordering::Acquire)
    }

    /// Move the round-robin cursor past `chosen`, provided it still holds
    /// `seen`. Returns false when another selection advanced it first.
    pub(crate) fn advance_round_robin(&self, seen: usize, chosen: usize) -> bool {
        let len = self.destinations.len().max(1);
        self.rr_cursor
            .compare_exchange(seen, (chosen + 1) % len, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn weighted_cursor(&self) -> usize {
        self.weight_cursor.load(Ordering::Acquire)
    }

    /// Destination index stored in weighted slot `slot`. `None` when the set
    /// is unweighted.
    pub(crate) fn weighted_index(&self, slot: usize) -> Option<usize> {
        self.weights.as_ref()?.get(slot % WEIGHT_SLOTS).copied()
    }

    /// Move the weighted cursor to the slot after `seen`, provided it still
    /// holds `seen`
    pub(crate) fn advance_weighted(&self, seen: usize) -> bool {
        self.weight_cursor
            .compare_exchange(seen, (seen + 1) % WEIGHT_SLOTS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Usable destination among the first `regular` ones with the lowest load
    /// and free capacity, lowest index on ties
    pub fn least_loaded(&self, regular: usize) -> Option<usize> {
        self.destinations
            .iter()
            .take(regular)
            .enumerate()
            .filter(|(_, d)| d.is_usable() && d.has_capacity())
            .min_by_key(|(i, d)| (d.load(), *i))
            .map(|(i, _)| i)
    }
}

/// Build the weighted distribution table for `destinations`.
///
/// A set whose first destination has weight 0 is unweighted. Otherwise each
/// destination index is repeated `weight` times (slots beyond 100 are
/// dropped), the rest is filled with the last index and the table shuffled.
pub fn init_weights<R: RngCore + ?Sized>(destinations: &[Destination], rng: &mut R) -> Option<Vec<usize>> {
    let first = destinations.first()?;
    if first.attrs.weight == 0 {
        return None;
    }

    let mut table = Vec::with_capacity(WEIGHT_SLOTS);
    'fill: for (index, destination) in destinations.iter().enumerate() {
        for _ in 0..destination.attrs.weight {
            if table.len() == WEIGHT_SLOTS {
                break 'fill;
            }
            table.push(index);
        }
    }

    let last = destinations.len() - 1;
    table.resize(WEIGHT_SLOTS, last);
    table.shuffle(rng);
    Some(table)
}
