//! # Destination registry
//!
//! The registry owns every destination set. Readers take a snapshot of the
//! current [`Generation`]; a reload builds the next generation in isolation
//! and publishes it with one atomic pointer swap:
//!
//! ```text
//!   reload():  rows ──> GenerationBuilder ──> reindex + weights ──> store()
//!                                                                     │
//!   select():  snapshot() ──────────────> Arc<Generation> <───────────┘
//! ```
//!
//! A generation is dropped once the last reader holding it is done. Only one
//! reload may run at a time; a second one fails with
//! [`DispatcherError::ReloadInProgress`].

pub mod destination;
pub mod resolver;
pub mod source;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DispatcherError, Result};
use crate::health::HealthStatus;
use crate::types::{SetId, SocketSpec};
use crate::uri::{SipUri, MAX_HOST_LEN};

pub use destination::{init_weights, Destination, DestinationAttrs, DestinationSet, WEIGHT_SLOTS};
pub use resolver::{HostResolver, StaticResolver, SystemResolver};
pub use source::{DestinationRow, DestinationSource, ListFileSource, SchemaVersion, StaticSource};

/// Registry settings applied while rows are loaded
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Accept IPv6 destinations
    pub try_ipv6: bool,
    /// Socket for destinations without a `socket` attribute
    pub default_socket: Option<SocketSpec>,
    /// Seed for the weighted table shuffle, random when unset
    pub rng_seed: Option<u64>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            try_ipv6: true,
            default_socket: None,
            rng_seed: None,
        }
    }
}

/// One complete, immutable set of destination groups
#[derive(Debug)]
pub struct Generation {
    version: u64,
    loaded_at: DateTime<Utc>,
    sets: BTreeMap<SetId, DestinationSet>,
}

impl Generation {
    pub fn empty() -> Self {
        Self {
            version: 0,
            loaded_at: Utc::now(),
            sets: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn lookup(&self, group: SetId) -> Option<&DestinationSet> {
        self.sets.get(&group)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Sets in ascending group order
    pub fn sets(&self) -> impl Iterator<Item = &DestinationSet> {
        self.sets.values()
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn destination_count(&self) -> usize {
        self.sets.values().map(DestinationSet::len).sum()
    }
}

/// Outcome of a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub version: u64,
    pub sets: usize,
    pub destinations: usize,
    /// Rows dropped because they could not be parsed or resolved
    pub skipped_rows: usize,
    /// IPv6 rows dropped because IPv6 is disabled
    pub skipped_ipv6: usize,
}

impl ReloadReport {
    /// Some rows were left out
    pub fn is_partial(&self) -> bool {
        self.skipped_rows > 0 || self.skipped_ipv6 > 0
    }
}

enum RowOutcome {
    Added,
    SkippedIpv6,
}

/// Collects rows of the next generation, grouped and priority ordered
struct GenerationBuilder<'a> {
    options: &'a RegistryOptions,
    resolver: &'a dyn HostResolver,
    pending: BTreeMap<SetId, Vec<Destination>>,
}

impl<'a> GenerationBuilder<'a> {
    fn new(options: &'a RegistryOptions, resolver: &'a dyn HostResolver) -> Self {
        Self {
            options,
            resolver,
            pending: BTreeMap::new(),
        }
    }

    fn add_row(&mut self, row: DestinationRow) -> Result<RowOutcome> {
        let (parsed, fixed) = SipUri::parse_lenient(&row.uri)?;
        let uri = if fixed {
            info!("uri without scheme, using {}", parsed);
            parsed.to_string()
        } else {
            row.uri.trim().to_string()
        };

        if parsed.host.len() > MAX_HOST_LEN {
            return Err(DispatcherError::invalid_uri(uri, "hostname too long"));
        }
        if parsed.is_ipv6_reference() && !self.options.try_ipv6 {
            warn!("ipv6 disabled, skipping destination {}", uri);
            return Ok(RowOutcome::SkippedIpv6);
        }

        let attrs = DestinationAttrs::parse(&row.attrs)?;
        let address = self.resolver.resolve(parsed.bare_host(), parsed.port_or_default())?;
        let socket = attrs.socket.clone().or_else(|| self.options.default_socket.clone());

        let destination = Destination::new(
            uri,
            parsed,
            address,
            row.priority,
            attrs,
            socket,
            HealthStatus::from_row_flags(row.flags),
        );

        // stable: equal priorities keep insertion order
        let list = self.pending.entry(row.group).or_default();
        let position = list
            .iter()
            .position(|d| d.priority > row.priority)
            .unwrap_or(list.len());
        list.insert(position, destination);

        Ok(RowOutcome::Added)
    }

    /// Turn every group into a contiguous set and compute its weight table
    fn build<R: RngCore + ?Sized>(self, version: u64, rng: &mut R) -> Result<Generation> {
        let mut sets = BTreeMap::new();
        for (id, pending) in self.pending {
            let mut destinations = Vec::new();
            destinations
                .try_reserve_exact(pending.len())
                .map_err(|e| DispatcherError::Resource(format!("set {}: {}", id, e)))?;
            destinations.extend(pending);

            let weights = init_weights(&destinations, rng);
            sets.insert(id, DestinationSet::new(id, destinations, weights));
        }

        Ok(Generation {
            version,
            loaded_at: Utc::now(),
            sets,
        })
    }
}

struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Holder of the published generation
pub struct Registry {
    current: ArcSwap<Generation>,
    reloading: AtomicBool,
    next_version: AtomicU64,
    options: RegistryOptions,
    resolver: Arc<dyn HostResolver>,
    rng: Mutex<StdRng>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        Self::with_resolver(options, Arc::new(SystemResolver))
    }

    pub fn with_resolver(options: RegistryOptions, resolver: Arc<dyn HostResolver>) -> Self {
        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            current: ArcSwap::from_pointee(Generation::empty()),
            reloading: AtomicBool::new(false),
            next_version: AtomicU64::new(1),
            options,
            resolver,
            rng: Mutex::new(rng),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// The generation currently serving
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::Acquire)
    }

    /// Load every row of `source` into a new generation and publish it.
    ///
    /// Bad rows are skipped and counted. A source that cannot be read, or a
    /// failure while building the sets, leaves the previous generation in
    /// place.
    pub fn reload(&self, source: &mut dyn DestinationSource) -> Result<ReloadReport> {
        if self
            .reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("dispatcher reload requested while another one is running");
            return Err(DispatcherError::ReloadInProgress);
        }
        let _guard = ReloadGuard(&self.reloading);

        let schema = source.schema_version();
        debug!("loading destinations, schema {:?}", schema);
        let rows = source.load_rows()?;

        let mut report = ReloadReport::default();
        let mut builder = GenerationBuilder::new(&self.options, self.resolver.as_ref());
        for row in rows {
            let outcome = row.and_then(|row| {
                let row = row.restrict_to(schema);
                let uri = row.uri.clone();
                builder.add_row(row).map_err(|e| {
                    DispatcherError::Config(format!("{}: {}", uri, e))
                })
            });
            match outcome {
                Ok(RowOutcome::Added) => report.destinations += 1,
                Ok(RowOutcome::SkippedIpv6) => report.skipped_ipv6 += 1,
                Err(e) => {
                    warn!("skipping destination row: {}", e);
                    report.skipped_rows += 1;
                }
            }
        }

        let version = self.next_version.fetch_add(1, Ordering::AcqRel);
        let generation = {
            let mut rng = self.rng.lock();
            builder.build(version, &mut *rng)?
        };

        report.version = version;
        report.sets = generation.set_count();
        if generation.is_empty() {
            warn!("no valid destinations loaded, dispatcher list is empty");
        }

        self.current.store(Arc::new(generation));
        info!(
            "dispatcher list version {} published: {} sets, {} destinations, {} rows skipped",
            version, report.sets, report.destinations, report.skipped_rows
        );

        Ok(report)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let generation = self.snapshot();
        f.debug_struct("Registry")
            .field("version", &generation.version())
            .field("sets", &generation.set_count())
            .field("reloading", &self.is_reloading())
            .finish()
    }
}
