//! Read-only views of the registry for management tools

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::health::LatencyStats;
use crate::registry::{Destination, DestinationSet, Generation};
use crate::types::SetId;

/// One destination as listed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationView {
    pub uri: String,
    /// State letter (`A`, `I`, `D`, `T`) followed by `P` when probing, `X` otherwise
    pub flags: String,
    pub priority: i32,
    pub duid: Option<String>,
    pub weight: u32,
    pub maxload: u32,
    /// Calls currently accounted by the call-load tracker
    pub load: u32,
    pub socket: Option<String>,
    pub attrs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyStats>,
}

impl DestinationView {
    fn new(destination: &Destination, with_latency: bool) -> Self {
        Self {
            uri: destination.uri.clone(),
            flags: destination.health().letters(),
            priority: destination.priority,
            duid: destination.attrs.duid.clone(),
            weight: destination.attrs.weight,
            maxload: destination.attrs.maxload,
            load: destination.load(),
            socket: destination.socket.as_ref().map(ToString::to_string),
            attrs: destination.attrs.body.clone(),
            latency: with_latency.then(|| destination.latency()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetView {
    pub id: SetId,
    pub destinations: Vec<DestinationView>,
}

impl SetView {
    fn new(set: &DestinationSet, with_latency: bool) -> Self {
        Self {
            id: set.id(),
            destinations: set
                .destinations()
                .iter()
                .map(|d| DestinationView::new(d, with_latency))
                .collect(),
        }
    }
}

/// Every set of one generation. `Display` renders the text dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryView {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub sets: Vec<SetView>,
}

impl RegistryView {
    pub fn from_generation(generation: &Generation, with_latency: bool) -> Self {
        Self {
            version: generation.version(),
            loaded_at: generation.loaded_at(),
            sets: generation.sets().map(|set| SetView::new(set, with_latency)).collect(),
        }
    }

    pub fn destination_count(&self) -> usize {
        self.sets.iter().map(|s| s.destinations.len()).sum()
    }
}

impl fmt::Display for RegistryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GENERATION: {} loaded {}",
            self.version,
            self.loaded_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        for set in &self.sets {
            writeln!(f, "SET: {}", set.id)?;
            for dst in &set.destinations {
                write!(
                    f,
                    "    URI: {} FLAGS: {} PRIORITY: {} LOAD: {}",
                    dst.uri, dst.flags, dst.priority, dst.load
                )?;
                if !dst.attrs.is_empty() {
                    write!(f, " ATTRS: {}", dst.attrs)?;
                }
                writeln!(f)?;
                if let Some(latency) = &dst.latency {
                    writeln!(
                        f,
                        "        LATENCY: avg={:.3} std={:.3} est={:.3} max={} timeout={}",
                        latency.average, latency.std_dev, latency.estimate, latency.max, latency.timeouts
                    )?;
                }
            }
        }
        Ok(())
    }
}
