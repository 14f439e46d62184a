//! Per-message failover stack
//!
//! Selection records the chosen destination as the current one and pushes
//! the alternates so that they pop in cyclic order after the chosen index,
//! with the reserved default slot last:
//!
//! ```text
//!   set:   [0] [1] [2] [3] [4] [default]      chosen = 2
//!   pop:    3 -> 4 -> 0 -> 1 -> default
//! ```
//!
//! The chosen destination itself is never pushed, so a failover never offers
//! the destination that just failed.

use serde::{Deserialize, Serialize};

use crate::types::{SetId, SocketSpec};

/// A destination recorded on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub group: SetId,
    pub uri: String,
    pub socket: Option<SocketSpec>,
    /// Raw attribute body of the destination
    pub attrs: String,
    pub duid: Option<String>,
}

/// LIFO list of alternates for one in-flight message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverStack {
    entries: Vec<FailoverEntry>,
}

impl FailoverStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FailoverEntry) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<FailoverEntry> {
        self.entries.pop()
    }

    /// Next entry `pop` would return
    pub fn peek(&self) -> Option<&FailoverEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in pop order
    pub fn iter(&self) -> impl Iterator<Item = &FailoverEntry> {
        self.entries.iter().rev()
    }

    /// Remove and return every entry in pop order
    pub fn drain(&mut self) -> Vec<FailoverEntry> {
        let mut drained: Vec<FailoverEntry> = self.entries.drain(..).collect();
        drained.reverse();
        drained
    }
}

/// Indexes of the alternates for `chosen`, in the order they are pushed.
///
/// `regular` is the number of non-default slots; `default` is the reserved
/// slot if one is configured. `eligible` filters out unusable destinations.
pub(crate) fn push_order(
    chosen: usize,
    regular: usize,
    default: Option<usize>,
    eligible: impl Fn(usize) -> bool,
) -> Vec<usize> {
    let mut order = Vec::with_capacity(regular + 1);

    if let Some(default) = default {
        if default != chosen && eligible(default) {
            order.push(default);
        }
    }

    if chosen < regular {
        // below the chosen one, then above it, both descending
        order.extend((0..chosen).rev().filter(|&i| eligible(i)));
        order.extend((chosen + 1..regular).rev().filter(|&i| eligible(i)));
    } else {
        // the default itself was chosen: every regular slot, lowest pops first
        order.extend((0..regular).rev().filter(|&i| eligible(i)));
    }

    order
}
