//! SIP destination dispatcher for the rvoip stack
//!
//! Routes requests to sets of upstream destinations: a reloadable
//! [`registry`] of destination sets, a [`select`]ion engine with eleven
//! algorithms and per-message failover, a call-[`load`] tracker for
//! least-loaded dispatching, and a [`health`] monitor that probes
//! destinations and takes failing ones out of rotation.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_dispatcher_core::prelude::*;
//!
//! # fn main() -> rvoip_dispatcher_core::Result<()> {
//! let config = DispatcherConfig {
//!     list_file: Some("/etc/dispatcher.list".into()),
//!     failover: true,
//!     ..Default::default()
//! };
//! let dispatcher = Dispatcher::new(config, Arc::new(NoopEventRouter))?;
//! dispatcher.reload_list_file()?;
//!
//! let mut msg = BasicMessage::request("INVITE", "sip:bob@example.com").with_call_id("a84b4c76e66710");
//! let selection = dispatcher.select(&mut msg, 1, Algorithm::HashCallId, UpdateMode::DestinationUri)?;
//! println!("routing to {}", selection.uri);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hash;
pub mod health;
pub mod load;
pub mod logging;
pub mod management;
pub mod message;
pub mod registry;
pub mod select;
pub mod types;
pub mod uri;

pub use config::DispatcherConfig;
pub use dispatcher::{AddressMatch, Dispatcher, DispatcherTasks, MatchMode};
pub use error::{DispatcherError, Result};
pub use health::{
    BroadcastEventRouter, DestinationEvent, DestinationState, EventRouter, HealthStatus, NoopEventRouter, Prober,
    StateRequest,
};
pub use message::{BasicMessage, DispatchMessage};
pub use registry::{Registry, ReloadReport};
pub use select::{Selection, SelectionEngine};
pub use types::{Algorithm, ProbingMode, SetId, SocketSpec, Transport, UpdateMode};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Algorithm, BasicMessage, DispatchMessage, Dispatcher, DispatcherConfig, DispatcherError, EventRouter,
        NoopEventRouter, Result, Selection, SetId, StateRequest, UpdateMode,
    };
}
