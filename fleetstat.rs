//! # Fleetstat - Fleet-Wide Metrics Control Plane
//!
//! A coordinator directs a dynamic population of instrumenter agents (which
//! sample raw counters on individual hosts) and aggregator agents (which merge
//! per-host samples into fleet-wide statistics) over a publish/subscribe bus.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  REQUEST LAYER → COORDINATOR SERVICE → PROTOCOL ENGINE ⇄ REGISTRY         │
//! │                          │  (fan-out cmd-*)      ▲ (fan-in ack-*)         │
//! │                          ▼                       │                        │
//! │        TRANSPORT ─── INSTRUMENTERS (metric model) ─── data ──► AGGREGATOR │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`metric`]: predicates, cartesian field expansion, bucketizers, reduction.
//! - [`agent`]: the `Metric` trait and the instrumenter/aggregator runtimes.
//! - [`registry`]: known agents and the merged metric catalog.
//! - [`coordinator`]: the instrumentation lifecycle state machine.
//! - [`service`]: the single-task event loop that owns the coordinator.

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod descriptors;
pub mod error;
pub mod logging;
pub mod message;
pub mod metric;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

pub use config::FleetConfig;
pub use coordinator::{Coordinator, InstrumentationSpec};
pub use error::{FleetError, FleetResult, RequestError};
pub use message::{Envelope, Message};
pub use metric::{Predicate, ReducedValue};
pub use registry::Registry;
pub use service::{CoordinatorHandle, CoordinatorService};
pub use transport::{LocalBus, Publisher, Transport};
pub use types::{InstId, Timestamp};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version - follows semantic versioning
pub const FLEETSTAT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FLEETSTAT_NAME: &str = "fleetstat";
pub const FLEETSTAT_FULL_NAME: &str = "Fleetstat Metrics Control Plane";

// ----------------------------------------------------------------------------
// Routing keys
// ----------------------------------------------------------------------------

/// Default prefix for every routing key on the bus
pub const DEFAULT_KEY_BASE: &str = "fleetstat";

/// Suffix of the coordinator's well-known routing key
pub const COORDINATOR_KEY_SUFFIX: &str = "config";

/// Suffix of the key every agent binds for broadcast commands
pub const BROADCAST_KEY_SUFFIX: &str = "all";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// How long a creation attempt may wait for acks (seconds)
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 30;

/// Smallest accepted ack timeout (seconds)
pub const MIN_ACK_TIMEOUT_SECS: u64 = 1;

/// How often the coordinator sweeps for expired creation attempts (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// How often instrumenters report values (milliseconds)
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 1000;

/// Smallest accepted report interval (milliseconds)
pub const MIN_REPORT_INTERVAL_MS: u64 = 100;

// ----------------------------------------------------------------------------
// Queues & Retention
// ----------------------------------------------------------------------------

/// Capacity of the request-layer → coordinator queue
pub const DEFAULT_REQUEST_QUEUE: usize = 1024;

/// Number of per-second samples an aggregator keeps per instrumentation
pub const DEFAULT_RETAIN_SAMPLES: usize = 600;

/// Name of the identity field every instrumenter metric carries
pub const HOSTNAME_FIELD: &str = "hostname";

/// Derive the routing key of an agent or coordinator
pub fn routing_key(key_base: &str, suffix: &str) -> String {
    format!("{}.{}", key_base, suffix)
}
