//! Lodestar Engine - lease-based service lookup registry
//!
//! The engine keeps a single-node, authoritative registry of service items:
//!
//! - **Index & matching**: registrations are indexed by id, expiration, type
//!   name and attribute value; a small planner picks the cheapest index for
//!   each [`ServiceTemplate`](lodestar_types::ServiceTemplate)
//! - **Leases**: every registration and subscription is held by a lease whose
//!   ceiling adapts to the population
//! - **Events**: subscribers hear about items appearing, disappearing or
//!   changing relative to their template, in order, per subscription
//! - **Persistence**: a CRC-framed command log plus periodic snapshots,
//!   replayed on open
//! - **Concurrency**: one reader/writer lock with a priority class for lease
//!   renewal, and background tasks for expiry and snapshotting
//!
//! The engine has no network surface. A transport opens a [`Registry`],
//! calls its operations on behalf of remote clients and supplies a
//! [`ListenerConnector`] through which events reach subscribers.

#![deny(unsafe_code)]

pub mod clock;
pub mod config;
mod daemons;
mod dispatch;
pub mod error;
pub mod events;
pub mod index;
pub mod lease;
pub mod listener;
mod lock;
pub mod matching;
pub mod persist;
mod registry;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RegistryConfig, RegistryPolicy};
pub use error::{RegistryError, Result, StoreError};
pub use lease::{Lease, LeaseCeilings, LeasePolicy, LeaseTarget};
pub use listener::{DeliveryError, EventListener, ListenerConnector, UnreachableConnector};
pub use matching::Matches;
pub use persist::{SnapshotPolicy, SyncMode};
pub use registry::{Registration, Registry, RegistryMetrics, Subscription};
pub use state::{AttributeEdit, SEQUENCE_RECOVERY_OFFSET};
