//! Lodestar Types - shared data model for the lookup registry
//!
//! This crate holds everything that crosses the boundary between the registry
//! engine and the transport layer that invokes it:
//!
//! - **Structural types**: [`ServiceType`] and [`EntryClass`] descriptors whose
//!   identity is a content hash, never a pointer
//! - **Attributes**: [`Entry`] instances carrying ordered [`AttrValue`] fields
//! - **Items and templates**: [`ServiceItem`] registrations and the
//!   [`ServiceTemplate`] queries matched against them
//! - **Events**: [`TransitionMask`], [`ServiceEvent`] and the
//!   [`ListenerEndpoint`] a subscriber is reached through
//!
//! Nothing here is async and nothing here owns state; the engine crate builds
//! its indexes on top of these values.

#![deny(unsafe_code)]

pub mod class;
pub mod entry;
pub mod error;
pub mod event;
pub mod ids;
pub mod item;
pub mod template;
pub mod value;

pub use class::{EntryClass, FieldDesc, ServiceType};
pub use entry::Entry;
pub use error::{Result, TypeError};
pub use event::{ListenerEndpoint, ServiceEvent, Transition, TransitionMask};
pub use ids::{EventId, LeaseId, ServiceId};
pub use item::ServiceItem;
pub use template::ServiceTemplate;
pub use value::AttrValue;
