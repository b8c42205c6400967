//! Transitions and change notifications.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TypeError};
use crate::ids::{EventId, ServiceId};
use crate::item::ServiceItem;

/// A state change of one item relative to a subscription's template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    /// Matched before, does not match (or no longer exists) after.
    MatchNoMatch,
    /// Did not match (or did not exist) before, matches after.
    NoMatchMatch,
    /// Matched before and after.
    MatchMatch,
}

impl Transition {
    pub fn bit(self) -> u8 {
        match self {
            Transition::MatchNoMatch => TransitionMask::MATCH_NOMATCH,
            Transition::NoMatchMatch => TransitionMask::NOMATCH_MATCH,
            Transition::MatchMatch => TransitionMask::MATCH_MATCH,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::MatchNoMatch => "disappeared",
            Transition::NoMatchMatch => "appeared",
            Transition::MatchMatch => "modified",
        };
        f.write_str(s)
    }
}

/// Set of transitions a subscription wants to hear about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TransitionMask(u8);

impl TransitionMask {
    pub const MATCH_NOMATCH: u8 = 1;
    pub const NOMATCH_MATCH: u8 = 2;
    pub const MATCH_MATCH: u8 = 4;

    const ALL_BITS: u8 = Self::MATCH_NOMATCH | Self::NOMATCH_MATCH | Self::MATCH_MATCH;

    /// Validate a raw mask: non-empty and no unknown bits.
    pub fn new(bits: u8) -> Result<Self> {
        if bits == 0 || bits & !Self::ALL_BITS != 0 {
            return Err(TypeError::InvalidTransitionMask(bits));
        }
        Ok(Self(bits))
    }

    pub fn all() -> Self {
        Self(Self::ALL_BITS)
    }

    pub fn of(transitions: &[Transition]) -> Result<Self> {
        Self::new(transitions.iter().fold(0, |acc, t| acc | t.bit()))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, transition: Transition) -> bool {
        self.0 & transition.bit() != 0
    }
}

impl TryFrom<u8> for TransitionMask {
    type Error = TypeError;

    fn try_from(bits: u8) -> Result<Self> {
        Self::new(bits)
    }
}

impl From<TransitionMask> for u8 {
    fn from(mask: TransitionMask) -> u8 {
        mask.0
    }
}

/// Serializable address of a subscriber.
///
/// The transport layer decides what an endpoint means (a callback URL, a
/// channel name); the registry only stores it and asks the transport to
/// resolve it when there is something to deliver.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerEndpoint(pub String);

impl ListenerEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl fmt::Display for ListenerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification delivered to a subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Identity of the registry that produced the event.
    pub registrar_id: ServiceId,
    pub event_id: EventId,
    /// Strictly increasing per subscription.
    pub sequence: u64,
    pub service_id: ServiceId,
    pub transition: Transition,
    /// Copy of the post-state item; absent when the item went away.
    pub item: Option<ServiceItem>,
    pub handback: Vec<u8>,
}
