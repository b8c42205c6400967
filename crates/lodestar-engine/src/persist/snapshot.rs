//! Snapshot record stream.

use lodestar_types::ServiceId;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::config::RegistryPolicy;
use crate::error::StoreError;
use crate::events::EventReg;
use crate::index::ServiceReg;
use crate::persist::framing::Frame;

/// Scalar state stored at the head of every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub registrar_id: ServiceId,
    pub next_event_id: u64,
    /// Last log sequence folded into this snapshot
    pub log_sequence: u64,
    pub policy: RegistryPolicy,
}

/// `registry.snapshot` is a header, the services, a sentinel, the events and
/// a final sentinel, in that order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub(crate) enum SnapshotRecord<'a> {
    Header(SnapshotHeader),
    Service(Cow<'a, ServiceReg>),
    ServicesEnd,
    Event(Cow<'a, EventReg>),
    EventsEnd,
}

/// A fully read snapshot.
#[derive(Debug)]
pub(crate) struct Snapshot {
    pub header: SnapshotHeader,
    pub services: Vec<ServiceReg>,
    pub events: Vec<EventReg>,
}

impl Snapshot {
    /// Check the record order and collect the contents.
    pub fn assemble(
        frames: Vec<Frame<SnapshotRecord<'static>>>,
        file: &str,
    ) -> Result<Self, StoreError> {
        #[derive(Clone, Copy)]
        enum Stage {
            Header,
            Services,
            Events,
            Done,
        }

        let mut stage = Stage::Header;
        let mut header = None;
        let mut services = Vec::new();
        let mut events = Vec::new();

        for frame in frames {
            let offset = frame.offset;
            match (stage, frame.record) {
                (Stage::Header, SnapshotRecord::Header(h)) => {
                    header = Some(h);
                    stage = Stage::Services;
                }
                (Stage::Services, SnapshotRecord::Service(reg)) => services.push(reg.into_owned()),
                (Stage::Services, SnapshotRecord::ServicesEnd) => stage = Stage::Events,
                (Stage::Events, SnapshotRecord::Event(reg)) => events.push(reg.into_owned()),
                (Stage::Events, SnapshotRecord::EventsEnd) => stage = Stage::Done,
                _ => {
                    return Err(StoreError::Corruption {
                        file: file.to_string(),
                        offset,
                        reason: "snapshot record out of order".into(),
                    })
                }
            }
        }

        match (stage, header) {
            (Stage::Done, Some(header)) => Ok(Self {
                header,
                services,
                events,
            }),
            _ => Err(StoreError::Corruption {
                file: file.to_string(),
                offset: 0,
                reason: "snapshot ends before its final sentinel".into(),
            }),
        }
    }
}
