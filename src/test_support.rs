//! Sample domain shared by unit tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AggregateVersion, Changeset, HandlerError, Position, ReadModel, Signature};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleEvent {
    Created { name: String },
    Touched,
    Renamed { name: String },
    Exploded,
    Ignored,
}

impl SampleEvent {
    pub fn created(name: &str) -> Self {
        SampleEvent::Created {
            name: name.to_string(),
        }
    }
}

/// Counter read model; the const parameter is the schema signature so tests
/// can simulate a code upgrade by switching from `Counter<1>` to `Counter<2>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter<const SIG: Signature> {
    pub id: String,
    pub name: String,
    pub touch_count: u32,
    #[serde(default)]
    pub linked_touches: u32,
}

impl<const SIG: Signature> ReadModel for Counter<SIG> {
    type Event = SampleEvent;

    const NAME: &'static str = "counter";
    const SIGNATURE: Signature = SIG;

    fn create(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            touch_count: 0,
            linked_touches: 0,
        }
    }

    fn apply(&mut self, event: &SampleEvent) -> Result<bool, HandlerError> {
        match event {
            SampleEvent::Created { name } | SampleEvent::Renamed { name } => {
                self.name = name.clone();
                Ok(true)
            }
            SampleEvent::Touched => {
                self.touch_count += 1;
                Ok(true)
            }
            SampleEvent::Exploded => Err(HandlerError::new("exploded")),
            SampleEvent::Ignored => Ok(false),
        }
    }

    fn apply_extra_stream(
        &mut self,
        _aggregate_id: &str,
        event: &SampleEvent,
    ) -> Result<bool, HandlerError> {
        match event {
            SampleEvent::Touched => {
                self.linked_touches += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub type CounterV1 = Counter<1>;
pub type CounterV2 = Counter<2>;

/// Second model type claiming the counter name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impostor {
    pub id: String,
}

impl ReadModel for Impostor {
    type Event = SampleEvent;

    const NAME: &'static str = "counter";
    const SIGNATURE: Signature = 1;

    fn create(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    fn apply(&mut self, _event: &SampleEvent) -> Result<bool, HandlerError> {
        Ok(false)
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Changeset at `epoch() + position` seconds
pub fn changeset(
    aggregate_id: &str,
    aggregate_version: AggregateVersion,
    position: Position,
    events: Vec<SampleEvent>,
) -> Changeset<SampleEvent> {
    Changeset::new(
        aggregate_id,
        aggregate_version,
        position,
        epoch() + Duration::seconds(position),
        events,
    )
}
