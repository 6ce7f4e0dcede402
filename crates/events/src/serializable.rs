use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use meridian_core::EventId;

use crate::event::Event;

/// Transport-safe form of a domain event.
///
/// This is what entities buffer as local events and what the event bus
/// carries. The typed event is serialized once, when it is raised; the
/// resulting value is immutable (fields are private, there are no setters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableEvent {
    event_id: EventId,
    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    /// Key of the entity that raised the event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,

    data: JsonValue,
}

impl SerializableEvent {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            event_version: 1,
            occurred_at: Utc::now(),
            source: None,
            data,
        }
    }

    /// Serialize a typed domain event, capturing its metadata.
    pub fn from_typed<E>(event: &E) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let data = serde_json::to_value(event)?;
        Ok(Self {
            event_id: EventId::new(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            source: None,
            data,
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    /// Deserialize the payload back into a typed event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

impl Event for SerializableEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn version(&self) -> u32 {
        self.event_version
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
