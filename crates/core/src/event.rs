//! Event model - immutable records of what was submitted for a decision.

use crate::id::EventId;
use crate::{Metadata, Time};
use serde::{Deserialize, Serialize};

/// An ingested event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,

    /// Caller-supplied type, e.g. "message"
    pub event_type: String,

    /// Fields rules are matched against
    pub metadata: Metadata,

    /// Opaque caller context (user, session, ...)
    pub context: Metadata,

    /// Surface that ingested the event
    pub source: String,

    /// When it was ingested
    pub created_at: Time,
}

/// An event not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Caller-supplied type
    pub event_type: String,
    /// Fields rules are matched against
    pub metadata: Metadata,
    /// Opaque caller context
    pub context: Metadata,
    /// Ingesting surface
    pub source: String,
    /// Ingestion time
    pub created_at: Time,
}

impl NewEvent {
    /// Create a new event.
    pub fn new(event_type: impl Into<String>, metadata: Metadata, context: Metadata) -> Self {
        Self {
            event_type: event_type.into(),
            metadata,
            context,
            source: "decide".to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Set the ingesting surface.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attach the id the store assigned.
    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            event_type: self.event_type,
            metadata: self.metadata,
            context: self.context,
            source: self.source,
            created_at: self.created_at,
        }
    }
}
