//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_id::{EventId, RequestId};

use crate::{Channel, EventError, Severity};

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human operator (maintenance, intervention clearing).
    Operator,
    /// A requester: build job, VM request or test request.
    Requester,
    /// The engine itself (health monitor, reaper, sequencer).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Operator => write!(f, "operator"),
            ActorType::Requester => write!(f, "requester"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    #[default]
    Resource,
    Reservation,
    Group,
    Pipeline,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Resource => "resource",
            AggregateType::Reservation => "reservation",
            AggregateType::Group => "group",
            AggregateType::Pipeline => "pipeline",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Monotonic event identifier, per engine process.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "resource.status_changed").
    pub event_type: String,

    /// Severity of the event.
    pub severity: Severity,

    /// Channels the event should be delivered to.
    pub channels: Vec<Channel>,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Identifier of the actor.
    pub actor_id: String,

    /// Request that led to this event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Grouping ID for related events (e.g. a pipeline id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Erases the payload type so heterogeneous events can share a channel.
    pub fn into_json(self) -> Result<EventEnvelope<serde_json::Value>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            severity: self.severity,
            channels: self.channels,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Decodes the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::InvalidPayload(e.to_string()))
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    severity: Severity,
    channels: Option<Vec<Channel>>,
    actor_type: ActorType,
    actor_id: Option<String>,
    request_id: Option<RequestId>,
    correlation_id: Option<String>,
    payload: Option<P>,
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            aggregate_type: None,
            aggregate_id: None,
            event_type: None,
            severity: Severity::Info,
            channels: None,
            actor_type: ActorType::System,
            actor_id: None,
            request_id: None,
            correlation_id: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, aggregate_type: AggregateType, id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type);
        self.aggregate_id = Some(id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Overrides the severity-derived channel routing.
    pub fn channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope. `actor_id` defaults to `"engine"`.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        let severity = self.severity;
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            severity,
            channels: self.channels.unwrap_or_else(|| severity.channels()),
            actor_type: self.actor_type,
            actor_id: self.actor_id.unwrap_or_else(|| "engine".to_string()),
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, MaintenanceChangedPayload};
    use testfarm_id::ResourceId;

    fn payload() -> MaintenanceChangedPayload {
        MaintenanceChangedPayload {
            resource_id: ResourceId::parse("H1").unwrap(),
            maintenance_mode: true,
        }
    }

    #[test]
    fn test_builder_routes_by_severity() {
        let env = EventEnvelope::builder()
            .event_id(EventId::new(7))
            .aggregate(AggregateType::Resource, "H1")
            .event_type(event_types::RESOURCE_MAINTENANCE_CHANGED)
            .severity(Severity::Warning)
            .payload(payload())
            .build()
            .unwrap();

        assert_eq!(env.channels, vec![Channel::Dashboard, Channel::Webhook]);
        assert_eq!(env.actor_type, ActorType::System);
        assert_eq!(env.actor_id, "engine");
    }

    #[test]
    fn test_builder_requires_event_type() {
        let err = EventEnvelope::builder()
            .event_id(EventId::new(1))
            .aggregate(AggregateType::Resource, "H1")
            .payload(payload())
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField("event_type")));
    }

    #[test]
    fn test_into_json_and_back() {
        let env = EventEnvelope::builder()
            .event_id(EventId::new(1))
            .aggregate(AggregateType::Resource, "H1")
            .event_type(event_types::RESOURCE_MAINTENANCE_CHANGED)
            .actor(ActorType::Operator, "alice")
            .payload(payload())
            .build()
            .unwrap()
            .into_json()
            .unwrap();

        assert_eq!(env.payload["maintenance_mode"], serde_json::json!(true));
        let decoded: MaintenanceChangedPayload = env.payload_as().unwrap();
        assert_eq!(decoded, payload());
    }
}
