//! Alert and notification emitter.
//!
//! Every engine event is wrapped in an [`EventEnvelope`], routed to delivery
//! channels by severity, broadcast to subscribers (dashboard backend, webhook
//! and email relays) and kept in a bounded ring for dashboard queries.
//! Delivery itself belongs to the subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use testfarm_events::{EventEnvelope, EventEnvelopeBuilder};
use testfarm_id::EventId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::Clock;

/// An event with its payload erased to JSON.
pub type EngineEvent = EventEnvelope<serde_json::Value>;

const CHANNEL_CAPACITY: usize = 1024;

struct EmitterInner {
    tx: broadcast::Sender<EngineEvent>,
    next_id: AtomicU64,
    recent: Mutex<VecDeque<EngineEvent>>,
    recent_limit: usize,
    clock: Arc<dyn Clock>,
}

/// Cheaply cloneable event publisher.
#[derive(Clone)]
pub struct AlertEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for AlertEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEmitter")
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .field("recent_limit", &self.inner.recent_limit)
            .finish()
    }
}

impl AlertEmitter {
    pub fn new(clock: Arc<dyn Clock>, recent_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EmitterInner {
                tx,
                next_id: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::new()),
                recent_limit: recent_limit.max(1),
                clock,
            }),
        }
    }

    /// Stamp, publish and remember an event.
    ///
    /// Emission never fails the caller: a malformed event is logged and
    /// dropped.
    pub fn emit<P: Serialize>(&self, builder: EventEnvelopeBuilder<P>) -> Option<EventId> {
        let id = EventId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        let event = match builder
            .event_id(id)
            .occurred_at(self.inner.clock.now())
            .build()
            .and_then(|e| e.into_json())
        {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, event_id = %id, "Dropping malformed event");
                return None;
            }
        };

        debug!(
            event_id = %id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            severity = ?event.severity,
            "Emitting event"
        );

        {
            let mut recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
            recent.push_back(event.clone());
            while recent.len() > self.inner.recent_limit {
                recent.pop_front();
            }
        }

        // No subscribers is fine; the ring still has it.
        let _ = self.inner.tx.send(event);
        Some(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.tx.subscribe()
    }

    /// Newest-last recent events, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<EngineEvent> {
        let recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Recent events of one type, newest last.
    pub fn recent_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        let recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use testfarm_events::{
        event_types, AggregateType, Channel, MaintenanceChangedPayload, Severity,
    };
    use testfarm_id::ResourceId;

    fn emitter(limit: usize) -> AlertEmitter {
        AlertEmitter::new(Arc::new(ManualClock::fixed()), limit)
    }

    fn maintenance(on: bool) -> EventEnvelopeBuilder<MaintenanceChangedPayload> {
        EventEnvelope::builder()
            .aggregate(AggregateType::Resource, "H1")
            .event_type(event_types::RESOURCE_MAINTENANCE_CHANGED)
            .payload(MaintenanceChangedPayload {
                resource_id: ResourceId::parse("H1").unwrap(),
                maintenance_mode: on,
            })
    }

    #[tokio::test]
    async fn test_emit_broadcasts_with_monotonic_ids() {
        let emitter = emitter(10);
        let mut rx = emitter.subscribe();

        let first = emitter.emit(maintenance(true)).unwrap();
        let second = emitter
            .emit(maintenance(false).severity(Severity::Critical))
            .unwrap();
        assert!(second > first);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.event_id, first);
        assert_eq!(b.channels, Severity::Critical.channels());
        assert!(b.channels.contains(&Channel::Email));
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let emitter = emitter(2);
        for _ in 0..5 {
            emitter.emit(maintenance(true));
        }
        let recent = emitter.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event_id, EventId::new(5));
    }

    #[test]
    fn test_malformed_event_is_dropped() {
        let emitter = emitter(2);
        let missing_type = EventEnvelope::builder()
            .aggregate(AggregateType::Resource, "H1")
            .payload(serde_json::json!({}));
        assert!(emitter.emit(missing_type).is_none());
        assert!(emitter.recent(10).is_empty());
    }
}
