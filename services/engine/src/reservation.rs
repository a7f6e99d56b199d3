//! Reservation manager.
//!
//! The reservation manager is the only writer of capacity fields
//! (`allocated`, `active_reservations`) in the registry. Every grant,
//! release and expiry for a resource runs inside that resource's lock, so
//! the sufficiency check and the decrement of free capacity are one
//! critical section and grants on one resource are strictly serialized.
//!
//! Boards are exclusive: at most one active reservation, whatever slice was
//! asked for. A board's `Available`/`InUse` flip happens here too, because it
//! mirrors the lock rather than health evidence.
//!
//! No connector is ever called while a resource lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::{
    event_types, AggregateType, EventEnvelope, ReservationPayload, ResourceStatus, Severity,
};
use testfarm_id::{ReservationId, ResourceId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::alerts::AlertEmitter;
use crate::clock::{self, Clock};
use crate::error::{CapacityError, EngineError};
use crate::model::{
    Holder, Reservation, ReservationPurpose, ReservedSlice, Resource, ResourceSlice,
};
use crate::registry::Registry;

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    UnknownResource,
    Maintenance,
    NeedsIntervention,
    NotAllocatable { status: ResourceStatus },
    BoardBusy { holder: String },
    SlotsExhausted { limit: u32 },
    InsufficientCapacity {
        requested: ResourceSlice,
        available: ResourceSlice,
    },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownResource => f.write_str("resource is not registered"),
            Self::Maintenance => f.write_str("resource is in maintenance"),
            Self::NeedsIntervention => f.write_str("resource needs manual intervention"),
            Self::NotAllocatable { status } => write!(f, "resource status is {status}"),
            Self::BoardBusy { holder } => write!(f, "board is held by {holder}"),
            Self::SlotsExhausted { limit } => write!(f, "all {limit} reservation slots are taken"),
            Self::InsufficientCapacity {
                requested,
                available,
            } => write!(f, "requested {requested}, only {available} free"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("reservation of {resource_id} denied: {reason}")]
pub struct ReservationDenied {
    pub resource_id: ResourceId,
    pub reason: DenyReason,
}

impl ReservationDenied {
    pub fn into_capacity_error(self, alternatives: Vec<ResourceId>) -> CapacityError {
        CapacityError {
            reason: self.to_string(),
            resource_id: Some(self.resource_id),
            alternatives,
        }
    }
}

/// Grants, renews, releases and expires reservations.
pub struct ReservationManager {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    alerts: AlertEmitter,
    locks: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
    active: RwLock<HashMap<ReservationId, Reservation>>,
}

impl ReservationManager {
    pub fn new(registry: Arc<Registry>, clock: Arc<dyn Clock>, alerts: AlertEmitter) -> Self {
        Self {
            registry,
            clock,
            alerts,
            locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &ResourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Reserve `slice` of a resource (the whole board for boards).
    pub async fn reserve(
        &self,
        resource_id: &ResourceId,
        slice: ResourceSlice,
        ttl: Duration,
        holder: Holder,
    ) -> Result<Reservation, ReservationDenied> {
        self.reserve_for(resource_id, slice, ttl, holder, ReservationPurpose::Request)
            .await
    }

    #[instrument(skip(self, slice, holder), fields(holder = %holder.requester))]
    pub(crate) async fn reserve_for(
        &self,
        resource_id: &ResourceId,
        slice: ResourceSlice,
        ttl: Duration,
        holder: Holder,
        purpose: ReservationPurpose,
    ) -> Result<Reservation, ReservationDenied> {
        let lock = self.lock_for(resource_id);
        let _guard = lock.lock().await;

        let now = self.clock.now();
        self.expire_resource_locked(resource_id, now).await;

        let deny = |reason: DenyReason| ReservationDenied {
            resource_id: resource_id.clone(),
            reason,
        };

        let resource = self
            .registry
            .get(resource_id)
            .await
            .ok_or_else(|| deny(DenyReason::UnknownResource))?;

        if let Err(reason) = self.check_grantable(&resource, &slice).await {
            warn!(
                resource_id = %resource_id,
                reason = %reason,
                "Reservation denied"
            );
            return Err(deny(reason));
        }

        let reserved = if resource.is_board() {
            ReservedSlice::ExclusiveBoard
        } else {
            ReservedSlice::Capacity(slice)
        };

        let reservation = Reservation {
            id: ReservationId::new(),
            resource_id: resource_id.clone(),
            kind: resource.kind(),
            holder,
            slice: reserved,
            purpose,
            created_at: now,
            expires_at: clock::after(now, ttl),
        };

        let applied = self
            .registry
            .update(resource_id, |r| {
                let held = reserved.capacity();
                r.allocated = r.allocated.checked_add(&held).unwrap_or(r.capacity.as_slice());
                r.active_reservations += 1;
                if r.is_board() && r.status == ResourceStatus::Available {
                    r.status = ResourceStatus::InUse;
                }
            })
            .await;
        if applied.is_none() {
            return Err(deny(DenyReason::UnknownResource));
        }

        self.active
            .write()
            .await
            .insert(reservation.id, reservation.clone());

        info!(
            reservation_id = %reservation.id,
            resource_id = %resource_id,
            holder = %reservation.holder.requester,
            expires_at = %reservation.expires_at,
            "Reservation granted"
        );
        self.emit(&reservation, event_types::RESERVATION_GRANTED, Severity::Info);

        Ok(reservation)
    }

    async fn check_grantable(&self, resource: &Resource, slice: &ResourceSlice) -> Result<(), DenyReason> {
        if resource.maintenance_mode || resource.status == ResourceStatus::Maintenance {
            return Err(DenyReason::Maintenance);
        }
        if resource.needs_intervention {
            return Err(DenyReason::NeedsIntervention);
        }
        if resource.is_board() && resource.active_reservations > 0 {
            let holder = self
                .active
                .read()
                .await
                .values()
                .find(|r| r.resource_id == resource.id)
                .map(|r| r.holder.requester.clone())
                .unwrap_or_else(|| "another reservation".to_string());
            return Err(DenyReason::BoardBusy { holder });
        }
        if !resource.status.is_allocatable(resource.kind()) {
            return Err(DenyReason::NotAllocatable {
                status: resource.status,
            });
        }
        if resource.active_reservations >= resource.slot_limit() {
            return Err(DenyReason::SlotsExhausted {
                limit: resource.slot_limit(),
            });
        }
        if !resource.is_board() && !slice.fits_within(&resource.available()) {
            return Err(DenyReason::InsufficientCapacity {
                requested: *slice,
                available: resource.available(),
            });
        }
        Ok(())
    }

    /// Release a reservation.
    ///
    /// Returns false, without side effects, for unknown or already released
    /// ids.
    pub async fn release(&self, id: &ReservationId) -> bool {
        let Some(resource_id) = self
            .active
            .read()
            .await
            .get(id)
            .map(|r| r.resource_id.clone())
        else {
            return false;
        };

        let lock = self.lock_for(&resource_id);
        let _guard = lock.lock().await;

        // A concurrent release may have won the race for the lock.
        let Some(reservation) = self.active.write().await.remove(id) else {
            return false;
        };
        self.restore_locked(&reservation).await;

        info!(
            reservation_id = %id,
            resource_id = %resource_id,
            holder = %reservation.holder.requester,
            "Reservation released"
        );
        self.emit(&reservation, event_types::RESERVATION_RELEASED, Severity::Info);
        true
    }

    /// Renew an active reservation for `ttl` from now.
    pub async fn extend(&self, id: &ReservationId, ttl: Duration) -> Option<Reservation> {
        let now = self.clock.now();
        let mut active = self.active.write().await;
        let reservation = active.get_mut(id)?;
        if reservation.is_expired(now) {
            return None;
        }

        reservation.expires_at = clock::after(now, ttl);
        info!(
            reservation_id = %id,
            expires_at = %reservation.expires_at,
            "Reservation extended"
        );
        Some(reservation.clone())
    }

    /// Release every reservation whose ttl ran out.
    ///
    /// The holder never released these, so each one is treated as abandoned.
    pub async fn expire_due(&self) -> Vec<Reservation> {
        let now = self.clock.now();
        let mut resources: Vec<ResourceId> = self
            .active
            .read()
            .await
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.resource_id.clone())
            .collect();
        resources.sort();
        resources.dedup();

        let mut expired = Vec::new();
        for resource_id in resources {
            let lock = self.lock_for(&resource_id);
            let _guard = lock.lock().await;
            expired.extend(self.expire_resource_locked(&resource_id, now).await);
        }
        expired
    }

    async fn expire_resource_locked(&self, resource_id: &ResourceId, now: DateTime<Utc>) -> Vec<Reservation> {
        let expired: Vec<Reservation> = {
            let mut active = self.active.write().await;
            let ids: Vec<ReservationId> = active
                .values()
                .filter(|r| &r.resource_id == resource_id && r.is_expired(now))
                .map(|r| r.id)
                .collect();
            ids.iter().filter_map(|id| active.remove(id)).collect()
        };

        for reservation in &expired {
            self.restore_locked(reservation).await;
            error!(
                reservation_id = %reservation.id,
                resource_id = %reservation.resource_id,
                holder = %reservation.holder.requester,
                expired_at = %reservation.expires_at,
                "Reservation expired without release, holder abandoned it"
            );
            self.emit(reservation, event_types::RESERVATION_EXPIRED, Severity::Critical);
        }
        expired
    }

    /// Give a reservation's slice back. Caller holds the resource lock.
    async fn restore_locked(&self, reservation: &Reservation) {
        let held = reservation.slice.capacity();
        let restored = self
            .registry
            .update(&reservation.resource_id, |r| {
                r.allocated = r.allocated.saturating_sub(&held);
                r.active_reservations = r.active_reservations.saturating_sub(1);
                if r.is_board() && r.active_reservations == 0 && r.status == ResourceStatus::InUse {
                    r.status = ResourceStatus::Available;
                }
            })
            .await;

        if restored.is_none() {
            warn!(
                reservation_id = %reservation.id,
                resource_id = %reservation.resource_id,
                "Released reservation for a resource no longer registered"
            );
        }
    }

    /// Remove a resource from the registry, refusing while it is reserved.
    pub(crate) async fn decommission(&self, id: &ResourceId) -> Result<Resource, EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let held = self.active_on(id).await;
        if !held.is_empty() {
            return Err(EngineError::Conflict(format!(
                "resource {id} has {} active reservation(s)",
                held.len()
            )));
        }

        let removed = self
            .registry
            .remove(id)
            .await
            .ok_or_else(|| EngineError::ResourceNotFound(id.clone()))?;

        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(removed)
    }

    pub async fn get(&self, id: &ReservationId) -> Option<Reservation> {
        self.active.read().await.get(id).cloned()
    }

    /// All active reservations, oldest first.
    pub async fn active(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.active.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn active_on(&self, resource_id: &ResourceId) -> Vec<Reservation> {
        self.active
            .read()
            .await
            .values()
            .filter(|r| &r.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Unexpired reservations on any of `resources`.
    ///
    /// Reservations past their expiry still sit in the table until the
    /// reaper runs; they are not counted.
    pub async fn count_on(&self, resources: &[ResourceId]) -> u32 {
        let now = self.clock.now();
        self.active
            .read()
            .await
            .values()
            .filter(|r| resources.contains(&r.resource_id) && !r.is_expired(now))
            .count() as u32
    }

    /// Earliest expiry per reserved resource.
    pub async fn busy_until(&self) -> BTreeMap<ResourceId, DateTime<Utc>> {
        let mut busy: BTreeMap<ResourceId, DateTime<Utc>> = BTreeMap::new();
        for reservation in self.active.read().await.values() {
            busy.entry(reservation.resource_id.clone())
                .and_modify(|at| *at = (*at).min(reservation.expires_at))
                .or_insert(reservation.expires_at);
        }
        busy
    }

    /// Cross-check registry capacity fields against the reservation table.
    ///
    /// A mismatch means the bookkeeping is corrupt and is reported as
    /// [`EngineError::Fatal`].
    pub async fn audit(&self) -> Result<(), EngineError> {
        for resource_id in self.registry.snapshot().await.into_iter().map(|r| r.id) {
            let lock = self.lock_for(&resource_id);
            let _guard = lock.lock().await;

            let Some(resource) = self.registry.get(&resource_id).await else {
                continue;
            };
            let held = self.active_on(&resource_id).await;

            let mut expected = ResourceSlice::default();
            for reservation in &held {
                expected = expected
                    .checked_add(&reservation.slice.capacity())
                    .ok_or_else(|| {
                        EngineError::Fatal(format!("reserved capacity on {resource_id} overflows"))
                    })?;
            }

            if resource.allocated != expected || resource.active_reservations as usize != held.len() {
                return Err(EngineError::Fatal(format!(
                    "capacity bookkeeping for {resource_id} drifted: registry has {} in {} reservation(s), table has {} in {}",
                    resource.allocated,
                    resource.active_reservations,
                    expected,
                    held.len()
                )));
            }
            if !expected.fits_within(&resource.capacity.as_slice()) {
                return Err(EngineError::Fatal(format!(
                    "reservations on {resource_id} exceed declared capacity"
                )));
            }
            if resource.is_board() && held.len() > 1 {
                return Err(EngineError::Fatal(format!(
                    "board {resource_id} has {} overlapping reservations",
                    held.len()
                )));
            }
        }

        let known = self.registry.snapshot().await;
        if let Some(orphan) = self
            .active
            .read()
            .await
            .values()
            .find(|r| !known.iter().any(|k| k.id == r.resource_id))
        {
            return Err(EngineError::Fatal(format!(
                "reservation {} points at unregistered resource {}",
                orphan.id, orphan.resource_id
            )));
        }

        Ok(())
    }

    fn emit(&self, reservation: &Reservation, event_type: &str, severity: Severity) {
        let mut builder = EventEnvelope::builder()
            .aggregate(AggregateType::Reservation, reservation.id.to_string())
            .event_type(event_type)
            .severity(severity)
            .correlation_id(reservation.resource_id.to_string())
            .payload(ReservationPayload {
                reservation_id: reservation.id,
                resource_id: reservation.resource_id.clone(),
                holder: reservation.holder.requester.clone(),
                expires_at: reservation.expires_at,
            });
        if let Some(request_id) = reservation.holder.request_id {
            builder = builder.request_id(request_id);
        }
        self.alerts.emit(builder);
    }
}
