//! Reservation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::ResourceKind;
use testfarm_id::{RequestId, ReservationId, ResourceId};

use super::ResourceSlice;

/// What a reservation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservedSlice {
    /// Part of a build server's or host's capacity.
    Capacity(ResourceSlice),
    /// The whole board.
    ExclusiveBoard,
}

impl ReservedSlice {
    /// Capacity to subtract from the resource's available slice.
    pub fn capacity(&self) -> ResourceSlice {
        match self {
            Self::Capacity(slice) => *slice,
            Self::ExclusiveBoard => ResourceSlice::default(),
        }
    }
}

/// Why the reservation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationPurpose {
    /// A caller's allocation request.
    #[default]
    Request,
    /// Exclusive board lock held by the engine during a firmware flash.
    Flash,
}

/// Who holds a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    /// Requester or task id (`build-4711`, `T1`, ...).
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl Holder {
    pub fn new(requester: impl Into<String>) -> Self {
        Self {
            requester: requester.into(),
            team: None,
            request_id: None,
        }
    }
}

/// A time-bounded hold on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub holder: Holder,
    pub slice: ReservedSlice,
    #[serde(default)]
    pub purpose: ReservationPurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
