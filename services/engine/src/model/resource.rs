//! Registered resources: build servers, QEMU hosts and test boards.
//!
//! A [`Resource`] is a shared base (identity, capacity, status, labels)
//! plus a kind-specific [`ResourceSpec`]. Reservation and selection work on
//! the base; only the compatibility predicates look inside the spec.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::{ResourceKind, ResourceStatus};
use testfarm_id::{GroupId, ResourceId};

/// A quantity of divisible capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSlice {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_gb: u64,
}

impl ResourceSlice {
    pub const fn new(cpu_cores: u32, memory_mb: u64, storage_gb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            storage_gb,
        }
    }

    pub const fn cores(cpu_cores: u32) -> Self {
        Self::new(cpu_cores, 0, 0)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// True if every dimension of `self` fits inside `other`.
    pub fn fits_within(&self, other: &ResourceSlice) -> bool {
        self.cpu_cores <= other.cpu_cores
            && self.memory_mb <= other.memory_mb
            && self.storage_gb <= other.storage_gb
    }

    pub fn checked_add(&self, other: &ResourceSlice) -> Option<ResourceSlice> {
        Some(ResourceSlice {
            cpu_cores: self.cpu_cores.checked_add(other.cpu_cores)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            storage_gb: self.storage_gb.checked_add(other.storage_gb)?,
        })
    }

    /// `self - other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &ResourceSlice) -> Option<ResourceSlice> {
        Some(ResourceSlice {
            cpu_cores: self.cpu_cores.checked_sub(other.cpu_cores)?,
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
            storage_gb: self.storage_gb.checked_sub(other.storage_gb)?,
        })
    }

    pub fn saturating_sub(&self, other: &ResourceSlice) -> ResourceSlice {
        ResourceSlice {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            storage_gb: self.storage_gb.saturating_sub(other.storage_gb),
        }
    }
}

impl std::fmt::Display for ResourceSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cores / {} MB / {} GB",
            self.cpu_cores, self.memory_mb, self.storage_gb
        )
    }
}

/// Declared capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_gb: u64,
    /// Architectures the resource can build for or run (`x86_64`, `arm64`, ...).
    pub architectures: BTreeSet<String>,
}

impl Capacity {
    pub fn as_slice(&self) -> ResourceSlice {
        ResourceSlice::new(self.cpu_cores, self.memory_mb, self.storage_gb)
    }

    pub fn supports(&self, architecture: &str) -> bool {
        self.architectures.contains(architecture)
    }
}

/// Latest utilization snapshot reported by a probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_free_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_average: Option<f32>,
}

/// How the connectors reach a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ConnectionInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: None,
            username: None,
        }
    }
}

/// Power control hardware wired to a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerControl {
    Pdu { endpoint: String, outlet: u16 },
    Relay { device: String, channel: u16 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildServerSpec {
    /// Installed toolchains (`gcc-13`, `clang-18`, `rust-1.90`, ...).
    #[serde(default)]
    pub toolchains: BTreeSet<String>,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    #[serde(default)]
    pub kvm: bool,
    #[serde(default)]
    pub nested_virt: bool,
    pub max_vms: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSpec {
    pub board_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc: Option<String>,
    #[serde(default)]
    pub peripherals: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_control: Option<PowerControl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Kind-specific part of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    BuildServer(BuildServerSpec),
    Host(HostSpec),
    Board(BoardSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::BuildServer(_) => ResourceKind::BuildServer,
            Self::Host(_) => ResourceKind::Host,
            Self::Board(_) => ResourceKind::Board,
        }
    }
}

/// A managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub connection: ConnectionInfo,
    pub capacity: Capacity,
    pub spec: ResourceSpec,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    // Owned by the health monitor.
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub needs_intervention: bool,
    #[serde(default)]
    pub utilization: Utilization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,

    // Owned by the reservation manager.
    #[serde(default)]
    pub allocated: ResourceSlice,
    #[serde(default)]
    pub active_reservations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(id: ResourceId, spec: ResourceSpec, capacity: Capacity, connection: ConnectionInfo) -> Self {
        Self {
            id,
            connection,
            capacity,
            spec,
            labels: BTreeMap::new(),
            group_id: None,
            status: ResourceStatus::Unknown,
            maintenance_mode: false,
            needs_intervention: false,
            utilization: Utilization::default(),
            last_health_check: None,
            allocated: ResourceSlice::default(),
            active_reservations: 0,
            registered_at: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn is_board(&self) -> bool {
        matches!(self.spec, ResourceSpec::Board(_))
    }

    pub fn board(&self) -> Option<&BoardSpec> {
        match &self.spec {
            ResourceSpec::Board(board) => Some(board),
            _ => None,
        }
    }

    pub fn power_control(&self) -> Option<&PowerControl> {
        self.board().and_then(|b| b.power_control.as_ref())
    }

    /// Capacity not yet held by reservations.
    pub fn available(&self) -> ResourceSlice {
        self.capacity.as_slice().saturating_sub(&self.allocated)
    }

    /// Maximum number of simultaneous reservations.
    pub fn slot_limit(&self) -> u32 {
        match &self.spec {
            ResourceSpec::BuildServer(spec) => spec.max_concurrent_jobs.max(1),
            ResourceSpec::Host(spec) => spec.max_vms.max(1),
            ResourceSpec::Board(_) => 1,
        }
    }

    /// Whether new work may be placed here at all (status gates only).
    pub fn is_selectable(&self) -> bool {
        !self.maintenance_mode
            && !self.needs_intervention
            && self.status != ResourceStatus::Maintenance
            && self.status.is_allocatable(self.kind())
    }

    /// Whether `slice` fits next to the existing reservations.
    pub fn has_room_for(&self, slice: &ResourceSlice) -> bool {
        if self.active_reservations >= self.slot_limit() {
            return false;
        }
        self.is_board() || slice.fits_within(&self.available())
    }

    /// Every required label is present with the same value.
    pub fn matches_labels(&self, required: &BTreeMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }

    /// Status a healthy resource settles in given its current reservations.
    pub fn healthy_status(&self) -> ResourceStatus {
        if self.is_board() && self.active_reservations > 0 {
            ResourceStatus::InUse
        } else {
            self.kind().idle_status()
        }
    }
}
