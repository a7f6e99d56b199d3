//! testfarm Engine Library
//!
//! Resource selection, reservation, health and recovery for a test farm of
//! build servers, QEMU hosts and physical test boards.
//!
//! ## Architecture
//!
//! ```text
//! Engine
//! ├── Registry              (resources, groups, health history)
//! ├── HealthMonitor         (probes, status state machine, recovery)
//! │   └── PowerController   (board power cycles)
//! ├── ReservationManager    (the only writer of allocated capacity)
//! ├── Allocator             (selection + policy + reservation + queue)
//! ├── FlashController       (FLASHING under the exclusive board lock)
//! ├── PipelineSequencer     (build → deploy → boot → test)
//! └── AlertEmitter          (event bus)
//! ```
//!
//! Background work: one [`health::HealthWorker`] per resource kind and a
//! [`reaper::ReservationReaper`].
//!
//! ## Modules
//!
//! - `selection`: per-kind compatibility filters and scoring
//! - `connector`: narrow traits to probes, power switches, flashers and
//!   remote execution, plus the `MockFleet` used in tests and development
//! - `inventory`: JSON inventory files for seeding

pub mod alerts;
pub mod allocation;
pub mod clock;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod flash;
pub mod health;
pub mod inventory;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod power;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod reservation;
pub mod selection;

// Re-export commonly used types
pub use allocation::{AllocationOutcome, AllocationRequest, Allocator, Denial, RequestStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use connector::MockFleet;
pub use engine::{Connectors, Engine, Workers};
pub use error::{EngineError, EngineResult};
pub use inventory::Inventory;
pub use model::{Reservation, Resource, ResourceGroup};
pub use pipeline::{PipelineConfig, StageExecutor};
pub use policy::Requester;
pub use selection::Requirements;
