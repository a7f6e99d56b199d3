//! Engine data model.

mod group;
mod health;
mod pipeline;
mod reservation;
mod resource;

pub use group::{AllocationPolicy, ResourceGroup};
pub use health::{HealthRecord, HealthTrend};
pub use pipeline::{PipelineRun, Stage, StageAttempt, StageOutput};
pub use reservation::{Holder, Reservation, ReservationPurpose, ReservedSlice};
pub use resource::{
    BoardSpec, BuildServerSpec, Capacity, ConnectionInfo, HostSpec, PowerControl, Resource,
    ResourceSlice, ResourceSpec, Utilization,
};
