//! Health monitoring: state machine, monitor and background workers.

pub mod monitor;
pub mod transition;
pub mod worker;

pub use monitor::{HealthCheck, HealthMonitor, ProbeReport};
pub use transition::{classify, next_status, Classification, Transition, TransitionInput};
pub use worker::HealthWorker;
