//! # testfarm-events
//!
//! Status vocabulary and event definitions shared by the testfarm engine and
//! anything that consumes its events (dashboard backend, notifiers).
//!
//! ## Design Principles
//!
//! - Events are immutable records of decisions and state transitions
//! - Every event belongs to exactly one aggregate (resource, reservation,
//!   group or pipeline)
//! - Every event carries a severity; severity decides which delivery
//!   channels (dashboard, webhook, email) receive it
//!
//! ## Event Types
//!
//! - Resource events (`resource.*`, `recovery.*`, `flash.*`)
//! - Reservation and allocation events (`reservation.*`, `allocation.*`)
//! - Policy audit events (`policy.*`)
//! - Pipeline events (`pipeline.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
