//! # testfarm-id
//!
//! Stable ID types, parsing, and validation for the testfarm engine.
//!
//! ## Two kinds of identifiers
//!
//! - **Generated IDs** for records the engine creates itself (reservations,
//!   pipeline runs, requests). These use a prefixed ULID: `{prefix}_{ulid}`.
//! - **Names** for things an operator registers (build servers, QEMU hosts,
//!   boards, resource groups). These are short human-chosen strings such as
//!   `B1`, `qemu-host-03` or `kernel-boards`.
//!
//! Examples:
//! - `rsv_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `pipe_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `rpi4-lab2.07`
//!
//! Generated IDs are sortable by creation time. Names are validated so they
//! are safe to embed in log fields, URLs and file names.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
