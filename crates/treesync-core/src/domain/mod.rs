//! Domain types
//!
//! - Change records exchanged between producers, the coordinator and the transport
//! - Component identifiers used when reporting errors
//! - Domain-specific error types

pub mod errors;
pub mod record;

pub use errors::DomainError;
pub use record::{Action, ChangeRecord, Component};
