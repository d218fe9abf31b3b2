//! treesync core - domain types shared by every pipeline component
//!
//! This crate contains:
//! - **Domain types** - [`ChangeRecord`](domain::ChangeRecord), [`Action`](domain::Action),
//!   [`Component`](domain::Component)
//! - **Configuration** - YAML-backed [`Config`](config::Config) with validation and a builder
//! - **Options codec** - the delimited byte-string packer used alongside records on the wire
//!
//! The domain module has no I/O. Filesystem access, watching and the
//! coordinator live in `treesync-sync`.

pub mod config;
pub mod domain;
pub mod options;
