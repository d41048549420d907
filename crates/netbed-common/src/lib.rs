//! Shared types for the netbed harness.
//!
//! This crate contains:
//! - **Errors** — the failure taxonomy shared by every harness component
//! - **Addresses** — the [`Cidr`] address/prefix value type
//! - **ID generation** — prefixed UUIDv7 helpers (`guest_`, `cap_`)
//! - **Topology config** — the declarative host/wiring description loaded
//!   from JSON or TOML

pub mod config;
pub mod error;
pub mod ids;
pub mod ip;

pub use error::{Error, Result};
pub use ip::Cidr;
