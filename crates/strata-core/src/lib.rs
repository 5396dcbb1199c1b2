//! # strata-core
//!
//! Shared vocabulary for the strata replication protocol:
//!
//! - **Actions**: [`action::Action`] envelope and the [`action::Scope`]
//!   visibility classes that drive routing
//! - **Ids**: [`ids::ClientId`] logical identity, stable across reconnects
//! - **Protocol messages**: [`protocol`] constructors for handshake, batch,
//!   heartbeat, and error envelopes
//! - **Errors**: [`errors::DispatchError`] via `thiserror`
//!
//! Foundation crate. Depended on by `strata-server` and `strata-client`.

#![deny(unsafe_code)]

pub mod action;
pub mod errors;
pub mod ids;
pub mod protocol;

pub use action::{Action, Scope};
pub use errors::DispatchError;
pub use ids::ClientId;
