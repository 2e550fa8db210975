//! HTTP control surface for the husk microVM sandbox manager.
//!
//! Exposes VM lifecycle and network policy operations of a local
//! [`husk_executor::Orchestrator`] as JSON endpoints.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod reaper;
pub mod routes;
