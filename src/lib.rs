//! Cellular packet data connectivity for multi-SIM devices.
//!
//! Each SIM slot runs its own [`asynch::runner::Runner`]: APN holders pick a
//! profile, connection state machines drive the radio through PDP context
//! activation and teardown, and the net agent keeps the platform's network
//! suppliers in sync with what is up.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod apn;
pub mod asynch;
pub mod config;
pub mod connection;
pub mod context;
pub mod controller;
pub mod error;
pub mod event;
pub mod hsm;
pub mod incall;
pub mod link;
pub mod manager;
pub mod monitor;
pub mod net_agent;
pub mod service;
pub mod timer;
pub mod timing;
pub mod traits;
pub mod types;

#[cfg(test)]
mod test_helpers;
