//! APN profiles, per type holders and their retry policy.

pub mod holder;
pub mod item;
pub mod manager;
pub mod retry;
