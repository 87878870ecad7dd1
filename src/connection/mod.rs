//! One radio data call, driven through its lifecycle by a hierarchical state
//! machine.

pub mod event;
pub mod handle;
pub mod machine;
pub mod slice;

use crate::hsm::StateTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Parent of every other state. Absorbs what the leaf does not handle.
    Default,
    Inactive,
    Activating,
    Active,
    Disconnecting,
}

impl StateTree for ConnectionState {
    fn parent(self) -> Option<Self> {
        match self {
            ConnectionState::Default => None,
            _ => Some(ConnectionState::Default),
        }
    }
}
