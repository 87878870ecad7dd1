//! Hierarchical state plumbing shared by the connection and in-call machines.
//!
//! States are plain ids with an explicit parent chain. An event is offered to
//! the current leaf first and then to each ancestor until one handles it.

use core::fmt::Debug;

pub trait StateTree: Copy + Eq + Debug {
    fn parent(self) -> Option<Self>;

    /// The state itself followed by its ancestors, leaf first.
    fn lineage(self) -> Vec<Self> {
        let mut chain = vec![self];
        let mut cur = self;
        while let Some(parent) = cur.parent() {
            chain.push(parent);
            cur = parent;
        }
        chain
    }
}

/// What a state did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    Handled,
    /// Offer the event to the parent state.
    NotHandled,
    /// Park the event until the next transition.
    Defer,
    Transition(S),
}

/// States to exit (leaf first) and enter (outermost first) when moving from
/// `from` to `to`. A transition to self exits and re-enters the state.
pub fn transition_path<S: StateTree>(from: S, to: S) -> (Vec<S>, Vec<S>) {
    let from_chain = from.lineage();
    let to_chain = to.lineage();

    let common = if from == to {
        from.parent()
    } else {
        from_chain.iter().copied().find(|s| to_chain.contains(s))
    };

    let exits = from_chain
        .iter()
        .copied()
        .take_while(|s| Some(*s) != common)
        .collect();
    let mut entries: Vec<S> = to_chain
        .iter()
        .copied()
        .take_while(|s| Some(*s) != common)
        .collect();
    entries.reverse();
    (exits, entries)
}
