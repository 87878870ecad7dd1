//! Async surface of a slot: a [`Runner`] owning the controller, [`Control`]
//! handles for callers and an [`IndicationHandler`] feeding radio events in.

pub mod control;
pub mod indication;
pub mod runner;
pub mod state;

use std::sync::Arc;

use crate::apn::item::ApnRecord;
use crate::context::Context;
use crate::controller::CellularDataController;
use crate::error::Error;
use crate::event::SlotQueue;
use crate::types::is_valid_slot_id;

use self::control::Control;
use self::indication::{IndicationChannel, IndicationHandler};
use self::runner::Runner;
use self::state::SlotState;

/// Set up one slot with its APN profiles.
pub fn new<'a, const N: usize>(
    slot_id: i32,
    ctx: Arc<Context>,
    records: &[ApnRecord],
    indications: &'a IndicationChannel<N>,
) -> Result<(Control, Runner, IndicationHandler<'a, N>), Error> {
    if !is_valid_slot_id(slot_id) {
        return Err(Error::InvalidSlot(slot_id));
    }

    let queue = SlotQueue::new(slot_id);
    let state = Arc::new(SlotState::new(slot_id));
    let mut controller = CellularDataController::new(slot_id, ctx, queue.clone(), state.clone());
    controller.init(records)?;

    Ok((
        Control::new(queue.clone(), state),
        Runner::new(controller, queue.clone()),
        IndicationHandler::new(indications, queue),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::test_context;

    #[test]
    fn invalid_slot_rejected() {
        let (ctx, _mocks) = test_context();
        let channel: IndicationChannel<2> = IndicationChannel::new();
        assert!(matches!(
            new(7, ctx.clone(), &[], &channel),
            Err(Error::InvalidSlot(7))
        ));
        let (control, _runner, _handler) = new(1, ctx, &[], &channel).unwrap();
        assert_eq!(control.slot_id(), 1);
    }
}
