use embassy_futures::select::{select, Either};
use embassy_time::{Instant, Timer};

use crate::controller::CellularDataController;
use crate::event::SlotQueue;

/// Background runner of one slot.
///
/// You must call `.run()` in a background task for the slot to operate.
pub struct Runner {
    controller: CellularDataController,
    queue: SlotQueue,
}

impl Runner {
    pub(crate) fn new(controller: CellularDataController, queue: SlotQueue) -> Self {
        Self { controller, queue }
    }

    pub fn controller(&self) -> &CellularDataController {
        &self.controller
    }

    /// Handle the next queued event, or the earliest timer if it runs out
    /// first.
    pub async fn step(&mut self) {
        let deadline = self.controller.next_deadline();
        let timer = async {
            match deadline {
                Some(deadline) => Timer::at(deadline).await,
                None => core::future::pending::<()>().await,
            }
        };

        match select(self.queue.receive(), timer).await {
            Either::First(event) => self.controller.process(event),
            Either::Second(()) => self.controller.on_timer(Instant::now()),
        }
    }

    pub async fn run(&mut self) -> ! {
        info!("Slot {} runner started", self.controller.slot_id());
        loop {
            self.step().await;
        }
    }
}
