use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver};

use crate::event::{SlotEvent, SlotQueue};
use crate::types::RadioIndication;

/// Where the radio layer and platform deliver indications for one slot.
pub type IndicationChannel<const N: usize> = Channel<CriticalSectionRawMutex, RadioIndication, N>;

/// Moves radio indications onto the slot queue.
pub struct IndicationHandler<'a, const N: usize> {
    receiver: Receiver<'a, CriticalSectionRawMutex, RadioIndication, N>,
    queue: SlotQueue,
}

impl<'a, const N: usize> IndicationHandler<'a, N> {
    pub fn new(indications: &'a IndicationChannel<N>, queue: SlotQueue) -> Self {
        Self {
            receiver: indications.receiver(),
            queue,
        }
    }

    pub async fn run(&mut self) -> ! {
        loop {
            let indication = self.receiver.receive().await;
            self.handle(indication);
        }
    }

    pub fn handle(&mut self, indication: RadioIndication) {
        let slot_id = self.queue.slot_id();
        match &indication {
            RadioIndication::RadioAdapterHostDied => warn!("Slot {} radio host died", slot_id),
            RadioIndication::InterfaceLinkDown(iface) => {
                warn!("Slot {} interface {} down", slot_id, iface)
            }
            RadioIndication::PsAttachChanged(attached) => {
                debug!("Slot {} ps attached {}", slot_id, attached)
            }
            RadioIndication::SimStateChanged { has_sim } => {
                debug!("Slot {} sim present {}", slot_id, has_sim)
            }
            other => trace!("Slot {} indication {:?}", slot_id, other),
        }
        if let Err(e) = self.queue.post(SlotEvent::from(indication)) {
            error!("Slot {} indication dropped: {}", slot_id, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::event::ConnectionEvent;
    use crate::types::{RequestToken, SetupDataCallResult};
    use embassy_futures::select::{select, Either};
    use embassy_futures::block_on;

    #[test]
    fn indications_reach_slot_queue() {
        let channel: IndicationChannel<4> = IndicationChannel::new();
        let queue = SlotQueue::new(1);
        let mut handler = IndicationHandler::new(&channel, queue.clone());

        channel
            .try_send(RadioIndication::SetupDataCallResponse {
                token: RequestToken {
                    machine: 4,
                    connect_id: 1,
                },
                result: Ok(SetupDataCallResult::default()),
            })
            .unwrap();
        channel
            .try_send(RadioIndication::PsAttachChanged(false))
            .unwrap();

        // `run` never returns; it stops being polled once the queue has both.
        let received = block_on(async {
            match select(handler.run(), async {
                let first = queue.receive().await;
                let second = queue.receive().await;
                (first, second)
            })
            .await
            {
                Either::First(never) => never,
                Either::Second(events) => events,
            }
        });
        assert!(matches!(
            received.0,
            SlotEvent::Connection {
                machine: 4,
                event: ConnectionEvent::ActivateDone { connect_id: 1, .. }
            }
        ));
        assert!(matches!(
            received.1,
            SlotEvent::Indication(RadioIndication::PsAttachChanged(false))
        ));
    }
}
