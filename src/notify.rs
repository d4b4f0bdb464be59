use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for reservation changes, one channel per vehicle.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes for a vehicle. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification to the event's vehicle. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let vehicle_id = event.vehicle_id();
        let drop_channel = match self.channels.get(&vehicle_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        // Every receiver is gone.
        if drop_channel {
            self.channels.remove_if(&vehicle_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(vehicle_id: Ulid) -> Event {
        Event::ReservationCompleted {
            id: Ulid::new(),
            vehicle_id,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let vid = Ulid::new();
        let mut rx = hub.subscribe(vid);

        let event = completed(vid);
        hub.send(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn other_vehicle_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);

        hub.send(&completed(Ulid::new()));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&completed(Ulid::new()));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_channel_is_dropped() {
        let hub = NotifyHub::new();
        let vid = Ulid::new();
        drop(hub.subscribe(vid));
        assert_eq!(hub.channel_count(), 1);

        hub.send(&completed(vid));
        assert_eq!(hub.channel_count(), 0);
    }
}
