mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{next_reservation, resolve, resolve_all};
pub use conflict::{canonical_phone, conflicts, first_conflict, validate};
pub use error::{EngineError, Field, Rejection};

use std::sync::Arc;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{ReservationStore, VehicleStore};

/// Reservation engine: the availability resolver and conflict validator wired
/// to their stores and a clock.
pub struct Engine {
    reservations: Arc<dyn ReservationStore>,
    vehicles: Arc<dyn VehicleStore>,
    clock: Arc<dyn Clock>,
    pub notify: Arc<NotifyHub>,
    /// Preparation window that must stay free before every departure.
    buffer: Ms,
}

impl Engine {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        vehicles: Arc<dyn VehicleStore>,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
        buffer: Ms,
    ) -> Self {
        Self {
            reservations,
            vehicles,
            clock,
            notify,
            buffer,
        }
    }

    /// Engine over a single store that keeps both vehicles and reservations.
    pub fn with_store<S>(store: Arc<S>, clock: Arc<dyn Clock>, buffer: Ms) -> Self
    where
        S: ReservationStore + VehicleStore + 'static,
    {
        Self::new(store.clone(), store, clock, Arc::new(NotifyHub::new()), buffer)
    }

    pub fn buffer(&self) -> Ms {
        self.buffer
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Receive every reservation change for `vehicle_id` from now on.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(vehicle_id)
    }
}
