use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::VehicleScope;

use super::conflict::{check_request_limits, validate};
use super::{Engine, EngineError, Rejection};

impl Engine {
    pub async fn register_vehicle(
        &self,
        id: Ulid,
        model: String,
        plate: String,
    ) -> Result<(), EngineError> {
        if model.len() > MAX_TEXT_LEN || plate.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("field too long"));
        }
        let fleet = self.vehicles.fetch_vehicles().await?;
        if fleet.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if fleet.iter().any(|v| v.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let vehicle = Vehicle { id, model, plate };
        self.vehicles.register_vehicle(vehicle.clone()).await?;
        info!("registered vehicle {id} ({})", vehicle.plate);
        self.notify.send(&Event::VehicleRegistered {
            id,
            model: vehicle.model,
            plate: vehicle.plate,
        });
        Ok(())
    }

    /// Validate and book a trip. Returns the id the store assigned.
    pub async fn submit(&self, request: ReservationRequest) -> Result<Ulid, EngineError> {
        let result = self.try_submit(&request).await;
        let outcome = match &result {
            Ok(id) => {
                info!("accepted reservation {id}");
                "accepted"
            }
            Err(EngineError::Rejected(r)) => {
                debug!("rejected reservation: {r}");
                r.kind()
            }
            Err(e) => {
                error!("reservation failed: {e}");
                "error"
            }
        };
        metrics::counter!(observability::RESERVATIONS_SUBMITTED_TOTAL, "outcome" => outcome)
            .increment(1);
        result
    }

    async fn try_submit(&self, request: &ReservationRequest) -> Result<Ulid, EngineError> {
        let snapshot = self.fetch_for(request).await?;
        validate(request, self.clock.now(), &snapshot, self.buffer)?;
        check_request_limits(request)?;

        if let Some(vehicle_id) = request.vehicle_id {
            let fleet = self.vehicles.fetch_vehicles().await?;
            if !fleet.iter().any(|v| v.id == vehicle_id) {
                return Err(Rejection::VehicleUnavailable.into());
            }
        }

        // TODO: serialize writes per vehicle (or make create_reservation a
        // conditional write) so two submissions cannot both pass this re-check.
        let fresh = self.fetch_for(request).await?;
        let accepted = validate(request, self.clock.now(), &fresh, self.buffer).inspect_err(|_| {
            metrics::counter!(observability::RESERVATIONS_LOST_RACE_TOTAL).increment(1);
        })?;

        let id = self.reservations.create_reservation(accepted.clone()).await?;
        self.notify.send(&Event::ReservationCreated {
            reservation: accepted.into_reservation(id),
        });
        Ok(id)
    }

    async fn fetch_for(&self, request: &ReservationRequest) -> Result<Vec<Reservation>, EngineError> {
        match request.vehicle_id {
            Some(vehicle_id) => Ok(self
                .reservations
                .fetch_reservations(VehicleScope::One(vehicle_id))
                .await?),
            // Validation stops at the missing field before touching the snapshot.
            None => Ok(Vec::new()),
        }
    }

    /// Mark a trip as finished. Completing an already completed trip is a no-op.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let reservation = self.reservations.complete_reservation(id).await?;
        info!("completed reservation {id}");
        self.notify.send(&Event::ReservationCompleted {
            id,
            vehicle_id: reservation.vehicle_id,
        });
        Ok(reservation)
    }
}
