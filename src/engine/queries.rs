use crate::model::*;
use crate::store::VehicleScope;

use super::availability::resolve_all;
use super::{Engine, EngineError};

impl Engine {
    /// Every vehicle with its availability at `reference`, resolved against one
    /// snapshot. With `only_available`, blocked vehicles are left out.
    pub async fn list_vehicles(
        &self,
        reference: Ms,
        only_available: bool,
    ) -> Result<Vec<VehicleAvailability>, EngineError> {
        let vehicles = self.vehicles.fetch_vehicles().await?;
        let reservations = self.reservations.fetch_reservations(VehicleScope::All).await?;
        let mut listed = resolve_all(&vehicles, reference, &reservations, self.buffer);
        if only_available {
            listed.retain(|v| v.status.available);
        }
        Ok(listed)
    }

    pub async fn list_reservations(
        &self,
        scope: VehicleScope,
    ) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.reservations.fetch_reservations(scope).await?)
    }
}
