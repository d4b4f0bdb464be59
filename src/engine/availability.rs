use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

// ── Availability Resolution ───────────────────────────────────────

/// The soonest non-completed reservation of `vehicle_id` departing at or after
/// `reference`. Equal departures are ordered by reservation id.
pub fn next_reservation(
    vehicle_id: Ulid,
    reference: Ms,
    reservations: &[Reservation],
) -> Option<&Reservation> {
    reservations
        .iter()
        .filter(|r| r.vehicle_id == vehicle_id && constrains(r, reference))
        .min_by_key(|r| (r.departure, r.id))
}

/// Availability of one vehicle at `reference`.
///
/// The vehicle is blocked from `next.departure - buffer` onwards, where `next`
/// is the soonest upcoming trip. Without an upcoming trip it is available
/// without restriction.
pub fn resolve(
    vehicle_id: Ulid,
    reference: Ms,
    reservations: &[Reservation],
    buffer: Ms,
) -> AvailabilityStatus {
    status_for(reference, next_reservation(vehicle_id, reference, reservations), buffer)
}

/// Resolve every vehicle against one snapshot. Output follows `vehicles` order.
pub fn resolve_all(
    vehicles: &[Vehicle],
    reference: Ms,
    reservations: &[Reservation],
    buffer: Ms,
) -> Vec<VehicleAvailability> {
    let mut next: HashMap<Ulid, &Reservation> = HashMap::new();
    for r in reservations.iter().filter(|r| constrains(r, reference)) {
        next.entry(r.vehicle_id)
            .and_modify(|cur| {
                if (r.departure, r.id) < (cur.departure, cur.id) {
                    *cur = r;
                }
            })
            .or_insert(r);
    }

    vehicles
        .iter()
        .map(|v| VehicleAvailability {
            vehicle: v.clone(),
            status: status_for(reference, next.get(&v.id).copied(), buffer),
        })
        .collect()
}

fn constrains(r: &Reservation, reference: Ms) -> bool {
    !r.completed && r.departure >= reference
}

fn status_for(reference: Ms, next: Option<&Reservation>, buffer: Ms) -> AvailabilityStatus {
    match next {
        Some(next) => {
            let until = next.delivery_deadline(buffer);
            AvailabilityStatus {
                available: reference < until,
                unavailable_until: Some(until),
            }
        }
        None => AvailabilityStatus::UNRESTRICTED,
    }
}
