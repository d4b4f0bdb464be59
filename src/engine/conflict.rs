use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve;
use super::error::{Field, Rejection};
use super::EngineError;

/// Size and range guards for a request that `validate` has already accepted.
/// Any validation rejection takes precedence over these.
pub(crate) fn check_request_limits(request: &ReservationRequest) -> Result<(), EngineError> {
    for instant in [request.departure, request.arrival].into_iter().flatten() {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&instant) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
    }
    let texts = [
        &request.driver_name,
        &request.registration,
        &request.phone,
        &request.destination,
    ];
    if texts.iter().any(|t| t.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    if request.notes.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Keep only the digits of a phone number.
pub fn canonical_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Whether `trip` reaches into `existing` or into the preparation window before
/// it: `trip.end > existing.departure - buffer && trip.start < existing.arrival`.
///
/// The buffer only guards the existing trip's departure, so a trip leaving
/// right after `existing` returns does not collide.
pub fn conflicts(trip: Span, existing: &Reservation, buffer: Ms) -> bool {
    trip.overlaps(&existing.buffered_span(buffer))
}

/// The earliest active reservation of `vehicle_id` that collides with `trip`.
pub fn first_conflict<'a>(
    vehicle_id: Ulid,
    trip: Span,
    existing: &'a [Reservation],
    buffer: Ms,
) -> Option<&'a Reservation> {
    existing
        .iter()
        .filter(|e| e.vehicle_id == vehicle_id && !e.completed)
        .filter(|e| conflicts(trip, e, buffer))
        .min_by_key(|e| (e.departure, e.id))
}

/// Decide whether `request` may be booked against the `existing` snapshot.
///
/// Checks run in a fixed order and the first failure is returned: required
/// fields, departure not in the past, arrival after departure, phone length,
/// overlap with buffer, then the resolved availability at departure. On
/// success the request comes back as a `NewReservation` with a digits-only
/// phone.
pub fn validate(
    request: &ReservationRequest,
    now: Ms,
    existing: &[Reservation],
    buffer: Ms,
) -> Result<NewReservation, Rejection> {
    let (vehicle_id, departure, arrival) = required_fields(request)?;

    if departure < now {
        return Err(Rejection::DepartureInPast);
    }
    if arrival <= departure {
        return Err(Rejection::ArrivalNotAfterDeparture);
    }

    let phone = canonical_phone(&request.phone);
    if !(10..=11).contains(&phone.len()) {
        return Err(Rejection::InvalidPhoneLength);
    }

    let trip = Span::new(departure, arrival);
    if let Some(e) = first_conflict(vehicle_id, trip, existing, buffer) {
        return Err(Rejection::VehicleConflict {
            reservation_id: e.id,
            existing_departure: e.departure,
            existing_arrival: e.arrival,
            delivery_deadline: e.delivery_deadline(buffer),
        });
    }

    if !resolve(vehicle_id, departure, existing, buffer).available {
        return Err(Rejection::VehicleUnavailable);
    }

    Ok(NewReservation {
        vehicle_id,
        departure,
        arrival,
        driver_name: request.driver_name.trim().to_string(),
        registration: request.registration.trim().to_string(),
        phone,
        destination: request.destination.trim().to_string(),
        notes: request.notes.trim().to_string(),
    })
}

fn required_fields(request: &ReservationRequest) -> Result<(Ulid, Ms, Ms), Rejection> {
    let blank = |s: &str| s.trim().is_empty();
    let mut missing = Vec::new();
    if request.departure.is_none() {
        missing.push(Field::Departure);
    }
    if request.arrival.is_none() {
        missing.push(Field::Arrival);
    }
    if request.vehicle_id.is_none() {
        missing.push(Field::VehicleId);
    }
    if blank(&request.driver_name) {
        missing.push(Field::DriverName);
    }
    if blank(&request.registration) {
        missing.push(Field::Registration);
    }
    if blank(&request.phone) {
        missing.push(Field::Phone);
    }
    if blank(&request.destination) {
        missing.push(Field::Destination);
    }

    match (request.vehicle_id, request.departure, request.arrival) {
        (Some(v), Some(d), Some(a)) if missing.is_empty() => Ok((v, d, a)),
        _ => Err(Rejection::MissingFields(missing)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    /// 2025-06-01T00:00:00Z
    const DAY: Ms = 1_748_736_000_000;

    fn at(hour: Ms, minute: Ms) -> Ms {
        DAY + hour * H + minute * M
    }

    fn request(vehicle_id: Ulid, departure: Ms, arrival: Ms) -> ReservationRequest {
        ReservationRequest {
            vehicle_id: Some(vehicle_id),
            departure: Some(departure),
            arrival: Some(arrival),
            driver_name: "Ana Souza".into(),
            registration: "4411".into(),
            phone: "(11) 98765-4321".into(),
            destination: "Campinas".into(),
            notes: String::new(),
        }
    }

    fn existing(vehicle_id: Ulid, departure: Ms, arrival: Ms) -> Reservation {
        validate(&request(vehicle_id, departure, arrival), 0, &[], H)
            .unwrap()
            .into_reservation(Ulid::new())
    }

    fn conflict_with(e: &Reservation) -> Rejection {
        Rejection::VehicleConflict {
            reservation_id: e.id,
            existing_departure: e.departure,
            existing_arrival: e.arrival,
            delivery_deadline: e.departure - H,
        }
    }

    // ── scenarios ─────────────────────────────────────────

    #[test]
    fn returns_before_delivery_deadline_is_accepted() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(8, 0), at(8, 30));
        let accepted = validate(&req, at(7, 0), &booked, H).unwrap();
        assert_eq!(accepted.vehicle_id, v);
        assert_eq!(accepted.phone, "11987654321");
    }

    #[test]
    fn return_inside_buffer_conflicts() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(9, 30), at(9, 45));
        let err = validate(&req, at(7, 0), &booked, H).unwrap_err();
        assert_eq!(err, conflict_with(&booked[0]));
        match err {
            Rejection::VehicleConflict {
                existing_departure,
                delivery_deadline,
                ..
            } => {
                assert_eq!(existing_departure, at(10, 0));
                assert_eq!(delivery_deadline, at(9, 0));
            }
            other => panic!("expected VehicleConflict, got {other:?}"),
        }
    }

    #[test]
    fn nine_digit_phone_rejected() {
        let v = Ulid::new();
        let mut req = request(v, at(8, 0), at(9, 0));
        req.phone = "123456789".into();
        assert_eq!(validate(&req, at(7, 0), &[], H), Err(Rejection::InvalidPhoneLength));
    }

    #[test]
    fn phone_lengths_ten_and_eleven_accepted() {
        let v = Ulid::new();
        for phone in ["(11) 3456-7890", "(11) 93456-7890"] {
            let mut req = request(v, at(8, 0), at(9, 0));
            req.phone = phone.into();
            assert!(validate(&req, at(7, 0), &[], H).is_ok(), "{phone}");
        }
        let mut req = request(v, at(8, 0), at(9, 0));
        req.phone = "+55 (11) 93456-7890".into();
        assert_eq!(validate(&req, at(7, 0), &[], H), Err(Rejection::InvalidPhoneLength));
    }

    #[test]
    fn past_departure_reported_before_conflict() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(9, 30), at(11, 0));
        assert_eq!(
            validate(&req, at(9, 31), &booked, H),
            Err(Rejection::DepartureInPast)
        );
    }

    #[test]
    fn departure_equal_to_now_is_not_past() {
        let v = Ulid::new();
        let req = request(v, at(8, 0), at(9, 0));
        assert!(validate(&req, at(8, 0), &[], H).is_ok());
    }

    #[test]
    fn arrival_must_follow_departure() {
        let v = Ulid::new();
        let same = request(v, at(8, 0), at(8, 0));
        let before = request(v, at(8, 0), at(7, 0));
        assert_eq!(validate(&same, 0, &[], H), Err(Rejection::ArrivalNotAfterDeparture));
        assert_eq!(validate(&before, 0, &[], H), Err(Rejection::ArrivalNotAfterDeparture));
    }

    #[test]
    fn temporal_checks_before_phone() {
        let v = Ulid::new();
        let mut req = request(v, at(8, 0), at(7, 0));
        req.phone = "1".into();
        assert_eq!(validate(&req, 0, &[], H), Err(Rejection::ArrivalNotAfterDeparture));
    }

    #[test]
    fn missing_fields_in_canonical_order() {
        let req = ReservationRequest {
            phone: "11987654321".into(),
            notes: "no notes needed".into(),
            ..Default::default()
        };
        assert_eq!(
            validate(&req, 0, &[], H),
            Err(Rejection::MissingFields(vec![
                Field::Departure,
                Field::Arrival,
                Field::VehicleId,
                Field::DriverName,
                Field::Registration,
                Field::Destination,
            ]))
        );
    }

    #[test]
    fn blank_text_counts_as_missing() {
        let v = Ulid::new();
        let mut req = request(v, at(8, 0), at(9, 0));
        req.destination = "   ".into();
        req.driver_name = String::new();
        // Reported even though the departure is also in the past.
        assert_eq!(
            validate(&req, at(23, 0), &[], H),
            Err(Rejection::MissingFields(vec![Field::DriverName, Field::Destination]))
        );
    }

    #[test]
    fn notes_are_optional() {
        let v = Ulid::new();
        let req = request(v, at(8, 0), at(9, 0));
        assert!(req.notes.is_empty());
        assert!(validate(&req, 0, &[], H).is_ok());
    }

    // ── overlap rule ──────────────────────────────────────

    #[test]
    fn buffer_boundary_is_exclusive() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];

        let on_deadline = request(v, at(8, 0), at(9, 0));
        assert!(validate(&on_deadline, 0, &booked, H).is_ok());

        let one_past = request(v, at(8, 0), at(9, 0) + 1);
        assert_eq!(
            validate(&one_past, 0, &booked, H),
            Err(conflict_with(&booked[0]))
        );
    }

    #[test]
    fn departing_after_return_plus_buffer_is_accepted() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(13, 0), at(15, 0));
        assert!(validate(&req, 0, &booked, H).is_ok());
    }

    #[test]
    fn departing_soon_after_return_is_accepted() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(12, 30), at(13, 0));
        assert!(validate(&req, 0, &booked, H).is_ok());

        let back_to_back = request(v, at(12, 0), at(13, 0));
        assert!(validate(&back_to_back, 0, &booked, H).is_ok());

        let still_out = request(v, at(11, 59), at(13, 0));
        assert_eq!(validate(&still_out, 0, &booked, H), Err(conflict_with(&booked[0])));
    }

    #[test]
    fn enclosing_request_conflicts() {
        let v = Ulid::new();
        let booked = vec![existing(v, at(10, 0), at(12, 0))];
        let req = request(v, at(6, 0), at(20, 0));
        assert_eq!(validate(&req, 0, &booked, H), Err(conflict_with(&booked[0])));
    }

    #[test]
    fn earliest_conflict_reported() {
        let v = Ulid::new();
        let late = existing(v, at(16, 0), at(18, 0));
        let early = existing(v, at(11, 0), at(12, 0));
        let booked = vec![late, early.clone()];
        let req = request(v, at(9, 0), at(17, 0));
        assert_eq!(validate(&req, 0, &booked, H), Err(conflict_with(&early)));
    }

    #[test]
    fn completed_and_other_vehicles_ignored() {
        let v = Ulid::new();
        let mut done = existing(v, at(10, 0), at(12, 0));
        done.completed = true;
        let other = existing(Ulid::new(), at(10, 0), at(12, 0));
        let req = request(v, at(10, 0), at(12, 0));
        assert!(validate(&req, 0, &[done, other], H).is_ok());
    }

    #[test]
    fn overlapping_trips_conflict_in_both_orders() {
        let v = Ulid::new();
        let a = existing(v, at(10, 0), at(12, 0));
        for (d, arr) in [(at(11, 0), at(13, 0)), (at(9, 0), at(10, 30)), (at(10, 30), at(11, 0))] {
            let b = existing(v, d, arr);
            assert!(conflicts(b.span(), &a, H));
            assert!(conflicts(a.span(), &b, H));
        }
    }

    #[test]
    fn buffer_guards_only_the_later_departure() {
        let v = Ulid::new();
        let a = existing(v, at(10, 0), at(12, 0));
        // Returns inside a's preparation window: a still needs the hour before 10:00.
        let b = existing(v, at(9, 30), at(9, 45));
        assert!(conflicts(b.span(), &a, H));
        assert!(!conflicts(a.span(), &b, H));
        // Disjoint buffered spans never conflict either way.
        let c = existing(v, at(8, 0), at(8, 30));
        assert!(!conflicts(c.span(), &a, H));
        assert!(!conflicts(a.span(), &c, H));
    }

    #[test]
    fn accepted_request_is_trimmed() {
        let v = Ulid::new();
        let mut req = request(v, at(8, 0), at(9, 0));
        req.driver_name = "  Ana  ".into();
        req.notes = " bring chains \n".into();
        let accepted = validate(&req, 0, &[], H).unwrap();
        assert_eq!(accepted.driver_name, "Ana");
        assert_eq!(accepted.notes, "bring chains");
    }

    #[test]
    fn request_limits() {
        let v = Ulid::new();
        let ok = request(v, at(8, 0), at(9, 0));
        assert!(check_request_limits(&ok).is_ok());

        let mut long = ok.clone();
        long.destination = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(check_request_limits(&long), Err(EngineError::LimitExceeded(_))));

        let mut ancient = ok.clone();
        ancient.departure = Some(0);
        assert!(matches!(check_request_limits(&ancient), Err(EngineError::LimitExceeded(_))));

        let mut essay = ok;
        essay.notes = "x".repeat(MAX_NOTES_LEN + 1);
        assert!(matches!(check_request_limits(&essay), Err(EngineError::LimitExceeded(_))));
    }

    // ── properties ────────────────────────────────────────

    /// (departure, duration) pairs in minutes from DAY, spread over two days.
    fn window() -> impl Strategy<Value = (Ms, Ms)> {
        (0i64..2 * 24 * 60, 1i64..8 * 60).prop_map(|(start, len)| (DAY + start * M, DAY + (start + len) * M))
    }

    proptest! {
        #[test]
        fn prop_conflict_in_both_orders_iff_trips_overlap(a in window(), b in window()) {
            let v = Ulid::new();
            let ra = existing(v, a.0, a.1);
            let rb = existing(v, b.0, b.1);
            let both = conflicts(ra.span(), &rb, H) && conflicts(rb.span(), &ra, H);
            prop_assert_eq!(both, ra.span().overlaps(&rb.span()));
        }

        #[test]
        fn prop_conflict_in_either_order_iff_buffered_spans_overlap(a in window(), b in window()) {
            let v = Ulid::new();
            let ra = existing(v, a.0, a.1);
            let rb = existing(v, b.0, b.1);
            let either = conflicts(ra.span(), &rb, H) || conflicts(rb.span(), &ra, H);
            prop_assert_eq!(either, ra.buffered_span(H).overlaps(&rb.buffered_span(H)));
        }

        #[test]
        fn prop_no_false_negatives(e in window(), r in window()) {
            let v = Ulid::new();
            let booked = existing(v, e.0, e.1);
            let guarded = Span::new(e.0 - H, e.1);
            prop_assume!(!Span::new(r.0, r.1).overlaps(&guarded));
            prop_assert!(validate(&request(v, r.0, r.1), 0, &[booked], H).is_ok());
        }

        #[test]
        fn prop_no_false_positives(e in window(), r in window()) {
            let v = Ulid::new();
            let booked = existing(v, e.0, e.1);
            let guarded = Span::new(e.0 - H, e.1);
            let requested = Span::new(r.0, r.1);
            prop_assume!(requested.overlaps(&guarded));
            let err = validate(&request(v, r.0, r.1), 0, std::slice::from_ref(&booked), H).unwrap_err();
            prop_assert_eq!(err, conflict_with(&booked));
        }

        #[test]
        fn prop_gate_agrees_with_overlap(es in prop::collection::vec(window(), 0..6), r in window()) {
            let v = Ulid::new();
            let booked: Vec<Reservation> = es.into_iter().map(|(d, a)| existing(v, d, a)).collect();
            let trip = Span::new(r.0, r.1);
            if first_conflict(v, trip, &booked, H).is_none() {
                prop_assert!(resolve(v, r.0, &booked, H).available);
            }
        }
    }
}
