use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Minimum idle time a vehicle needs before each departure.
pub const DEFAULT_BUFFER_MS: Ms = HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Parse an instant from wire text: RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]`
/// read as UTC.
pub fn parse_instant(text: &str) -> Option<Ms> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Render an instant as RFC 3339 UTC with millisecond precision.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub model: String,
    pub plate: String,
}

/// A persisted trip. Immutable once created, except for `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub departure: Ms,
    pub arrival: Ms,
    pub driver_name: String,
    pub registration: String,
    /// Digits only.
    pub phone: String,
    pub destination: String,
    pub notes: String,
    pub completed: bool,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.departure, self.arrival)
    }

    /// The trip plus the preparation window that must stay free before it departs.
    pub fn buffered_span(&self, buffer: Ms) -> Span {
        Span::new(self.departure - buffer, self.arrival)
    }

    pub fn delivery_deadline(&self, buffer: Ms) -> Ms {
        self.departure - buffer
    }
}

/// A reservation that passed validation and has no id yet; the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub vehicle_id: Ulid,
    pub departure: Ms,
    pub arrival: Ms,
    pub driver_name: String,
    pub registration: String,
    pub phone: String,
    pub destination: String,
    pub notes: String,
}

impl NewReservation {
    pub fn into_reservation(self, id: Ulid) -> Reservation {
        Reservation {
            id,
            vehicle_id: self.vehicle_id,
            departure: self.departure,
            arrival: self.arrival,
            driver_name: self.driver_name,
            registration: self.registration,
            phone: self.phone,
            destination: self.destination,
            notes: self.notes,
            completed: false,
        }
    }
}

/// Raw reservation input as submitted by an operator. Any field may be unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub vehicle_id: Option<Ulid>,
    pub departure: Option<Ms>,
    pub arrival: Option<Ms>,
    pub driver_name: String,
    pub registration: String,
    pub phone: String,
    pub destination: String,
    pub notes: String,
}

/// Point-in-time view of whether a vehicle can be booked. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityStatus {
    pub available: bool,
    /// `None` means available without restriction.
    pub unavailable_until: Option<Ms>,
}

impl AvailabilityStatus {
    pub const UNRESTRICTED: Self = Self {
        available: true,
        unavailable_until: None,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAvailability {
    pub vehicle: Vehicle,
    pub status: AvailabilityStatus,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        model: String,
        plate: String,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCompleted {
        id: Ulid,
        vehicle_id: Ulid,
    },
}

impl Event {
    pub fn vehicle_id(&self) -> Ulid {
        match self {
            Event::VehicleRegistered { id, .. } => *id,
            Event::ReservationCreated { reservation } => reservation.vehicle_id,
            Event::ReservationCompleted { vehicle_id, .. } => *vehicle_id,
        }
    }
}
