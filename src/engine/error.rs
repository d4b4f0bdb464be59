use ulid::Ulid;

use crate::model::{format_instant, Ms};
use crate::store::StoreError;

/// Mandatory reservation fields, declared in the order they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Departure,
    Arrival,
    VehicleId,
    DriverName,
    Registration,
    Phone,
    Destination,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Departure => "departure",
            Field::Arrival => "arrival",
            Field::VehicleId => "vehicle_id",
            Field::DriverName => "driver_name",
            Field::Registration => "registration",
            Field::Phone => "phone",
            Field::Destination => "destination",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a reservation request was refused. Exactly one is reported per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingFields(Vec<Field>),
    DepartureInPast,
    ArrivalNotAfterDeparture,
    InvalidPhoneLength,
    VehicleConflict {
        reservation_id: Ulid,
        existing_departure: Ms,
        existing_arrival: Ms,
        /// Latest instant the vehicle may be returned before the existing trip.
        delivery_deadline: Ms,
    },
    VehicleUnavailable,
}

impl Rejection {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::MissingFields(_) => "missing_fields",
            Rejection::DepartureInPast => "departure_in_past",
            Rejection::ArrivalNotAfterDeparture => "arrival_not_after_departure",
            Rejection::InvalidPhoneLength => "invalid_phone_length",
            Rejection::VehicleConflict { .. } => "vehicle_conflict",
            Rejection::VehicleUnavailable => "vehicle_unavailable",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingFields(fields) => {
                let names: Vec<&str> = fields.iter().map(Field::name).collect();
                write!(f, "missing required fields: {}", names.join(", "))
            }
            Rejection::DepartureInPast => write!(f, "departure cannot be in the past"),
            Rejection::ArrivalNotAfterDeparture => {
                write!(f, "arrival must be after departure")
            }
            Rejection::InvalidPhoneLength => write!(f, "phone number must have 10 or 11 digits"),
            Rejection::VehicleConflict {
                existing_departure,
                delivery_deadline,
                ..
            } => write!(
                f,
                "conflict: vehicle is reserved with departure at {}; it must be delivered by {}",
                format_instant(*existing_departure),
                format_instant(*delivery_deadline)
            ),
            Rejection::VehicleUnavailable => {
                write!(f, "vehicle is not available for the requested departure")
            }
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug)]
pub enum EngineError {
    Rejected(Rejection),
    /// Any store I/O failure. Never retried here.
    StoreUnavailable(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rejected(r) => write!(f, "reservation rejected: {r}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(msg) => EngineError::StoreUnavailable(msg),
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
        }
    }
}
