//! Persistence collaborators of the reservation engine.
//!
//! The engine only sees the [`ReservationStore`] and [`VehicleStore`] traits;
//! every call is an atomic request/response that may fail with a transient
//! I/O error. [`WalStore`] is the bundled implementation.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

/// Which reservations to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleScope {
    One(Ulid),
    All,
}

#[derive(Debug)]
pub enum StoreError {
    Io(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Reservations ordered by `(departure, id)`.
    async fn fetch_reservations(&self, scope: VehicleScope) -> Result<Vec<Reservation>, StoreError>;

    /// Persist an accepted reservation and return the id the store assigned.
    async fn create_reservation(&self, reservation: NewReservation) -> Result<Ulid, StoreError>;

    /// Mark a trip as finished. Completing twice is not an error.
    async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, StoreError>;
}

#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// Vehicles ordered by id.
    async fn fetch_vehicles(&self) -> Result<Vec<Vehicle>, StoreError>;

    async fn register_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError>;
}
