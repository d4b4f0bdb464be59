use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{ReservationStore, StoreError, VehicleScope, VehicleStore};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before the non-append command sees the file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break, // channel empty, flush batch
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

fn commit_batch(wal: &mut Wal, batch: Pending) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &Pending) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Store ────────────────────────────────────────────────

/// Vehicles and reservations held in memory, made durable by a group-commit WAL.
pub struct WalStore {
    vehicles: DashMap<Ulid, Vehicle>,
    /// Reservations per vehicle, sorted by `(departure, id)`.
    reservations: DashMap<Ulid, Vec<Reservation>>,
    /// Reverse lookup: reservation id → vehicle id
    reservation_vehicle: DashMap<Ulid, Ulid>,
    /// Writers hold it shared from WAL append to in-memory apply; compaction
    /// holds it exclusively so its snapshot cannot miss a committed event.
    write_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a
    /// tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, replay) = Wal::open(path)?;
        if replay.discarded > 0 {
            warn!(
                "discarded {} bytes of torn WAL tail in {}",
                replay.discarded,
                path.display()
            );
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            vehicles: DashMap::new(),
            reservations: DashMap::new(),
            reservation_vehicle: DashMap::new(),
            write_gate: RwLock::new(()),
            wal_tx,
        };
        for event in &replay.events {
            store.apply(event);
        }
        info!(
            "replayed {} events from {} ({} vehicles, {} reservations)",
            replay.events.len(),
            path.display(),
            store.vehicles.len(),
            store.reservation_vehicle.len()
        );
        Ok(store)
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::VehicleRegistered { id, model, plate } => {
                self.vehicles.insert(
                    *id,
                    Vehicle {
                        id: *id,
                        model: model.clone(),
                        plate: plate.clone(),
                    },
                );
            }
            Event::ReservationCreated { reservation } => {
                self.reservation_vehicle
                    .insert(reservation.id, reservation.vehicle_id);
                let mut trips = self.reservations.entry(reservation.vehicle_id).or_default();
                let key = (reservation.departure, reservation.id);
                let pos = trips
                    .binary_search_by_key(&key, |r| (r.departure, r.id))
                    .unwrap_or_else(|e| e);
                trips.insert(pos, reservation.clone());
            }
            Event::ReservationCompleted { id, vehicle_id } => {
                if let Some(mut trips) = self.reservations.get_mut(vehicle_id) {
                    if let Some(r) = trips.iter_mut().find(|r| r.id == *id) {
                        r.completed = true;
                    }
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))??;
        Ok(())
    }

    async fn persist_and_apply(&self, event: &Event) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        self.wal_append(event).await?;
        self.apply(event);
        Ok(())
    }

    fn find_reservation(&self, id: Ulid) -> Option<Reservation> {
        let vehicle_id = *self.reservation_vehicle.get(&id)?.value();
        let trips = self.reservations.get(&vehicle_id)?;
        trips.iter().find(|r| r.id == id).cloned()
    }

    fn snapshot_vehicles(&self) -> Vec<Vehicle> {
        let mut vehicles: Vec<Vehicle> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    fn snapshot_reservations(&self, scope: VehicleScope) -> Vec<Reservation> {
        match scope {
            VehicleScope::One(vehicle_id) => self
                .reservations
                .get(&vehicle_id)
                .map(|trips| trips.value().clone())
                .unwrap_or_default(),
            VehicleScope::All => {
                let mut all: Vec<Reservation> = self
                    .reservations
                    .iter()
                    .flat_map(|e| e.value().clone())
                    .collect();
                all.sort_by_key(|r| (r.departure, r.id));
                all
            }
        }
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;

        let mut events: Vec<Event> = self
            .snapshot_vehicles()
            .into_iter()
            .map(|v| Event::VehicleRegistered {
                id: v.id,
                model: v.model,
                plate: v.plate,
            })
            .collect();
        events.extend(
            self.snapshot_reservations(VehicleScope::All)
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))??;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn fetch_reservations(&self, scope: VehicleScope) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.snapshot_reservations(scope))
    }

    async fn create_reservation(&self, reservation: NewReservation) -> Result<Ulid, StoreError> {
        if !self.vehicles.contains_key(&reservation.vehicle_id) {
            return Err(StoreError::NotFound(reservation.vehicle_id));
        }
        let id = Ulid::new();
        let event = Event::ReservationCreated {
            reservation: reservation.into_reservation(id),
        };
        self.persist_and_apply(&event).await?;
        Ok(id)
    }

    async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        let mut reservation = self.find_reservation(id).ok_or(StoreError::NotFound(id))?;
        if reservation.completed {
            return Ok(reservation);
        }
        let event = Event::ReservationCompleted {
            id,
            vehicle_id: reservation.vehicle_id,
        };
        self.persist_and_apply(&event).await?;
        reservation.completed = true;
        Ok(reservation)
    }
}

#[async_trait]
impl VehicleStore for WalStore {
    async fn fetch_vehicles(&self) -> Result<Vec<Vehicle>, StoreError> {
        Ok(self.snapshot_vehicles())
    }

    async fn register_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        if self.vehicles.contains_key(&vehicle.id) {
            return Err(StoreError::AlreadyExists(vehicle.id));
        }
        let event = Event::VehicleRegistered {
            id: vehicle.id,
            model: vehicle.model,
            plate: vehicle.plate,
        };
        self.persist_and_apply(&event).await
    }
}
