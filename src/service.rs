//! The Ride Lifecycle Coordinator.
//!
//! Drives a ride through Requested -> Accepted -> Completed/Cancelled.
//! Every mutating step is ledger-first: the signed instruction must confirm
//! before the local projection changes, so the ledger stays the settlement
//! authority and the index remains a read cache. Transitions for a single
//! ride address are serialized through a per-address lock held across the
//! ledger call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::address;
use crate::error::{LedgerError, ServiceError, ValidationError};
use crate::fare::{self, FareSchedule};
use crate::index::{LocalIndex, UserField};
use crate::ledger::{GatewayConfig, Instruction, LedgerGateway, LedgerTransport, SignedInstruction};
use crate::registry::DriverRegistry;
use crate::types::{
    GeoPoint, Identity, LifecycleEvent, Ride, RideAddress, RideStatus, Role, Timestamp, User,
};
use crate::vault::KeyVault;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub fares: FareSchedule,
    pub gateway: GatewayConfig,
    /// Bound on address-collision retries during ride creation.
    pub create_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fares: FareSchedule::default(),
            gateway: GatewayConfig::default(),
            create_attempts: 3,
        }
    }
}

/// Outcome of a reconciliation pass. A pass over an already-consistent
/// index reports `healed == 0` and performs no writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: u32,
    pub healed: u32,
}

/// One lock per ride address; transitions on distinct addresses proceed in
/// parallel. The guard is dropped on every exit path, including timeouts.
#[derive(Default)]
struct AddressLocks {
    inner: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AddressLocks {
    fn for_address(&self, address: &RideAddress) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("address lock map poisoned");
        map.entry(address.as_str().to_string()).or_default().clone()
    }
}

pub struct RideCoordinator {
    index: LocalIndex,
    vault: KeyVault,
    gateway: LedgerGateway,
    drivers: Arc<DriverRegistry>,
    config: CoordinatorConfig,
    locks: AddressLocks,
}

impl RideCoordinator {
    pub fn new(
        db: &Arc<sled::Db>,
        vault: KeyVault,
        transport: Arc<dyn LedgerTransport>,
        drivers: Arc<DriverRegistry>,
    ) -> Result<Self, ServiceError> {
        Self::with_config(db, vault, transport, drivers, CoordinatorConfig::default())
    }

    pub fn with_config(
        db: &Arc<sled::Db>,
        vault: KeyVault,
        transport: Arc<dyn LedgerTransport>,
        drivers: Arc<DriverRegistry>,
        config: CoordinatorConfig,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            index: LocalIndex::open(db)?,
            vault,
            gateway: LedgerGateway::new(transport, config.gateway),
            drivers,
            config,
            locks: AddressLocks::default(),
        })
    }

    /// Register a user. A fresh ed25519 keypair is generated; the seed is
    /// sealed into the vault record before the user is stored, and drivers
    /// additionally enter the driver pool.
    pub fn register(
        &self,
        name: &str,
        contact: &str,
        role: Role,
        password: &str,
    ) -> Result<Identity, ServiceError> {
        if name.is_empty() {
            return Err(ValidationError::MissingField("name").into());
        }
        if contact.is_empty() {
            return Err(ValidationError::MissingField("contact").into());
        }
        if password.is_empty() {
            return Err(ValidationError::MissingField("password").into());
        }

        let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let identity = Identity::from_public_key(&signing_key.verifying_key().to_bytes());
        let sealed_key = self.vault.seal(&signing_key.to_bytes())?;

        let user = User {
            identity: identity.clone(),
            sealed_key,
            role,
            name: name.to_string(),
            contact: contact.to_string(),
            password_digest: sha256::digest(password),
            created_at: Timestamp::now(),
        };
        self.index.put_user(&user)?;

        if role == Role::Driver {
            self.drivers.add(identity.clone());
        }

        info!(identity = %identity, ?role, "registered user");
        Ok(identity)
    }

    /// Look a user up by name or contact and check their password digest.
    /// A name match takes precedence over a contact match when the same
    /// identifier would resolve to different users.
    pub fn authenticate(&self, identifier: &str, password: &str) -> Result<Identity, ServiceError> {
        if identifier.is_empty() || password.is_empty() {
            return Err(ValidationError::MissingField("identifier or password").into());
        }

        let user = match self.index.find_user_by_field(UserField::Name, identifier)? {
            Some(user) => user,
            None => self
                .index
                .find_user_by_field(UserField::Contact, identifier)?
                .ok_or_else(|| ServiceError::NotFound(format!("user {identifier:?}")))?,
        };

        if user.password_digest != sha256::digest(password) {
            return Err(ValidationError::Invalid("invalid credentials".to_string()).into());
        }
        Ok(user.identity)
    }

    /// Record a driver's location report in the process-scoped pool.
    pub fn update_driver_location(
        &self,
        driver: &Identity,
        location: GeoPoint,
    ) -> Result<(), ServiceError> {
        if !location.is_in_range() {
            return Err(ValidationError::Invalid(format!(
                "location out of range: ({}, {})",
                location.lat, location.lng
            ))
            .into());
        }
        if !self.drivers.update_location(driver, location) {
            return Err(ServiceError::NotFound(format!("driver {driver}")));
        }
        Ok(())
    }

    /// Create a ride: compute the fare, derive a ledger address from the
    /// rider and a fresh nonce, submit the creation instruction signed with
    /// the rider's vaulted key, and only then write the Requested
    /// projection. An address collision redraws the nonce and retries, up
    /// to the configured bound.
    pub async fn create_ride(
        &self,
        rider: &Identity,
        pickup: GeoPoint,
        drop_off: GeoPoint,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Ride, ServiceError> {
        let duration_min = (end_time - start_time).num_milliseconds() as f64 / 60_000.0;
        let fare_amount = self.config.fares.compute(pickup, drop_off, duration_min)?;
        let distance_km = fare::distance_km(pickup, drop_off);

        let rider_user = self
            .index
            .get_user(rider)?
            .ok_or_else(|| ServiceError::NotFound(format!("rider {rider}")))?;
        if rider_user.role != Role::Rider {
            return Err(ValidationError::Invalid(format!("{rider} is not a rider")).into());
        }

        let mut nonce = Utc::now().timestamp_millis() as u64;
        let mut attempt = 0u32;
        loop {
            let ride_address = address::derive(address::RIDE_NAMESPACE, rider, nonce)?;
            let signed = self.signed_instruction(
                &rider_user,
                Instruction::CreateRide {
                    address: ride_address.clone(),
                    rider: rider.clone(),
                    nonce,
                    fare: fare_amount,
                    distance_m: (distance_km * 1000.0).round() as u64,
                },
            )?;

            match self.gateway.create_ride_record(&signed).await {
                Ok(_) => {
                    let ride = Ride {
                        address: ride_address.clone(),
                        rider: rider.clone(),
                        driver: None,
                        fare: fare_amount,
                        distance_km,
                        duration_min,
                        pickup,
                        drop_off,
                        status: RideStatus::Requested,
                        nonce,
                        requested_at: Timestamp::now(),
                        accepted_at: None,
                        ended_at: None,
                        ledger_closed: false,
                    };
                    self.index.put_ride(&ride)?;
                    info!(address = %ride_address, rider = %rider, fare = fare_amount, "ride requested");
                    return Ok(ride);
                }
                Err(LedgerError::AccountAlreadyExists)
                    if attempt + 1 < self.config.create_attempts =>
                {
                    attempt += 1;
                    warn!(address = %ride_address, attempt, "ride address collision, redrawing nonce");
                    nonce = nonce.wrapping_add(rand::thread_rng().gen_range(1..1_000u64));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn ride_status(&self, address: &RideAddress) -> Result<Ride, ServiceError> {
        self.index
            .get_ride(address)?
            .ok_or_else(|| ServiceError::NotFound(format!("ride {address}")))
    }

    /// Accept a Requested ride on behalf of a driver. Exactly one of two
    /// concurrent accepts can win: the loser re-reads the projection under
    /// the address lock and fails the transition guard.
    pub async fn accept_ride(
        &self,
        address: &RideAddress,
        driver: &Identity,
    ) -> Result<Ride, ServiceError> {
        let driver_user = self
            .index
            .get_user(driver)?
            .ok_or_else(|| ServiceError::NotFound(format!("driver {driver}")))?;
        if driver_user.role != Role::Driver {
            return Err(ValidationError::Invalid(format!("{driver} is not a driver")).into());
        }

        let lock = self.locks.for_address(address);
        let _guard = lock.lock().await;

        let mut ride = self.ride_status(address)?;
        if !ride.status.permits(LifecycleEvent::Accept) {
            return Err(ServiceError::Conflict {
                operation: "accept",
                status: ride.status,
            });
        }

        let signed = self.signed_instruction(
            &driver_user,
            Instruction::AcceptRide {
                address: address.clone(),
                driver: driver.clone(),
            },
        )?;
        self.gateway.accept_ride_record(&signed).await?;

        ride.driver = Some(driver.clone());
        ride.status = RideStatus::Accepted;
        ride.accepted_at = Some(Timestamp::now());
        self.index.put_ride(&ride)?;

        info!(address = %address, driver = %driver, "ride accepted");
        Ok(ride)
    }

    /// Complete an Accepted ride. The completion instruction is signed with
    /// the rider's vaulted key.
    pub async fn complete_ride(&self, address: &RideAddress) -> Result<Ride, ServiceError> {
        let lock = self.locks.for_address(address);
        let _guard = lock.lock().await;

        let mut ride = self.ride_status(address)?;
        if !ride.status.permits(LifecycleEvent::Complete) {
            return Err(ServiceError::Conflict {
                operation: "complete",
                status: ride.status,
            });
        }

        let rider_user = self
            .index
            .get_user(&ride.rider)?
            .ok_or_else(|| ServiceError::NotFound(format!("rider {}", ride.rider)))?;
        let signed = self.signed_instruction(
            &rider_user,
            Instruction::CompleteRide {
                address: address.clone(),
            },
        )?;
        self.gateway.complete_ride_record(&signed).await?;

        ride.status = RideStatus::Completed;
        ride.ended_at = Some(Timestamp::now());
        self.index.put_ride(&ride)?;

        info!(address = %address, "ride completed");
        Ok(ride)
    }

    /// Cancel a ride that has not yet completed.
    pub async fn cancel_ride(&self, address: &RideAddress) -> Result<Ride, ServiceError> {
        let lock = self.locks.for_address(address);
        let _guard = lock.lock().await;

        let mut ride = self.ride_status(address)?;
        if !ride.status.permits(LifecycleEvent::Cancel) {
            return Err(ServiceError::Conflict {
                operation: "cancel",
                status: ride.status,
            });
        }

        let rider_user = self
            .index
            .get_user(&ride.rider)?
            .ok_or_else(|| ServiceError::NotFound(format!("rider {}", ride.rider)))?;
        let signed = self.signed_instruction(
            &rider_user,
            Instruction::CancelRide {
                address: address.clone(),
                by_rider: true,
            },
        )?;
        self.gateway.cancel_ride_record(&signed).await?;

        ride.status = RideStatus::Cancelled;
        ride.ended_at = Some(Timestamp::now());
        self.index.put_ride(&ride)?;

        info!(address = %address, "ride cancelled");
        Ok(ride)
    }

    /// Release the ledger-side account of a finished ride. The local
    /// projection is kept as history, marked as closed.
    pub async fn close_ride(&self, address: &RideAddress) -> Result<Ride, ServiceError> {
        let lock = self.locks.for_address(address);
        let _guard = lock.lock().await;

        let mut ride = self.ride_status(address)?;
        if !ride.status.permits(LifecycleEvent::Close) || ride.ledger_closed {
            return Err(ServiceError::Conflict {
                operation: "close",
                status: ride.status,
            });
        }

        let rider_user = self
            .index
            .get_user(&ride.rider)?
            .ok_or_else(|| ServiceError::NotFound(format!("rider {}", ride.rider)))?;
        let signed = self.signed_instruction(
            &rider_user,
            Instruction::CloseRide {
                address: address.clone(),
            },
        )?;
        self.gateway.close_ride_record(&signed).await?;

        ride.ledger_closed = true;
        self.index.put_ride(&ride)?;

        info!(address = %address, "ride ledger account closed");
        Ok(ride)
    }

    /// Heal projections that diverged from the ledger, e.g. after a crash
    /// between ledger confirmation and index write, or after an ambiguous
    /// timeout. Scans non-terminal rides whose last local transition is
    /// older than `older_than`, re-reads their ledger account and adopts
    /// the ledger's status. Idempotent: an already-consistent ride is
    /// examined but not rewritten.
    pub async fn reconcile(&self, older_than: Duration) -> Result<ReconcileReport, ServiceError> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for candidate in self.index.open_rides()? {
            let basis = candidate
                .accepted_at
                .unwrap_or(candidate.requested_at)
                .to_datetime_utc();
            if now.signed_duration_since(basis) < older_than {
                continue;
            }

            let lock = self.locks.for_address(&candidate.address);
            let _guard = lock.lock().await;

            // Re-read under the lock; a concurrent transition may have
            // finished while we were scanning.
            let Some(mut ride) = self.index.get_ride(&candidate.address)? else {
                continue;
            };
            if ride.status.is_terminal() {
                continue;
            }
            report.examined += 1;

            match self.gateway.fetch_ride_record(&ride.address).await? {
                Some(record) if record.status != ride.status => {
                    info!(
                        address = %ride.address,
                        local = ?ride.status,
                        ledger = ?record.status,
                        "healing diverged projection from ledger"
                    );
                    ride.status = record.status;
                    if let Some(driver) = record.driver {
                        ride.driver = Some(driver);
                    }
                    if record.status == RideStatus::Accepted && ride.accepted_at.is_none() {
                        ride.accepted_at = Some(Timestamp::now());
                    }
                    if record.status.is_terminal() && ride.ended_at.is_none() {
                        ride.ended_at = Some(Timestamp::now());
                    }
                    self.index.put_ride(&ride)?;
                    report.healed += 1;
                }
                // Consistent with the ledger, or no ledger record to adopt
                // (never confirmed, or already closed): leave it alone.
                _ => {}
            }
        }

        Ok(report)
    }

    fn signed_instruction(
        &self,
        user: &User,
        instruction: Instruction,
    ) -> Result<SignedInstruction, ServiceError> {
        let message =
            minicbor::to_vec(&instruction).map_err(|e| ServiceError::Codec(e.to_string()))?;
        let signature = self.vault.sign_with_sealed_key(&user.sealed_key, &message)?;
        Ok(SignedInstruction {
            instruction,
            signer: user.identity.clone(),
            signature: signature.to_vec(),
        })
    }
}
