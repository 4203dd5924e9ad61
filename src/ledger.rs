//! Gateway to the external settlement ledger.
//!
//! The gateway is the only component that talks to the ledger. It submits
//! signed instructions, awaits confirmation with a bounded timeout, retries
//! transient transport failures with backoff, and maps ledger-side
//! rejections into the crate's error taxonomy. [`InMemoryLedger`] is an
//! in-process transport reproducing the external program's account guards
//! for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::types::{Identity, RideAddress, RideStatus};

/// Instruction set of the on-ledger ride program. The signed message is the
/// CBOR encoding of this value.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub enum Instruction {
    #[n(0)]
    CreateRide {
        #[n(0)]
        address: RideAddress,
        #[n(1)]
        rider: Identity,
        #[n(2)]
        nonce: u64,
        #[n(3)]
        fare: u64,
        #[n(4)]
        distance_m: u64,
    },
    #[n(1)]
    AcceptRide {
        #[n(0)]
        address: RideAddress,
        #[n(1)]
        driver: Identity,
    },
    #[n(2)]
    CompleteRide {
        #[n(0)]
        address: RideAddress,
    },
    #[n(3)]
    CancelRide {
        #[n(0)]
        address: RideAddress,
        #[n(1)]
        by_rider: bool,
    },
    #[n(4)]
    CloseRide {
        #[n(0)]
        address: RideAddress,
    },
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct SignedInstruction {
    #[n(0)]
    pub instruction: Instruction,
    #[n(1)]
    pub signer: Identity,
    #[cbor(n(2), with = "minicbor::bytes")]
    pub signature: Vec<u8>,
}

/// Marker returned once the ledger confirmed a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfirmation {
    pub transaction_id: String,
}

/// The ledger's view of a ride account, as returned by a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRideRecord {
    pub rider: Identity,
    pub driver: Option<Identity>,
    pub nonce: u64,
    pub fare: u64,
    pub distance_m: u64,
    pub status: RideStatus,
}

/// Seam to the external ledger. Implementations suspend the calling task
/// until the ledger answers; they never retry on their own.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    async fn submit(&self, signed: &SignedInstruction) -> Result<TxConfirmation, LedgerError>;

    async fn fetch(&self, address: &RideAddress) -> Result<Option<LedgerRideRecord>, LedgerError>;
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// How long a single submission may wait for confirmation.
    pub timeout: Duration,
    /// Retries on transient failures, beyond the initial attempt.
    pub max_retries: u32,
    /// Initial backoff; doubles per retry.
    pub retry_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

pub struct LedgerGateway {
    transport: Arc<dyn LedgerTransport>,
    config: GatewayConfig,
}

impl LedgerGateway {
    pub fn new(transport: Arc<dyn LedgerTransport>, config: GatewayConfig) -> Self {
        Self { transport, config }
    }

    pub async fn create_ride_record(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        debug_assert!(matches!(
            signed.instruction,
            Instruction::CreateRide { .. }
        ));
        self.submit_with_retries(signed).await
    }

    pub async fn accept_ride_record(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        debug_assert!(matches!(
            signed.instruction,
            Instruction::AcceptRide { .. }
        ));
        self.submit_with_retries(signed).await
    }

    pub async fn complete_ride_record(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        debug_assert!(matches!(
            signed.instruction,
            Instruction::CompleteRide { .. }
        ));
        self.submit_with_retries(signed).await
    }

    pub async fn cancel_ride_record(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        debug_assert!(matches!(
            signed.instruction,
            Instruction::CancelRide { .. }
        ));
        self.submit_with_retries(signed).await
    }

    pub async fn close_ride_record(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        debug_assert!(matches!(signed.instruction, Instruction::CloseRide { .. }));
        self.submit_with_retries(signed).await
    }

    /// Read a ride account back from the ledger, for reconciliation.
    pub async fn fetch_ride_record(
        &self,
        address: &RideAddress,
    ) -> Result<Option<LedgerRideRecord>, LedgerError> {
        let mut delay = self.config.retry_backoff;
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(
                self.config.timeout,
                self.transport.fetch(address),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LedgerError::Timeout),
            };

            match outcome {
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(%address, %err, attempt, "ledger fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    /// Submit with timeout; transient failures are retried with doubling
    /// backoff up to the configured count. `InvalidStateForOperation` and
    /// the other logic-level rejections are never retried.
    async fn submit_with_retries(
        &self,
        signed: &SignedInstruction,
    ) -> Result<TxConfirmation, LedgerError> {
        let mut delay = self.config.retry_backoff;
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(
                self.config.timeout,
                self.transport.submit(signed),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LedgerError::Timeout),
            };

            match outcome {
                Ok(confirmation) => {
                    debug!(
                        signer = %signed.signer,
                        tx = %confirmation.transaction_id,
                        "ledger confirmed instruction"
                    );
                    return Ok(confirmation);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(signer = %signed.signer, %err, attempt, "ledger submission failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// In-process stand-in for the external ledger program. Enforces the same
/// account guards the on-ledger program does: signature verification,
/// create-once addressing and status-gated transitions. Fault injection
/// hooks let tests exercise the gateway's retry and timeout paths.
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: Mutex<HashMap<String, LedgerRideRecord>>,
    submissions: AtomicU32,
    transport_faults: AtomicU32,
    stall: Mutex<Option<Duration>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn fail_submissions(&self, n: u32) {
        self.transport_faults.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `duration`, for driving the gateway into timeout.
    pub fn stall_for(&self, duration: Duration) {
        *self.stall.lock().expect("stall lock poisoned") = Some(duration);
    }

    /// Total submissions that reached the ledger (after any stall).
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Direct account read, bypassing the gateway. Test helper.
    pub fn record(&self, address: &RideAddress) -> Option<LedgerRideRecord> {
        self.accounts
            .lock()
            .expect("accounts lock poisoned")
            .get(address.as_str())
            .cloned()
    }

    fn apply(&self, signed: &SignedInstruction) -> Result<TxConfirmation, LedgerError> {
        verify_signature(signed)?;

        let mut accounts = self.accounts.lock().expect("accounts lock poisoned");
        match &signed.instruction {
            Instruction::CreateRide {
                address,
                rider,
                nonce,
                fare,
                distance_m,
            } => {
                // The create instruction is funded and signed by the rider.
                if signed.signer != *rider {
                    return Err(LedgerError::SignatureRejected);
                }
                if accounts.contains_key(address.as_str()) {
                    return Err(LedgerError::AccountAlreadyExists);
                }
                accounts.insert(
                    address.as_str().to_string(),
                    LedgerRideRecord {
                        rider: rider.clone(),
                        driver: None,
                        nonce: *nonce,
                        fare: *fare,
                        distance_m: *distance_m,
                        status: RideStatus::Requested,
                    },
                );
            }
            Instruction::AcceptRide { address, driver } => {
                if signed.signer != *driver {
                    return Err(LedgerError::SignatureRejected);
                }
                let record = accounts
                    .get_mut(address.as_str())
                    .ok_or(LedgerError::AccountNotFound)?;
                if record.status != RideStatus::Requested {
                    return Err(LedgerError::InvalidStateForOperation);
                }
                record.driver = Some(driver.clone());
                record.status = RideStatus::Accepted;
            }
            Instruction::CompleteRide { address } => {
                let record = accounts
                    .get_mut(address.as_str())
                    .ok_or(LedgerError::AccountNotFound)?;
                if record.status != RideStatus::Accepted {
                    return Err(LedgerError::InvalidStateForOperation);
                }
                record.status = RideStatus::Completed;
            }
            Instruction::CancelRide { address, .. } => {
                let record = accounts
                    .get_mut(address.as_str())
                    .ok_or(LedgerError::AccountNotFound)?;
                // The program guard only forbids cancelling a completed ride.
                if record.status == RideStatus::Completed {
                    return Err(LedgerError::InvalidStateForOperation);
                }
                record.status = RideStatus::Cancelled;
            }
            Instruction::CloseRide { address } => {
                accounts
                    .remove(address.as_str())
                    .ok_or(LedgerError::AccountNotFound)?;
            }
        }

        let encoded =
            minicbor::to_vec(signed).map_err(|e| LedgerError::TransportError(e.to_string()))?;
        Ok(TxConfirmation {
            transaction_id: sha256::digest(encoded.as_slice()),
        })
    }
}

#[async_trait]
impl LedgerTransport for InMemoryLedger {
    async fn submit(&self, signed: &SignedInstruction) -> Result<TxConfirmation, LedgerError> {
        let stall = *self.stall.lock().expect("stall lock poisoned");
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        self.submissions.fetch_add(1, Ordering::SeqCst);

        if self.transport_faults.load(Ordering::SeqCst) > 0 {
            self.transport_faults.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::TransportError(
                "injected transport fault".to_string(),
            ));
        }

        self.apply(signed)
    }

    async fn fetch(&self, address: &RideAddress) -> Result<Option<LedgerRideRecord>, LedgerError> {
        let stall = *self.stall.lock().expect("stall lock poisoned");
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        Ok(self
            .accounts
            .lock()
            .expect("accounts lock poisoned")
            .get(address.as_str())
            .cloned())
    }
}

fn verify_signature(signed: &SignedInstruction) -> Result<(), LedgerError> {
    let key_bytes = signed
        .signer
        .public_key()
        .map_err(|_| LedgerError::SignatureRejected)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| LedgerError::SignatureRejected)?;

    let message =
        minicbor::to_vec(&signed.instruction).map_err(|e| LedgerError::TransportError(e.to_string()))?;
    let signature =
        Signature::from_slice(&signed.signature).map_err(|_| LedgerError::SignatureRejected)?;

    verifying_key
        .verify(&message, &signature)
        .map_err(|_| LedgerError::SignatureRejected)
}
