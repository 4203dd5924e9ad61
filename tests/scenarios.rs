//! End-to-end lifecycle scenarios against the in-memory ledger.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, TimeZone, Utc};
use ed25519_dalek::{Signer, SigningKey};
use tempfile::{TempDir, tempdir};

use ride_settlement::error::{LedgerError, ServiceError};
use ride_settlement::ledger::{InMemoryLedger, Instruction, LedgerTransport, SignedInstruction};
use ride_settlement::registry::DriverRegistry;
use ride_settlement::service::RideCoordinator;
use ride_settlement::types::{GeoPoint, Identity, RideStatus, Role};
use ride_settlement::vault::KeyVault;

struct Harness {
    coordinator: RideCoordinator,
    ledger: Arc<InMemoryLedger>,
    registry: Arc<DriverRegistry>,
    // Sled uses file-based locking, so every test gets its own database
    // under a tempdir; dropping the dir cleans it up.
    _temp: TempDir,
}

fn harness() -> anyhow::Result<Harness> {
    let temp = tempdir()?;
    let db = Arc::new(sled::open(temp.path().join("index.db"))?);
    let ledger = Arc::new(InMemoryLedger::new());
    let registry = Arc::new(DriverRegistry::new());
    let coordinator = RideCoordinator::new(
        &db,
        KeyVault::new("scenario-operator-secret"),
        ledger.clone(),
        registry.clone(),
    )?;

    Ok(Harness {
        coordinator,
        ledger,
        registry,
        _temp: temp,
    })
}

fn trip_times() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let start = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
    (start, start + Duration::minutes(30))
}

#[tokio::test]
async fn full_lifecycle_request_accept_complete() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h
        .coordinator
        .register("Alice", "555-0100", Role::Rider, "pw1")
        .context("registering rider")?;
    let bob = h
        .coordinator
        .register("Bob", "555-0200", Role::Driver, "pw2")
        .context("registering driver")?;

    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await
        .context("creating ride")?;

    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.fare > 0);
    assert!(ride.driver.is_none());

    // The ledger account exists before the projection is readable.
    assert!(h.ledger.record(&ride.address).is_some());

    let ride = h
        .coordinator
        .accept_ride(&ride.address, &bob)
        .await
        .context("accepting ride")?;
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.driver.as_ref(), Some(&bob));

    let ride = h
        .coordinator
        .complete_ride(&ride.address)
        .await
        .context("completing ride")?;
    assert_eq!(ride.status, RideStatus::Completed);
    assert!(ride.ended_at.is_some());

    // No transitions out of Completed.
    let err = h.coordinator.cancel_ride(&ride.address).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));

    Ok(())
}

#[tokio::test]
async fn cancel_is_allowed_until_completion() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    let ride = h.coordinator.cancel_ride(&ride.address).await?;
    assert_eq!(ride.status, RideStatus::Cancelled);

    // Cancelled is terminal too.
    let err = h.coordinator.cancel_ride(&ride.address).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));

    Ok(())
}

#[tokio::test]
async fn complete_requires_a_prior_accept() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    let err = h.coordinator.complete_ride(&ride.address).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Conflict {
            operation: "complete",
            status: RideStatus::Requested,
        }
    ));

    Ok(())
}

#[tokio::test]
async fn double_accept_is_rejected() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let bob = h.coordinator.register("Bob", "555-0200", Role::Driver, "pw2")?;
    let carol = h.coordinator.register("Carol", "555-0300", Role::Driver, "pw3")?;

    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    h.coordinator.accept_ride(&ride.address, &bob).await?;
    let err = h
        .coordinator
        .accept_ride(&ride.address, &carol)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));

    Ok(())
}

#[tokio::test]
async fn concurrent_accepts_have_exactly_one_winner() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let bob = h.coordinator.register("Bob", "555-0200", Role::Driver, "pw2")?;
    let carol = h.coordinator.register("Carol", "555-0300", Role::Driver, "pw3")?;

    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    let (first, second) = tokio::join!(
        h.coordinator.accept_ride(&ride.address, &bob),
        h.coordinator.accept_ride(&ride.address, &carol),
    );

    let (winner, loser_err) = match (first, second) {
        (Ok(ride), Err(err)) => ((bob.clone(), ride), err),
        (Err(err), Ok(ride)) => ((carol.clone(), ride), err),
        (Ok(_), Ok(_)) => panic!("both accepts succeeded"),
        (Err(a), Err(b)) => panic!("both accepts failed: {a}; {b}"),
    };

    let (winner_identity, winner_ride) = winner;
    assert_eq!(winner_ride.driver.as_ref(), Some(&winner_identity));
    assert!(matches!(
        loser_err,
        ServiceError::Conflict { .. } | ServiceError::Ledger(LedgerError::InvalidStateForOperation)
    ));

    // The projection records the winner, not the loser.
    let projection = h.coordinator.ride_status(&ride.address)?;
    assert_eq!(projection.status, RideStatus::Accepted);
    assert_eq!(projection.driver, Some(winner_identity));

    Ok(())
}

#[tokio::test]
async fn close_releases_the_ledger_account_but_keeps_history() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let bob = h.coordinator.register("Bob", "555-0200", Role::Driver, "pw2")?;

    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    // Closing a live ride is rejected.
    let err = h.coordinator.close_ride(&ride.address).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { operation: "close", .. }));

    h.coordinator.accept_ride(&ride.address, &bob).await?;
    h.coordinator.complete_ride(&ride.address).await?;
    let ride = h.coordinator.close_ride(&ride.address).await?;

    assert!(ride.ledger_closed);
    assert!(h.ledger.record(&ride.address).is_none());

    // The local projection survives as history.
    let projection = h.coordinator.ride_status(&ride.address)?;
    assert_eq!(projection.status, RideStatus::Completed);

    // A second close has nothing left to release.
    let err = h.coordinator.close_ride(&ride.address).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));

    Ok(())
}

#[tokio::test]
async fn reconciliation_adopts_ledger_state_and_is_idempotent() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let (start, end) = trip_times();
    let ride = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await?;

    // An accept lands on the ledger without ever reaching our index, as if
    // the process crashed between confirmation and projection write.
    let driver_key = SigningKey::from_bytes(&[77u8; 32]);
    let driver = Identity::from_public_key(&driver_key.verifying_key().to_bytes());
    let instruction = Instruction::AcceptRide {
        address: ride.address.clone(),
        driver: driver.clone(),
    };
    let message = minicbor::to_vec(&instruction)?;
    let signed = SignedInstruction {
        instruction,
        signer: driver.clone(),
        signature: driver_key.sign(&message).to_bytes().to_vec(),
    };
    h.ledger.submit(&signed).await?;

    // Local projection is stale.
    assert_eq!(
        h.coordinator.ride_status(&ride.address)?.status,
        RideStatus::Requested
    );

    let report = h.coordinator.reconcile(Duration::zero()).await?;
    assert_eq!(report.healed, 1);

    let projection = h.coordinator.ride_status(&ride.address)?;
    assert_eq!(projection.status, RideStatus::Accepted);
    assert_eq!(projection.driver, Some(driver));

    // Running the pass again on a consistent index writes nothing.
    let report = h.coordinator.reconcile(Duration::zero()).await?;
    assert_eq!(report.healed, 0);

    Ok(())
}

#[tokio::test]
async fn create_rejects_end_before_start() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let (start, end) = trip_times();

    let err = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            end,
            start,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    // Nothing reached the ledger.
    assert_eq!(h.ledger.submissions(), 0);

    Ok(())
}

#[tokio::test]
async fn create_requires_a_registered_rider() -> anyhow::Result<()> {
    let h = harness()?;

    // A driver cannot request a ride, and an unknown identity cannot either.
    let bob = h.coordinator.register("Bob", "555-0200", Role::Driver, "pw2")?;
    let stranger = Identity::from_public_key(&[3u8; 32]);

    let (start, end) = trip_times();
    let pickup = GeoPoint::new(12.9, 77.6);
    let drop_off = GeoPoint::new(13.0, 77.7);

    let err = h
        .coordinator
        .create_ride(&bob, pickup, drop_off, start, end)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .coordinator
        .create_ride(&stranger, pickup, drop_off, start, end)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    Ok(())
}

#[tokio::test]
async fn ledger_failure_leaves_no_projection() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    let (start, end) = trip_times();

    // More faults than the gateway will retry through.
    h.ledger.fail_submissions(10);
    let err = h
        .coordinator
        .create_ride(
            &alice,
            GeoPoint::new(12.9, 77.6),
            GeoPoint::new(13.0, 77.7),
            start,
            end,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Ledger(LedgerError::TransportError(_))
    ));

    // No ride projection was written for the failed creation.
    let report = h.coordinator.reconcile(Duration::zero()).await?;
    assert_eq!(report.examined, 0);

    Ok(())
}

#[tokio::test]
async fn authentication_prefers_name_over_contact() -> anyhow::Result<()> {
    let h = harness()?;

    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;
    // A second user whose *contact* collides with Alice's name.
    let mallory = h.coordinator.register("Mallory", "Alice", Role::Rider, "pw2")?;

    assert_eq!(h.coordinator.authenticate("Alice", "pw1")?, alice);
    assert_eq!(h.coordinator.authenticate("555-0100", "pw1")?, alice);
    assert_eq!(h.coordinator.authenticate("Mallory", "pw2")?, mallory);

    let err = h.coordinator.authenticate("Alice", "wrong").unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h.coordinator.authenticate("nobody", "pw").unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    Ok(())
}

#[tokio::test]
async fn driver_locations_live_in_the_pool() -> anyhow::Result<()> {
    let h = harness()?;

    let bob = h.coordinator.register("Bob", "555-0200", Role::Driver, "pw2")?;
    let alice = h.coordinator.register("Alice", "555-0100", Role::Rider, "pw1")?;

    // Riders never enter the pool.
    assert!(h.registry.contains(&bob));
    assert!(!h.registry.contains(&alice));

    let point = GeoPoint::new(12.95, 77.64);
    h.coordinator.update_driver_location(&bob, point)?;
    assert_eq!(h.registry.location_of(&bob), Some(point));

    let err = h
        .coordinator
        .update_driver_location(&alice, point)
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    Ok(())
}
