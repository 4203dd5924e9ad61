//! Ride lifecycle coordination against an external settlement ledger.
//!
//! A ride is recorded twice: as a projection in a local sled index (fast
//! queries) and as an account on an append-only settlement ledger (the
//! authority for money movement). The coordinator in [`service`] drives a
//! ride through Requested -> Accepted -> Completed/Cancelled, always
//! submitting the ledger instruction first and mutating the local
//! projection only after the ledger has confirmed.

pub mod address;
pub mod error;
pub mod fare;
pub mod index;
pub mod ledger;
pub mod registry;
pub mod service;
pub mod types;
pub mod vault;

mod utils;
