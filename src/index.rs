//! Local keyed index of user and ride projections.
//!
//! A thin layer over sled: two trees, CBOR values, single-key atomicity.
//! Rides are keyed by their derived ledger address, so one local record
//! maps to exactly one ledger account.

use std::sync::Arc;

use crate::error::IndexError;
use crate::types::{Identity, Ride, RideAddress, User};

const USERS_TREE: &str = "users";
const RIDES_TREE: &str = "rides";

/// Field selector for user lookups, the keyed store's `findByField`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    Name,
    Contact,
}

pub struct LocalIndex {
    users: sled::Tree,
    rides: sled::Tree,
}

impl LocalIndex {
    pub fn open(db: &Arc<sled::Db>) -> Result<Self, IndexError> {
        Ok(Self {
            users: db.open_tree(USERS_TREE)?,
            rides: db.open_tree(RIDES_TREE)?,
        })
    }

    pub fn put_user(&self, user: &User) -> Result<(), IndexError> {
        let value = minicbor::to_vec(user).map_err(|e| IndexError::Codec(e.to_string()))?;
        self.users
            .insert(user.identity.as_str().as_bytes(), value)?;
        Ok(())
    }

    pub fn get_user(&self, identity: &Identity) -> Result<Option<User>, IndexError> {
        match self.users.get(identity.as_str().as_bytes())? {
            Some(value) => {
                let user =
                    minicbor::decode(value.as_ref()).map_err(|e| IndexError::Codec(e.to_string()))?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Scan for the first user whose `field` equals `value`. The user set
    /// is small enough that a linear pass serves as the generic
    /// find-by-field operation.
    pub fn find_user_by_field(
        &self,
        field: UserField,
        value: &str,
    ) -> Result<Option<User>, IndexError> {
        for entry in self.users.iter() {
            let (_, raw) = entry?;
            let user: User =
                minicbor::decode(raw.as_ref()).map_err(|e| IndexError::Codec(e.to_string()))?;
            let matched = match field {
                UserField::Name => user.name == value,
                UserField::Contact => user.contact == value,
            };
            if matched {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    pub fn put_ride(&self, ride: &Ride) -> Result<(), IndexError> {
        let value = minicbor::to_vec(ride).map_err(|e| IndexError::Codec(e.to_string()))?;
        self.rides.insert(ride.address.as_str().as_bytes(), value)?;
        Ok(())
    }

    pub fn get_ride(&self, address: &RideAddress) -> Result<Option<Ride>, IndexError> {
        match self.rides.get(address.as_str().as_bytes())? {
            Some(value) => {
                let ride =
                    minicbor::decode(value.as_ref()).map_err(|e| IndexError::Codec(e.to_string()))?;
                Ok(Some(ride))
            }
            None => Ok(None),
        }
    }

    /// All rides still in a non-terminal state, the candidate set for
    /// reconciliation against the ledger.
    pub fn open_rides(&self) -> Result<Vec<Ride>, IndexError> {
        let mut rides = Vec::new();
        for entry in self.rides.iter() {
            let (_, raw) = entry?;
            let ride: Ride =
                minicbor::decode(raw.as_ref()).map_err(|e| IndexError::Codec(e.to_string()))?;
            if !ride.status.is_terminal() {
                rides.push(ride);
            }
        }
        Ok(rides)
    }
}
