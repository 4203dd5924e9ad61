//! Core identities, addresses and ride records
use crate::error::ValidationError;
use bech32::Bech32m;
use chrono::{DateTime, Utc};

const IDENTITY_HRP: &str = "user";
pub(crate) const ADDRESS_HRP: &str = "ride";

/// A user's public identity: the bech32 encoding of their ed25519 public
/// key. The encoded string is the index key and the value that appears in
/// ledger instructions; the raw key is recovered for signature checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let hrp = bech32::Hrp::parse_unchecked(IDENTITY_HRP);
        let encoded = bech32::encode::<Bech32m>(hrp, public_key)
            .expect("32-byte payload fits the bech32 length limit");
        Self(encoded)
    }

    /// Parse a caller-supplied identity string, verifying it decodes back
    /// to a 32-byte public key under the expected prefix.
    pub fn parse(encoded: &str) -> Result<Self, ValidationError> {
        let (hrp, payload) = bech32::decode(encoded)
            .map_err(|_| ValidationError::MalformedIdentity(encoded.to_string()))?;
        if hrp.as_str() != IDENTITY_HRP || payload.len() != 32 {
            return Err(ValidationError::MalformedIdentity(encoded.to_string()));
        }
        Ok(Self(encoded.to_string()))
    }

    pub fn public_key(&self) -> Result<[u8; 32], ValidationError> {
        let (_, payload) = bech32::decode(&self.0)
            .map_err(|_| ValidationError::MalformedIdentity(self.0.clone()))?;
        payload
            .try_into()
            .map_err(|_| ValidationError::MalformedIdentity(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The derived ledger-side address of a ride record. Doubles as the local
/// index key, giving a 1:1 mapping between projection and ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RideAddress(String);

impl RideAddress {
    pub(crate) fn from_digest(digest: &[u8; 32]) -> Self {
        let hrp = bech32::Hrp::parse_unchecked(ADDRESS_HRP);
        let encoded = bech32::encode::<Bech32m>(hrp, digest)
            .expect("32-byte payload fits the bech32 length limit");
        Self(encoded)
    }

    pub fn parse(encoded: &str) -> Result<Self, ValidationError> {
        let (hrp, payload) = bech32::decode(encoded)
            .map_err(|_| ValidationError::MalformedAddress(encoded.to_string()))?;
        if hrp.as_str() != ADDRESS_HRP || payload.len() != 32 {
            return Err(ValidationError::MalformedAddress(encoded.to_string()));
        }
        Ok(Self(encoded.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RideAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct GeoPoint {
    #[n(0)]
    pub lat: f64,
    #[n(1)]
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_in_range(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Role {
    #[n(0)]
    Driver,
    #[n(1)]
    Rider,
}

/// Ride status as a closed variant set. The free-form status string of the
/// upstream system is gone; every transition consults [`RideStatus::permits`]
/// before any ledger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RideStatus {
    #[n(0)]
    Requested,
    #[n(1)]
    Accepted,
    #[n(2)]
    Completed,
    #[n(3)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Accept,
    Complete,
    Cancel,
    Close,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// The transition table. `Close` releases the ledger-side record and is
    /// only valid once the ride has reached a terminal state.
    pub fn permits(self, event: LifecycleEvent) -> bool {
        match (self, event) {
            (RideStatus::Requested, LifecycleEvent::Accept) => true,
            (RideStatus::Accepted, LifecycleEvent::Complete) => true,
            (RideStatus::Requested | RideStatus::Accepted, LifecycleEvent::Cancel) => true,
            (RideStatus::Completed | RideStatus::Cancelled, LifecycleEvent::Close) => true,
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value)
    }
}

/// Registered user as projected into the local index. The signing key is
/// present only as the vault's sealed record; the plaintext seed never
/// appears in this struct.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub identity: Identity,
    #[n(1)]
    pub sealed_key: String,
    #[n(2)]
    pub role: Role,
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub contact: String,
    #[n(5)]
    pub password_digest: String,
    #[n(6)]
    pub created_at: Timestamp,
}

/// Local projection of a ride. Written only after the corresponding ledger
/// instruction confirmed; the ledger stays the source of truth.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Ride {
    #[n(0)]
    pub address: RideAddress,
    #[n(1)]
    pub rider: Identity,
    #[n(2)]
    pub driver: Option<Identity>,
    #[n(3)]
    pub fare: u64,
    #[n(4)]
    pub distance_km: f64,
    #[n(5)]
    pub duration_min: f64,
    #[n(6)]
    pub pickup: GeoPoint,
    #[n(7)]
    pub drop_off: GeoPoint,
    #[n(8)]
    pub status: RideStatus,
    #[n(9)]
    pub nonce: u64,
    #[n(10)]
    pub requested_at: Timestamp,
    #[n(11)]
    pub accepted_at: Option<Timestamp>,
    #[n(12)]
    pub ended_at: Option<Timestamp>,
    #[n(13)]
    pub ledger_closed: bool,
}

impl<C> minicbor::Encode<C> for Identity {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Identity {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(Identity(d.str()?.to_string()))
    }
}

impl<C> minicbor::Encode<C> for RideAddress {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for RideAddress {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(RideAddress(d.str()?.to_string()))
    }
}

impl<C> minicbor::Encode<C> for Timestamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Timestamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(Timestamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
