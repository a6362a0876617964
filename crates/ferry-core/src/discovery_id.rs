//! Time-rotated rendezvous identifier derivation.
//!
//! Both endpoints of a session derive the same short ASCII string from the
//! channel number (taken from the shared passphrase) and the current wall
//! clock truncated to a fixed slot length. The string is published verbatim
//! as the multicast DNS rendezvous name and, hashed into a multihash, as the
//! DHT provider key.
//!
//! Wire format, fixed for interoperability: decimal channel number, an ASCII
//! hyphen, decimal Unix-seconds of the slot start. Channel 42 in the slot
//! starting at 1754100000 yields `"42-1754100000"`.

use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Slot length used when the configuration does not override it.
pub const DEFAULT_SLOT_LENGTH: Duration = Duration::from_secs(5 * 60);

/// Multihash code for SHA2-256.
const SHA2_256_CODE: u64 = 0x12;

/// Maximum digest size the content identifier can carry.
const DIGEST_CAPACITY: usize = 64;

/// Derives rendezvous identifiers for one (offset, slot length) pair.
///
/// A session runs two derivers per channel: one at offset zero and one at
/// minus one slot length, so endpoints whose clocks straddle a slot boundary
/// still meet on the previous slot's identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deriver {
    /// Truncation granularity in seconds.
    slot_secs: u64,
    /// Signed shift applied to the wall clock before truncation, in seconds.
    offset_secs: i64,
}

impl Deriver {
    pub fn new(slot_length: Duration) -> Self {
        assert!(slot_length.as_secs() > 0, "slot length must be non-zero");
        Self {
            slot_secs: slot_length.as_secs(),
            offset_secs: 0,
        }
    }

    /// Shifts the clock by `offset_secs` before truncation. The session uses
    /// `0` and `-(slot length)`.
    pub fn with_offset(mut self, offset_secs: i64) -> Self {
        self.offset_secs = offset_secs;
        self
    }

    pub fn offset_secs(&self) -> i64 {
        self.offset_secs
    }

    pub fn slot_length(&self) -> Duration {
        Duration::from_secs(self.slot_secs)
    }

    /// Start of the slot containing `now + offset`, in Unix seconds.
    pub fn time_slot_start(&self, now: SystemTime) -> u64 {
        let unix = now
            .duration_since(UNIX_EPOCH)
            .expect("wall clock before Unix epoch")
            .as_secs() as i64;
        let shifted = unix + self.offset_secs;
        let slot = self.slot_secs as i64;
        (shifted.div_euclid(slot) * slot).max(0) as u64
    }

    /// The rendezvous string for `channel` at instant `now`.
    pub fn discovery_id(&self, channel: u32, now: SystemTime) -> String {
        format!("{}-{}", channel, self.time_slot_start(now))
    }

    /// Wall-clock instant at which [`Deriver::discovery_id`] next changes:
    /// `time_slot_start + slot_length`, mapped back from the shifted clock.
    pub fn next_rotation(&self, now: SystemTime) -> SystemTime {
        let deadline =
            self.time_slot_start(now) as i64 + self.slot_secs as i64 - self.offset_secs;
        UNIX_EPOCH + Duration::from_secs(deadline.max(0) as u64)
    }
}

/// Fixed-size content-addressed form of a discovery ID, used as the DHT
/// provider key. SHA2-256 multihash of the identifier's ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(Multihash<DIGEST_CAPACITY>);

impl ContentId {
    pub fn from_discovery_id(discovery_id: &str) -> Self {
        let digest = Sha256::digest(discovery_id.as_bytes());
        let hash = Multihash::wrap(SHA2_256_CODE, &digest)
            .expect("32-byte digest fits the multihash capacity");
        Self(hash)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn code(&self) -> u64 {
        self.0.code()
    }

    pub fn digest(&self) -> &[u8] {
        self.0.digest()
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId(")?;
        for byte in self.to_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}
