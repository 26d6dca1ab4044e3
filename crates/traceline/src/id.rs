//! Trace and entity identifiers.
//!
//! A [`TraceId`] is shared verbatim by every entity belonging to one
//! end-to-end request, across process boundaries. An [`EntityId`] names a
//! single segment or subsegment and only needs to be unique within its
//! trace, so 64 random bits are enough.

use rand::Rng;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Format version prefix of the textual trace id form.
const TRACE_ID_VERSION: &str = "1";

/// Returned when a textual id does not match the expected format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {kind} id `{text}`")]
pub struct ParseIdError {
    kind: &'static str,
    text: String,
}

/// Globally-unique trace identifier: a format version, a 32-bit creation
/// epoch, and 96 random bits. Textual form is `1-58406520-a006649127e371903a2de979`
/// (35 characters). Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId {
    epoch: u32,
    random: [u8; 12],
}

impl TraceId {
    /// Mints a fresh trace id stamped with the current epoch second.
    pub fn new() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            epoch,
            random: rand::thread_rng().gen(),
        }
    }

    /// The creation epoch second embedded in the id.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TRACE_ID_VERSION}-{:08x}-", self.epoch)?;
        for byte in &self.random {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for TraceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdError {
            kind: "trace",
            text: s.to_string(),
        };
        let mut parts = s.splitn(3, '-');
        let version = parts.next().ok_or_else(malformed)?;
        let epoch_part = parts.next().ok_or_else(malformed)?;
        let random_part = parts.next().ok_or_else(malformed)?;
        if version != TRACE_ID_VERSION || epoch_part.len() != 8 || random_part.len() != 24 {
            return Err(malformed());
        }
        let epoch = u32::from_str_radix(epoch_part, 16).map_err(|_| malformed())?;
        let mut random = [0u8; 12];
        for (i, chunk) in random.iter_mut().enumerate() {
            let hex = random_part.get(i * 2..i * 2 + 2).ok_or_else(malformed)?;
            *chunk = u8::from_str_radix(hex, 16).map_err(|_| malformed())?;
        }
        Ok(Self { epoch, random })
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identifier of a single segment or subsegment: 8 random bytes, rendered
/// as 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(u64);

impl EntityId {
    /// Mints a fresh random entity id.
    pub fn new() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(ParseIdError {
                kind: "entity",
                text: s.to_string(),
            });
        }
        u64::from_str_radix(s, 16).map(Self).map_err(|_| ParseIdError {
            kind: "entity",
            text: s.to_string(),
        })
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
