// ============================================================================
// CORE TYPES
// ============================================================================
// Identity and time types shared by every component.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamp - Nanosecond Precision Wall Clock
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// Instrumentation Identity
// ----------------------------------------------------------------------------

/// Identifier of one instrumentation. Assigned by the coordinator from a
/// monotonic counter and never reused within its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstId(u64);

impl InstId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl Display for InstId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(InstId)
    }
}

/// Monotonic id allocator. Starts at 1.
#[derive(Debug)]
pub struct InstIdAllocator {
    next: u64,
}

impl InstIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> InstId {
        let id = InstId(self.next);
        self.next += 1;
        id
    }
}

impl Default for InstIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Agent Kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Coordinator,
    Instrumenter,
    Aggregator,
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Coordinator => write!(f, "coordinator"),
            AgentKind::Instrumenter => write!(f, "instrumenter"),
            AgentKind::Aggregator => write!(f, "aggregator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::from_secs(10);
        let b = Timestamp::from_secs(12);
        assert!(b > a);
        assert_eq!(b.duration_since(a), Duration::from_secs(2));
        assert_eq!(a.duration_since(b), Duration::ZERO);
        assert_eq!(b.as_secs(), 12);
    }

    #[test]
    fn test_inst_ids_are_never_reused() {
        let mut alloc = InstIdAllocator::new();
        let ids: Vec<InstId> = (0..5).map(|_| alloc.allocate()).collect();
        assert_eq!(ids[0], InstId::new(1));
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_inst_id_parse() {
        assert_eq!("42".parse::<InstId>().ok(), Some(InstId::new(42)));
        assert!("foobar-err".parse::<InstId>().is_err());
    }
}
