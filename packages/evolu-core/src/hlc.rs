//! Hybrid Logical Clock: timestamps that total-order mutations across devices.
//!
//! `Timestamp` is the wire/storage representation (16-byte binary, sortable
//! ISO-8601-ish string). `Clock` is the stateful, persistent-per-owner
//! singleton that produces new timestamps via `send`/`receive`, following the
//! same `ClockSource`-injected, drift-checked design as a typical HLC
//! implementation so tests can swap in a fixed clock.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::{Error, Result};

/// Millis may not reach `2^48 - 1`; that value is reserved as "infinity".
pub const MAX_MILLIS: u64 = (1u64 << 48) - 2;
pub const MAX_COUNTER: u16 = u16::MAX;
pub const DEFAULT_MAX_DRIFT_MS: u64 = 5 * 60 * 1000;

/// A single HLC timestamp: (millis, counter, node_id). Total-ordered first by
/// millis, then counter, then node_id -- the same order the 16-byte binary
/// encoding sorts in, so storing timestamps as `BLOB PRIMARY KEY` gives
/// correct chronological iteration for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: u64,
    pub counter: u16,
    pub node_id: NodeId,
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.counter.cmp(&other.counter))
            .then(self.node_id.0.cmp(&other.node_id.0))
    }
}

impl Timestamp {
    /// The zero timestamp assigned to a replica before it has sent anything.
    #[must_use]
    pub fn create_initial(node_id: NodeId) -> Self {
        Self {
            millis: 0,
            counter: 0,
            node_id,
        }
    }

    fn validate_millis(millis: u64) -> Result<()> {
        if millis > MAX_MILLIS {
            Err(Error::TimestampTimeOutOfRange(millis))
        } else {
            Ok(())
        }
    }

    /// 16-byte big-endian binary encoding: 6 bytes millis, 2 bytes counter, 8
    /// bytes node id. Sorts identically to `Ord` because every field is
    /// fixed-width and big-endian.
    #[must_use]
    pub fn to_binary(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        let millis_bytes = self.millis.to_be_bytes(); // 8 bytes, take low 6
        out[0..6].copy_from_slice(&millis_bytes[2..8]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..16].copy_from_slice(&self.node_id.0);
        out
    }

    pub fn from_binary(bytes: &[u8; 16]) -> Result<Self> {
        let mut millis_bytes = [0u8; 8];
        millis_bytes[2..8].copy_from_slice(&bytes[0..6]);
        let millis = u64::from_be_bytes(millis_bytes);
        let counter = u16::from_be_bytes([bytes[6], bytes[7]]);
        let mut node_bytes = [0u8; 8];
        node_bytes.copy_from_slice(&bytes[8..16]);
        Self::validate_millis(millis)?;
        Ok(Self {
            millis,
            counter,
            node_id: NodeId(node_bytes),
        })
    }

    /// `YYYY-MM-DDTHH:MM:SS.sssZ-XXXX-xxxxxxxxxxxxxxxx`: lexicographically
    /// equivalent to the binary sort order because every component is
    /// fixed-width.
    #[must_use]
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}-{:04X}-{}",
            millis_to_iso8601(self.millis),
            self.counter,
            self.node_id.to_hex()
        )
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.rsplitn(3, '-').collect();
        if parts.len() != 3 {
            return Err(Error::Unexpected(anyhow::anyhow!(
                "malformed timestamp string: {s}"
            )));
        }
        // rsplitn yields reversed order: [node_id, counter, iso_millis]
        let node_id = NodeId::from_hex(parts[0])?;
        let counter = u16::from_str_radix(parts[1], 16)
            .map_err(|e| Error::Unexpected(anyhow::anyhow!(e)))?;
        let millis = iso8601_to_millis(parts[2])?;
        Self::validate_millis(millis)?;
        Ok(Self {
            millis,
            counter,
            node_id,
        })
    }
}

/// Exposed for the row store's `createdAt`/`updatedAt` bookkeeping columns,
/// which use plain wall-clock time rather than HLC timestamps.
pub(crate) fn millis_to_iso8601_pub(millis: u64) -> String {
    millis_to_iso8601(millis)
}

fn millis_to_iso8601(millis: u64) -> String {
    let secs = millis / 1000;
    let ms = millis % 1000;
    let days = secs / 86400;
    let rem = secs % 86400;
    let (year, month, day) = civil_from_days(days as i64);
    let hour = rem / 3600;
    let minute = (rem % 3600) / 60;
    let second = rem % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{ms:03}Z")
}

fn iso8601_to_millis(s: &str) -> Result<u64> {
    let bytes = s.as_bytes();
    if bytes.len() != 24 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return Err(Error::Unexpected(anyhow::anyhow!(
            "malformed ISO-8601 timestamp: {s}"
        )));
    }
    let year: i64 = s[0..4].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let month: u32 = s[5..7].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let day: u32 = s[8..10].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let hour: u64 = s[11..13].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let minute: u64 = s[14..16].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let second: u64 = s[17..19].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let ms: u64 = s[20..23].parse().map_err(|e| Error::Unexpected(anyhow::anyhow!("{e}")))?;
    let days = days_from_civil(year, month, day);
    let secs = days * 86400 + (hour * 3600 + minute * 60 + second) as i64;
    Ok((secs as u64) * 1000 + ms)
}

/// Howard Hinnant's civil-from-days algorithm (proleptic Gregorian, days
/// since 1970-01-01). Avoids pulling in a full calendar crate for timestamp
/// formatting alone.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = u64::from(if m > 2 { m - 3 } else { m + 9 });
    let doy = (153 * mp + 2) / 5 + u64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

/// Supplies the current wall-clock time in milliseconds since the epoch.
/// Injected so tests can use a deterministic clock.
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Real wall-clock `ClockSource`.
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the epoch")
            .as_millis() as u64
    }
}

/// `send`: stamps a new local event. `now` is the caller's current wall
/// clock reading; `local` is the last timestamp this replica produced.
pub fn send(now: u64, local: Timestamp, max_drift_ms: u64) -> Result<Timestamp> {
    let m = now.max(local.millis);
    if m.saturating_sub(now) > max_drift_ms {
        return Err(Error::TimestampDrift { now, next: m });
    }
    let counter = if m == local.millis {
        local
            .counter
            .checked_add(1)
            .ok_or(Error::TimestampCounterOverflow { millis: m })?
    } else {
        0
    };
    Ok(Timestamp {
        millis: m,
        counter,
        node_id: local.node_id,
    })
}

/// `receive`: merges a remote timestamp into the local clock. The returned
/// timestamp always carries the local `node_id`; a node-id collision with the
/// remote is not itself an error.
pub fn receive(
    now: u64,
    local: Timestamp,
    remote: Timestamp,
    max_drift_ms: u64,
) -> Result<Timestamp> {
    let m = now.max(local.millis).max(remote.millis);
    if m.saturating_sub(now) > max_drift_ms {
        return Err(Error::TimestampDrift { now, next: m });
    }
    let counter = if m == local.millis && m == remote.millis {
        local
            .counter
            .max(remote.counter)
            .checked_add(1)
            .ok_or(Error::TimestampCounterOverflow { millis: m })?
    } else if m == local.millis {
        local
            .counter
            .checked_add(1)
            .ok_or(Error::TimestampCounterOverflow { millis: m })?
    } else if m == remote.millis {
        remote
            .counter
            .checked_add(1)
            .ok_or(Error::TimestampCounterOverflow { millis: m })?
    } else {
        0
    };
    Ok(Timestamp {
        millis: m,
        counter,
        node_id: local.node_id,
    })
}

/// Stateful, persistent-per-owner clock singleton. Wraps the pure
/// `send`/`receive` functions with the replica's current timestamp and an
/// injected `ClockSource`, the same split the rest of the ecosystem uses to
/// keep HLC state-machine logic unit-testable without real wall-clock reads.
pub struct Clock {
    last: Timestamp,
    max_drift_ms: u64,
    clock_source: Box<dyn ClockSource>,
}

impl Clock {
    #[must_use]
    pub fn new(node_id: NodeId, clock_source: Box<dyn ClockSource>) -> Self {
        Self::with_options(node_id, clock_source, DEFAULT_MAX_DRIFT_MS)
    }

    #[must_use]
    pub fn with_options(
        node_id: NodeId,
        clock_source: Box<dyn ClockSource>,
        max_drift_ms: u64,
    ) -> Self {
        Self {
            last: Timestamp::create_initial(node_id),
            max_drift_ms,
            clock_source,
        }
    }

    /// Restores a clock from a previously persisted timestamp (the `Clock`
    /// row in storage).
    #[must_use]
    pub fn restore(last: Timestamp, clock_source: Box<dyn ClockSource>, max_drift_ms: u64) -> Self {
        Self {
            last,
            max_drift_ms,
            clock_source,
        }
    }

    #[must_use]
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// The current wall-clock reading from the injected `ClockSource`.
    #[must_use]
    pub fn now_millis(&self) -> u64 {
        self.clock_source.now_millis()
    }

    /// Stamps a new local mutation and advances the clock.
    pub fn send(&mut self) -> Result<Timestamp> {
        let now = self.clock_source.now_millis();
        let next = send(now, self.last, self.max_drift_ms)?;
        if next.millis > now + self.max_drift_ms / 10 {
            tracing::warn!(now, next = next.millis, "HLC advanced notably ahead of wall clock");
        }
        self.last = next;
        Ok(next)
    }

    /// Merges an incoming remote timestamp and advances the clock.
    pub fn receive(&mut self, remote: Timestamp) -> Result<Timestamp> {
        let now = self.clock_source.now_millis();
        let next = receive(now, self.last, remote, self.max_drift_ms)?;
        self.last = next;
        Ok(next)
    }
}
