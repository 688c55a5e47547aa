use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_LOCK_WAIT, RETIRED_BUCKET_RETRIES};
use crate::error::{CoreError, Result};
use crate::identity::{Day, IdentityKey};

/// Attendance status. Absence is the absence of a record, so `Present` is
/// the only state ever written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Present,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Present => "Present",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Present" => Some(Status::Present),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identity's attendance on one day. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub status: Status,
    pub name: String,
    pub timestamp: String,
}

impl AttendanceRecord {
    pub fn present(name: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            status: Status::Present,
            name: name.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// Result of [`AttendanceLedger::try_mark_present`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum MarkOutcome {
    /// This call wrote the record.
    Marked(AttendanceRecord),
    /// A record already existed; carries the existing (unchanged) record.
    AlreadyMarked(AttendanceRecord),
}

impl MarkOutcome {
    pub fn is_marked(&self) -> bool {
        matches!(self, MarkOutcome::Marked(_))
    }

    pub fn record(&self) -> &AttendanceRecord {
        match self {
            MarkOutcome::Marked(r) | MarkOutcome::AlreadyMarked(r) => r,
        }
    }
}

/// Per-day attendance records.
///
/// For any `(day, identity)`, at most one record exists and it never changes
/// until the whole day is reset. Implementations must make
/// `try_mark_present` an atomic check-and-insert: of any number of concurrent
/// calls for the same key, exactly one returns [`MarkOutcome::Marked`].
pub trait AttendanceLedger: Send + Sync {
    fn try_mark_present(
        &self,
        day: &Day,
        identity: &IdentityKey,
        name: &str,
        timestamp: &str,
    ) -> Result<MarkOutcome>;

    /// Snapshot of a day's records; empty if none were written.
    fn get_day(&self, day: &Day) -> Result<BTreeMap<IdentityKey, AttendanceRecord>>;

    /// Deletes the whole day. Returns the number of records removed.
    fn reset_day(&self, day: &Day) -> Result<usize>;

    /// Days that currently hold at least one record, ascending.
    fn days(&self) -> Result<Vec<Day>>;
}

#[derive(Default)]
struct DayBucket {
    records: BTreeMap<IdentityKey, AttendanceRecord>,
    /// Set by a reset once the bucket is unlinked from the ledger.
    retired: bool,
}

/// In-memory [`AttendanceLedger`].
///
/// Each day is an independently locked bucket, so marking on one day never
/// waits on another. The outer map lock is only held to find or unlink a
/// bucket.
pub struct MemoryLedger {
    days: RwLock<HashMap<Day, Arc<Mutex<DayBucket>>>>,
    lock_wait: Duration,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            days: RwLock::new(HashMap::new()),
            lock_wait,
        }
    }

    fn contention(what: &str, day: &Day) -> CoreError {
        CoreError::Contention(format!("{what} {day}"))
    }

    fn existing_bucket(&self, day: &Day) -> Result<Option<Arc<Mutex<DayBucket>>>> {
        let days = self
            .days
            .try_read_for(self.lock_wait)
            .ok_or_else(|| Self::contention("ledger index for", day))?;
        Ok(days.get(day).cloned())
    }

    fn bucket_for_write(&self, day: &Day) -> Result<Arc<Mutex<DayBucket>>> {
        if let Some(bucket) = self.existing_bucket(day)? {
            return Ok(bucket);
        }
        let mut days = self
            .days
            .try_write_for(self.lock_wait)
            .ok_or_else(|| Self::contention("ledger index for", day))?;
        Ok(days.entry(day.clone()).or_default().clone())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AttendanceLedger for MemoryLedger {
    fn try_mark_present(
        &self,
        day: &Day,
        identity: &IdentityKey,
        name: &str,
        timestamp: &str,
    ) -> Result<MarkOutcome> {
        for _ in 0..RETIRED_BUCKET_RETRIES {
            let bucket = self.bucket_for_write(day)?;
            let mut bucket = bucket
                .try_lock_for(self.lock_wait)
                .ok_or_else(|| Self::contention("attendance day", day))?;
            if bucket.retired {
                // Lost a race with reset_day; the next lookup creates a fresh bucket.
                continue;
            }
            if let Some(existing) = bucket.records.get(identity) {
                return Ok(MarkOutcome::AlreadyMarked(existing.clone()));
            }
            let record = AttendanceRecord::present(name, timestamp);
            bucket.records.insert(identity.clone(), record.clone());
            return Ok(MarkOutcome::Marked(record));
        }
        Err(Self::contention("repeatedly reset attendance day", day))
    }

    fn get_day(&self, day: &Day) -> Result<BTreeMap<IdentityKey, AttendanceRecord>> {
        let Some(bucket) = self.existing_bucket(day)? else {
            return Ok(BTreeMap::new());
        };
        let bucket = bucket
            .try_lock_for(self.lock_wait)
            .ok_or_else(|| Self::contention("attendance day", day))?;
        if bucket.retired {
            return Ok(BTreeMap::new());
        }
        Ok(bucket.records.clone())
    }

    fn reset_day(&self, day: &Day) -> Result<usize> {
        let mut days = self
            .days
            .try_write_for(self.lock_wait)
            .ok_or_else(|| Self::contention("ledger index for", day))?;
        let Some(bucket) = days.get(day).cloned() else {
            return Ok(0);
        };
        let mut guard = bucket
            .try_lock_for(self.lock_wait)
            .ok_or_else(|| Self::contention("attendance day", day))?;
        let removed = guard.records.len();
        guard.records.clear();
        guard.retired = true;
        days.remove(day);
        Ok(removed)
    }

    fn days(&self) -> Result<Vec<Day>> {
        let buckets: Vec<(Day, Arc<Mutex<DayBucket>>)> = {
            let days = self
                .days
                .try_read_for(self.lock_wait)
                .ok_or_else(|| CoreError::Contention("ledger index".into()))?;
            days.iter().map(|(d, b)| (d.clone(), b.clone())).collect()
        };
        let mut out = Vec::with_capacity(buckets.len());
        for (day, bucket) in buckets {
            let bucket = bucket
                .try_lock_for(self.lock_wait)
                .ok_or_else(|| Self::contention("attendance day", &day))?;
            if !bucket.retired && !bucket.records.is_empty() {
                out.push(day);
            }
        }
        out.sort();
        Ok(out)
    }
}
