//! Core data model shared across acquisition, storage and queries.
//! Keep this module minimal and stable; it defines the on-disk record format.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of counter channels on a sorting machine.
pub const DEFAULT_COUNTER_COUNT: usize = 12;

/// One `(timestamp, value)` observation of a counter, tagged with the
/// per-counter receive sequence number assigned by the history tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A raw value update delivered by a live protocol session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagUpdate {
    pub tag: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub value: f64,
}

/// Connection configuration for one machine. Name is the stable identity;
/// at most one machine per name exists in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    /// WebSocket endpoint of the machine's telemetry agent, e.g. ws://HOST:PORT/ws
    pub endpoint: String,
    /// Optional auth token appended as a query parameter on connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Channel numbering convention on the wire: 1 for machines that count
    /// channels from 1 (the common case), 0 for zero-based firmware.
    #[serde(default = "default_tag_offset")]
    pub tag_offset: u32,
    /// Counter names, in channel order. Position in this list plus
    /// `tag_offset` gives the protocol-level channel number.
    #[serde(default = "default_counters")]
    pub counters: Vec<String>,
}

fn default_tag_offset() -> u32 {
    1
}

fn default_counters() -> Vec<String> {
    (1..=DEFAULT_COUNTER_COUNT)
        .map(|i| format!("counter_{i}"))
        .collect()
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            token: None,
            tag_offset: default_tag_offset(),
            counters: default_counters(),
        }
    }

    /// Reject configs that could never reach Connecting.
    pub fn validate(&self) -> crate::error::Result<()> {
        let fail = |reason: &str| {
            Err(crate::error::CoreError::InvalidConfig {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.name.trim().is_empty() {
            return fail("machine name is empty");
        }
        match url::Url::parse(&self.endpoint) {
            Ok(u) if u.scheme() == "ws" || u.scheme() == "wss" => {}
            Ok(u) => return fail(&format!("unsupported endpoint scheme '{}'", u.scheme())),
            Err(e) => return fail(&format!("bad endpoint: {e}")),
        }
        if self.counters.is_empty() {
            return fail("no counters configured");
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.counters {
            if !seen.insert(c.as_str()) {
                return fail(&format!("duplicate counter name '{c}'"));
            }
        }
        Ok(())
    }

    /// Protocol-level tag name for the counter at list position `idx`.
    /// Applied once at subscribe time; stable for the life of a session.
    pub fn tag_for(&self, idx: usize) -> String {
        format!(
            "Settings.ColorSort.Primary{}.DefectRate",
            idx as u32 + self.tag_offset
        )
    }

    /// Full (tag, counter) subscription map in channel order.
    pub fn tag_map(&self) -> Vec<(String, String)> {
        self.counters
            .iter()
            .enumerate()
            .map(|(i, c)| (self.tag_for(i), c.clone()))
            .collect()
    }
}

/// Lifecycle state of a machine's connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Per-counter aggregate within one hour record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CounterAggregate {
    pub count: u64,
    pub sum: f64,
    pub last: f64,
}

impl CounterAggregate {
    pub fn merge(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.last = value;
    }
}

/// Durable per-hour summary of one machine's counters. Sealed records are
/// immutable once appended; only the current hour's record is updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRecord {
    pub machine: String,
    pub hour_start: DateTime<Utc>,
    pub counters: BTreeMap<String, CounterAggregate>,
    pub sealed: bool,
}

impl HourlyRecord {
    pub fn open(machine: impl Into<String>, hour_start: DateTime<Utc>) -> Self {
        Self {
            machine: machine.into(),
            hour_start,
            counters: BTreeMap::new(),
            sealed: false,
        }
    }

    /// End of the hour this record covers (exclusive).
    pub fn hour_end(&self) -> DateTime<Utc> {
        self.hour_start + chrono::Duration::hours(1)
    }

    /// Whether this record's hour overlaps the half-open range `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.hour_start < end && start < self.hour_end()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Truncate a timestamp to the start of its calendar hour.
pub fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Health of the durable storage path for one machine. Repeated flush
/// failures and samples lost to buffer eviction surface here rather than
/// as fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageHealth {
    Ok,
    Degraded {
        consecutive_failures: u32,
        /// Samples evicted from history before a flush drained them.
        /// Cumulative; the aggregates they would have fed stay incomplete.
        lost_samples: u64,
    },
}
