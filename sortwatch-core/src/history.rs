//! Bounded per-counter history buffers.
//!
//! Pure in-memory data structure: no I/O, no blocking beyond short lock
//! sections. Each counter's buffer has a single writer (its machine's
//! supervisor) and many readers (the aggregation writer, queries).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::types::Sample;

/// Push with fixed-capacity eviction: oldest entry drops first.
pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

/// Normalize a raw counter value before it enters the history: negative or
/// near-zero readings are sensor noise and become exactly 0.
pub fn normalize(value: f64, threshold: f64) -> f64 {
    if value < 0.0 || value.abs() < threshold {
        0.0
    } else {
        value
    }
}

/// Fixed-capacity sample window for one counter. Insertion order is receive
/// order; timestamps from a misbehaving endpoint may be unordered and are
/// recorded as-is.
#[derive(Debug)]
pub struct HistoryBuffer {
    samples: VecDeque<Sample>,
    cap: usize,
    next_seq: u64,
}

impl HistoryBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
            next_seq: 0,
        }
    }

    /// Append a sample, evicting the oldest if at capacity. Returns the
    /// sequence number assigned to the sample.
    pub fn record(&mut self, timestamp: DateTime<Utc>, value: f64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        push_capped(
            &mut self.samples,
            Sample {
                seq,
                timestamp,
                value,
            },
            self.cap,
        );
        seq
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    /// Samples newer than the cursor, plus the number of samples evicted
    /// before the cursor reached them. A non-zero gap means the buffer
    /// wrapped between drains and those samples are gone for good.
    pub fn drain(&self, cursor: Option<u64>) -> (Vec<Sample>, u64) {
        let expected = cursor.map_or(0, |c| c + 1);
        let lost = match self.samples.front() {
            Some(front) if front.seq > expected => front.seq - expected,
            _ => 0,
        };
        (self.since(cursor), lost)
    }

    /// Samples with sequence numbers strictly greater than `seq`, in
    /// receive order. Used by the aggregation writer's drain cursors.
    pub fn since(&self, seq: Option<u64>) -> Vec<Sample> {
        match seq {
            None => self.snapshot(),
            Some(s) => self
                .samples
                .iter()
                .filter(|x| x.seq > s)
                .copied()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// All counter histories for one machine. The buffer map grows lazily as
/// counters deliver their first sample.
#[derive(Debug)]
pub struct MachineHistory {
    cap: usize,
    /// Undrained backlog that triggers a pressure notification.
    high_water: u64,
    undrained: AtomicU64,
    pressure: Arc<Notify>,
    counters: RwLock<HashMap<String, Arc<RwLock<HistoryBuffer>>>>,
}

impl MachineHistory {
    pub fn new(cap: usize) -> Self {
        Self::with_pressure(cap, Arc::new(Notify::new()))
    }

    /// `pressure` fires once the undrained backlog reaches half of one
    /// buffer's capacity, so the flush cycle can run early instead of
    /// letting eviction overtake its drain cursors.
    pub fn with_pressure(cap: usize, pressure: Arc<Notify>) -> Self {
        Self {
            cap,
            high_water: (cap as u64 / 2).max(1),
            undrained: AtomicU64::new(0),
            pressure,
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn buffer(&self, counter: &str) -> Arc<RwLock<HistoryBuffer>> {
        if let Some(buf) = self.counters.read().unwrap().get(counter) {
            return buf.clone();
        }
        let mut map = self.counters.write().unwrap();
        map.entry(counter.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HistoryBuffer::new(self.cap))))
            .clone()
    }

    /// Record one normalized sample. Callers clamp values before this point.
    pub fn record(&self, counter: &str, timestamp: DateTime<Utc>, value: f64) -> u64 {
        let buf = self.buffer(counter);
        let seq = buf.write().unwrap().record(timestamp, value);
        let backlog = self.undrained.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog == self.high_water {
            self.pressure.notify_one();
        }
        seq
    }

    pub fn snapshot(&self, counter: &str) -> Vec<Sample> {
        match self.counters.read().unwrap().get(counter) {
            Some(buf) => buf.read().unwrap().snapshot(),
            None => Vec::new(),
        }
    }

    pub fn latest(&self, counter: &str) -> Option<Sample> {
        self.counters
            .read()
            .unwrap()
            .get(counter)
            .and_then(|buf| buf.read().unwrap().latest())
    }

    /// Per-counter samples newer than the given cursors, as one consistent
    /// snapshot per counter (no tearing across a counter's sequence), plus
    /// the total number of samples lost to eviction since the previous
    /// drain.
    pub fn drain_since(
        &self,
        cursors: &HashMap<String, u64>,
    ) -> (Vec<(String, Vec<Sample>)>, u64) {
        let map = self.counters.read().unwrap();
        let mut out = Vec::with_capacity(map.len());
        let mut lost = 0u64;
        let mut drained = 0u64;
        for (name, buf) in map.iter() {
            let (fresh, gap) = buf.read().unwrap().drain(cursors.get(name).copied());
            lost += gap;
            drained += fresh.len() as u64;
            if !fresh.is_empty() {
                out.push((name.clone(), fresh));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        let consumed = drained + lost;
        if consumed > 0 {
            let backlog = self.undrained.load(Ordering::Relaxed);
            self.undrained
                .fetch_sub(consumed.min(backlog), Ordering::Relaxed);
        }
        (out, lost)
    }
}

/// Process-wide table of machine histories, owned by the coordinator.
/// Structural changes (add/remove) are exclusive with iteration by the
/// aggregation writer.
#[derive(Debug)]
pub struct HistoryBook {
    cap: usize,
    pressure: Arc<Notify>,
    machines: RwLock<HashMap<String, Arc<MachineHistory>>>,
}

impl HistoryBook {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            pressure: Arc::new(Notify::new()),
            machines: RwLock::new(HashMap::new()),
        }
    }

    /// Shared backlog signal across all machines; the flush loop listens
    /// on it to run an out-of-cycle flush before any buffer wraps.
    pub fn pressure(&self) -> Arc<Notify> {
        Arc::clone(&self.pressure)
    }

    pub fn insert(&self, machine: &str) -> Arc<MachineHistory> {
        let mut map = self.machines.write().unwrap();
        map.entry(machine.to_string())
            .or_insert_with(|| {
                Arc::new(MachineHistory::with_pressure(
                    self.cap,
                    Arc::clone(&self.pressure),
                ))
            })
            .clone()
    }

    pub fn remove(&self, machine: &str) -> Option<Arc<MachineHistory>> {
        self.machines.write().unwrap().remove(machine)
    }

    pub fn get(&self, machine: &str) -> Option<Arc<MachineHistory>> {
        self.machines.read().unwrap().get(machine).cloned()
    }

    pub fn list(&self) -> Vec<(String, Arc<MachineHistory>)> {
        let map = self.machines.read().unwrap();
        let mut out: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
