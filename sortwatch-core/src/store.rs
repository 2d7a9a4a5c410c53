//! Durable hourly aggregation.
//!
//! Each machine gets a directory under the data dir holding:
//!   - `hourly.jsonl`: append-only sealed hour records, one JSON per line;
//!   - `current.json`: the in-progress hour, rewritten atomically on each
//!     flush so a crash loses at most one sub-interval of aggregation.
//!
//! Flush drains history buffers through per-counter sequence cursors and
//! buckets each sample into the hour its timestamp falls in, so calling
//! it twice with no new samples changes nothing and boundary samples land
//! in the hour they belong to. Write failures never touch the in-memory
//! side; sealed records wait in a backlog until the append succeeds, and
//! failures only bump a per-machine counter that surfaces as degraded
//! storage health.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::history::MachineHistory;
use crate::types::{hour_start, HourlyRecord, StorageHealth};

pub const SEALED_FILENAME: &str = "hourly.jsonl";
pub const CURRENT_FILENAME: &str = "current.json";

/// Consecutive flush failures before a machine's storage reports degraded.
const DEGRADED_AFTER: u32 = 3;

struct MachineStoreState {
    current: HourlyRecord,
    /// Sealed records not yet durably appended; retried every flush.
    pending_sealed: Vec<HourlyRecord>,
    /// Highest sequence number already merged, per counter. Process-local:
    /// history sequences restart with the process, so these must too.
    cursors: HashMap<String, u64>,
    consecutive_failures: u32,
    /// Cumulative count of samples evicted before a flush drained them.
    lost_samples: u64,
}

impl MachineStoreState {
    /// Seal the in-progress record (if it holds anything) and open a new
    /// one for `hour`. The sealed copy waits in memory until the durable
    /// append succeeds.
    fn rollover(&mut self, machine: &str, hour: DateTime<Utc>) {
        let prev = std::mem::replace(&mut self.current, HourlyRecord::open(machine, hour));
        if !prev.is_empty() {
            let mut sealed = prev;
            sealed.sealed = true;
            self.pending_sealed.push(sealed);
        }
    }
}

pub struct HourlyStore {
    data_dir: PathBuf,
    machines: Mutex<HashMap<String, MachineStoreState>>,
}

impl HourlyStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| CoreError::Persistence {
            path: data_dir.clone(),
            source: e,
        })?;
        Ok(Self {
            data_dir,
            machines: Mutex::new(HashMap::new()),
        })
    }

    fn machine_dir(&self, machine: &str) -> PathBuf {
        self.data_dir.join(machine)
    }

    /// Begin tracking a machine, recovering any persisted in-progress
    /// record from a previous run. A recovered record for an older hour is
    /// sealed by the next flush.
    pub fn open_machine(&self, machine: &str, now: DateTime<Utc>) -> Result<()> {
        let dir = self.machine_dir(machine);
        fs::create_dir_all(&dir).map_err(|e| CoreError::Persistence {
            path: dir.clone(),
            source: e,
        })?;

        let current = match fs::read_to_string(dir.join(CURRENT_FILENAME)) {
            Ok(s) => match serde_json::from_str::<HourlyRecord>(&s) {
                Ok(rec) => {
                    debug!(machine, hour = %rec.hour_start, "recovered in-progress record");
                    rec
                }
                Err(e) => {
                    warn!(machine, error = %e, "discarding unreadable in-progress record");
                    HourlyRecord::open(machine, hour_start(now))
                }
            },
            Err(_) => HourlyRecord::open(machine, hour_start(now)),
        };

        let mut machines = self.machines.lock().unwrap();
        machines.entry(machine.to_string()).or_insert(MachineStoreState {
            current,
            pending_sealed: Vec::new(),
            cursors: HashMap::new(),
            consecutive_failures: 0,
            lost_samples: 0,
        });
        Ok(())
    }

    /// Stop tracking a machine. Durable records are retained on disk.
    pub fn forget(&self, machine: &str) {
        self.machines.lock().unwrap().remove(machine);
    }

    pub fn storage_health(&self, machine: &str) -> StorageHealth {
        let machines = self.machines.lock().unwrap();
        match machines.get(machine) {
            Some(st) if st.consecutive_failures >= DEGRADED_AFTER || st.lost_samples > 0 => {
                StorageHealth::Degraded {
                    consecutive_failures: st.consecutive_failures,
                    lost_samples: st.lost_samples,
                }
            }
            _ => StorageHealth::Ok,
        }
    }

    /// Flush every listed machine. Returns the machines whose writes
    /// failed this round; their data stays in memory for the next attempt.
    pub fn flush(
        &self,
        now: DateTime<Utc>,
        views: &[(String, Arc<MachineHistory>)],
    ) -> Vec<(String, CoreError)> {
        let mut failures = Vec::new();
        for (machine, hist) in views {
            if let Err(e) = self.flush_machine(machine, hist, now) {
                warn!(machine, error = %e, "flush failed; will retry next interval");
                failures.push((machine.clone(), e));
            }
        }
        failures
    }

    fn flush_machine(
        &self,
        machine: &str,
        hist: &MachineHistory,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let dir = self.machine_dir(machine);
        let hour = hour_start(now);

        let mut machines = self.machines.lock().unwrap();
        let st = match machines.get_mut(machine) {
            Some(st) => st,
            None => return Ok(()), // removed while iterating
        };

        let outcome = Self::flush_locked(&dir, st, hist, machine, hour);
        match &outcome {
            Ok(()) => st.consecutive_failures = 0,
            Err(_) => st.consecutive_failures += 1,
        }
        outcome
    }

    fn flush_locked(
        dir: &Path,
        st: &mut MachineStoreState,
        hist: &MachineHistory,
        machine: &str,
        hour: DateTime<Utc>,
    ) -> Result<()> {
        // Drain new samples in receive order. Cursors advance with the
        // in-memory merge: the durable copy may lag one sub-interval but
        // never double-counts. An eviction gap is permanent loss and is
        // surfaced through storage health.
        let (drained, lost) = hist.drain_since(&st.cursors);
        if lost > 0 {
            st.lost_samples += lost;
            warn!(machine, lost, "samples evicted before flush reached them");
        }

        // Bucket each sample into the hour its timestamp falls in, clamped
        // to [current hour, flush hour]: sealed records stay immutable and
        // a skewed endpoint clock cannot open a future hour.
        let floor = st.current.hour_start;
        let ceil = hour.max(floor);
        let mut buckets: BTreeMap<DateTime<Utc>, Vec<(String, f64)>> = BTreeMap::new();
        let mut merged = 0usize;
        for (counter, samples) in &drained {
            for s in samples {
                let h = hour_start(s.timestamp).max(floor).min(ceil);
                buckets.entry(h).or_default().push((counter.clone(), s.value));
            }
            if let Some(last) = samples.last() {
                st.cursors.insert(counter.clone(), last.seq);
            }
            merged += samples.len();
        }

        for (h, values) in buckets {
            if h > st.current.hour_start {
                st.rollover(machine, h);
            }
            for (counter, value) in values {
                st.current.counters.entry(counter).or_default().merge(value);
            }
        }
        if hour > st.current.hour_start {
            st.rollover(machine, hour);
        }
        if merged > 0 {
            debug!(machine, merged, "merged samples into hour records");
        }

        // Durable phase: sealed backlog first, then the in-progress file.
        // On failure everything stays in memory and is retried next flush.
        while let Some(rec) = st.pending_sealed.first() {
            append_sealed(dir, rec)?;
            debug!(machine, hour = %rec.hour_start, "sealed hour record");
            st.pending_sealed.remove(0);
        }
        write_current(dir, &st.current)
    }

    /// Sealed records overlapping `[start, end)`, oldest first, plus the
    /// in-progress record when the range covers the current hour. The
    /// sealed file is streamed line by line; corrupt or torn lines are
    /// skipped with a warning, surrounding records still returned.
    pub fn query(
        &self,
        machine: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRecord>> {
        let path = self.machine_dir(machine).join(SEALED_FILENAME);
        let mut out = Vec::new();

        if path.exists() {
            let file = File::open(&path).map_err(|e| CoreError::Persistence {
                path: path.clone(),
                source: e,
            })?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| CoreError::Persistence {
                    path: path.clone(),
                    source: e,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HourlyRecord>(&line) {
                    Ok(rec) => {
                        if rec.overlaps(start, end) {
                            out.push(rec);
                        }
                    }
                    Err(_) => {
                        // Torn trailing write after a crash lands here too.
                        warn!(
                            machine,
                            line = idx + 1,
                            path = %path.display(),
                            "skipping corrupt hour record"
                        );
                    }
                }
            }
        }

        let machines = self.machines.lock().unwrap();
        if let Some(st) = machines.get(machine) {
            // Sealed records awaiting a durable append are still answers.
            for rec in &st.pending_sealed {
                if rec.overlaps(start, end) {
                    out.push(rec.clone());
                }
            }
            if !st.current.is_empty() && st.current.overlaps(start, end) {
                out.push(st.current.clone());
            }
        }
        Ok(out)
    }
}

fn append_sealed(dir: &Path, record: &HourlyRecord) -> Result<()> {
    let path = dir.join(SEALED_FILENAME);
    let persist = |e| CoreError::Persistence {
        path: path.clone(),
        source: e,
    };
    let line = serde_json::to_string(record).expect("serialize hour record");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(persist)?;
    writeln!(file, "{line}").map_err(persist)?;
    // Sync before the in-progress file is reset, so the sealed record is
    // durable before anything references the new hour.
    file.sync_all().map_err(persist)?;
    Ok(())
}

/// Atomic replace: write a temp file, sync, rename over the old one.
fn write_current(dir: &Path, record: &HourlyRecord) -> Result<()> {
    let tmp = dir.join(format!("{CURRENT_FILENAME}.tmp"));
    let path = dir.join(CURRENT_FILENAME);
    let persist = |p: &Path| {
        let p = p.to_path_buf();
        move |e| CoreError::Persistence {
            path: p.clone(),
            source: e,
        }
    };

    let data = serde_json::to_vec(record).expect("serialize hour record");
    let mut file = File::create(&tmp).map_err(persist(&tmp))?;
    file.write_all(&data).map_err(persist(&tmp))?;
    file.sync_all().map_err(persist(&tmp))?;
    drop(file);
    fs::rename(&tmp, &path).map_err(persist(&path))?;
    Ok(())
}
