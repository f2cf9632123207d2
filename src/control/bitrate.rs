//! Learns, per kind of device, the highest video bit rate its encoder
//! actually sustains.
//!
//! The agent lowers the bit rate when the encoder falls behind and flags
//! those packets. Each report gives every candidate at or above the reported
//! rate a large score bump; periods of stable streaming slowly decay the
//! candidates below the current rate. A candidate reaching the threshold
//! becomes the rate the agent is started with next time.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const PROMOTION_THRESHOLD: i32 = 100;
pub const REACHED_SCORE: i32 = 20;
pub const DECAY_SCORE: i32 = 1;
pub const MAX_ENTRIES: usize = 100;

/// Identifies devices expected to share encoder capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub manufacturer: String,
    pub model: String,
    pub abi: String,
    pub api_level: i32,
}

impl DeviceKey {
    pub fn new(manufacturer: &str, model: &str, abi: &str, api_level: i32) -> Self {
        Self {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            abi: abi.to_string(),
            api_level,
        }
    }

    /// Builds a key from `getprop` output.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let get = |name: &str| props.get(name).map(String::as_str).unwrap_or("").trim();
        Self::new(
            get("ro.product.manufacturer"),
            get("ro.product.model"),
            get("ro.product.cpu.abi"),
            get("ro.build.version.sdk").parse().unwrap_or(0),
        )
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.manufacturer, self.model, self.abi, self.api_level
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Candidate {
    bit_rate: i32,
    score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    key: String,
    /// Resolved bit rate, 0 while unresolved.
    bit_rate: i32,
    /// Strictly descending by bit rate.
    candidates: Vec<Candidate>,
}

impl Entry {
    fn new(key: String) -> Self {
        Self {
            key,
            bit_rate: 0,
            candidates: Vec::new(),
        }
    }

    fn reduced(&mut self, bit_rate: i32) {
        if self.bit_rate != 0 && bit_rate >= self.bit_rate {
            return;
        }

        let mut matched = false;
        let mut promoted = None;
        for candidate in self.candidates.iter_mut().filter(|c| c.bit_rate >= bit_rate) {
            candidate.score += REACHED_SCORE;
            matched |= candidate.bit_rate == bit_rate;
            if candidate.score >= PROMOTION_THRESHOLD {
                // Descending order, so the last one wins.
                promoted = Some(candidate.bit_rate);
            }
        }

        if !matched {
            let position = self
                .candidates
                .iter()
                .position(|c| c.bit_rate < bit_rate)
                .unwrap_or(self.candidates.len());
            self.candidates.insert(
                position,
                Candidate {
                    bit_rate,
                    score: REACHED_SCORE,
                },
            );
            if REACHED_SCORE >= PROMOTION_THRESHOLD {
                promoted = Some(bit_rate);
            }
        }

        if let Some(resolved) = promoted {
            self.bit_rate = resolved;
            self.candidates.retain(|c| c.bit_rate < resolved);
        }
    }

    fn stable(&mut self, bit_rate: i32) {
        for candidate in self.candidates.iter_mut().filter(|c| c.bit_rate < bit_rate) {
            candidate.score -= DECAY_SCORE;
        }
        self.candidates.retain(|c| c.score > 0);
    }
}

/// Bounded table of learned bit rates, least recently used first.
#[derive(Debug, Default)]
pub struct BitRateTracker {
    entries: Mutex<Vec<Entry>>,
}

impl BitRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved bit rate for `key`, or 0 when nothing has been learned.
    pub fn bit_rate(&self, key: &DeviceKey) -> i32 {
        let mut entries = self.entries.lock();
        Self::touch(&mut entries, &key.to_string(), false).map_or(0, |e| e.bit_rate)
    }

    /// Records that the agent had to lower the bit rate to `bit_rate`.
    pub fn reduced(&self, key: &DeviceKey, bit_rate: i32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = Self::touch(&mut entries, &key.to_string(), true) {
            entry.reduced(bit_rate);
            tracing::debug!(
                "Bit rate of {} reduced to {}, resolved {}",
                key,
                bit_rate,
                entry.bit_rate
            );
        }
    }

    /// Records that `bit_rate` has been sustained for a while.
    pub fn stable(&self, key: &DeviceKey, bit_rate: i32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = Self::touch(&mut entries, &key.to_string(), false) {
            entry.stable(bit_rate);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Moves the entry for `key` to the most recently used end, creating it
    /// when asked to.
    fn touch<'a>(entries: &'a mut Vec<Entry>, key: &str, create: bool) -> Option<&'a mut Entry> {
        let entry = match entries.iter().position(|e| e.key == key) {
            Some(index) => entries.remove(index),
            None if create => Entry::new(key.to_string()),
            None => return None,
        };
        entries.push(entry);
        if entries.len() > MAX_ENTRIES {
            let excess = entries.len() - MAX_ENTRIES;
            entries.drain(..excess);
        }
        entries.last_mut()
    }

    /// Loads a table saved by [`save`](Self::save). A missing file yields an
    /// empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let mut entries: Vec<Entry> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse bit rate table {}", path.display()))?;
        for entry in &mut entries {
            entry.candidates.sort_by(|a, b| b.bit_rate.cmp(&a.bit_rate));
            entry.candidates.dedup_by_key(|c| c.bit_rate);
        }
        if entries.len() > MAX_ENTRIES {
            let excess = entries.len() - MAX_ENTRIES;
            entries.drain(..excess);
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Writes the table as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let entries = self.entries.lock();
            serde_json::to_string_pretty(&*entries)?
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        // Each save gets its own temp file, so concurrent saves never share one.
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create a temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.path().display()))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
