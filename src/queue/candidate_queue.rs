//! Append-only JSONL log of pending candidates.
//!
//! The file is the source of truth: every append is written and synced
//! before the call returns, so a crash between append and drain loses
//! nothing. An in-memory id set (rebuilt from the file on open) gives
//! id-based dedup without rescanning the log.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::domain::Candidate;
use crate::error::{AkariError, Result};

/// Durable, multi-producer queue of candidates awaiting a dispatcher cycle.
#[derive(Debug)]
pub struct CandidateQueue {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl CandidateQueue {
    /// Open (or create) the queue log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let seen = read_entries(&path)?.into_iter().map(|c| c.id).collect();

        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }

    /// Path of the backing log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.seen.lock().map_err(|e| AkariError::Queue(e.to_string()))
    }

    /// Append a candidate. Returns false when its id is already queued.
    pub fn append(&self, candidate: &Candidate) -> Result<bool> {
        let mut seen = self.lock()?;
        if seen.contains(&candidate.id) {
            log::debug!("Candidate {} already queued, skipping", candidate.id);
            return Ok(false);
        }

        let line = serde_json::to_string(candidate)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;

        seen.insert(candidate.id.clone());
        Ok(true)
    }

    /// Read every pending candidate in insertion order without clearing.
    pub fn read_all(&self) -> Result<Vec<Candidate>> {
        let _guard = self.lock()?;
        read_entries(&self.path)
    }

    /// Read every pending candidate in insertion order, then clear the log.
    pub fn drain_all(&self) -> Result<Vec<Candidate>> {
        let mut seen = self.lock()?;
        let candidates = read_entries(&self.path)?;
        truncate(&self.path)?;
        seen.clear();
        Ok(candidates)
    }

    /// Remove the given ids, keeping anything appended since they were read.
    pub fn clear_drained(&self, ids: &[String]) -> Result<usize> {
        let mut seen = self.lock()?;
        let drop: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let (removed, kept): (Vec<Candidate>, Vec<Candidate>) = read_entries(&self.path)?
            .into_iter()
            .partition(|c| drop.contains(c.id.as_str()));

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for candidate in &kept {
                writeln!(file, "{}", serde_json::to_string(candidate)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        *seen = kept.into_iter().map(|c| c.id).collect();
        Ok(removed.len())
    }

    /// Number of distinct queued ids.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn truncate(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    file.sync_all()?;
    Ok(())
}

/// Parse the log, skipping lines that don't decode and repeated ids.
fn read_entries(path: &Path) -> Result<Vec<Candidate>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut ids = HashSet::new();
    let mut candidates = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Candidate>(&line) {
            Ok(candidate) => {
                if ids.insert(candidate.id.clone()) {
                    candidates.push(candidate);
                }
            }
            Err(e) => {
                log::warn!("Skipping malformed queue entry at {}:{}: {}", path.display(), index + 1, e);
            }
        }
    }

    Ok(candidates)
}
