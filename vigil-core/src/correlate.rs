//! Session correlation
//!
//! Given a launch timestamp and a working directory, find the transcript file
//! that belongs to the invocation just launched, among possibly several
//! concurrent invocations. There is no cooperative protocol with the agent;
//! only filesystem signals are available.
//!
//! The expected transcript directory is derived from the working directory by
//! a pure, reversible encoding. Within it, candidate files are those created
//! or appended in the window [T0−ε, T0+Δ], validated by reading their first
//! record's embedded session id and timestamp. The earliest qualifying
//! candidate wins and stays pinned for the invocation's entire lifetime.

use crate::error::Result;
use crate::parser::{read_first_record, FirstRecord};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};

/// Encode a project path into its transcript directory name.
///
/// `/` maps to `-`; literal `-` and `%` are escaped first so the mapping is
/// reversible (see [`decode_project_path`]).
pub fn encode_project_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('%', "%25")
        .replace('-', "%2d")
        .replace('/', "-")
}

/// Inverse of [`encode_project_path`].
pub fn decode_project_path(encoded: &str) -> PathBuf {
    PathBuf::from(
        encoded
            .replace('-', "/")
            .replace("%2d", "-")
            .replace("%25", "%"),
    )
}

/// A validated correlation match: the transcript file and the identity read
/// from its first record.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub session_id: String,
    pub first_timestamp: DateTime<Utc>,
}

/// Correlates one invocation (T0, project path) to its transcript file.
pub struct Correlator {
    transcript_dir: PathBuf,
    t0: DateTime<Utc>,
    epsilon: Duration,
    delta: Duration,
}

impl Correlator {
    pub fn new(
        transcript_root: &Path,
        project_path: &Path,
        t0: DateTime<Utc>,
        epsilon: std::time::Duration,
        delta: std::time::Duration,
    ) -> Self {
        Self {
            transcript_dir: transcript_root.join(encode_project_path(project_path)),
            t0,
            epsilon: Duration::from_std(epsilon).unwrap_or_else(|_| Duration::seconds(1)),
            delta: Duration::from_std(delta).unwrap_or_else(|_| Duration::seconds(30)),
        }
    }

    /// The directory this invocation's transcript is expected in.
    pub fn transcript_dir(&self) -> &Path {
        &self.transcript_dir
    }

    /// Latest instant at which a candidate may still appear.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.t0 + self.delta
    }

    /// Scan the transcript directory once for the earliest qualifying
    /// candidate.
    ///
    /// `is_free` filters out files already pinned by another invocation.
    /// Returns `Ok(None)` while no candidate qualifies; the caller decides
    /// when the window has expired.
    pub fn scan<F>(&self, is_free: F) -> Result<Option<Candidate>>
    where
        F: Fn(&Path) -> bool,
    {
        if !self.transcript_dir.is_dir() {
            return Ok(None);
        }

        let pattern = self.transcript_dir.join("*.jsonl");
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| crate::error::Error::Config(format!("invalid glob pattern: {}", e)))?;

        let window_start = self.t0 - self.epsilon;
        let window_end = self.t0 + self.delta;

        let mut best: Option<Candidate> = None;
        for entry in entries.flatten() {
            if !is_free(&entry) {
                continue;
            }
            if !self.mtime_in_window(&entry, window_start) {
                continue;
            }
            let Some(first) = self.validate(&entry, window_start, window_end)? else {
                continue;
            };
            let candidate = Candidate {
                path: entry,
                session_id: first.session_id,
                first_timestamp: first.timestamp,
            };
            let earlier = match &best {
                Some(b) => candidate.first_timestamp < b.first_timestamp,
                None => true,
            };
            if earlier {
                best = Some(candidate);
            }
        }

        Ok(best)
    }

    /// Cheap mtime pre-filter: the file must have been written at or after
    /// the start of the window. Files untouched since before launch belong
    /// to older invocations.
    fn mtime_in_window(&self, path: &Path, window_start: DateTime<Utc>) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        DateTime::<Utc>::from(modified) >= window_start
    }

    /// Validate a candidate by its first record: it must carry a session id
    /// and a timestamp consistent with this invocation's window.
    fn validate(
        &self,
        path: &Path,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<FirstRecord>> {
        let first = match read_first_record(path) {
            Ok(Some(f)) => f,
            // Unreadable or still incomplete; maybe next scan
            Ok(None) | Err(_) => return Ok(None),
        };
        if first.timestamp < window_start || first.timestamp > window_end {
            tracing::debug!(
                path = %path.display(),
                first_ts = %first.timestamp,
                "Candidate rejected: first record outside correlation window"
            );
            return Ok(None);
        }
        Ok(Some(first))
    }
}
