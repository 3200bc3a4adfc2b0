//! Durable session store
//!
//! One directory per (agent_type, session_id) under the store root, holding
//! three artifacts:
//!
//! ```text
//! <root>/<agent_type>/<session_id>/
//!   metadata.json   # MonitoredSession, rewritten via write-fsync-rename
//!   steps.jsonl     # append-only step log, one JSON record per line
//!   summary.json    # SessionSummary, written exactly once at finalize
//! ```
//!
//! Crash consistency: step appends land as whole newline-terminated records
//! (readers skip a torn tail line the same way the transcript parser does);
//! metadata and summary writes go through a temp file, fsync, then rename.
//! One writer per session directory; readers never take locks.

use crate::error::{Error, Result};
use crate::types::{AgentType, MonitoredSession, SessionStatus, SessionSummary, Step};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const METADATA_FILE: &str = "metadata.json";
const STEPS_FILE: &str = "steps.jsonl";
const SUMMARY_FILE: &str = "summary.json";

/// Filter for [`SessionStore::list_sessions`].
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub agent_type: Option<AgentType>,
    pub limit: Option<usize>,
}

/// Write handle for one session directory. Held exclusively by the session's
/// monitor for its lifetime.
pub struct SessionHandle {
    dir: PathBuf,
    log: File,
}

impl SessionHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Filesystem-backed session store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, agent_type: AgentType, session_id: &str) -> PathBuf {
        self.root.join(agent_type.as_str()).join(session_id)
    }

    /// Open (creating if needed) the directory for a session and return an
    /// exclusive write handle with the step log opened for append.
    pub fn open_session(&self, agent_type: AgentType, session_id: &str) -> Result<SessionHandle> {
        let dir = self.session_dir(agent_type, session_id);
        std::fs::create_dir_all(&dir).map_err(|e| Error::Store {
            path: dir.clone(),
            source: e,
        })?;
        let log_path = dir.join(STEPS_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::Store {
                path: log_path,
                source: e,
            })?;
        Ok(SessionHandle { dir, log })
    }

    /// Append steps to the session's log.
    ///
    /// The whole batch is serialized first and written with a single call
    /// followed by fsync, so a reader polling the log sees only complete,
    /// newline-terminated records.
    pub fn append_steps(&self, handle: &mut SessionHandle, steps: &[Step]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for step in steps {
            serde_json::to_writer(&mut buf, step)?;
            buf.push(b'\n');
        }
        let path = handle.dir.join(STEPS_FILE);
        handle
            .log
            .write_all(&buf)
            .and_then(|_| handle.log.sync_data())
            .map_err(|e| Error::Store { path, source: e })
    }

    /// Rewrite the session's metadata atomically.
    pub fn write_metadata(&self, handle: &SessionHandle, meta: &MonitoredSession) -> Result<()> {
        write_atomic(&handle.dir.join(METADATA_FILE), &serde_json::to_vec_pretty(meta)?)
    }

    /// Write the terminal summary exactly once.
    ///
    /// Idempotent: if a summary already exists it is returned unchanged and
    /// the new one is discarded.
    pub fn finalize(
        &self,
        handle: &SessionHandle,
        summary: &SessionSummary,
    ) -> Result<SessionSummary> {
        let path = handle.dir.join(SUMMARY_FILE);
        if path.exists() {
            let existing = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&existing)?);
        }
        write_atomic(&path, &serde_json::to_vec_pretty(summary)?)?;
        Ok(summary.clone())
    }

    /// List sessions matching a filter, newest first.
    ///
    /// Unreadable session directories are skipped with a warning; a partly
    /// damaged store still lists everything else.
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<MonitoredSession>> {
        let mut sessions = Vec::new();
        if !self.root.is_dir() {
            return Ok(sessions);
        }

        for agent_entry in std::fs::read_dir(&self.root)? {
            let agent_dir = agent_entry?.path();
            if !agent_dir.is_dir() {
                continue;
            }
            if let Some(want) = filter.agent_type {
                if agent_dir.file_name().and_then(|n| n.to_str()) != Some(want.as_str()) {
                    continue;
                }
            }
            for session_entry in std::fs::read_dir(&agent_dir)? {
                let session_dir = session_entry?.path();
                let meta_path = session_dir.join(METADATA_FILE);
                let meta: MonitoredSession = match std::fs::read_to_string(&meta_path)
                    .map_err(Error::from)
                    .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
                {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(
                            path = %meta_path.display(),
                            error = %e,
                            "Skipping unreadable session metadata"
                        );
                        continue;
                    }
                };
                if let Some(status) = filter.status {
                    if meta.status != status {
                        continue;
                    }
                }
                sessions.push(meta);
            }
        }

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    /// Locate a session directory by id, searching all agent types.
    pub fn find_session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if self.root.is_dir() {
            for agent_entry in std::fs::read_dir(&self.root)? {
                let candidate = agent_entry?.path().join(session_id);
                if candidate.join(METADATA_FILE).exists() {
                    return Ok(candidate);
                }
            }
        }
        Err(Error::SessionNotFound(session_id.to_string()))
    }

    /// Read a session's metadata.
    pub fn read_metadata(&self, session_id: &str) -> Result<MonitoredSession> {
        let dir = self.find_session_dir(session_id)?;
        let contents = std::fs::read_to_string(dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Read a session's summary, if it has been finalized.
    pub fn read_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let dir = self.find_session_dir(session_id)?;
        let path = dir.join(SUMMARY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Read a window of steps, skipping `offset` records and returning at
    /// most `limit`. The boolean is true when more steps follow the window.
    ///
    /// A torn final line (writer crashed mid-append) is ignored; committed
    /// records are never affected by a failed append.
    pub fn read_steps(
        &self,
        session_id: &str,
        offset: u64,
        limit: usize,
    ) -> Result<(Vec<Step>, bool)> {
        let dir = self.find_session_dir(session_id)?;
        let path = dir.join(STEPS_FILE);
        if !path.exists() {
            return Ok((Vec::new(), false));
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut steps = Vec::new();
        let mut has_more = false;
        let mut seen = 0u64;

        for line in reader.split(b'\n') {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let step: Step = match serde_json::from_slice(&line) {
                Ok(s) => s,
                // Torn tail from an interrupted append
                Err(_) => break,
            };
            seen += 1;
            if seen <= offset {
                continue;
            }
            if steps.len() == limit {
                has_more = true;
                break;
            }
            steps.push(step);
        }

        Ok((steps, has_more))
    }
}

/// Write a file atomically: temp file in the same directory, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| Error::Store {
        path: path.to_path_buf(),
        source: e,
    })
}
