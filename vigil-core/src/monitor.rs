//! Per-invocation session monitor
//!
//! One monitor per launched agent invocation, run on its own thread. The
//! lifecycle is a small state machine:
//!
//! ```text
//! unpinned ──correlation──► running ──► completed | error | cancelled
//! ```
//!
//! While running, a filesystem watcher (with a polling fallback) wakes the
//! monitor to re-read the pinned transcript incrementally, persist new steps
//! through the store, and refresh session metadata. Any terminal transition
//! computes and persists the session summary exactly once.
//!
//! The only state shared between monitors is the [`Registry`]: a single
//! mutex-guarded map used for listing, cancellation, and pin exclusivity.
//! Critical sections are O(1).

use crate::config::MonitorConfig;
use crate::correlate::Correlator;
use crate::error::{Error, Result};
use crate::parser;
use crate::store::{SessionFilter, SessionHandle, SessionStore};
use crate::types::{AgentType, MonitoredSession, SessionStatus, SessionSummary, Step};
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Cumulative parse warnings per session before the one-time format drift
/// escalation fires.
const FORMAT_DRIFT_THRESHOLD: usize = 10;

// ============================================
// Session control & registry
// ============================================

/// Shared control block for one invocation.
///
/// `cancel` comes from the user (ctrl-c, `Registry::cancel`); `exit` from
/// whoever waits on the agent subprocess. They are independent signals and
/// cancel wins when both are set.
#[derive(Debug, Default)]
pub struct SessionControl {
    cancel: AtomicBool,
    exit: Mutex<Option<bool>>,
}

impl SessionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Record the agent process's exit. `success` is its exit status.
    pub fn record_exit(&self, success: bool) {
        let mut exit = self.exit.lock().expect("control lock poisoned");
        exit.get_or_insert(success);
    }

    pub fn exit_status(&self) -> Option<bool> {
        *self.exit.lock().expect("control lock poisoned")
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<SessionControl>>,
    pinned: HashSet<PathBuf>,
}

/// Process-wide registry of live monitors.
///
/// Keyed by session id for cancellation; also owns the pinned-file set that
/// enforces one-session-per-transcript exclusivity.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim a transcript file. Returns false if another
    /// invocation already holds it; the claim lasts until the session
    /// finalizes.
    pub fn try_pin(&self, file: &Path) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.pinned.insert(file.to_path_buf())
    }

    pub fn is_pinned(&self, file: &Path) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.pinned.contains(file)
    }

    fn unpin(&self, file: &Path) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.pinned.remove(file);
    }

    fn register(&self, session_id: &str, control: Arc<SessionControl>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.sessions.insert(session_id.to_string(), control);
    }

    fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.sessions.remove(session_id);
    }

    /// Request cancellation of a running session. Returns false when the
    /// session is not registered (already terminal, or never pinned).
    pub fn cancel(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        match inner.sessions.get(session_id) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    /// Session ids with a live monitor attached.
    pub fn running_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.sessions.keys().cloned().collect()
    }
}

// ============================================
// Monitor
// ============================================

/// Outcome of one monitor run.
#[derive(Debug)]
pub enum MonitorOutcome {
    /// Correlation never succeeded; the agent run itself is unaffected.
    Unavailable { reason: String },
    /// The session reached a terminal state; its summary was persisted.
    Finished(SessionSummary),
}

/// Driver for one observed invocation.
pub struct Monitor {
    store: SessionStore,
    registry: Registry,
    settings: MonitorConfig,
    agent_type: AgentType,
    project_path: PathBuf,
    transcript_root: PathBuf,
    t0: DateTime<Utc>,
}

impl Monitor {
    pub fn new(
        store: SessionStore,
        registry: Registry,
        settings: MonitorConfig,
        agent_type: AgentType,
        project_path: PathBuf,
        transcript_root: PathBuf,
        t0: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            agent_type,
            project_path,
            transcript_root,
            t0,
        }
    }

    /// Run the monitor to completion. Blocks; call from a dedicated thread.
    ///
    /// `on_step` is invoked for every persisted step, in source order.
    pub fn run<F>(&self, control: &Arc<SessionControl>, mut on_step: F) -> Result<MonitorOutcome>
    where
        F: FnMut(&Step),
    {
        if !self.transcript_root.is_dir() {
            let err = Error::TranscriptUnavailable {
                root: self.transcript_root.clone(),
            };
            tracing::warn!(error = %err, "Monitoring unavailable");
            return Ok(MonitorOutcome::Unavailable {
                reason: err.to_string(),
            });
        }

        let Some(candidate) = self.correlate(control)? else {
            let err = Error::CorrelationTimeout {
                project: self.project_path.clone(),
                waited_secs: self.settings.delta_secs,
            };
            tracing::warn!(error = %err, "Monitoring unavailable");
            return Ok(MonitorOutcome::Unavailable {
                reason: err.to_string(),
            });
        };

        tracing::info!(
            session_id = %candidate.session_id,
            file = %candidate.path.display(),
            "Transcript pinned"
        );

        let mut session = MonitoredSession::new(
            candidate.session_id.clone(),
            self.agent_type,
            self.project_path.clone(),
            candidate.path.clone(),
            self.t0,
        );

        let mut handle = self.store.open_session(self.agent_type, &session.session_id)?;
        self.store.write_metadata(&handle, &session)?;
        self.registry.register(&session.session_id, Arc::clone(control));

        let summary = self.watch(control, &mut session, &mut handle, &mut on_step)?;
        Ok(MonitorOutcome::Finished(summary))
    }

    /// unpinned: scan the transcript directory until a candidate qualifies,
    /// the window expires, or the run is cancelled.
    fn correlate(&self, control: &Arc<SessionControl>) -> Result<Option<crate::correlate::Candidate>> {
        let correlator = Correlator::new(
            &self.transcript_root,
            &self.project_path,
            self.t0,
            self.settings.epsilon(),
            self.settings.delta(),
        );
        // A fast-exiting agent either wrote its transcript already or never
        // will; allow a short grace after exit instead of the full window.
        // The grace is never shorter than epsilon so a transcript flushed
        // slightly after exit is still caught.
        let exit_grace = (self.settings.poll_interval() * 4).max(self.settings.epsilon());
        let mut exit_seen: Option<Instant> = None;

        loop {
            if control.is_cancelled() {
                return Ok(None);
            }
            if let Some(candidate) = correlator.scan(|p| !self.registry.is_pinned(p))? {
                if self.registry.try_pin(&candidate.path) {
                    return Ok(Some(candidate));
                }
                // Lost the race for this file; keep scanning for another
                continue;
            }
            if Utc::now() > correlator.deadline() {
                return Ok(None);
            }
            if control.exit_status().is_some() {
                let seen = *exit_seen.get_or_insert_with(Instant::now);
                if seen.elapsed() > exit_grace {
                    return Ok(None);
                }
            }
            std::thread::sleep(self.settings.poll_interval());
        }
    }

    /// running: consume transcript appends until a terminal transition.
    fn watch<F>(
        &self,
        control: &Arc<SessionControl>,
        session: &mut MonitoredSession,
        handle: &mut SessionHandle,
        on_step: &mut F,
    ) -> Result<SessionSummary>
    where
        F: FnMut(&Step),
    {
        let file = session.source_file.clone();
        let watch_dir = file.parent().unwrap_or(&self.transcript_root).to_path_buf();

        let (tx, rx) = mpsc::channel();
        let _watcher = match build_watcher(&watch_dir, tx) {
            Ok(w) => Some(w),
            Err(e) => {
                // WatchBackendExhaustion: inotify limits and the like. The
                // recv_timeout below already doubles as a poll tick.
                tracing::warn!(error = %e, "Watch backend unavailable, degrading to polling");
                None
            }
        };

        let poll = self.settings.poll_interval();
        let mut offset = 0u64;
        let mut next_step_id = 1u64;
        let mut warning_total = 0usize;
        let mut drift_logged = false;
        let mut last_step_type = None;
        let mut last_progress = Instant::now();
        let mut exit_deadline: Option<Instant> = None;

        loop {
            let draining = control.is_cancelled();
            if !draining {
                match rx.recv_timeout(poll) {
                    Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        // Watcher thread died; polling cadence continues
                        std::thread::sleep(poll);
                    }
                }
            }

            let batch = match parser::parse_new(&file, offset, next_step_id) {
                Ok(batch) => batch,
                Err(e) => {
                    // Permission revoked, file deleted: fatal to this session
                    tracing::error!(
                        session_id = %session.session_id,
                        error = %e,
                        "Fatal transcript read error"
                    );
                    return self.finalize(session, handle, SessionStatus::Error);
                }
            };

            warning_total += batch.warnings.len();
            for warning in &batch.warnings {
                tracing::warn!(session_id = %session.session_id, "{}", warning);
            }
            if warning_total >= FORMAT_DRIFT_THRESHOLD && !drift_logged {
                drift_logged = true;
                tracing::error!(
                    session_id = %session.session_id,
                    warnings = warning_total,
                    "Transcript format drift: records are systematically unparsable"
                );
            }

            let made_progress = batch.new_offset != offset;
            offset = batch.new_offset;

            if !batch.steps.is_empty() {
                let now = Utc::now();
                let mut steps = batch.steps;
                for step in &mut steps {
                    step.timestamp = clamp_timestamp(step.timestamp, session.started_at, now);
                }

                if let Err(e) = self.store.append_steps(handle, &steps) {
                    tracing::error!(session_id = %session.session_id, error = %e, "Store append failed");
                    return self.finalize(session, handle, SessionStatus::Error);
                }

                next_step_id += steps.len() as u64;
                session.step_count += steps.len() as u64;
                session.tool_call_count += steps
                    .iter()
                    .filter(|s| s.step_type == crate::types::StepType::ToolCall)
                    .count() as u64;
                session.last_activity = steps.last().map(|s| s.timestamp).unwrap_or(now);
                last_step_type = steps.last().map(|s| s.step_type);

                if let Err(e) = self.store.write_metadata(handle, session) {
                    tracing::error!(session_id = %session.session_id, error = %e, "Store metadata write failed");
                    return self.finalize(session, handle, SessionStatus::Error);
                }

                for step in &steps {
                    on_step(step);
                }
            }
            if made_progress {
                last_progress = Instant::now();
            }

            if draining {
                return self.finalize(session, handle, SessionStatus::Cancelled);
            }

            if let Some(success) = control.exit_status() {
                // Drain trailing writes for a couple of poll ticks after exit
                let deadline = *exit_deadline.get_or_insert_with(|| Instant::now() + poll * 2);
                if made_progress {
                    exit_deadline = Some(Instant::now() + poll * 2);
                } else if Instant::now() >= deadline {
                    let status = if success {
                        SessionStatus::Completed
                    } else {
                        SessionStatus::Error
                    };
                    return self.finalize(session, handle, status);
                }
            }

            if last_progress.elapsed() >= self.settings.inactivity() {
                let at_boundary = last_step_type.map(|t| t.is_turn_boundary()).unwrap_or(false);
                let status = if at_boundary {
                    SessionStatus::Completed
                } else {
                    // Went quiet mid-turn; indistinguishable from a wedged agent
                    SessionStatus::Error
                };
                tracing::info!(
                    session_id = %session.session_id,
                    at_boundary,
                    "Inactivity timeout reached"
                );
                return self.finalize(session, handle, status);
            }
        }
    }

    /// Terminal transition: persist the summary exactly once, flip metadata
    /// to the terminal status, and drop the registry entry and the pin.
    ///
    /// Repeating a transition after the summary exists is a no-op: the store
    /// returns the existing summary unchanged.
    fn finalize(
        &self,
        session: &mut MonitoredSession,
        handle: &SessionHandle,
        status: SessionStatus,
    ) -> Result<SessionSummary> {
        // Registry cleanup happens whether or not the store writes succeed.
        // A failed finalize must not leave a dead session cancellable or its
        // transcript file claimed forever.
        let result = self.finalize_inner(session, handle, status);
        self.registry.remove(&session.session_id);
        self.registry.unpin(&session.source_file);
        result
    }

    fn finalize_inner(
        &self,
        session: &mut MonitoredSession,
        handle: &SessionHandle,
        status: SessionStatus,
    ) -> Result<SessionSummary> {
        let ended_at = Utc::now();
        let (steps, _) = self
            .store
            .read_steps(&session.session_id, 0, usize::MAX)?;
        let summary = SessionSummary::compute(session, &steps, status, ended_at);
        let stored = self.store.finalize(handle, &summary)?;

        session.status = stored.status;
        session.ended_at = Some(stored.ended_at);
        self.store.write_metadata(handle, session)?;

        tracing::info!(
            session_id = %session.session_id,
            status = %stored.status,
            steps = stored.step_count,
            "Session finalized"
        );
        Ok(stored)
    }
}

/// Clamp a step timestamp into the session's valid range. The upper bound
/// is raised to `started_at` when the wall clock has gone backwards since
/// launch, so the range is never inverted.
fn clamp_timestamp(
    ts: DateTime<Utc>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    ts.clamp(started_at, now.max(started_at))
}

fn build_watcher(
    dir: &Path,
    tx: mpsc::Sender<std::result::Result<notify::Event, notify::Error>>,
) -> std::result::Result<notify::RecommendedWatcher, notify::Error> {
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// ============================================
// Crash recovery
// ============================================

/// Finalize sessions a dead monitor left dangling.
///
/// A session still marked `running` whose last activity predates the
/// inactivity timeout lost its monitor (crash, kill -9). It is finalized as
/// `error` with a summary recovered from whatever was durably logged.
pub fn recover_dangling(
    store: &SessionStore,
    settings: &MonitorConfig,
) -> Result<Vec<SessionSummary>> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(settings.inactivity())
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

    let running = store.list_sessions(&SessionFilter {
        status: Some(SessionStatus::Running),
        ..Default::default()
    })?;

    let mut recovered = Vec::new();
    for mut session in running {
        if session.last_activity > cutoff {
            continue;
        }
        tracing::warn!(
            session_id = %session.session_id,
            last_activity = %session.last_activity,
            "Recovering dangling session as error"
        );

        let handle = store.open_session(session.agent_type, &session.session_id)?;
        let (steps, _) = store.read_steps(&session.session_id, 0, usize::MAX)?;
        let summary =
            SessionSummary::compute(&session, &steps, SessionStatus::Error, session.last_activity);
        let stored = store.finalize(&handle, &summary)?;

        session.status = stored.status;
        session.ended_at = Some(stored.ended_at);
        store.write_metadata(&handle, &session)?;
        recovered.push(stored);
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_registry_pin_exclusivity() {
        let registry = Registry::new();
        let file = Path::new("/transcripts/a.jsonl");

        assert!(registry.try_pin(file));
        assert!(registry.is_pinned(file));
        // Re-pin attempts fail while the claim is held, including from the
        // original owner
        assert!(!registry.try_pin(file));

        assert!(registry.try_pin(Path::new("/transcripts/b.jsonl")));

        // Releasing the claim makes the file available to a later invocation
        registry.unpin(file);
        assert!(!registry.is_pinned(file));
        assert!(registry.try_pin(file));
    }

    #[test]
    fn test_clamp_timestamp_survives_backwards_clock() {
        let started = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let ts = started + chrono::Duration::seconds(2);

        // Normal range
        let now = started + chrono::Duration::seconds(10);
        assert_eq!(clamp_timestamp(ts, started, now), ts);
        let early = started - chrono::Duration::seconds(3);
        assert_eq!(clamp_timestamp(early, started, now), started);
        let late = started + chrono::Duration::seconds(60);
        assert_eq!(clamp_timestamp(late, started, now), now);

        // Wall clock went backwards between launch and the batch
        let skewed_now = started - chrono::Duration::seconds(5);
        assert_eq!(clamp_timestamp(ts, started, skewed_now), started);
    }

    #[test]
    fn test_finalize_error_still_clears_registry() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let registry = Registry::new();
        let control = SessionControl::new();

        let handle = store.open_session(AgentType::ClaudeCode, "s1").unwrap();
        let mut session = MonitoredSession::new(
            "s1".into(),
            AgentType::ClaudeCode,
            PathBuf::from("/repo"),
            PathBuf::from("/t/s1.jsonl"),
            Utc::now(),
        );
        store.write_metadata(&handle, &session).unwrap();
        registry.register("s1", Arc::clone(&control));
        assert!(registry.try_pin(&session.source_file));

        let monitor = Monitor::new(
            store.clone(),
            registry.clone(),
            MonitorConfig::default(),
            AgentType::ClaudeCode,
            PathBuf::from("/repo"),
            dir.path().to_path_buf(),
            Utc::now(),
        );

        // Yank the session directory out from under the terminal transition
        std::fs::remove_dir_all(dir.path().join("claude_code/s1")).unwrap();
        let result = monitor.finalize(&mut session, &handle, SessionStatus::Error);
        assert!(result.is_err());

        // The dead session is neither cancellable nor holding its pin
        assert!(registry.running_ids().is_empty());
        assert!(!registry.is_pinned(&session.source_file));
    }

    #[test]
    fn test_registry_cancel() {
        let registry = Registry::new();
        let control = SessionControl::new();
        registry.register("s1", Arc::clone(&control));

        assert!(registry.cancel("s1"));
        assert!(control.is_cancelled());
        assert!(!registry.cancel("ghost"));

        registry.remove("s1");
        assert!(registry.running_ids().is_empty());
    }

    #[test]
    fn test_control_exit_is_sticky() {
        let control = SessionControl::new();
        assert_eq!(control.exit_status(), None);
        control.record_exit(true);
        // A second report never overwrites the first
        control.record_exit(false);
        assert_eq!(control.exit_status(), Some(true));
    }

    #[test]
    fn test_recover_dangling() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let settings = MonitorConfig::default();

        // A session whose monitor died long ago
        let handle = store.open_session(AgentType::ClaudeCode, "stale").unwrap();
        let mut stale = MonitoredSession::new(
            "stale".into(),
            AgentType::ClaudeCode,
            PathBuf::from("/repo"),
            PathBuf::from("/t/stale.jsonl"),
            Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        );
        stale.last_activity = Utc.with_ymd_and_hms(2026, 8, 1, 12, 1, 0).unwrap();
        store.write_metadata(&handle, &stale).unwrap();

        // A session that is recent enough to still be live
        let handle2 = store.open_session(AgentType::ClaudeCode, "fresh").unwrap();
        let fresh = MonitoredSession::new(
            "fresh".into(),
            AgentType::ClaudeCode,
            PathBuf::from("/repo"),
            PathBuf::from("/t/fresh.jsonl"),
            Utc::now(),
        );
        store.write_metadata(&handle2, &fresh).unwrap();

        let recovered = recover_dangling(&store, &settings).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].session_id, "stale");
        assert_eq!(recovered[0].status, SessionStatus::Error);

        let meta = store.read_metadata("stale").unwrap();
        assert_eq!(meta.status, SessionStatus::Error);
        assert!(meta.ended_at.is_some());
        assert!(store.read_summary("stale").unwrap().is_some());

        let fresh_meta = store.read_metadata("fresh").unwrap();
        assert_eq!(fresh_meta.status, SessionStatus::Running);
        assert!(store.read_summary("fresh").unwrap().is_none());

        // Recovery is idempotent across restarts
        let again = recover_dangling(&store, &settings).unwrap();
        assert!(again.is_empty());
    }
}
