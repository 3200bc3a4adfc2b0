//! Read path over the session store
//!
//! Serves CLI and GUI consumers: listing sessions, fetching paginated detail,
//! and tailing a live session. Tailing polls the store and diffs against the
//! last-seen step id; it is deliberately not a push subscription since
//! polling-grade latency is all the consumers need.

use crate::error::Result;
use crate::store::{SessionFilter, SessionStore};
use crate::types::{pair_tool_calls, MonitoredSession, SessionSummary, Step, ToolCallRecord};
use std::time::Duration;

/// Paginated detail for one session.
#[derive(Debug)]
pub struct SessionDetail {
    pub session: MonitoredSession,
    pub steps: Vec<Step>,
    /// Tool pairings derived from the returned step window
    pub tool_calls: Vec<ToolCallRecord>,
    /// Present iff the session is terminal
    pub summary: Option<SessionSummary>,
    pub has_more: bool,
}

/// Query surface over a session store.
pub struct SessionQuery {
    store: SessionStore,
    tail_poll: Duration,
}

impl SessionQuery {
    pub fn new(store: SessionStore, tail_poll: Duration) -> Self {
        Self { store, tail_poll }
    }

    /// List sessions matching a filter, newest first.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<MonitoredSession>> {
        self.store.list_sessions(filter)
    }

    /// Fetch one session with a window of its step log.
    pub fn detail(&self, session_id: &str, offset: u64, limit: usize) -> Result<SessionDetail> {
        let session = self.store.read_metadata(session_id)?;
        let (steps, has_more) = self.store.read_steps(session_id, offset, limit)?;
        let tool_calls = pair_tool_calls(&steps);
        let summary = self.store.read_summary(session_id)?;
        Ok(SessionDetail {
            session,
            steps,
            tool_calls,
            summary,
            has_more,
        })
    }

    /// Tail a session's step log from just after `from_step_id`.
    ///
    /// The returned iterator blocks on its polling interval; it ends once
    /// the session is terminal and every step has been yielded, and is
    /// restartable from any step id.
    pub fn tail(&self, session_id: &str, from_step_id: u64) -> Result<Tail> {
        // Fail fast on unknown sessions rather than polling forever
        self.store.read_metadata(session_id)?;
        Ok(Tail {
            store: self.store.clone(),
            session_id: session_id.to_string(),
            last_seen: from_step_id,
            poll: self.tail_poll,
            first: true,
            done: false,
        })
    }
}

/// Lazy, restartable sequence of newly appended steps.
///
/// Each `next` yields a non-empty batch, sleeping between empty polls.
/// Finite for terminal sessions, unbounded for running ones until the
/// caller stops.
pub struct Tail {
    store: SessionStore,
    session_id: String,
    last_seen: u64,
    poll: Duration,
    first: bool,
    done: bool,
}

impl Iterator for Tail {
    type Item = Result<Vec<Step>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if !self.first {
                std::thread::sleep(self.poll);
            }
            self.first = false;

            // Read metadata before steps: if the session goes terminal
            // between the two reads we still drain the final appends on the
            // following iteration.
            let terminal = match self.store.read_metadata(&self.session_id) {
                Ok(meta) => meta.status.is_terminal(),
                Err(e) => return Some(Err(e)),
            };

            let (steps, _) = match self.store.read_steps(&self.session_id, self.last_seen, usize::MAX)
            {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };

            if !steps.is_empty() {
                self.last_seen += steps.len() as u64;
                return Some(Ok(steps));
            }
            if terminal {
                self.done = true;
                return None;
            }
        }
    }
}
