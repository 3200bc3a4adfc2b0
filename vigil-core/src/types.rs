//! Core domain types for vigil
//!
//! These types model one observed agent invocation: the session record owned
//! by its monitor, the append-only Steps parsed from the transcript, the
//! derived tool-call pairings, and the terminal summary.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Transcript** | The external agent's append-only JSONL record file for one run |
//! | **Session** | One observed agent invocation, pinned to exactly one transcript |
//! | **Step** | One parsed, structured record extracted from a transcript |
//! | **Pinning** | Permanently fixing a session-to-file mapping once correlated |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Upper bound on `Step::content_summary` length, in characters.
pub const SUMMARY_MAX_CHARS: usize = 200;

// ============================================
// Agent types
// ============================================

/// Supported coding agents whose transcripts vigil can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    ClaudeCode,
    Codex,
}

impl AgentType {
    /// Returns the display name for this agent
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "Claude Code",
            AgentType::Codex => "Codex",
        }
    }

    /// Returns the identifier used in store paths and filters
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "claude_code",
            AgentType::Codex => "codex",
        }
    }

    /// Returns the default transcript root for this agent
    pub fn default_transcript_root(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(match self {
            AgentType::ClaudeCode => home.join(".claude/projects"),
            AgentType::Codex => home.join(".codex/sessions"),
        })
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" | "ClaudeCode" => Ok(AgentType::ClaudeCode),
            "codex" | "Codex" => Ok(AgentType::Codex),
            _ => Err(format!("unknown agent type: {}", s)),
        }
    }
}

// ============================================
// Sessions
// ============================================

/// Lifecycle status of a monitored session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Monitor is pinned and consuming new records
    Running,
    /// Agent finished normally or went quiet at a turn boundary
    Completed,
    /// Agent exited with failure, or monitoring hit a fatal fault
    Error,
    /// Explicit stop request
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// A terminal session is read-only and has exactly one summary.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One observed agent invocation.
///
/// Exclusively owned by its monitor while running; read-only once
/// `ended_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSession {
    /// Stable identifier assigned by the external agent
    pub session_id: String,
    /// Which agent produced the transcript
    pub agent_type: AgentType,
    /// Working directory the invocation ran in
    pub project_path: PathBuf,
    /// Transcript file this session is pinned to
    pub source_file: PathBuf,
    /// When the invocation was launched
    pub started_at: DateTime<Utc>,
    /// Set exactly once, at the terminal transition
    pub ended_at: Option<DateTime<Utc>>,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// Number of steps persisted so far
    pub step_count: u64,
    /// Number of tool_call steps persisted so far
    pub tool_call_count: u64,
    /// Most recent observed activity
    pub last_activity: DateTime<Utc>,
}

impl MonitoredSession {
    /// Create a freshly pinned session in the `Running` state.
    pub fn new(
        session_id: String,
        agent_type: AgentType,
        project_path: PathBuf,
        source_file: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            agent_type,
            project_path,
            source_file,
            started_at,
            ended_at: None,
            status: SessionStatus::Running,
            step_count: 0,
            tool_call_count: 0,
            last_activity: started_at,
        }
    }
}

// ============================================
// Steps
// ============================================

/// Type of a parsed transcript record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    SystemEvent,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::UserMessage => "user_message",
            StepType::AssistantMessage => "assistant_message",
            StepType::ToolCall => "tool_call",
            StepType::ToolResult => "tool_result",
            StepType::SystemEvent => "system_event",
        }
    }

    /// Total mapping from a raw record kind to a step type.
    ///
    /// Unrecognized kinds fall back to [`StepType::SystemEvent`]; this never
    /// fails, so no transcript record can abort a parse batch on kind alone.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "user" | "user_message" | "human" => StepType::UserMessage,
            "assistant" | "assistant_message" => StepType::AssistantMessage,
            "tool_call" | "tool_use" => StepType::ToolCall,
            "tool_result" | "tool_output" => StepType::ToolResult,
            _ => StepType::SystemEvent,
        }
    }

    /// Whether a record of this type can legitimately be the last one in a
    /// finished transcript. A transcript ending on a bare tool_call or user
    /// message stopped mid-turn.
    pub fn is_turn_boundary(&self) -> bool {
        matches!(
            self,
            StepType::AssistantMessage | StepType::ToolResult | StepType::SystemEvent
        )
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed transcript record. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based, contiguous, strictly increasing per session
    pub step_id: u64,
    pub step_type: StepType,
    pub timestamp: DateTime<Utc>,
    /// Bounded excerpt of the record's content (see [`SUMMARY_MAX_CHARS`])
    pub content_summary: String,
    /// The record's own identifier, if it carried one
    pub raw_id: Option<String>,
    /// The record's parent identifier, if it carried one
    pub parent_id: Option<String>,
    /// Tool name, for tool_call and tool_result steps
    pub tool_name: Option<String>,
    /// Invocation id shared between a tool_call and its tool_result
    pub invocation_id: Option<String>,
    /// Whether a tool_result reported failure
    pub is_error: bool,
}

/// Truncate a content excerpt to the summary bound, on a char boundary.
pub fn bound_summary(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUMMARY_MAX_CHARS - 1).collect();
    out.push('…');
    out
}

// ============================================
// Tool call pairing
// ============================================

/// Status of a tool call derived from its (eventual) result step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// No matching tool_result observed yet
    Pending,
    Success,
    Error,
}

/// Derived pairing of a tool_call step with its tool_result step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub invocation_id: Option<String>,
    pub call_step_id: u64,
    pub result_step_id: Option<u64>,
    pub status: ToolCallStatus,
    /// Wall time between call and result timestamps
    pub duration_ms: Option<i64>,
}

/// Pair tool_call steps with their tool_result steps by shared invocation id.
///
/// Results without a matching call are ignored; calls without a result stay
/// `Pending`. Pure over a single session's steps.
pub fn pair_tool_calls(steps: &[Step]) -> Vec<ToolCallRecord> {
    let mut records: Vec<ToolCallRecord> = Vec::new();
    let mut open: HashMap<&str, usize> = HashMap::new();

    for step in steps {
        match step.step_type {
            StepType::ToolCall => {
                let idx = records.len();
                records.push(ToolCallRecord {
                    tool_name: step.tool_name.clone().unwrap_or_else(|| "unknown".into()),
                    invocation_id: step.invocation_id.clone(),
                    call_step_id: step.step_id,
                    result_step_id: None,
                    status: ToolCallStatus::Pending,
                    duration_ms: None,
                });
                if let Some(id) = step.invocation_id.as_deref() {
                    open.insert(id, idx);
                }
            }
            StepType::ToolResult => {
                let Some(id) = step.invocation_id.as_deref() else {
                    continue;
                };
                if let Some(idx) = open.remove(id) {
                    let record = &mut records[idx];
                    record.result_step_id = Some(step.step_id);
                    record.status = if step.is_error {
                        ToolCallStatus::Error
                    } else {
                        ToolCallStatus::Success
                    };
                    let call_ts = steps
                        .iter()
                        .find(|s| s.step_id == record.call_step_id)
                        .map(|s| s.timestamp);
                    record.duration_ms = call_ts
                        .map(|ts| step.timestamp.signed_duration_since(ts).num_milliseconds());
                }
            }
            _ => {}
        }
    }

    records
}

// ============================================
// Session summary
// ============================================

/// Per-tool usage count for the summary's most-used list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub name: String,
    pub count: u64,
}

/// Terminal aggregate for one session. Created exactly once, at session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_type: AgentType,
    /// Final status; always terminal
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub step_count: u64,
    pub user_message_count: u64,
    pub assistant_message_count: u64,
    pub tool_call_count: u64,
    pub tool_result_count: u64,
    pub system_event_count: u64,
    pub tool_success_count: u64,
    pub tool_error_count: u64,
    pub tool_pending_count: u64,
    /// Up to five most-used tools, by call count
    pub most_used_tools: Vec<ToolUsage>,
}

impl SessionSummary {
    /// Compute the terminal aggregate for a session from its full step log.
    ///
    /// `final_status` must be terminal; the session's own status field is not
    /// consulted so a recovery pass can summarize a still-`running` record.
    pub fn compute(
        session: &MonitoredSession,
        steps: &[Step],
        final_status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let mut user = 0u64;
        let mut assistant = 0u64;
        let mut tool_calls = 0u64;
        let mut tool_results = 0u64;
        let mut system = 0u64;
        let mut tool_counts: HashMap<String, u64> = HashMap::new();

        for step in steps {
            match step.step_type {
                StepType::UserMessage => user += 1,
                StepType::AssistantMessage => assistant += 1,
                StepType::ToolCall => {
                    tool_calls += 1;
                    let name = step.tool_name.clone().unwrap_or_else(|| "unknown".into());
                    *tool_counts.entry(name).or_insert(0) += 1;
                }
                StepType::ToolResult => tool_results += 1,
                StepType::SystemEvent => system += 1,
            }
        }

        let pairs = pair_tool_calls(steps);
        let success = pairs
            .iter()
            .filter(|p| p.status == ToolCallStatus::Success)
            .count() as u64;
        let error = pairs
            .iter()
            .filter(|p| p.status == ToolCallStatus::Error)
            .count() as u64;
        let pending = pairs
            .iter()
            .filter(|p| p.status == ToolCallStatus::Pending)
            .count() as u64;

        let mut most_used: Vec<ToolUsage> = tool_counts
            .into_iter()
            .map(|(name, count)| ToolUsage { name, count })
            .collect();
        most_used.sort_by(|a, b| b.count.cmp(&a.count).then(a.name.cmp(&b.name)));
        most_used.truncate(5);

        let ended_at = ended_at.max(session.started_at);

        Self {
            session_id: session.session_id.clone(),
            agent_type: session.agent_type,
            status: final_status,
            started_at: session.started_at,
            ended_at,
            duration_secs: ended_at
                .signed_duration_since(session.started_at)
                .num_seconds(),
            step_count: steps.len() as u64,
            user_message_count: user,
            assistant_message_count: assistant,
            tool_call_count: tool_calls,
            tool_result_count: tool_results,
            system_event_count: system,
            tool_success_count: success,
            tool_error_count: error,
            tool_pending_count: pending,
            most_used_tools: most_used,
        }
    }
}
