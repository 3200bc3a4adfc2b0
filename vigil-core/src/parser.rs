//! Incremental transcript record parser
//!
//! Turns new bytes of one transcript file into structured [`Step`]s. The
//! caller tracks a byte offset per file; [`parse_new`] reads only bytes past
//! that offset and returns the offset to resume from.
//!
//! # Error Handling
//!
//! The parser is designed to recover from per-record faults:
//!
//! - **Malformed JSON lines**: logged to [`ParseBatch::warnings`], line
//!   skipped, parsing continues.
//!
//! - **Missing or unparseable timestamp**: the record cannot become a Step
//!   (every Step carries a timestamp), so it is skipped with a warning.
//!
//! - **Unknown record kinds**: mapped to [`StepType::SystemEvent`] by the
//!   total [`StepType::from_kind`] mapping; never an error.
//!
//! - **Incomplete last line**: a record the producer is still writing has no
//!   trailing newline yet. The returned offset stops before it, so the same
//!   bytes are re-attempted on the next call once the write completes.
//!
//! - **File truncation**: when the checkpoint offset exceeds the current file
//!   size, parsing resets to offset 0 with a warning.

use crate::error::Result;
use crate::types::{bound_summary, Step, StepType};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Result of one incremental parse pass over a transcript file.
#[derive(Debug, Default)]
pub struct ParseBatch {
    /// Fully parsed steps, in source order
    pub steps: Vec<Step>,
    /// Byte offset to resume from on the next call
    pub new_offset: u64,
    /// Per-record recoverable faults
    pub warnings: Vec<String>,
}

/// Identity fields of a transcript's first record, used by correlation to
/// validate a candidate file.
#[derive(Debug, Clone)]
pub struct FirstRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// One line of agent transcript JSONL.
///
/// Uses `#[serde(default)]` liberally so unknown or missing fields never
/// fail deserialization.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,

    // user/assistant messages
    message: Option<RawMessage>,

    // tool_call / tool_result records
    tool_name: Option<String>,
    tool_use_id: Option<String>,
    input: Option<serde_json::Value>,
    content: Option<RawContent>,
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    // Catch-all for unknown block types
    #[serde(other)]
    Unknown,
}

impl RawContent {
    /// Flatten to display text. Non-text blocks contribute nothing.
    fn to_text(&self) -> String {
        match self {
            RawContent::Text(s) => s.clone(),
            RawContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Unknown => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
            RawContent::Other(v) => v.to_string(),
        }
    }
}

impl RawRecord {
    fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn content_summary(&self, step_type: StepType) -> String {
        let text = match step_type {
            StepType::ToolCall => {
                let name = self.tool_name.as_deref().unwrap_or("unknown");
                match &self.input {
                    Some(input) => format!("{}: {}", name, compact_value(input)),
                    None => name.to_string(),
                }
            }
            StepType::ToolResult => self
                .content
                .as_ref()
                .map(|c| c.to_text())
                .unwrap_or_default(),
            _ => self
                .message
                .as_ref()
                .and_then(|m| m.content.as_ref())
                .or(self.content.as_ref())
                .map(|c| c.to_text())
                .unwrap_or_default(),
        };
        bound_summary(text.trim())
    }
}

/// Render a JSON value as a short single-line excerpt.
fn compact_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================
// Parsing
// ============================================

/// Parse records appended to `path` since `offset`.
///
/// Steps are numbered starting at `next_step_id` so the caller keeps the
/// per-session sequence contiguous across calls. Only newline-terminated
/// lines are consumed; the returned offset never points into a partial
/// record.
pub fn parse_new(path: &Path, offset: u64, next_step_id: u64) -> Result<ParseBatch> {
    let mut batch = ParseBatch::default();
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut start = offset;
    if start > file_size {
        batch.warnings.push(format!(
            "file truncated: offset {} > size {}, re-reading from start",
            start, file_size
        ));
        start = 0;
    }
    batch.new_offset = start;

    if start >= file_size {
        return Ok(batch);
    }

    let mut reader = BufReader::new(file);
    if start > 0 {
        reader.seek(SeekFrom::Start(start))?;
    }

    let mut step_id = next_step_id;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            // Trailing record still being written; retry next call
            break;
        }

        let record_offset = batch.new_offset;
        batch.new_offset += read as u64;

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: RawRecord = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                batch
                    .warnings
                    .push(format!("offset {}: JSON parse error: {}", record_offset, e));
                continue;
            }
        };

        let Some(timestamp) = record.parsed_timestamp() else {
            batch.warnings.push(format!(
                "offset {}: record has no usable timestamp, skipped",
                record_offset
            ));
            continue;
        };

        let step_type = StepType::from_kind(record.record_type.as_deref().unwrap_or(""));
        let content_summary = record.content_summary(step_type);

        batch.steps.push(Step {
            step_id,
            step_type,
            timestamp,
            content_summary,
            raw_id: record.uuid,
            parent_id: record.parent_uuid,
            tool_name: record.tool_name,
            invocation_id: record.tool_use_id,
            is_error: record.is_error.unwrap_or(false),
        });
        step_id += 1;
    }

    Ok(batch)
}

/// Read the first complete record of a transcript and return its embedded
/// identity, if both session id and timestamp are present.
///
/// Used by correlation to validate candidate files. Returns `Ok(None)` when
/// the file has no complete, well-formed first record yet.
pub fn read_first_record(path: &Path) -> Result<Option<FirstRecord>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line)?;
    if read == 0 || line.last() != Some(&b'\n') {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&line);
    let record: RawRecord = match serde_json::from_str(text.trim()) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };

    let (Some(timestamp), Some(session_id)) = (record.parsed_timestamp(), record.session_id) else {
        return Ok(None);
    };

    Ok(Some(FirstRecord {
        session_id,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    const USER_LINE: &str = r#"{"type":"user","sessionId":"abc","uuid":"u1","timestamp":"2026-08-01T12:00:02Z","message":{"content":"fix the bug"}}"#;
    const ASSISTANT_LINE: &str = r#"{"type":"assistant","sessionId":"abc","uuid":"a1","parentUuid":"u1","timestamp":"2026-08-01T12:00:03Z","message":{"content":[{"type":"text","text":"on it"}]}}"#;
    const TOOL_CALL_LINE: &str = r#"{"type":"tool_call","sessionId":"abc","uuid":"t1","timestamp":"2026-08-01T12:00:04Z","toolName":"Bash","toolUseId":"inv-1","input":"cargo test"}"#;
    const TOOL_RESULT_LINE: &str = r#"{"type":"tool_result","sessionId":"abc","uuid":"t2","timestamp":"2026-08-01T12:00:06Z","toolName":"Bash","toolUseId":"inv-1","content":"ok"}"#;

    fn full_transcript() -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            USER_LINE, ASSISTANT_LINE, TOOL_CALL_LINE, TOOL_RESULT_LINE
        )
    }

    #[test]
    fn test_parse_full_transcript() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "abc.jsonl", &full_transcript());

        let batch = parse_new(&path, 0, 1).unwrap();

        assert_eq!(batch.steps.len(), 4);
        assert!(batch.warnings.is_empty());
        assert_eq!(batch.new_offset, full_transcript().len() as u64);

        assert_eq!(batch.steps[0].step_type, StepType::UserMessage);
        assert_eq!(batch.steps[0].content_summary, "fix the bug");
        assert_eq!(batch.steps[1].step_type, StepType::AssistantMessage);
        assert_eq!(batch.steps[1].parent_id.as_deref(), Some("u1"));
        assert_eq!(batch.steps[2].step_type, StepType::ToolCall);
        assert_eq!(batch.steps[2].tool_name.as_deref(), Some("Bash"));
        assert_eq!(batch.steps[2].invocation_id.as_deref(), Some("inv-1"));
        assert_eq!(batch.steps[3].step_type, StepType::ToolResult);

        let ids: Vec<u64> = batch.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_truncated_trailing_record_left_unconsumed() {
        let dir = TempDir::new().unwrap();
        let partial = format!("{}\n{}", USER_LINE, &ASSISTANT_LINE[..40]);
        let path = write_file(&dir, "abc.jsonl", &partial);

        let batch = parse_new(&path, 0, 1).unwrap();
        assert_eq!(batch.steps.len(), 1);
        assert_eq!(batch.new_offset, USER_LINE.len() as u64 + 1);

        // Complete the write, re-parse from the returned offset
        std::fs::write(&path, format!("{}\n{}\n", USER_LINE, ASSISTANT_LINE)).unwrap();
        let batch2 = parse_new(&path, batch.new_offset, 2).unwrap();
        assert_eq!(batch2.steps.len(), 1);
        assert_eq!(batch2.steps[0].step_id, 2);
        assert_eq!(batch2.steps[0].step_type, StepType::AssistantMessage);
    }

    #[test]
    fn test_incremental_never_re_emits() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "abc.jsonl", &format!("{}\n", USER_LINE));

        let first = parse_new(&path, 0, 1).unwrap();
        assert_eq!(first.steps.len(), 1);

        let again = parse_new(&path, first.new_offset, 2).unwrap();
        assert!(again.steps.is_empty());
        assert_eq!(again.new_offset, first.new_offset);
    }

    #[test]
    fn test_malformed_line_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        let contents = format!("{}\nnot json at all\n{}\n", USER_LINE, ASSISTANT_LINE);
        let path = write_file(&dir, "abc.jsonl", &contents);

        let batch = parse_new(&path, 0, 1).unwrap();
        assert_eq!(batch.steps.len(), 2);
        assert_eq!(batch.warnings.len(), 1);
        // The batch's numbering stays contiguous despite the skip
        assert_eq!(batch.steps[1].step_id, 2);
        // Offset covers the bad line so it is not retried
        assert_eq!(batch.new_offset, contents.len() as u64);
    }

    #[test]
    fn test_missing_timestamp_skipped() {
        let dir = TempDir::new().unwrap();
        let contents = r#"{"type":"user","sessionId":"abc","message":{"content":"hi"}}"#;
        let path = write_file(&dir, "abc.jsonl", &format!("{}\n", contents));

        let batch = parse_new(&path, 0, 1).unwrap();
        assert!(batch.steps.is_empty());
        assert_eq!(batch.warnings.len(), 1);
        assert!(batch.warnings[0].contains("timestamp"));
    }

    #[test]
    fn test_unknown_kind_becomes_system_event() {
        let dir = TempDir::new().unwrap();
        let contents = r#"{"type":"compaction-marker","timestamp":"2026-08-01T12:00:00Z"}"#;
        let path = write_file(&dir, "abc.jsonl", &format!("{}\n", contents));

        let batch = parse_new(&path, 0, 1).unwrap();
        assert_eq!(batch.steps.len(), 1);
        assert_eq!(batch.steps[0].step_type, StepType::SystemEvent);
    }

    #[test]
    fn test_truncation_resets_to_start() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "abc.jsonl", &format!("{}\n", USER_LINE));

        let batch = parse_new(&path, 10_000, 1).unwrap();
        assert_eq!(batch.steps.len(), 1);
        assert_eq!(batch.warnings.len(), 1);
        assert!(batch.warnings[0].contains("truncated"));
    }

    #[test]
    fn test_read_first_record() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "abc.jsonl", &full_transcript());

        let first = read_first_record(&path).unwrap().unwrap();
        assert_eq!(first.session_id, "abc");
        assert_eq!(
            first.timestamp,
            DateTime::parse_from_rfc3339("2026-08-01T12:00:02Z").unwrap()
        );

        // Incomplete first line is not yet a valid candidate
        let partial = write_file(&dir, "partial.jsonl", &USER_LINE[..30]);
        assert!(read_first_record(&partial).unwrap().is_none());

        // No session id means no identity
        let anon = write_file(
            &dir,
            "anon.jsonl",
            "{\"type\":\"user\",\"timestamp\":\"2026-08-01T12:00:02Z\"}\n",
        );
        assert!(read_first_record(&anon).unwrap().is_none());
    }
}
