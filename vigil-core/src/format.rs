//! Status formatting helpers shared by the CLI.

use crate::types::{SessionSummary, Step, StepType};

/// Render a step as a human-readable status line.
pub fn step_line(step: &Step) -> String {
    let ts = step.timestamp.format("%H:%M:%S");
    let label = match step.step_type {
        StepType::ToolCall | StepType::ToolResult => {
            let name = step.tool_name.as_deref().unwrap_or("unknown");
            let mark = if step.step_type == StepType::ToolResult && step.is_error {
                " !"
            } else {
                ""
            };
            format!("{} [{}{}]", step.step_type, name, mark)
        }
        other => other.to_string(),
    };
    if step.content_summary.is_empty() {
        format!("{} #{:<4} {}", ts, step.step_id, label)
    } else {
        format!("{} #{:<4} {:<30} {}", ts, step.step_id, label, step.content_summary)
    }
}

/// Render a step as a single JSON line.
pub fn step_json(step: &Step) -> crate::error::Result<String> {
    Ok(serde_json::to_string(step)?)
}

/// Render a summary as a one-line wrap-up.
pub fn summary_line(summary: &SessionSummary) -> String {
    let tools = if summary.most_used_tools.is_empty() {
        String::new()
    } else {
        let names: Vec<String> = summary
            .most_used_tools
            .iter()
            .map(|t| format!("{} x{}", t.name, t.count))
            .collect();
        format!(" | tools: {}", names.join(", "))
    };
    format!(
        "session {} {} in {} | {} steps, {} tool calls ({} ok, {} failed){}",
        summary.session_id,
        summary.status,
        format_duration(summary.duration_secs),
        summary.step_count,
        summary.tool_call_count,
        summary.tool_success_count,
        summary.tool_error_count,
        tools
    )
}

/// Format a duration in seconds as a compact human string.
pub fn format_duration(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
