use serde_json::Value;

/// Result of translating one batch of OpenClaw runtime-log lines.
/// `next_fallback_run_id` is fed back on the next poll so embedded runs
/// started by the primary run keep streaming activities.
#[derive(Debug, Default)]
pub struct LogTranslation {
    pub activities: Vec<String>,
    pub next_fallback_run_id: Option<String>,
}

/// Translate NDJSON runtime-log lines emitted while a run is in flight.
///
/// Lines older than `started_at_ms` belong to earlier runs and are dropped.
/// A line is accepted when its `runId` matches the primary id; otherwise the
/// first "embedded run start" line binds a fallback id and subsequent lines
/// with that id are accepted too.
pub fn translate_runtime_lines(
    primary_run_id: &str,
    fallback_run_id: Option<&str>,
    started_at_ms: u64,
    lines: &[String],
) -> LogTranslation {
    let mut out = LogTranslation {
        activities: Vec::new(),
        next_fallback_run_id: fallback_run_id.map(|s| s.to_string()),
    };

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if line_timestamp_ms(&parsed).is_some_and(|ts| ts < started_at_ms) {
            continue;
        }
        let message = match parsed.get("message").and_then(|m| m.as_str()) {
            Some(m) => m,
            None => continue,
        };
        let run_id = parsed.get("runId").and_then(|r| r.as_str());

        let accepted = match run_id {
            Some(id) if id == primary_run_id => true,
            Some(id) => out.next_fallback_run_id.as_deref() == Some(id),
            None => false,
        };

        if !accepted {
            // An embedded run spawned on our behalf announces itself once;
            // bind to the first such id we see.
            if out.next_fallback_run_id.is_none() {
                if let Some(embedded) = parse_embedded_run_start(message) {
                    out.next_fallback_run_id = Some(embedded);
                    out.activities.push("Run accepted by OpenClaw.".to_string());
                }
            }
            continue;
        }

        if let Some(activity) = translate_message(message) {
            out.activities.push(activity);
        }
    }

    out
}

fn line_timestamp_ms(value: &Value) -> Option<u64> {
    match value.get("timestamp") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as u64),
        _ => None,
    }
}

fn parse_embedded_run_start(message: &str) -> Option<String> {
    let rest = message.strip_prefix("embedded run start:")?;
    extract_field(rest, "runId")
}

fn extract_field(text: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=");
    let start = text.find(&marker)? + marker.len();
    let value: String = text[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn translate_message(message: &str) -> Option<String> {
    if message.starts_with("embedded run start") {
        return Some("Run accepted by OpenClaw.".to_string());
    }
    if let Some(rest) = message.strip_prefix("embedded run tool start:") {
        let tool = extract_field(rest, "tool")?;
        return Some(format!("Running tool: {tool}."));
    }
    if let Some(rest) = message.strip_prefix("embedded run tool end:") {
        let tool = extract_field(rest, "tool")?;
        let duration = extract_field(rest, "durationMs")?;
        return Some(format!("Finished tool: {tool} ({duration} ms)."));
    }
    // Recognized chatter passes through with run-id noise removed.
    let cleaned = strip_run_id_noise(message);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Remove `runId=...` tokens and collapse the leftover whitespace.
fn strip_run_id_noise(message: &str) -> String {
    message
        .split_whitespace()
        .filter(|token| !token.starts_with("runId="))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(ts: u64, run_id: &str, message: &str) -> String {
        serde_json::json!({"timestamp": ts, "runId": run_id, "message": message}).to_string()
    }

    #[test]
    fn translates_tool_lifecycle() {
        let lines = vec![
            line(1_000, "r1", "embedded run start: runId=r1"),
            line(1_001, "r1", "embedded run tool start: tool=read_file"),
            line(1_050, "r1", "embedded run tool end: tool=read_file durationMs=49"),
        ];
        let t = translate_runtime_lines("r1", None, 500, &lines);
        assert_eq!(
            t.activities,
            vec![
                "Run accepted by OpenClaw.",
                "Running tool: read_file.",
                "Finished tool: read_file (49 ms).",
            ]
        );
    }

    #[test]
    fn ignores_lines_before_run_start() {
        let lines = vec![
            line(100, "r1", "embedded run tool start: tool=old"),
            line(1_000, "r1", "embedded run tool start: tool=new"),
        ];
        let t = translate_runtime_lines("r1", None, 500, &lines);
        assert_eq!(t.activities, vec!["Running tool: new."]);
    }

    #[test]
    fn binds_fallback_run_id_from_embedded_start() {
        let lines = vec![
            line(1_000, "other", "embedded run start: runId=emb-7"),
            line(1_001, "emb-7", "embedded run tool start: tool=exec"),
            line(1_002, "unrelated", "embedded run tool start: tool=nope"),
        ];
        let t = translate_runtime_lines("primary", None, 0, &lines);
        assert_eq!(t.next_fallback_run_id.as_deref(), Some("emb-7"));
        assert_eq!(
            t.activities,
            vec!["Run accepted by OpenClaw.", "Running tool: exec."]
        );
    }

    #[test]
    fn fallback_id_carries_across_polls() {
        let first = translate_runtime_lines(
            "primary",
            None,
            0,
            &[line(1_000, "x", "embedded run start: runId=emb-1")],
        );
        let second = translate_runtime_lines(
            "primary",
            first.next_fallback_run_id.as_deref(),
            0,
            &[line(1_001, "emb-1", "embedded run tool start: tool=write_file")],
        );
        assert_eq!(second.activities, vec!["Running tool: write_file."]);
        assert_eq!(second.next_fallback_run_id.as_deref(), Some("emb-1"));
    }

    #[test]
    fn passthrough_strips_run_id_noise() {
        let lines = vec![line(1_000, "r1", "compacting context runId=r1 budget=0.8")];
        let t = translate_runtime_lines("r1", None, 0, &lines);
        assert_eq!(t.activities, vec!["compacting context budget=0.8"]);
    }

    #[test]
    fn skips_unparsable_lines() {
        let lines = vec![
            "not json at all".to_string(),
            line(1_000, "r1", "embedded run tool start: tool=grep"),
        ];
        let t = translate_runtime_lines("r1", None, 0, &lines);
        assert_eq!(t.activities, vec!["Running tool: grep."]);
    }
}
