use anyhow::Result;
use chrono::{SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Wall-clock source. Stores and the cron take this as a trait object so
/// tests can pin time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    fn now_iso(&self) -> String {
        let ms = self.now_ms();
        match Utc.timestamp_millis_opt(ms as i64).single() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

pub fn now_ms() -> u64 {
    SystemClock.now_ms()
}

/// Lowercase-kebab identifier derived from a display name.
/// "Research Analyst" -> "research-analyst".
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Write JSON through a temp file in the same directory, then rename.
/// Readers never observe a partially written record.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_string_atomic(path, &json)
}

pub fn write_string_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").unwrap())
}

pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").to_string()
}

/// Line prefixes the OpenClaw runtime interleaves into run output. Stripped
/// from user-facing text; stripping twice is a no-op.
const RUNTIME_NOISE_PREFIXES: &[&str] = &["Config warnings:", "[openclaw]", "embedded run "];

pub fn sanitize_run_output(raw: &str) -> String {
    let plain = strip_ansi(raw);
    let kept: Vec<&str> = plain
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !RUNTIME_NOISE_PREFIXES.iter().any(|p| t.starts_with(p))
        })
        .collect();
    kept.join("\n").trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_display_names() {
        assert_eq!(slugify("Research Analyst"), "research-analyst");
        assert_eq!(slugify("  QA  Lead "), "qa-lead");
        assert_eq!(slugify("goat"), "goat");
        assert_eq!(slugify("C++ Wizard!"), "c-wizard");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/record.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 1);
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn sanitizer_is_idempotent() {
        let raw = "Config warnings: something odd\n\x1b[31mhello\x1b[0m\n[openclaw] noise\nworld";
        let once = sanitize_run_output(raw);
        assert_eq!(once, "hello\nworld");
        assert_eq!(sanitize_run_output(&once), once);
    }

    #[test]
    fn manual_clock_iso_format() {
        let clock = testing::ManualClock::at(0);
        assert_eq!(clock.now_iso(), "1970-01-01T00:00:00.000Z");
        clock.advance(1_500);
        assert_eq!(clock.now_iso(), "1970-01-01T00:00:01.500Z");
    }
}
