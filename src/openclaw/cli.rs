use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Default per-subcommand timeout for OpenClaw CLI calls.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn failures the caller handles differently: a missing binary falls
/// back to the gateway, a timeout is reported as-is.
#[derive(Debug)]
pub enum RunnerError {
    Missing,
    TimedOut,
    Io(std::io::Error),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Missing => write!(f, "binary not found"),
            RunnerError::TimedOut => write!(f, "command timed out"),
            RunnerError::Io(e) => write!(f, "{e}"),
        }
    }
}

/// Narrow process port so the reconciler and providers are testable without
/// an OpenClaw installation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CmdOutput, RunnerError>;
}

pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CmdOutput, RunnerError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::Missing
            } else {
                RunnerError::Io(e)
            }
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RunnerError::Io(e)),
            Err(_) => return Err(RunnerError::TimedOut),
        };

        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
}

/// Handle on the external OpenClaw runtime: a local binary (overridable via
/// `OPENCLAW_CMD`), with an HTTP gateway as the fallback transport.
pub struct OpenClawCli {
    binary: String,
    runner: std::sync::Arc<dyn CommandRunner>,
    gateway: Option<GatewayConfig>,
    http: reqwest::Client,
}

impl OpenClawCli {
    pub fn new(runner: std::sync::Arc<dyn CommandRunner>, gateway: Option<GatewayConfig>) -> Self {
        let binary = std::env::var("OPENCLAW_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "openclaw".to_string());
        Self {
            binary,
            runner,
            gateway,
            http: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    pub fn with_binary(
        binary: &str,
        runner: std::sync::Arc<dyn CommandRunner>,
        gateway: Option<GatewayConfig>,
    ) -> Self {
        Self {
            binary: binary.to_string(),
            runner,
            gateway,
            http: reqwest::Client::new(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn gateway(&self) -> Option<&GatewayConfig> {
        self.gateway.as_ref()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Directory that would hold `openclaw.plugin.json` next to the binary,
    /// when the binary is addressed by path.
    pub fn binary_dir(&self) -> Option<PathBuf> {
        let p = PathBuf::from(&self.binary);
        if p.components().count() > 1 {
            p.parent().map(|d| d.to_path_buf())
        } else {
            None
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<CmdOutput, RunnerError> {
        self.run_with_timeout(args, DEFAULT_COMMAND_TIMEOUT).await
    }

    pub async fn run_with_timeout(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CmdOutput, RunnerError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        debug!("openclaw {}", args.join(" "));
        self.runner
            .run(&self.binary, &args, &HashMap::new(), timeout)
            .await
    }

    /// Run a subcommand and extract the first balanced JSON value from its
    /// stdout, tolerating noise lines before the payload.
    pub async fn run_json(&self, args: &[&str]) -> Result<Value, String> {
        let output = self
            .run(args)
            .await
            .map_err(|e| format!("openclaw {}: {e}", args.join(" ")))?;
        if output.code != 0 {
            return Err(format!(
                "openclaw {} exited with code {}: {}",
                args.join(" "),
                output.code,
                output.stderr.trim()
            ));
        }
        extract_first_json(&output.stdout).ok_or_else(|| {
            format!(
                "openclaw {} produced no parsable JSON",
                args.join(" ")
            )
        })
    }
}

/// Scan text for the first balanced JSON object or array and parse it.
///
/// OpenClaw prefixes its JSON payloads with warning lines ("Config
/// warnings: ..."), so a plain `serde_json::from_str` on the whole output
/// fails. The scanner is string-aware: braces inside JSON strings do not
/// count toward depth.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let open = text[start..]
            .find(|c| c == '{' || c == '[')
            .map(|i| start + i)?;
        if let Some(end) = balanced_end(text, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[open..=end]) {
                return Some(value);
            }
        }
        start = open + 1;
    }
    None
}

fn balanced_end(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove the OpenClaw config-warnings preamble from text destined for
/// users. Deterministic: the same lines are dropped every time.
pub fn strip_config_warnings(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("Config warnings:"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted runner: responses keyed by the leading args; records every
    /// invocation for assertions.
    pub struct ScriptedRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<Vec<(Vec<String>, Result<CmdOutput, &'static str>)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            }
        }

        pub fn on(&self, prefix: &[&str], output: CmdOutput) -> &Self {
            self.responses.lock().unwrap().push((
                prefix.iter().map(|s| s.to_string()).collect(),
                Ok(output),
            ));
            self
        }

        pub fn fail(&self, prefix: &[&str], kind: &'static str) -> &Self {
            self.responses.lock().unwrap().push((
                prefix.iter().map(|s| s.to_string()).collect(),
                Err(kind),
            ));
            self
        }

        pub fn calls_matching(&self, prefix: &[&str]) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|args| args.len() >= prefix.len() && args[..prefix.len()] == *prefix)
                .count()
        }
    }

    pub fn ok(stdout: &str) -> CmdOutput {
        CmdOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
            _envs: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<CmdOutput, RunnerError> {
            self.calls.lock().unwrap().push(args.to_vec());
            let responses = self.responses.lock().unwrap();
            for (prefix, result) in responses.iter() {
                if args.len() >= prefix.len() && args[..prefix.len()] == prefix[..] {
                    return match result {
                        Ok(out) => Ok(out.clone()),
                        Err("missing") => Err(RunnerError::Missing),
                        Err("timeout") => Err(RunnerError::TimedOut),
                        Err(other) => Err(RunnerError::Io(std::io::Error::other(*other))),
                    };
                }
            }
            // Unscripted commands succeed silently; most config writes do.
            Ok(ok(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_after_noise_lines() {
        let out = "Config warnings: plugin dir missing\nsome banner\n{\"agents\": [{\"id\": \"goat\"}]}\ntrailing";
        let value = extract_first_json(out).unwrap();
        assert_eq!(value["agents"][0]["id"], "goat");
    }

    #[test]
    fn extracts_arrays_and_ignores_braces_in_strings() {
        let out = "warn { not json\n[{\"name\": \"a{b}\"}]";
        let value = extract_first_json(out).unwrap();
        assert_eq!(value[0]["name"], "a{b}");
    }

    #[test]
    fn no_json_yields_none() {
        assert!(extract_first_json("nothing here").is_none());
        assert!(extract_first_json("{unclosed").is_none());
    }

    #[test]
    fn strip_config_warnings_is_deterministic() {
        let text = "Config warnings: x\nhello\nConfig warnings: y\nworld";
        let stripped = strip_config_warnings(text);
        assert_eq!(stripped, "hello\nworld");
        assert_eq!(strip_config_warnings(&stripped), stripped);
    }

    #[tokio::test]
    async fn run_json_reports_nonzero_exit() {
        let runner = std::sync::Arc::new(testing::ScriptedRunner::new());
        runner.on(
            &["agents", "list"],
            CmdOutput {
                code: 2,
                stdout: String::new(),
                stderr: "boom".to_string(),
            },
        );
        let cli = OpenClawCli::with_binary("openclaw", runner, None);
        let err = cli.run_json(&["agents", "list", "--json"]).await.unwrap_err();
        assert!(err.contains("code 2"));
        assert!(err.contains("boom"));
    }
}
