pub mod model_cli;
pub mod openclaw;

use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capability record. Providers vary along orthogonal boolean axes; there is
/// deliberately no per-provider type hierarchy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub agent: bool,
    pub model: bool,
    pub auth: bool,
    pub passthrough: bool,
    pub reportees: bool,
    pub agent_create: bool,
    pub agent_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Agent,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: ProviderKind,
    pub capabilities: ProviderCapabilities,
}

/// Where a provider runs relative to the agent's workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingDirPolicy {
    /// The provider manages its own working directory (OpenClaw).
    #[serde(rename = "provider-default")]
    ProviderDefault,
    /// Runs are rooted in `<home>/workspaces/<id>/`.
    #[serde(rename = "agent-workspace")]
    AgentWorkspace,
}

/// Role-skill ids keyed by agent type.
#[derive(Debug, Clone, Copy)]
pub struct RoleSkillIds {
    pub manager: &'static str,
    pub individual: &'static str,
}

/// Static runtime profile: where skills live and how the working directory
/// is chosen for this provider.
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    pub working_dir: WorkingDirPolicy,
    /// Skill directory relative to the agent workspace.
    pub skill_dir: &'static str,
    pub role_skill_ids: RoleSkillIds,
}

pub const MANAGER_ROLE_SKILL: &str = "og-board-manager";
pub const INDIVIDUAL_ROLE_SKILL: &str = "og-board-individual";

/// Every role-skill id any profile has ever used; RoleSkillSync removes all
/// but the chosen one. Includes retired ids still present in old homes.
pub const ALL_ROLE_SKILL_IDS: &[&str] = &[
    MANAGER_ROLE_SKILL,
    INDIVIDUAL_ROLE_SKILL,
    "og-boards",
    "manager",
];

/// Events emitted while a run is in flight. Hooks are a channel, not
/// callbacks; consumers drain at their own pace.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        agent_id: String,
        session_key: String,
        run_id: String,
    },
    Stdout {
        chunk: String,
    },
    Stderr {
        chunk: String,
    },
    /// Translated OpenClaw runtime-log line.
    Activity {
        message: String,
    },
    ProviderInvocationCompleted {
        code: i32,
    },
    RunCompleted {
        code: i32,
    },
}

pub struct InvokeRequest {
    pub agent_id: String,
    pub workspace: PathBuf,
    pub message: String,
    /// Provider-assigned conversation id to resume, when known.
    pub provider_session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub images: Vec<PathBuf>,
    pub abort: CancellationToken,
    pub events: Option<mpsc::UnboundedSender<RunEvent>>,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub provider_id: String,
    pub provider_session_id: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn profile(&self) -> &RuntimeProfile;

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeOutcome>;

    /// Register the agent with the external runtime. Only meaningful when
    /// `capabilities.agent_create` is set.
    async fn create_agent(&self, agent_id: &str, _workspace: &std::path::Path) -> Result<()> {
        Err(Error::validation(format!(
            "provider '{}' does not support agent creation (agent '{}')",
            self.descriptor().id,
            agent_id
        )))
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        Err(Error::validation(format!(
            "provider '{}' does not support agent deletion (agent '{}')",
            self.descriptor().id,
            agent_id
        )))
    }

    /// Path of the provider's own runtime log channel, when it has one.
    fn runtime_log_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Spawn a provider CLI and stream its output. Stdout/stderr chunks are
/// forwarded verbatim to the event channel while being buffered; the abort
/// token kills the child and yields a non-zero exit with "aborted" on
/// stderr.
pub(crate) async fn spawn_streaming(
    program: &str,
    args: &[String],
    cwd: Option<&std::path::Path>,
    env: &HashMap<String, String>,
    abort: &CancellationToken,
    events: &Option<mpsc::UnboundedSender<RunEvent>>,
) -> std::io::Result<(i32, String, String)> {
    use tokio::io::AsyncReadExt;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let mut child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_events = events.clone();
    let stderr_events = events.clone();

    let stdout_task = tokio::spawn(async move {
        let mut buffered = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = pipe.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                if let Some(tx) = &stdout_events {
                    let _ = tx.send(RunEvent::Stdout {
                        chunk: chunk.clone(),
                    });
                }
                buffered.push_str(&chunk);
            }
        }
        buffered
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffered = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = pipe.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                if let Some(tx) = &stderr_events {
                    let _ = tx.send(RunEvent::Stderr {
                        chunk: chunk.clone(),
                    });
                }
                buffered.push_str(&chunk);
            }
        }
        buffered
    });

    let mut aborted = false;
    let code = tokio::select! {
        status = child.wait() => status?.code().unwrap_or(-1),
        _ = abort.cancelled() => {
            aborted = true;
            let _ = child.kill().await;
            130
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let mut stderr = stderr_task.await.unwrap_or_default();
    if aborted && !stderr.contains("aborted") {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str("aborted");
    }
    Ok((code, stdout, stderr))
}

/// Maps provider id to adapter. Construction is explicit so tests can
/// register fakes.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.descriptor().id.clone(), p))
            .collect();
        Self { providers }
    }

    /// The builtin set: OpenClaw plus the model-only CLIs.
    pub fn builtin(cli: Arc<crate::openclaw::cli::OpenClawCli>) -> Self {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(openclaw::OpenClawProvider::new(cli)),
            Arc::new(model_cli::ModelCliProvider::codex()),
            Arc::new(model_cli::ModelCliProvider::claude_code()),
        ];
        Self::new(providers)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown provider id: {id}")))
    }

    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let mut out: Vec<ProviderDescriptor> = self
            .providers
            .values()
            .map(|p| p.descriptor().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_ids() {
        let providers: Vec<Arc<dyn Provider>> =
            vec![Arc::new(model_cli::ModelCliProvider::codex())];
        let registry = ProviderRegistry::new(providers);
        assert!(registry.get("codex").is_ok());
        let err = match registry.get("gpt-9") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("unknown provider id"));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(model_cli::ModelCliProvider::codex()),
            Arc::new(model_cli::ModelCliProvider::claude_code()),
        ];
        let registry = ProviderRegistry::new(providers);
        let ids: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["claude-code", "codex"]);
    }
}
