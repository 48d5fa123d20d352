use super::{
    spawn_streaming, InvokeOutcome, InvokeRequest, Provider, ProviderCapabilities,
    ProviderDescriptor, ProviderKind, RoleSkillIds, RuntimeProfile, WorkingDirPolicy,
    INDIVIDUAL_ROLE_SKILL, MANAGER_ROLE_SKILL,
};
use crate::errors::{Error, Result};
use crate::openclaw::cli::OpenClawCli;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// The OpenClaw agent runtime: reached through its CLI when installed, with
/// the HTTP gateway as the fallback transport.
pub struct OpenClawProvider {
    descriptor: ProviderDescriptor,
    profile: RuntimeProfile,
    cli: Arc<OpenClawCli>,
}

impl OpenClawProvider {
    pub fn new(cli: Arc<OpenClawCli>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: "openclaw".to_string(),
                display_name: "OpenClaw".to_string(),
                kind: ProviderKind::Agent,
                capabilities: ProviderCapabilities {
                    agent: true,
                    model: false,
                    auth: true,
                    passthrough: true,
                    reportees: true,
                    agent_create: true,
                    agent_delete: true,
                },
            },
            profile: RuntimeProfile {
                working_dir: WorkingDirPolicy::ProviderDefault,
                skill_dir: "skills",
                role_skill_ids: RoleSkillIds {
                    manager: MANAGER_ROLE_SKILL,
                    individual: INDIVIDUAL_ROLE_SKILL,
                },
            },
            cli,
        }
    }

    async fn invoke_gateway(&self, req: &InvokeRequest) -> Result<InvokeOutcome> {
        let gateway = self
            .cli
            .gateway()
            .ok_or_else(|| Error::transient("openclaw binary missing and no gateway configured"))?;
        let url = format!("{}/api/v1/runs", gateway.url.trim_end_matches('/'));
        let mut request = self.cli.http().post(&url).json(&serde_json::json!({
            "agentId": req.agent_id,
            "sessionId": req.provider_session_id,
            "message": req.message,
        }));
        if let Some(token) = &gateway.token {
            request = request.bearer_auth(token);
        }
        let send = request.send();
        let response = tokio::select! {
            response = send => response.map_err(|e| Error::transient(format!("openclaw gateway: {e}")))?,
            // The dispatcher turns this into a non-zero exit result.
            _ = req.abort.cancelled() => return Err(Error::Cancelled),
        };
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient(format!("openclaw gateway body: {e}")))?;
        let provider_session_id = crate::openclaw::cli::extract_first_json(&body)
            .and_then(|v| v.get("sessionId").and_then(|s| s.as_str()).map(String::from));
        Ok(InvokeOutcome {
            code: if status.is_success() { 0 } else { 1 },
            stdout: if status.is_success() { body.clone() } else { String::new() },
            stderr: if status.is_success() {
                String::new()
            } else {
                format!("openclaw gateway returned {status}: {body}")
            },
            provider_id: self.descriptor.id.clone(),
            provider_session_id,
        })
    }
}

#[async_trait]
impl Provider for OpenClawProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeOutcome> {
        let mut args = vec![
            "agent".to_string(),
            "run".to_string(),
            "--agent".to_string(),
            req.agent_id.clone(),
            "--message".to_string(),
            req.message.clone(),
        ];
        if let Some(session_id) = &req.provider_session_id {
            args.push("--session-id".to_string());
            args.push(session_id.clone());
        }
        for image in &req.images {
            args.push("--image".to_string());
            args.push(image.to_string_lossy().to_string());
        }

        match spawn_streaming(
            self.cli.binary(),
            &args,
            req.cwd.as_deref(),
            &req.env,
            &req.abort,
            &req.events,
        )
        .await
        {
            Ok((code, stdout, stderr)) => Ok(InvokeOutcome {
                code,
                stdout,
                stderr,
                provider_id: self.descriptor.id.clone(),
                provider_session_id: req.provider_session_id.clone(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("openclaw binary not found, trying the gateway");
                self.invoke_gateway(&req).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_agent(&self, agent_id: &str, workspace: &std::path::Path) -> Result<()> {
        let ws = workspace.to_string_lossy().to_string();
        let output = self
            .cli
            .run(&["agent", "create", agent_id, "--workspace", ws.as_str()])
            .await
            .map_err(|e| Error::transient(format!("openclaw agent create: {e}")))?;
        if output.code == 0 {
            return Ok(());
        }
        // Re-creating a known agent is a success, not a conflict.
        if output.stderr.contains("already exists") {
            debug!("openclaw already knows agent '{agent_id}'");
            return Ok(());
        }
        Err(Error::runtime_sync(
            format!(
                "openclaw agent create for '{agent_id}' failed: {}",
                output.stderr.trim()
            ),
            false,
        ))
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let output = self
            .cli
            .run(&["agent", "delete", agent_id])
            .await
            .map_err(|e| Error::transient(format!("openclaw agent delete: {e}")))?;
        if output.code == 0 || output.stderr.contains("not found") {
            return Ok(());
        }
        Err(Error::runtime_sync(
            format!(
                "openclaw agent delete for '{agent_id}' failed: {}",
                output.stderr.trim()
            ),
            false,
        ))
    }

    fn runtime_log_path(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var("OPENCLAW_RUNTIME_LOG") {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let home = dirs::home_dir()?;
        let path = home.join(".openclaw/logs/runtime.jsonl");
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openclaw::cli::testing::{ok, ScriptedRunner};
    use crate::openclaw::cli::CmdOutput;

    fn provider_with(runner: Arc<ScriptedRunner>) -> OpenClawProvider {
        OpenClawProvider::new(Arc::new(OpenClawCli::with_binary("openclaw", runner, None)))
    }

    #[tokio::test]
    async fn create_treats_already_exists_as_success() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            &["agent", "create"],
            CmdOutput {
                code: 1,
                stdout: String::new(),
                stderr: "agent 'goat' already exists".to_string(),
            },
        );
        let provider = provider_with(runner);
        provider
            .create_agent("goat", std::path::Path::new("/tmp/ws"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_surfaces_real_failures() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            &["agent", "create"],
            CmdOutput {
                code: 1,
                stdout: String::new(),
                stderr: "disk full".to_string(),
            },
        );
        let provider = provider_with(runner);
        let err = provider
            .create_agent("goat", std::path::Path::new("/tmp/ws"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn delete_tolerates_unknown_agents() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            &["agent", "delete"],
            CmdOutput {
                code: 1,
                stdout: String::new(),
                stderr: "agent not found".to_string(),
            },
        );
        let provider = provider_with(runner.clone());
        provider.delete_agent("ghost").await.unwrap();
        runner.on(&["agent", "delete"], ok(""));
        provider.delete_agent("goat").await.unwrap();
    }
}
