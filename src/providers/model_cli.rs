use super::{
    spawn_streaming, InvokeOutcome, InvokeRequest, Provider, ProviderCapabilities,
    ProviderDescriptor, ProviderKind, RoleSkillIds, RuntimeProfile, WorkingDirPolicy,
    INDIVIDUAL_ROLE_SKILL, MANAGER_ROLE_SKILL,
};
use crate::errors::Result;
use async_trait::async_trait;

/// Model-only providers: one-shot CLIs (codex, claude-code) that run inside
/// the agent's workspace and know nothing about agents or reportees.
pub struct ModelCliProvider {
    descriptor: ProviderDescriptor,
    profile: RuntimeProfile,
    program: String,
    /// Leading args before the prompt.
    prompt_args: Vec<String>,
    /// Flag pair used to resume a provider session, when supported.
    resume_flag: Option<String>,
}

impl ModelCliProvider {
    pub fn codex() -> Self {
        Self::new("codex", "codex", vec!["exec", "--skip-git-repo-check"], None)
    }

    pub fn claude_code() -> Self {
        Self::new("claude-code", "claude", vec!["-p"], Some("--resume"))
    }

    fn new(id: &str, program: &str, prompt_args: Vec<&str>, resume_flag: Option<&str>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: id.to_string(),
                display_name: match id {
                    "codex" => "Codex".to_string(),
                    "claude-code" => "Claude Code".to_string(),
                    other => other.to_string(),
                },
                kind: ProviderKind::Model,
                capabilities: ProviderCapabilities {
                    model: true,
                    ..Default::default()
                },
            },
            profile: RuntimeProfile {
                working_dir: WorkingDirPolicy::AgentWorkspace,
                skill_dir: ".agents/skills",
                role_skill_ids: RoleSkillIds {
                    manager: MANAGER_ROLE_SKILL,
                    individual: INDIVIDUAL_ROLE_SKILL,
                },
            },
            program: program.to_string(),
            prompt_args: prompt_args.into_iter().map(String::from).collect(),
            resume_flag: resume_flag.map(String::from),
        }
    }
}

#[async_trait]
impl Provider for ModelCliProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeOutcome> {
        let mut args = self.prompt_args.clone();
        if let (Some(flag), Some(session_id)) = (&self.resume_flag, &req.provider_session_id) {
            args.push(flag.clone());
            args.push(session_id.clone());
        }
        args.push(req.message.clone());

        let cwd = req
            .cwd
            .clone()
            .unwrap_or_else(|| req.workspace.clone());
        let (code, stdout, stderr) = spawn_streaming(
            &self.program,
            &args,
            Some(&cwd),
            &req.env,
            &req.abort,
            &req.events,
        )
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                crate::errors::Error::transient(format!(
                    "provider binary '{}' is not installed",
                    self.program
                ))
            } else {
                e.into()
            }
        })?;
        Ok(InvokeOutcome {
            code,
            stdout,
            stderr,
            provider_id: self.descriptor.id.clone(),
            provider_session_id: req.provider_session_id.clone(),
        })
    }
}
