use crate::agents::{AgentConfig, RuntimeHook, RuntimeSyncReport};
use crate::errors::Result;
use crate::openclaw::cli::{strip_config_warnings, OpenClawCli};
use crate::providers::{ProviderRegistry, ALL_ROLE_SKILL_IDS};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Plugin ids OpenClaw has shipped the workspace plugin under, tried in
/// order; enabling any one of them is enough.
const PLUGIN_IDS: &[&str] = &[
    "openclaw-plugin",
    "opengoat-plugin",
    "openclaw-plugin-pack",
    "workspace",
];

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub ceo_synced: bool,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_skills_dir: Option<String>,
    pub repaired: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_enabled: Option<String>,
}

#[derive(Debug, Clone)]
struct RuntimeAgent {
    id: String,
    workspace: Option<String>,
    index: usize,
}

/// Drives the external OpenClaw runtime toward the on-disk OpenGoat state:
/// agent inventory, per-agent policy, plugin wiring, and managed skills.
/// Reconciliation never runs twice concurrently.
pub struct OpenClawReconciler {
    home: PathBuf,
    cli: Arc<OpenClawCli>,
    providers: Arc<ProviderRegistry>,
    lock: Mutex<()>,
}

impl OpenClawReconciler {
    pub fn new(home: PathBuf, cli: Arc<OpenClawCli>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            home,
            cli,
            providers,
            lock: Mutex::new(()),
        }
    }

    /// Full reconciliation pass. Collects warnings instead of failing: a
    /// broken OpenClaw installation degrades, it does not take OpenGoat down.
    pub async fn sync_runtime_defaults(
        &self,
        local_agents: &[AgentConfig],
        default_agent: Option<&str>,
    ) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        let mut outcome = SyncOutcome::default();

        // 1. Skill roots: where OpenClaw keeps workspace and managed skills.
        match self.cli.run_json(&["skills", "list", "--json"]).await {
            Ok(value) => {
                outcome.workspace_dir = value
                    .get("workspaceDir")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                outcome.managed_skills_dir = value
                    .get("managedSkillsDir")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            Err(e) => outcome.warnings.push(clean_warning(&e)),
        }

        // 2. Agent inventory. Unavailable inventory means no repairs and no
        // deletions this pass: never act on an incomplete picture.
        let inventory = match self.cli.run_json(&["agents", "list", "--json"]).await {
            Ok(value) => Some(parse_inventory(&value)),
            Err(e) => {
                outcome
                    .warnings
                    .push(format!("agent inventory unavailable, skipping repair: {}", clean_warning(&e)));
                None
            }
        };

        let openclaw_locals: Vec<&AgentConfig> = local_agents
            .iter()
            .filter(|a| self.manages(&a.provider_id))
            .collect();

        if let Some(runtime_agents) = &inventory {
            // Repair stale mappings: a runtime agent pointing anywhere but
            // its OpenGoat workspace gets deleted and recreated.
            for runtime_agent in runtime_agents {
                let Some(local) = openclaw_locals.iter().find(|a| a.id == runtime_agent.id) else {
                    continue;
                };
                let expected = self.workspace_of(&local.id);
                let matches = runtime_agent
                    .workspace
                    .as_deref()
                    .map(|ws| Path::new(ws) == expected.as_path())
                    .unwrap_or(false);
                if !matches {
                    info!(
                        "repairing stale OpenClaw mapping for '{}' ({:?} -> {})",
                        runtime_agent.id,
                        runtime_agent.workspace,
                        expected.display()
                    );
                    if let Err(e) = self.delete_in_runtime(&runtime_agent.id).await {
                        outcome.warnings.push(clean_warning(&e.to_string()));
                        continue;
                    }
                    match self.create_in_runtime(&local.id).await {
                        Ok(()) => outcome.repaired.push(local.id.clone()),
                        Err(e) => outcome.warnings.push(clean_warning(&e.to_string())),
                    }
                }
            }

            // Runtime agents with no local counterpart are removed.
            for runtime_agent in runtime_agents {
                if openclaw_locals.iter().all(|a| a.id != runtime_agent.id) {
                    match self.delete_in_runtime(&runtime_agent.id).await {
                        Ok(()) => outcome.deleted.push(runtime_agent.id.clone()),
                        Err(e) => outcome.warnings.push(clean_warning(&e.to_string())),
                    }
                }
            }
        }

        // 3. Every local OpenClaw agent exists in the runtime.
        for agent in &openclaw_locals {
            let known = inventory
                .as_ref()
                .is_some_and(|inv| inv.iter().any(|r| r.id == agent.id));
            if known {
                continue;
            }
            match self.create_in_runtime(&agent.id).await {
                Ok(()) => {
                    outcome.created.push(agent.id.clone());
                    if Some(agent.id.as_str()) == default_agent {
                        outcome.ceo_synced = true;
                    }
                }
                Err(e) => outcome.warnings.push(clean_warning(&e.to_string())),
            }
        }
        if default_agent
            .map(|root| {
                inventory
                    .as_ref()
                    .is_some_and(|inv| inv.iter().any(|r| r.id == root))
            })
            .unwrap_or(false)
        {
            outcome.ceo_synced = true;
        }

        // 4. Per-agent policy: sandbox off, all tools, no bootstrap wizard.
        self.enforce_agent_policies(&openclaw_locals, &mut outcome).await;

        // 5. Plugin source path and activation.
        self.configure_plugin(&mut outcome).await;

        // 6. Role skills never live in the managed skills directory.
        if let Some(managed) = outcome.managed_skills_dir.clone() {
            for id in ALL_ROLE_SKILL_IDS {
                let dir = Path::new(&managed).join(id);
                if dir.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        outcome
                            .warnings
                            .push(format!("failed to remove managed role skill {id}: {e}"));
                    }
                }
            }
        }

        outcome
    }

    async fn enforce_agent_policies(
        &self,
        locals: &[&AgentConfig],
        outcome: &mut SyncOutcome,
    ) {
        // Policies address agents by index, so re-read the inventory now
        // that creation has settled.
        let inventory = match self.cli.run_json(&["agents", "list", "--json"]).await {
            Ok(value) => parse_inventory(&value),
            Err(e) => {
                outcome
                    .warnings
                    .push(format!("skipping agent policies: {}", clean_warning(&e)));
                return;
            }
        };
        for agent in locals {
            let Some(entry) = inventory.iter().find(|r| r.id == agent.id) else {
                continue;
            };
            let prefix = format!("agents.list[{}]", entry.index);
            for assignment in [
                format!("{prefix}.sandbox.mode=off"),
                format!("{prefix}.tools.allow=[\"*\"]"),
                format!("{prefix}.skipBootstrap=true"),
            ] {
                match self.cli.run(&["config", "set", assignment.as_str()]).await {
                    Ok(output) if output.code == 0 => {}
                    Ok(output) => outcome.warnings.push(clean_warning(&format!(
                        "config set {assignment} failed: {}",
                        output.stderr.trim()
                    ))),
                    Err(e) => {
                        outcome
                            .warnings
                            .push(clean_warning(&format!("config set {assignment}: {e}")));
                        return;
                    }
                }
            }
        }
    }

    async fn configure_plugin(&self, outcome: &mut SyncOutcome) {
        let Some(plugin_dir) = self.resolve_plugin_dir() else {
            outcome
                .warnings
                .push("openclaw plugin directory not found; plugin left unconfigured".to_string());
            return;
        };
        let plugin_path = plugin_dir.to_string_lossy().to_string();

        let current: Vec<String> = match self
            .cli
            .run_json(&["config", "get", "plugins.load.paths", "--json"])
            .await
        {
            Ok(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                outcome.warnings.push(clean_warning(&e));
                Vec::new()
            }
        };

        if !current.iter().any(|p| p == &plugin_path) {
            // Prepend and dedupe, preserving the existing order.
            let mut updated = vec![plugin_path.clone()];
            for path in current {
                if !updated.contains(&path) {
                    updated.push(path);
                }
            }
            let encoded = serde_json::to_string(&updated).unwrap_or_else(|_| "[]".to_string());
            let assignment = format!("plugins.load.paths={encoded}");
            if let Err(e) = self.cli.run(&["config", "set", assignment.as_str()]).await {
                outcome
                    .warnings
                    .push(clean_warning(&format!("config set plugins.load.paths: {e}")));
            }
        }

        for id in PLUGIN_IDS.iter().copied() {
            match self.cli.run(&["plugins", "enable", id]).await {
                Ok(output) if output.code == 0 => {
                    debug!("enabled openclaw plugin as '{id}'");
                    outcome.plugin_enabled = Some(id.to_string());
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    outcome
                        .warnings
                        .push(clean_warning(&format!("plugins enable {id}: {e}")));
                    return;
                }
            }
        }
        outcome.warnings.push(format!(
            "could not enable the openclaw plugin under any known id ({})",
            PLUGIN_IDS.join(", ")
        ));
    }

    /// Env override first, else `openclaw.plugin.json` next to the binary.
    fn resolve_plugin_dir(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var("OPENGOAT_OPENCLAW_PLUGIN_PATH") {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let dir = self.cli.binary_dir()?;
        if dir.join("openclaw.plugin.json").exists() {
            Some(dir)
        } else {
            None
        }
    }

    fn workspace_of(&self, agent_id: &str) -> PathBuf {
        crate::paths::workspaces_dir(&self.home).join(agent_id)
    }

    async fn create_in_runtime(&self, agent_id: &str) -> Result<()> {
        let provider = self.providers.get("openclaw")?;
        provider
            .create_agent(agent_id, &self.workspace_of(agent_id))
            .await
    }

    async fn delete_in_runtime(&self, agent_id: &str) -> Result<()> {
        let provider = self.providers.get("openclaw")?;
        provider.delete_agent(agent_id).await
    }
}

#[async_trait]
impl RuntimeHook for OpenClawReconciler {
    fn manages(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .map(|p| p.descriptor().capabilities.agent_create)
            .unwrap_or(false)
    }

    async fn create_agent(
        &self,
        agent: &AgentConfig,
        workspace: &Path,
    ) -> Result<RuntimeSyncReport> {
        let _guard = self.lock.lock().await;
        let provider = self.providers.get(&agent.provider_id)?;
        provider.create_agent(&agent.id, workspace).await?;
        Ok(RuntimeSyncReport {
            provider_id: agent.provider_id.clone(),
            action: "create".to_string(),
            already_existed: false,
            warnings: Vec::new(),
        })
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<RuntimeSyncReport> {
        let _guard = self.lock.lock().await;
        let provider = self.providers.get("openclaw")?;
        provider.delete_agent(agent_id).await?;
        Ok(RuntimeSyncReport {
            provider_id: "openclaw".to_string(),
            action: "delete".to_string(),
            already_existed: false,
            warnings: Vec::new(),
        })
    }
}

fn parse_inventory(value: &Value) -> Vec<RuntimeAgent> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        other => other
            .get("agents")
            .and_then(|a| a.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default(),
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let id = item
                .get("id")
                .or_else(|| item.get("name"))
                .and_then(|v| v.as_str())?;
            Some(RuntimeAgent {
                id: id.to_string(),
                workspace: item
                    .get("workspace")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                index,
            })
        })
        .collect()
}

/// Warnings surface to users: strip the OpenClaw config-warnings preamble
/// before they do.
fn clean_warning(message: &str) -> String {
    strip_config_warnings(message).trim().to_string()
}
