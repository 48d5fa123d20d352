pub mod role_skill;

use crate::errors::{Error, Result};
use crate::providers::ProviderRegistry;
use crate::util;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Manager,
    Individual,
}

/// Persisted shape of `<home>/agents/<id>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub reports_to: Option<String>,
    pub provider_id: String,
    #[serde(default = "default_true")]
    pub discoverable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub runtime: RuntimeState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub skills: SkillAssignments,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillAssignments {
    #[serde(default)]
    pub assigned: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct CreateAgentOptions {
    pub agent_type: Option<AgentType>,
    pub reports_to: Option<String>,
    pub provider_id: Option<String>,
    pub role: Option<String>,
    pub description: Option<String>,
    pub skills: Vec<String>,
    pub discoverable: Option<bool>,
    pub tags: Vec<String>,
    pub priority: Option<i64>,
}

/// Patch for `update`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub agent_type: Option<AgentType>,
    pub reports_to: Option<String>,
    pub provider_id: Option<String>,
    pub discoverable: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<i64>,
    pub skills: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSyncReport {
    pub provider_id: String,
    pub action: String,
    pub already_existed: bool,
    pub warnings: Vec<String>,
}

/// Seam to the external runtime (OpenClaw). The reconciler implements this;
/// tests plug in fakes.
#[async_trait]
pub trait RuntimeHook: Send + Sync {
    /// Whether this runtime manages agents of the given provider.
    fn manages(&self, provider_id: &str) -> bool;

    async fn create_agent(&self, agent: &AgentConfig, workspace: &Path)
        -> Result<RuntimeSyncReport>;

    async fn delete_agent(&self, agent_id: &str) -> Result<RuntimeSyncReport>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentReport {
    pub agent: AgentConfig,
    pub created_paths: Vec<PathBuf>,
    pub skipped_paths: Vec<PathBuf>,
    pub already_existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_sync: Option<RuntimeSyncReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAgentReport {
    pub existed: bool,
    pub removed_paths: Vec<PathBuf>,
    pub skipped_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_sync: Option<RuntimeSyncReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub total_reportees: usize,
    pub direct_reportees: Vec<String>,
}

/// Org-tree queries the task store needs for authority checks.
pub trait OrgQuery: Send + Sync {
    fn agent_exists(&self, id: &str) -> bool;
    fn is_recursive_reportee(&self, manager: &str, id: &str) -> bool;
}

/// Owns `<home>/agents/**` and `<home>/workspaces/**`: agent records, the
/// reports-to tree, and the symlink mirror of that tree.
pub struct AgentStore {
    home: PathBuf,
    providers: Arc<ProviderRegistry>,
    runtime: Arc<dyn RuntimeHook>,
}

impl AgentStore {
    pub fn new(
        home: PathBuf,
        providers: Arc<ProviderRegistry>,
        runtime: Arc<dyn RuntimeHook>,
    ) -> Self {
        Self {
            home,
            providers,
            runtime,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn config_path(&self, id: &str) -> PathBuf {
        crate::paths::agents_dir(&self.home).join(id).join("config.json")
    }

    pub fn workspace(&self, id: &str) -> PathBuf {
        crate::paths::workspaces_dir(&self.home).join(id)
    }

    // ------------------------------------------------------------------
    // Default (root) agent
    // ------------------------------------------------------------------

    /// The root agent id: `OPENGOAT_DEFAULT_AGENT` env override, else
    /// `<home>/config.json`.
    pub fn default_agent_id(&self) -> Option<String> {
        if let Ok(val) = std::env::var("OPENGOAT_DEFAULT_AGENT") {
            let trimmed = val.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        let path = crate::paths::root_config_path(&self.home);
        let value: serde_json::Value = util::read_json(&path).ok()?;
        value
            .get("defaultAgent")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn set_default_agent(&self, id: &str) -> Result<()> {
        let path = crate::paths::root_config_path(&self.home);
        util::write_json_atomic(&path, &serde_json::json!({ "defaultAgent": id }))
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    pub fn load(&self, id: &str) -> Result<AgentConfig> {
        let path = self.config_path(id);
        if !path.exists() {
            return Err(Error::not_found("agent", id));
        }
        util::read_json(&path).map_err(Into::into)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.config_path(id).exists()
    }

    /// All agents: default agent first, then case-insensitively by display
    /// name. Corrupt records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<AgentConfig>> {
        let agents_dir = crate::paths::agents_dir(&self.home);
        if !agents_dir.exists() {
            return Ok(Vec::new());
        }
        let mut agents = Vec::new();
        for entry in fs::read_dir(&agents_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let config_path = entry.path().join("config.json");
            if !config_path.exists() {
                continue;
            }
            match util::read_json::<AgentConfig>(&config_path) {
                Ok(agent) => agents.push(agent),
                Err(e) => {
                    warn!("Skipping corrupt agent config at {}: {e}", config_path.display());
                }
            }
        }
        let default_id = self.default_agent_id();
        agents.sort_by(|a, b| {
            let a_default = Some(&a.id) == default_id.as_ref();
            let b_default = Some(&b.id) == default_id.as_ref();
            b_default
                .cmp(&a_default)
                .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
        });
        Ok(agents)
    }

    pub async fn create(&self, name: &str, opts: CreateAgentOptions) -> Result<CreateAgentReport> {
        let id = util::slugify(name);
        if id.is_empty() {
            return Err(Error::validation(format!(
                "agent name '{name}' yields an empty id"
            )));
        }
        let provider_id = opts
            .provider_id
            .clone()
            .unwrap_or_else(|| "openclaw".to_string());
        let provider = self.providers.get(&provider_id)?;

        if let Some(manager_id) = &opts.reports_to {
            let manager = self.load(manager_id)?;
            let manager_provider = self.providers.get(&manager.provider_id)?;
            if !manager_provider.descriptor().capabilities.reportees {
                return Err(Error::validation(format!(
                    "agent '{manager_id}' cannot take reportees: provider '{}' does not support them",
                    manager.provider_id
                )));
            }
        }

        let already_existed = self.exists(&id);
        let mut created_paths = Vec::new();
        let mut skipped_paths = Vec::new();

        let agent = if already_existed {
            let existing = self.load(&id)?;
            skipped_paths.push(self.config_path(&id));
            skipped_paths.push(self.workspace(&id));
            existing
        } else {
            let agent = AgentConfig {
                id: id.clone(),
                display_name: name.trim().to_string(),
                role: opts.role.clone(),
                description: opts.description.clone().unwrap_or_default(),
                agent_type: opts.agent_type.unwrap_or(AgentType::Individual),
                reports_to: opts.reports_to.clone(),
                provider_id: provider_id.clone(),
                discoverable: opts.discoverable.unwrap_or(true),
                tags: opts.tags.clone(),
                priority: opts.priority.unwrap_or(0),
                runtime: RuntimeState {
                    skills: SkillAssignments {
                        assigned: dedupe_preserving_order(opts.skills.clone()),
                    },
                },
            };
            created_paths.extend(self.write_agent_files(&agent, provider.profile())?);
            agent
        };

        // Sync runs for pre-existing agents too: re-running create is how a
        // failed runtime registration is recovered.
        let runtime_sync = if self.runtime.manages(&agent.provider_id) {
            match self.runtime.create_agent(&agent, &self.workspace(&id)).await {
                Ok(report) => Some(report),
                Err(e) => {
                    if !already_existed {
                        self.rollback_create(&agent, &created_paths);
                        return Err(Error::runtime_sync(e.to_string(), true));
                    }
                    return Err(Error::runtime_sync(e.to_string(), false));
                }
            }
        } else {
            None
        };

        Ok(CreateAgentReport {
            agent,
            created_paths,
            skipped_paths,
            already_existed,
            runtime_sync,
        })
    }

    fn write_agent_files(
        &self,
        agent: &AgentConfig,
        profile: &crate::providers::RuntimeProfile,
    ) -> Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        let config_path = self.config_path(&agent.id);
        util::write_json_atomic(&config_path, agent)?;
        created.push(config_path);

        let ws = self.workspace(&agent.id);
        fs::create_dir_all(&ws)?;
        created.push(ws.clone());

        for (file, content) in [
            ("AGENTS.md", workspace_agents_md(agent)),
            ("ROLE.md", workspace_role_md(agent)),
            ("SOUL.md", workspace_soul_md(agent)),
        ] {
            let path = ws.join(file);
            if !path.exists() {
                fs::write(&path, content)?;
                created.push(path);
            }
        }

        let skill_root = ws.join(profile.skill_dir);
        fs::create_dir_all(&skill_root)?;
        created.push(skill_root);

        let reportees = ws.join("reportees");
        fs::create_dir_all(&reportees)?;
        created.push(reportees);

        let org_link = ws.join("organization");
        if !org_link.exists() {
            fs::create_dir_all(crate::paths::organization_dir(&self.home))?;
            make_symlink(Path::new("../../organization"), &org_link)?;
            created.push(org_link);
        }

        let change =
            role_skill::sync_role_skill(&ws, profile, &agent.id, agent.agent_type)?;
        created.extend(change.written);

        if let Some(manager_id) = &agent.reports_to {
            let link = self.reportee_link(manager_id, &agent.id);
            self.ensure_reportee_link(manager_id, &agent.id)?;
            created.push(link);
        }

        Ok(created)
    }

    fn rollback_create(&self, agent: &AgentConfig, _created: &[PathBuf]) {
        let agent_dir = crate::paths::agents_dir(&self.home).join(&agent.id);
        let _ = fs::remove_dir_all(&agent_dir);
        let _ = fs::remove_dir_all(self.workspace(&agent.id));
        if let Some(manager_id) = &agent.reports_to {
            let _ = fs::remove_file(self.reportee_link(manager_id, &agent.id));
        }
    }

    pub async fn delete(&self, id: &str, force: bool) -> Result<DeleteAgentReport> {
        if !self.exists(id) {
            return Ok(DeleteAgentReport {
                existed: false,
                removed_paths: Vec::new(),
                skipped_paths: Vec::new(),
                runtime_sync: None,
            });
        }
        let agent = self.load(id)?;

        if Some(id.to_string()) == self.default_agent_id() && !force {
            return Err(Error::validation(format!(
                "refusing to delete the default agent '{id}' (pass force to override)"
            )));
        }

        let reportees = self.list_direct_reportees(id)?;
        if !reportees.is_empty() && !force {
            return Err(Error::validation(format!(
                "agent '{id}' still has {} reportee(s); reassign them or pass force",
                reportees.len()
            )));
        }

        // Runtime first: a failed external delete leaves local state intact
        // unless the caller forces.
        let runtime_sync = if self.runtime.manages(&agent.provider_id) {
            match self.runtime.delete_agent(id).await {
                Ok(report) => Some(report),
                Err(e) if force => {
                    warn!("Ignoring runtime delete failure for '{id}': {e}");
                    None
                }
                Err(e) => return Err(Error::runtime_sync(e.to_string(), false)),
            }
        } else {
            None
        };

        // Forced delete of a mid-tree manager: hoist its reportees to the
        // deleted agent's own manager (or leave them at the root).
        for reportee in &reportees {
            let new_manager = agent.reports_to.clone();
            let mut updated = reportee.clone();
            updated.reports_to = new_manager.clone();
            util::write_json_atomic(&self.config_path(&updated.id), &updated)?;
            let _ = fs::remove_file(self.reportee_link(id, &updated.id));
            if let Some(m) = &new_manager {
                self.ensure_reportee_link(m, &updated.id)?;
            }
        }

        let mut removed = Vec::new();
        let agent_dir = crate::paths::agents_dir(&self.home).join(id);
        fs::remove_dir_all(&agent_dir)?;
        removed.push(agent_dir);
        let ws = self.workspace(id);
        if ws.exists() {
            fs::remove_dir_all(&ws)?;
            removed.push(ws);
        }
        if let Some(manager_id) = &agent.reports_to {
            let link = self.reportee_link(manager_id, id);
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
                removed.push(link);
            }
        }

        Ok(DeleteAgentReport {
            existed: true,
            removed_paths: removed,
            skipped_paths: Vec::new(),
            runtime_sync,
        })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set_manager(&self, id: &str, new_manager: &str) -> Result<()> {
        if id == new_manager {
            return Err(Error::validation(format!(
                "agent '{id}' cannot report to itself"
            )));
        }
        let mut agent = self.load(id)?;
        let manager = self.load(new_manager)?;

        let manager_provider = self.providers.get(&manager.provider_id)?;
        if !manager_provider.descriptor().capabilities.reportees {
            return Err(Error::validation(format!(
                "agent '{new_manager}' cannot take reportees: provider '{}' does not support them",
                manager.provider_id
            )));
        }

        // Walk up from the proposed manager; finding `id` would close a cycle.
        let mut cursor = Some(new_manager.to_string());
        let mut seen = HashSet::new();
        while let Some(current) = cursor {
            if current == id {
                return Err(Error::validation(format!(
                    "setting manager of '{id}' to '{new_manager}' would create a reporting cycle"
                )));
            }
            if !seen.insert(current.clone()) {
                break;
            }
            cursor = self.load(&current).ok().and_then(|a| a.reports_to);
        }

        let old_manager = agent.reports_to.clone();
        agent.reports_to = Some(new_manager.to_string());
        util::write_json_atomic(&self.config_path(id), &agent)?;

        if let Some(old) = &old_manager {
            let link = self.reportee_link(old, id);
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
        }
        self.ensure_reportee_link(new_manager, id)?;

        // Role skills can change for all three parties (an agent promoted
        // into or out of management picks up the other manual).
        self.resync_role_skill(&agent)?;
        if let Some(old) = &old_manager {
            if let Ok(old_agent) = self.load(old) {
                self.resync_role_skill(&old_agent)?;
            }
        }
        self.resync_role_skill(&manager)?;
        Ok(())
    }

    pub fn set_provider(&self, id: &str, provider_id: &str) -> Result<()> {
        let mut agent = self.load(id)?;
        let new_provider = self.providers.get(provider_id)?;
        let old_provider = self.providers.get(&agent.provider_id)?;

        agent.provider_id = provider_id.to_string();
        util::write_json_atomic(&self.config_path(id), &agent)?;

        let ws = self.workspace(id);
        // Relocate the role skill into the new provider's skill directory.
        role_skill::remove_role_skills(&ws, old_provider.profile())?;
        role_skill::sync_role_skill(&ws, new_provider.profile(), id, agent.agent_type)?;
        Ok(())
    }

    pub fn update(&self, id: &str, patch: AgentPatch) -> Result<AgentConfig> {
        let mut agent = self.load(id)?;

        if let Some(display_name) = patch.display_name {
            agent.display_name = display_name.trim().to_string();
        }
        if let Some(role) = patch.role {
            let role = role.trim().to_string();
            agent.role = if role.is_empty() { None } else { Some(role) };
        }
        if let Some(description) = patch.description {
            agent.description = description;
        }
        if let Some(discoverable) = patch.discoverable {
            agent.discoverable = discoverable;
        }
        if let Some(tags) = patch.tags {
            agent.tags = tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(priority) = patch.priority {
            agent.priority = priority;
        }
        if let Some(skills) = patch.skills {
            agent.runtime.skills.assigned = dedupe_preserving_order(skills);
        }
        let type_changed = match patch.agent_type {
            Some(t) if t != agent.agent_type => {
                agent.agent_type = t;
                true
            }
            _ => false,
        };
        util::write_json_atomic(&self.config_path(id), &agent)?;

        if type_changed {
            self.resync_role_skill(&agent)?;
        }
        if let Some(provider_id) = patch.provider_id {
            if provider_id != agent.provider_id {
                self.set_provider(id, &provider_id)?;
            }
        }
        if let Some(reports_to) = patch.reports_to {
            if Some(&reports_to) != agent.reports_to.as_ref() {
                self.set_manager(id, &reports_to)?;
            }
        }
        self.load(id)
    }

    fn resync_role_skill(&self, agent: &AgentConfig) -> Result<()> {
        let provider = self.providers.get(&agent.provider_id)?;
        role_skill::sync_role_skill(
            &self.workspace(&agent.id),
            provider.profile(),
            &agent.id,
            agent.agent_type,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tree queries
    // ------------------------------------------------------------------

    pub fn list_direct_reportees(&self, id: &str) -> Result<Vec<AgentConfig>> {
        if !self.exists(id) {
            return Err(Error::not_found("agent", id));
        }
        let mut out: Vec<AgentConfig> = self
            .list()?
            .into_iter()
            .filter(|a| a.reports_to.as_deref() == Some(id))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// BFS over the subtree below `id`, level by level, each level sorted by
    /// agent id. Excludes `id` itself.
    pub fn list_all_reportees(&self, id: &str) -> Result<Vec<AgentConfig>> {
        if !self.exists(id) {
            return Err(Error::not_found("agent", id));
        }
        let all = self.list()?;
        let mut children: HashMap<&str, Vec<&AgentConfig>> = HashMap::new();
        for agent in &all {
            if let Some(manager) = agent.reports_to.as_deref() {
                children.entry(manager).or_default().push(agent);
            }
        }
        for level in children.values_mut() {
            level.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(id);
        seen.insert(id);
        while let Some(current) = queue.pop_front() {
            for child in children.get(current).into_iter().flatten() {
                if seen.insert(child.id.as_str()) {
                    out.push((*child).clone());
                    queue.push_back(child.id.as_str());
                }
            }
        }
        Ok(out)
    }

    pub fn get_info(&self, id: &str) -> Result<AgentInfo> {
        let agent = self.load(id)?;
        let direct: Vec<String> = self
            .list_direct_reportees(id)?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let total = self.list_all_reportees(id)?.len();
        Ok(AgentInfo {
            id: agent.id,
            name: agent.display_name,
            role: agent.role,
            total_reportees: total,
            direct_reportees: direct,
        })
    }

    // ------------------------------------------------------------------
    // Symlinks
    // ------------------------------------------------------------------

    fn reportee_link(&self, manager_id: &str, reportee_id: &str) -> PathBuf {
        self.workspace(manager_id).join("reportees").join(reportee_id)
    }

    fn ensure_reportee_link(&self, manager_id: &str, reportee_id: &str) -> Result<()> {
        let link = self.reportee_link(manager_id, reportee_id);
        if link.symlink_metadata().is_ok() {
            return Ok(());
        }
        fs::create_dir_all(self.workspace(manager_id).join("reportees"))?;
        let target = PathBuf::from("../..").join(reportee_id);
        make_symlink(&target, &link)?;
        Ok(())
    }
}

impl OrgQuery for AgentStore {
    fn agent_exists(&self, id: &str) -> bool {
        self.exists(id)
    }

    fn is_recursive_reportee(&self, manager: &str, id: &str) -> bool {
        self.list_all_reportees(manager)
            .map(|subtree| subtree.iter().any(|a| a.id == id))
            .unwrap_or(false)
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(Into::into)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_dir(target, link).map_err(Into::into)
}

fn dedupe_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn workspace_agents_md(agent: &AgentConfig) -> String {
    format!(
        "# {name}\n\n\
This workspace belongs to the OpenGoat agent `{id}`.\n\n\
- `ROLE.md` describes what this agent is responsible for.\n\
- `SOUL.md` sets tone and working style.\n\
- `reportees/` links to the workspaces of direct reports.\n\
- `organization/` links to shared organization state (wiki, notes).\n",
        name = agent.display_name,
        id = agent.id
    )
}

fn workspace_role_md(agent: &AgentConfig) -> String {
    let role = agent.role.as_deref().unwrap_or(match agent.agent_type {
        AgentType::Manager => "Manager",
        AgentType::Individual => "Individual contributor",
    });
    format!(
        "# Role\n\n{role}\n\n{description}\n",
        description = agent.description
    )
}

fn workspace_soul_md(agent: &AgentConfig) -> String {
    format!(
        "# Soul\n\n\
You are {name}. Be direct, keep your worklog current, and prefer small\n\
verifiable steps over sweeping claims.\n",
        name = agent.display_name
    )
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Runtime hook recording calls; optionally scripted to fail.
    #[derive(Default)]
    pub struct RecordingRuntime {
        pub created: std::sync::Mutex<Vec<String>>,
        pub deleted: std::sync::Mutex<Vec<String>>,
        pub fail_create: std::sync::atomic::AtomicBool,
        pub fail_delete: std::sync::atomic::AtomicBool,
    }

    impl RecordingRuntime {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl RuntimeHook for RecordingRuntime {
        fn manages(&self, provider_id: &str) -> bool {
            provider_id == "openclaw"
        }

        async fn create_agent(
            &self,
            agent: &AgentConfig,
            _workspace: &Path,
        ) -> Result<RuntimeSyncReport> {
            if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::transient("openclaw create failed"));
            }
            self.created.lock().unwrap().push(agent.id.clone());
            Ok(RuntimeSyncReport {
                provider_id: agent.provider_id.clone(),
                action: "create".to_string(),
                already_existed: false,
                warnings: Vec::new(),
            })
        }

        async fn delete_agent(&self, agent_id: &str) -> Result<RuntimeSyncReport> {
            if self.fail_delete.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::transient("openclaw delete failed"));
            }
            self.deleted.lock().unwrap().push(agent_id.to_string());
            Ok(RuntimeSyncReport {
                provider_id: "openclaw".to_string(),
                action: "delete".to_string(),
                already_existed: false,
                warnings: Vec::new(),
            })
        }
    }

    pub fn registry() -> Arc<ProviderRegistry> {
        use crate::openclaw::cli::{testing::ScriptedRunner, OpenClawCli};
        let runner = Arc::new(ScriptedRunner::new());
        let cli = Arc::new(OpenClawCli::with_binary("openclaw", runner, None));
        Arc::new(ProviderRegistry::builtin(cli))
    }

    pub fn store_at(home: &Path) -> (AgentStore, Arc<RecordingRuntime>) {
        let runtime = RecordingRuntime::new();
        let store = AgentStore::new(home.to_path_buf(), registry(), runtime.clone());
        (store, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (AgentStore, Arc<testing::RecordingRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (store, runtime) = testing::store_at(dir.path());
        (store, runtime, dir)
    }

    async fn seed_root(store: &AgentStore) -> AgentConfig {
        let report = store
            .create(
                "Goat",
                CreateAgentOptions {
                    agent_type: Some(AgentType::Manager),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.set_default_agent(&report.agent.id).unwrap();
        report.agent
    }

    #[tokio::test]
    async fn create_writes_config_and_workspace() {
        let (store, runtime, dir) = fixture();
        let root = seed_root(&store).await;
        let report = store
            .create(
                "Research Analyst",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    skills: vec!["research".to_string()],
                    role: Some("Developer".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.agent.id, "research-analyst");
        assert!(!report.already_existed);

        let config: serde_json::Value = util::read_json(
            &dir.path().join("agents/research-analyst/config.json"),
        )
        .unwrap();
        assert_eq!(config["runtime"]["skills"]["assigned"][0], "research");
        assert_eq!(config["type"], "individual");
        assert_eq!(config["reportsTo"], "goat");
        assert_eq!(config["displayName"], "Research Analyst");

        let link = dir.path().join("workspaces/goat/reportees/research-analyst");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(dir
            .path()
            .join("workspaces/research-analyst/skills/og-board-individual/SKILL.md")
            .exists());
        assert!(dir
            .path()
            .join("workspaces/research-analyst/organization")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());

        assert_eq!(runtime.created.lock().unwrap().as_slice(), ["goat", "research-analyst"]);
    }

    #[tokio::test]
    async fn create_is_idempotent_and_still_syncs() {
        let (store, runtime, _dir) = fixture();
        seed_root(&store).await;
        let first = store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        assert!(!first.already_existed);
        let second = store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        assert!(second.already_existed);
        assert!(second.created_paths.is_empty());
        // Both calls reached the runtime.
        assert_eq!(runtime.calls_for("engineer"), 2);
    }

    impl testing::RecordingRuntime {
        fn calls_for(&self, id: &str) -> usize {
            self.created.lock().unwrap().iter().filter(|c| c.as_str() == id).count()
        }
    }

    #[tokio::test]
    async fn runtime_create_failure_rolls_back_new_agent() {
        let (store, runtime, dir) = fixture();
        let root = seed_root(&store).await;
        runtime
            .fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = store
            .create(
                "Flaky",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            Error::RuntimeSync { rolled_back, .. } => assert!(rolled_back),
            other => panic!("expected RuntimeSync, got {other:?}"),
        }
        assert!(!dir.path().join("agents/flaky").exists());
        assert!(!dir.path().join("workspaces/flaky").exists());
        assert!(!dir.path().join("workspaces/goat/reportees/flaky").symlink_metadata().is_ok());
    }

    #[tokio::test]
    async fn runtime_create_failure_preserves_existing_agent() {
        let (store, runtime, dir) = fixture();
        seed_root(&store).await;
        store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        runtime
            .fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = store.create("Engineer", CreateAgentOptions::default()).await.unwrap_err();
        match err {
            Error::RuntimeSync { rolled_back, .. } => assert!(!rolled_back),
            other => panic!("expected RuntimeSync, got {other:?}"),
        }
        assert!(dir.path().join("agents/engineer/config.json").exists());
    }

    #[tokio::test]
    async fn delete_removes_directory_and_symlink() {
        let (store, runtime, dir) = fixture();
        let root = seed_root(&store).await;
        store
            .create(
                "Research Analyst",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = store.delete("research-analyst", false).await.unwrap();
        assert!(report.existed);
        assert!(!dir.path().join("agents/research-analyst").exists());
        assert!(!dir.path().join("workspaces/research-analyst").exists());
        assert!(dir
            .path()
            .join("workspaces/goat/reportees/research-analyst")
            .symlink_metadata()
            .is_err());
        assert_eq!(runtime.deleted.lock().unwrap().as_slice(), ["research-analyst"]);
    }

    #[tokio::test]
    async fn delete_refuses_root_without_force() {
        let (store, _runtime, _dir) = fixture();
        let root = seed_root(&store).await;
        let err = store.delete(&root.id, false).await.unwrap_err();
        assert!(err.to_string().contains("default agent"));
        let report = store.delete(&root.id, true).await.unwrap();
        assert!(report.existed);
    }

    #[tokio::test]
    async fn delete_aborts_on_runtime_failure_unless_forced() {
        let (store, runtime, dir) = fixture();
        seed_root(&store).await;
        store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        runtime
            .fail_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = store.delete("engineer", false).await.unwrap_err();
        assert!(matches!(err, Error::RuntimeSync { .. }));
        assert!(dir.path().join("agents/engineer/config.json").exists());

        let report = store.delete("engineer", true).await.unwrap();
        assert!(report.existed);
        assert!(!dir.path().join("agents/engineer").exists());
    }

    #[tokio::test]
    async fn list_puts_default_agent_first_then_alphabetical() {
        let (store, _runtime, _dir) = fixture();
        let root = seed_root(&store).await;
        for name in ["zeta", "Alpha", "beta"] {
            store
                .create(
                    name,
                    CreateAgentOptions {
                        reports_to: Some(root.id.clone()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["goat", "alpha", "beta", "zeta"]);
    }

    #[tokio::test]
    async fn set_manager_rejects_cycles_and_ineligible_providers() {
        let (store, _runtime, _dir) = fixture();
        let root = seed_root(&store).await;
        store
            .create(
                "Lead",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .create(
                "Engineer",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A model-only provider cannot take reportees; the error names it.
        store.set_provider("lead", "codex").unwrap();
        let err = store.set_manager("engineer", "lead").unwrap_err();
        assert!(err.to_string().contains("codex"), "{err}");

        store.set_provider("lead", "openclaw").unwrap();
        store.set_manager("engineer", "lead").unwrap();
        let err = store.set_manager("lead", "engineer").unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let err = store.set_manager("lead", "lead").unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[tokio::test]
    async fn set_manager_moves_the_symlink() {
        let (store, _runtime, dir) = fixture();
        let root = seed_root(&store).await;
        for name in ["Lead", "Engineer"] {
            store
                .create(
                    name,
                    CreateAgentOptions {
                        agent_type: Some(AgentType::Manager),
                        reports_to: Some(root.id.clone()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        store.set_manager("engineer", "lead").unwrap();
        assert!(dir
            .path()
            .join("workspaces/goat/reportees/engineer")
            .symlink_metadata()
            .is_err());
        assert!(dir
            .path()
            .join("workspaces/lead/reportees/engineer")
            .symlink_metadata()
            .is_ok());
        assert_eq!(
            store.load("engineer").unwrap().reports_to.as_deref(),
            Some("lead")
        );
    }

    #[tokio::test]
    async fn set_provider_relocates_role_skill() {
        let (store, _runtime, dir) = fixture();
        seed_root(&store).await;
        store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        assert!(dir
            .path()
            .join("workspaces/engineer/skills/og-board-individual/SKILL.md")
            .exists());

        store.set_provider("engineer", "claude-code").unwrap();
        assert!(!dir
            .path()
            .join("workspaces/engineer/skills/og-board-individual")
            .exists());
        assert!(dir
            .path()
            .join("workspaces/engineer/.agents/skills/og-board-individual/SKILL.md")
            .exists());
    }

    #[tokio::test]
    async fn reportee_queries_are_bfs_sorted() {
        let (store, _runtime, _dir) = fixture();
        let root = seed_root(&store).await;
        store
            .create(
                "CTO",
                CreateAgentOptions {
                    agent_type: Some(AgentType::Manager),
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for name in ["Engineer", "Designer"] {
            store
                .create(
                    name,
                    CreateAgentOptions {
                        reports_to: Some("cto".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        store
            .create(
                "QA",
                CreateAgentOptions {
                    reports_to: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let direct: Vec<String> = store
            .list_direct_reportees("goat")
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(direct, vec!["cto", "qa"]);

        let all: Vec<String> = store
            .list_all_reportees("goat")
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(all, vec!["cto", "qa", "designer", "engineer"]);

        let info = store.get_info("goat").unwrap();
        assert_eq!(info.total_reportees, 4);
        assert_eq!(info.direct_reportees, vec!["cto", "qa"]);

        assert!(store.is_recursive_reportee("goat", "engineer"));
        assert!(!store.is_recursive_reportee("cto", "qa"));

        assert!(matches!(
            store.list_all_reportees("nobody").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn update_patch_round_trips() {
        let (store, _runtime, _dir) = fixture();
        seed_root(&store).await;
        store.create("Engineer", CreateAgentOptions::default()).await.unwrap();
        let updated = store
            .update(
                "engineer",
                AgentPatch {
                    role: Some("  Backend Developer  ".to_string()),
                    tags: Some(vec![" rust ".to_string(), String::new()]),
                    priority: Some(4),
                    skills: Some(vec!["research".to_string(), "research".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.role.as_deref(), Some("Backend Developer"));
        assert_eq!(updated.tags, vec!["rust"]);
        assert_eq!(updated.priority, 4);
        assert_eq!(updated.runtime.skills.assigned, vec!["research"]);
    }
}
