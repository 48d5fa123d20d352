use crate::agents::{AgentPatch, AgentStore};
use crate::errors::{Error, Result};
use crate::util;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillScope {
    Global,
    Agent,
}

#[derive(Debug, Clone, Default)]
pub struct InstallSkillRequest {
    pub scope: SkillScope,
    pub agent_id: Option<String>,
    pub skill_name: String,
    pub source_path: Option<PathBuf>,
    pub source_url: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
    pub assign_to_all_agents: bool,
}

impl Default for SkillScope {
    fn default() -> Self {
        SkillScope::Global
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub scope: SkillScope,
    pub path: PathBuf,
}

/// Installs, removes, and lists skills. A skill is a directory holding a
/// `SKILL.md` with YAML frontmatter (`name`, `description`) and a markdown
/// body, either global (`<home>/skills/`) or inside an agent workspace.
pub struct SkillService {
    home: PathBuf,
    agents: Arc<AgentStore>,
    http: reqwest::Client,
}

impl SkillService {
    pub fn new(home: PathBuf, agents: Arc<AgentStore>) -> Self {
        Self {
            home,
            agents,
            http: reqwest::Client::new(),
        }
    }

    pub async fn install(&self, req: InstallSkillRequest) -> Result<SkillRecord> {
        let id = util::slugify(&req.skill_name);
        if id.is_empty() {
            return Err(Error::validation(format!(
                "skill name '{}' yields an empty id",
                req.skill_name
            )));
        }
        let sources = [
            req.source_path.is_some(),
            req.source_url.is_some(),
            req.content.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if sources != 1 {
            return Err(Error::validation(
                "exactly one of sourcePath, sourceUrl, or content is required",
            ));
        }

        let raw = if let Some(path) = &req.source_path {
            let path = if path.is_dir() { path.join("SKILL.md") } else { path.clone() };
            fs::read_to_string(&path)
                .map_err(|e| Error::validation(format!("cannot read {}: {e}", path.display())))?
        } else if let Some(url) = &req.source_url {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| Error::transient(format!("fetching {url}: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::transient(format!(
                    "fetching {url}: HTTP {}",
                    response.status()
                )));
            }
            response
                .text()
                .await
                .map_err(|e| Error::transient(format!("reading {url}: {e}")))?
        } else {
            req.content.clone().unwrap_or_default()
        };

        let content = ensure_frontmatter(&raw, &req.skill_name, req.description.as_deref());

        let target = match req.scope {
            SkillScope::Global => crate::paths::global_skills_dir(&self.home).join(&id),
            SkillScope::Agent => {
                let agent_id = req.agent_id.as_deref().ok_or_else(|| {
                    Error::validation("agentId is required for agent-scoped skills")
                })?;
                let agent = self.agents.load(agent_id)?;
                let provider = self.agents.providers().get(&agent.provider_id)?;
                self.agents
                    .workspace(agent_id)
                    .join(provider.profile().skill_dir)
                    .join(&id)
            }
        };
        util::write_string_atomic(&target.join("SKILL.md"), &content)?;

        match req.scope {
            SkillScope::Agent => {
                let agent_id = req.agent_id.as_deref().unwrap_or_default();
                self.assign(agent_id, &id)?;
            }
            SkillScope::Global if req.assign_to_all_agents => {
                for agent in self.agents.list()? {
                    let provider = self.agents.providers().get(&agent.provider_id)?;
                    let dest = self
                        .agents
                        .workspace(&agent.id)
                        .join(provider.profile().skill_dir)
                        .join(&id)
                        .join("SKILL.md");
                    util::write_string_atomic(&dest, &content)?;
                    self.assign(&agent.id, &id)?;
                }
            }
            SkillScope::Global => {}
        }

        let (name, description) = parse_frontmatter(&content)
            .unwrap_or((req.skill_name.clone(), req.description.clone().unwrap_or_default()));
        Ok(SkillRecord {
            id,
            name,
            description,
            scope: req.scope,
            path: target,
        })
    }

    fn assign(&self, agent_id: &str, skill_id: &str) -> Result<()> {
        let agent = self.agents.load(agent_id)?;
        let mut assigned = agent.runtime.skills.assigned.clone();
        if !assigned.iter().any(|s| s == skill_id) {
            assigned.push(skill_id.to_string());
            self.agents.update(
                agent_id,
                AgentPatch {
                    skills: Some(assigned),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    pub fn remove(&self, scope: SkillScope, agent_id: Option<&str>, skill_id: &str) -> Result<()> {
        match scope {
            SkillScope::Global => {
                let dir = crate::paths::global_skills_dir(&self.home).join(skill_id);
                if !dir.exists() {
                    return Err(Error::not_found("skill", skill_id));
                }
                fs::remove_dir_all(dir)?;
                // Unassign everywhere; workspace copies go with it.
                for agent in self.agents.list()? {
                    let _ = self.unassign(&agent.id, skill_id);
                }
                Ok(())
            }
            SkillScope::Agent => {
                let agent_id = agent_id.ok_or_else(|| {
                    Error::validation("agentId is required for agent-scoped skills")
                })?;
                self.unassign(agent_id, skill_id)
            }
        }
    }

    fn unassign(&self, agent_id: &str, skill_id: &str) -> Result<()> {
        let agent = self.agents.load(agent_id)?;
        let provider = self.agents.providers().get(&agent.provider_id)?;
        let dir = self
            .agents
            .workspace(agent_id)
            .join(provider.profile().skill_dir)
            .join(skill_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        let assigned: Vec<String> = agent
            .runtime
            .skills
            .assigned
            .iter()
            .filter(|s| s.as_str() != skill_id)
            .cloned()
            .collect();
        if assigned.len() != agent.runtime.skills.assigned.len() {
            self.agents.update(
                agent_id,
                AgentPatch {
                    skills: Some(assigned),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Skills materialized in an agent's workspace, role skills included.
    pub fn list_for_agent(&self, agent_id: &str) -> Result<Vec<SkillRecord>> {
        let agent = self.agents.load(agent_id)?;
        let provider = self.agents.providers().get(&agent.provider_id)?;
        let root = self
            .agents
            .workspace(agent_id)
            .join(provider.profile().skill_dir);
        Ok(scan_skill_dir(&root, SkillScope::Agent))
    }

    pub fn list_global(&self) -> Vec<SkillRecord> {
        scan_skill_dir(
            &crate::paths::global_skills_dir(&self.home),
            SkillScope::Global,
        )
    }
}

fn scan_skill_dir(root: &Path, scope: SkillScope) -> Vec<SkillRecord> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let skill_md = dir.join("SKILL.md");
        if !skill_md.is_file() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        let content = match fs::read_to_string(&skill_md) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping unreadable skill at {}: {e}", skill_md.display());
                continue;
            }
        };
        let (name, description) =
            parse_frontmatter(&content).unwrap_or_else(|| (id.clone(), String::new()));
        out.push(SkillRecord {
            id,
            name,
            description,
            scope,
            path: dir,
        });
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Pull `name:` and `description:` out of a SKILL.md frontmatter block.
fn parse_frontmatter(content: &str) -> Option<(String, String)> {
    if !content.starts_with("---") {
        return None;
    }
    let parts: Vec<&str> = content.splitn(3, "---").collect();
    if parts.len() < 3 {
        return None;
    }
    let mut name = None;
    let mut description = None;
    for line in parts[1].lines() {
        if let Some(value) = line.strip_prefix("name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("description:") {
            description = Some(value.trim().to_string());
        }
    }
    Some((name?, description.unwrap_or_default()))
}

fn ensure_frontmatter(raw: &str, skill_name: &str, description: Option<&str>) -> String {
    if raw.trim_start().starts_with("---") {
        return raw.to_string();
    }
    format!(
        "---\nname: {skill_name}\ndescription: {}\n---\n\n{}",
        description.unwrap_or(""),
        raw.trim_start()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::CreateAgentOptions;

    async fn fixture() -> (SkillService, Arc<AgentStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _runtime) = crate::agents::testing::store_at(dir.path());
        let agents = Arc::new(store);
        agents
            .create("Engineer", CreateAgentOptions::default())
            .await
            .unwrap();
        let service = SkillService::new(dir.path().to_path_buf(), agents.clone());
        (service, agents, dir)
    }

    #[test]
    fn exactly_one_source_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _runtime) = crate::agents::testing::store_at(dir.path());
        let service = SkillService::new(dir.path().to_path_buf(), Arc::new(store));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(service.install(InstallSkillRequest {
                skill_name: "Research".into(),
                ..Default::default()
            }))
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));

        let err = rt
            .block_on(service.install(InstallSkillRequest {
                skill_name: "Research".into(),
                content: Some("body".into()),
                source_url: Some("https://example.com/skill.md".into()),
                ..Default::default()
            }))
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[tokio::test]
    async fn global_install_from_content_adds_frontmatter() {
        let (service, _agents, dir) = fixture().await;
        let record = service
            .install(InstallSkillRequest {
                skill_name: "Deep Research".into(),
                content: Some("Use many sources.".into()),
                description: Some("Research playbook".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.id, "deep-research");
        let written =
            std::fs::read_to_string(dir.path().join("skills/deep-research/SKILL.md")).unwrap();
        assert!(written.starts_with("---\nname: Deep Research"));
        assert!(written.contains("Use many sources."));

        let listed = service.list_global();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Deep Research");
        assert_eq!(listed[0].description, "Research playbook");
    }

    #[tokio::test]
    async fn agent_install_lands_in_workspace_and_assignment() {
        let (service, agents, dir) = fixture().await;
        service
            .install(InstallSkillRequest {
                scope: SkillScope::Agent,
                agent_id: Some("engineer".into()),
                skill_name: "Research".into(),
                content: Some("---\nname: research\ndescription: find things\n---\n\nGo.".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("workspaces/engineer/skills/research/SKILL.md")
            .exists());
        assert_eq!(
            agents.load("engineer").unwrap().runtime.skills.assigned,
            vec!["research"]
        );

        // Listing sees both the role skill and the installed one.
        let listed = service.list_for_agent("engineer").unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"research"));
        assert!(ids.contains(&"og-board-individual"));
    }

    #[tokio::test]
    async fn install_from_source_path_directory() {
        let (service, _agents, dir) = fixture().await;
        let src = dir.path().join("incoming/research");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            src.join("SKILL.md"),
            "---\nname: research\ndescription: from disk\n---\n\nbody",
        )
        .unwrap();

        let record = service
            .install(InstallSkillRequest {
                skill_name: "research".into(),
                source_path: Some(src),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.description, "from disk");
    }

    #[tokio::test]
    async fn assign_to_all_agents_materializes_everywhere() {
        let (service, agents, dir) = fixture().await;
        agents
            .create("Designer", CreateAgentOptions::default())
            .await
            .unwrap();

        service
            .install(InstallSkillRequest {
                skill_name: "Writing".into(),
                content: Some("Write well.".into()),
                assign_to_all_agents: true,
                ..Default::default()
            })
            .await
            .unwrap();

        for id in ["engineer", "designer"] {
            assert!(dir
                .path()
                .join(format!("workspaces/{id}/skills/writing/SKILL.md"))
                .exists());
            assert!(agents
                .load(id)
                .unwrap()
                .runtime
                .skills
                .assigned
                .contains(&"writing".to_string()));
        }
    }

    #[tokio::test]
    async fn remove_unassigns_and_deletes() {
        let (service, agents, dir) = fixture().await;
        service
            .install(InstallSkillRequest {
                skill_name: "Writing".into(),
                content: Some("Write well.".into()),
                assign_to_all_agents: true,
                ..Default::default()
            })
            .await
            .unwrap();

        service.remove(SkillScope::Global, None, "writing").unwrap();
        assert!(!dir.path().join("skills/writing").exists());
        assert!(!dir.path().join("workspaces/engineer/skills/writing").exists());
        assert!(agents
            .load("engineer")
            .unwrap()
            .runtime
            .skills
            .assigned
            .is_empty());

        assert!(matches!(
            service.remove(SkillScope::Global, None, "ghost").unwrap_err(),
            Error::NotFound { .. }
        ));
    }
}
