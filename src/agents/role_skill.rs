use crate::errors::Result;
use crate::providers::{RuntimeProfile, ALL_ROLE_SKILL_IDS};
use crate::util;
use std::fs;
use std::path::{Path, PathBuf};

use super::AgentType;

/// The role skill is the markdown operating manual the provider runtime
/// picks up for an agent. Exactly one exists per agent; which one is a pure
/// function of (provider profile, agent type).
pub struct RoleSkillChange {
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

pub fn sync_role_skill(
    workspace: &Path,
    profile: &RuntimeProfile,
    agent_id: &str,
    agent_type: AgentType,
) -> Result<RoleSkillChange> {
    let skill_root = workspace.join(profile.skill_dir);
    let chosen = match agent_type {
        AgentType::Manager => profile.role_skill_ids.manager,
        AgentType::Individual => profile.role_skill_ids.individual,
    };

    let mut change = RoleSkillChange {
        written: Vec::new(),
        removed: Vec::new(),
    };

    let skill_path = skill_root.join(chosen).join("SKILL.md");
    util::write_string_atomic(&skill_path, &render_role_skill(chosen, agent_id, agent_type))?;
    change.written.push(skill_path);

    for id in ALL_ROLE_SKILL_IDS {
        if *id == chosen {
            continue;
        }
        let dir = skill_root.join(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            change.removed.push(dir);
        }
    }

    Ok(change)
}

/// Remove every role-skill directory under a profile's skill root. Used when
/// an agent moves to a different provider.
pub fn remove_role_skills(workspace: &Path, profile: &RuntimeProfile) -> Result<Vec<PathBuf>> {
    let skill_root = workspace.join(profile.skill_dir);
    let mut removed = Vec::new();
    for id in ALL_ROLE_SKILL_IDS {
        let dir = skill_root.join(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            removed.push(dir);
        }
    }
    Ok(removed)
}

fn render_role_skill(skill_id: &str, agent_id: &str, agent_type: AgentType) -> String {
    match agent_type {
        AgentType::Manager => format!(
            "---\nname: {skill_id}\ndescription: Operating manual for the manager agent {agent_id}.\n---\n\n\
# Managing your team\n\n\
You are `{agent_id}`, a manager. Your reportees are listed under the\n\
`reportees/` directory of your workspace; shared organization state is\n\
under `organization/`.\n\n\
- Break incoming work into tasks and assign each to the reportee whose\n\
  role fits best. You may only assign tasks to yourself or to agents in\n\
  your reporting line.\n\
- When a reportee reports a blocker, either resolve it or escalate it to\n\
  your own manager with the task id and the blocker text.\n\
- Review `done` tasks before closing them out, and record decisions in\n\
  the organization wiki.\n"
        ),
        AgentType::Individual => format!(
            "---\nname: {skill_id}\ndescription: Operating manual for the agent {agent_id}.\n---\n\n\
# Working your task queue\n\n\
You are `{agent_id}`, an individual contributor.\n\n\
- Pick up tasks assigned to you oldest-first. Move a task to `doing`\n\
  before starting and keep its worklog current.\n\
- If you cannot make progress, set the task to `blocked` and record the\n\
  blocker so your manager can act on it.\n\
- Mark a task `done` only when the work is verifiably complete; link\n\
  artifacts from the task record.\n"
        ),
    }
}
