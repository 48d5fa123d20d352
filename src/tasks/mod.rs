use crate::agents::OrgQuery;
use crate::errors::{Error, Result};
use crate::util::{self, Clock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Pending,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Todo | TaskStatus::Doing | TaskStatus::Pending)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Timestamped, attributed entry shared by blockers, artifacts, and worklog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub created_at: String,
    pub created_by: String,
    pub content: String,
}

/// Persisted shape of `<home>/tasks/<taskId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub owner: String,
    pub assigned_to: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub blockers: Vec<TaskEntry>,
    #[serde(default)]
    pub artifacts: Vec<TaskEntry>,
    #[serde(default)]
    pub worklog: Vec<TaskEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub assigned_to: Option<String>,
    pub status: Option<TaskStatus>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub assignee: Option<String>,
    pub limit: Option<usize>,
}

/// In-memory arena plus secondary indexes, rebuilt from disk at startup.
/// Slots of deleted tasks become `None`; indexes hold live slots only.
#[derive(Default)]
struct Arena {
    tasks: Vec<Option<Task>>,
    by_id: HashMap<String, usize>,
    by_assignee: HashMap<String, Vec<usize>>,
    by_status: HashMap<TaskStatus, Vec<usize>>,
}

impl Arena {
    fn insert(&mut self, task: Task) {
        let slot = self.tasks.len();
        self.by_id.insert(task.task_id.clone(), slot);
        self.by_assignee
            .entry(task.assigned_to.clone())
            .or_default()
            .push(slot);
        self.by_status.entry(task.status).or_default().push(slot);
        self.tasks.push(Some(task));
    }

    fn get(&self, id: &str) -> Option<&Task> {
        let slot = *self.by_id.get(id)?;
        self.tasks.get(slot)?.as_ref()
    }

    fn reindex(&mut self, slot: usize, old_status: TaskStatus, old_assignee: &str) {
        let task = match self.tasks.get(slot).and_then(|t| t.as_ref()) {
            Some(t) => t,
            None => return,
        };
        let (status, assignee) = (task.status, task.assigned_to.clone());
        if status != old_status {
            if let Some(slots) = self.by_status.get_mut(&old_status) {
                slots.retain(|s| *s != slot);
            }
            self.by_status.entry(status).or_default().push(slot);
        }
        if assignee != old_assignee {
            if let Some(slots) = self.by_assignee.get_mut(old_assignee) {
                slots.retain(|s| *s != slot);
            }
            self.by_assignee.entry(assignee).or_default().push(slot);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Task> {
        let slot = self.by_id.remove(id)?;
        let task = self.tasks.get_mut(slot)?.take()?;
        if let Some(slots) = self.by_status.get_mut(&task.status) {
            slots.retain(|s| *s != slot);
        }
        if let Some(slots) = self.by_assignee.get_mut(&task.assigned_to) {
            slots.retain(|s| *s != slot);
        }
        Some(task)
    }
}

/// Durable task store. Every mutation rewrites the task's own file through
/// a temp-then-rename, so a crash never leaves a half-written record.
pub struct TaskStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    arena: RwLock<Arena>,
}

impl TaskStore {
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            dir,
            clock,
            arena: RwLock::new(Arena::default()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Rebuild the arena and indexes from the on-disk records. Called at
    /// startup and after a hard reset.
    pub fn reload(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut arena = Arena::default();
        let mut records: Vec<Task> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match util::read_json::<Task>(&path) {
                Ok(task) => records.push(task),
                Err(e) => warn!("Skipping corrupt task record at {}: {e}", path.display()),
            }
        }
        // Oldest-first insertion keeps index order aligned with createdAt.
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for task in records {
            arena.insert(task);
        }
        *self.arena.write().unwrap() = arena;
        Ok(())
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn persist(&self, task: &Task) -> Result<()> {
        util::write_json_atomic(&self.task_path(&task.task_id), task).map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub fn create(&self, actor: &str, new: NewTask, org: &dyn OrgQuery) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(Error::validation("task title must not be empty"));
        }
        if !org.agent_exists(actor) {
            return Err(Error::not_found("agent", actor));
        }
        let assigned_to = new.assigned_to.unwrap_or_else(|| actor.to_string());
        if !org.agent_exists(&assigned_to) {
            return Err(Error::not_found("agent", assigned_to));
        }
        // Assignment authority: self, or someone in the actor's reporting line.
        if assigned_to != actor && !org.is_recursive_reportee(actor, &assigned_to) {
            return Err(Error::authority(format!(
                "'{actor}' cannot assign tasks to '{assigned_to}': not a reportee"
            )));
        }
        let status = new.status.unwrap_or(TaskStatus::Todo);
        if status == TaskStatus::Blocked {
            return Err(Error::validation(
                "a task cannot be created blocked: add a blocker after creation",
            ));
        }
        let now = self.clock.now_iso();
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            created_at: now.clone(),
            updated_at: now,
            owner: actor.to_string(),
            assigned_to,
            title: new.title.trim().to_string(),
            description: new.description,
            status,
            status_reason: None,
            blockers: Vec::new(),
            artifacts: Vec::new(),
            worklog: Vec::new(),
            project: new.project,
        };
        self.persist(&task)?;
        self.arena.write().unwrap().insert(task.clone());
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.arena
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id))
    }

    /// Oldest-first by `createdAt`, optionally filtered by assignee.
    pub fn list(&self, filter: TaskFilter) -> Vec<Task> {
        let arena = self.arena.read().unwrap();
        let mut out: Vec<Task> = match &filter.assignee {
            Some(assignee) => arena
                .by_assignee
                .get(assignee)
                .into_iter()
                .flatten()
                .filter_map(|slot| arena.tasks.get(*slot).and_then(|t| t.clone()))
                .collect(),
            None => arena.tasks.iter().flatten().cloned().collect(),
        };
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn update_status(
        &self,
        actor: &str,
        id: &str,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<Task> {
        let mut arena = self.arena.write().unwrap();
        let slot = *arena
            .by_id
            .get(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        let task = arena.tasks[slot]
            .as_ref()
            .ok_or_else(|| Error::not_found("task", id))?
            .clone();

        // Authority binds exactly two transitions: leaving todo (assignee
        // only; owner may close outright) and entering done/cancelled (owner
        // or assignee). Everything else carries no actor constraint.
        let old_status = task.status;
        if old_status == TaskStatus::Todo && status != TaskStatus::Todo {
            let closing = matches!(status, TaskStatus::Done | TaskStatus::Cancelled);
            let authorized = if closing {
                actor == task.assigned_to || actor == task.owner
            } else {
                actor == task.assigned_to
            };
            if !authorized {
                return Err(Error::authority(format!(
                    "only the assignee '{}' may move task {id} out of todo",
                    task.assigned_to
                )));
            }
        } else if matches!(status, TaskStatus::Done | TaskStatus::Cancelled)
            && actor != task.assigned_to
            && actor != task.owner
        {
            return Err(Error::authority(format!(
                "only the owner or assignee may mark task {id} {status}"
            )));
        }

        if old_status == TaskStatus::Doing
            && status == TaskStatus::Pending
            && reason.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            return Err(Error::validation(
                "moving a task from doing to pending requires a status reason",
            ));
        }

        let mut updated = task;
        if status == TaskStatus::Blocked {
            // A blocked task must carry at least one blocker; the reason
            // doubles as the first one.
            match &reason {
                Some(r) if !r.trim().is_empty() => updated.blockers.push(TaskEntry {
                    created_at: self.clock.now_iso(),
                    created_by: actor.to_string(),
                    content: r.trim().to_string(),
                }),
                _ if updated.blockers.is_empty() => {
                    return Err(Error::validation(
                        "a blocked task needs a blocker: pass a reason or add one first",
                    ));
                }
                _ => {}
            }
        }
        updated.status = status;
        updated.status_reason = reason.filter(|r| !r.trim().is_empty());
        updated.updated_at = self.clock.now_iso();

        self.persist(&updated)?;
        let old_assignee = updated.assigned_to.clone();
        arena.tasks[slot] = Some(updated.clone());
        arena.reindex(slot, old_status, &old_assignee);
        Ok(updated)
    }

    pub fn add_blocker(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.append(actor, id, content, |task, entry| task.blockers.push(entry))
    }

    pub fn add_artifact(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.append(actor, id, content, |task, entry| task.artifacts.push(entry))
    }

    pub fn add_worklog(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.append(actor, id, content, |task, entry| task.worklog.push(entry))
    }

    fn append(
        &self,
        actor: &str,
        id: &str,
        content: &str,
        apply: impl FnOnce(&mut Task, TaskEntry),
    ) -> Result<Task> {
        if content.trim().is_empty() {
            return Err(Error::validation("entry content must not be empty"));
        }
        let mut arena = self.arena.write().unwrap();
        let slot = *arena
            .by_id
            .get(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        let mut task = arena.tasks[slot]
            .as_ref()
            .ok_or_else(|| Error::not_found("task", id))?
            .clone();
        apply(
            &mut task,
            TaskEntry {
                created_at: self.clock.now_iso(),
                created_by: actor.to_string(),
                content: content.trim().to_string(),
            },
        );
        task.updated_at = self.clock.now_iso();
        self.persist(&task)?;
        arena.tasks[slot] = Some(task.clone());
        Ok(task)
    }

    /// Delete the tasks the actor is authorized to delete (owner or
    /// assignee); returns the ids actually removed.
    pub fn delete(&self, actor: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut arena = self.arena.write().unwrap();
        for id in ids {
            let authorized = arena
                .get(id)
                .map(|t| t.owner == actor || t.assigned_to == actor)
                .unwrap_or(false);
            if !authorized {
                continue;
            }
            if arena.remove(id).is_some() {
                let _ = fs::remove_file(self.task_path(id));
                removed.push(id.clone());
            }
        }
        Ok(removed)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.arena
            .read()
            .unwrap()
            .by_status
            .get(&status)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
