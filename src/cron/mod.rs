pub mod messages;

use crate::agents::{AgentConfig, AgentStore};
use crate::errors::Result;
use crate::sessions::dispatcher::{Dispatcher, RunOptions};
use crate::sessions::SessionStore;
use crate::settings::{NotificationTarget, Settings, SettingsStore};
use crate::tasks::{Task, TaskFilter, TaskStatus, TaskStore};
use crate::util::Clock;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Default tick interval for the background scheduler.
pub const TICK_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    Todo,
    Doing,
    Pending,
    Blocked,
    Inactive,
    Topdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedDispatch {
    pub kind: DispatchKind,
    pub target_agent_id: String,
    /// Session slug under the target agent. Task automation reuses `main`;
    /// notifications get a stable per-manager session. Never per-task.
    pub session_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_agent_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    #[serde(flatten)]
    pub dispatch: PlannedDispatch,
    pub session_ref: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub ran_at: String,
    pub scanned_tasks: usize,
    pub todo_tasks: usize,
    pub doing_tasks: usize,
    pub blocked_tasks: usize,
    pub inactive_agents: usize,
    pub sent: usize,
    pub failed: usize,
    pub dispatches: Vec<DispatchResult>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    pub max_parallel_flows: Option<usize>,
    pub in_progress_minutes: Option<u64>,
    pub inactive_minutes: Option<u64>,
}

/// Delivery seam: the cron plans dispatches, something else sends them.
/// Production wires this to the Dispatcher; tests observe concurrency here.
#[async_trait]
pub trait DispatchPort: Send + Sync {
    async fn dispatch(&self, target_agent_id: &str, session_slug: &str, message: &str)
        -> Result<()>;
}

/// Real delivery path: load the target agent and run it on the stable
/// session with the planned message.
pub struct AgentDispatch {
    agents: Arc<AgentStore>,
    dispatcher: Arc<Dispatcher>,
}

impl AgentDispatch {
    pub fn new(agents: Arc<AgentStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { agents, dispatcher }
    }
}

#[async_trait]
impl DispatchPort for AgentDispatch {
    async fn dispatch(
        &self,
        target_agent_id: &str,
        session_slug: &str,
        message: &str,
    ) -> Result<()> {
        let agent = self.agents.load(target_agent_id)?;
        self.dispatcher
            .run_agent(
                &agent,
                RunOptions {
                    message: message.to_string(),
                    session_ref: Some(format!("agent:{session_slug}")),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Everything one classification pass looks at, snapshotted up front.
/// Mutations made by dispatches become visible to the next cycle only.
pub struct CycleInputs {
    pub now_ms: u64,
    pub tasks: Vec<Task>,
    pub agents: Vec<AgentConfig>,
    pub default_agent: Option<String>,
    pub last_activity_ms: HashMap<String, u64>,
    pub settings: Settings,
    pub reminded: HashMap<String, u64>,
}

/// Classify tasks and agents into an ordered dispatch batch. Pure: no IO.
pub fn plan_cycle(inputs: &CycleInputs) -> Vec<PlannedDispatch> {
    let mut out = Vec::new();
    let strategies = &inputs.settings.task_delegation_strategies;
    let in_progress_ms = inputs.settings.max_in_progress_minutes * 60_000;
    let inactive_ms = strategies.bottom_up.max_inactivity_minutes * 60_000;

    let mut tasks = inputs.tasks.clone();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let agent_index: HashMap<&str, &AgentConfig> =
        inputs.agents.iter().map(|a| (a.id.as_str(), a)).collect();

    // todo: every open todo, oldest first, one dispatch per task.
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Todo) {
        out.push(PlannedDispatch {
            kind: DispatchKind::Todo,
            target_agent_id: task.assigned_to.clone(),
            session_slug: "main".to_string(),
            task_id: Some(task.task_id.clone()),
            subject_agent_id: None,
            message: messages::todo_nudge(task),
        });
    }

    // doing: stale in-progress work, unless already reminded since the last
    // task update.
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Doing) {
        let updated_ms = iso_to_ms(&task.updated_at);
        if inputs.now_ms.saturating_sub(updated_ms) < in_progress_ms {
            continue;
        }
        if already_reminded(&inputs.reminded, &task.task_id, updated_ms) {
            continue;
        }
        out.push(PlannedDispatch {
            kind: DispatchKind::Doing,
            target_agent_id: task.assigned_to.clone(),
            session_slug: "main".to_string(),
            task_id: Some(task.task_id.clone()),
            subject_agent_id: None,
            message: messages::doing_reminder(task, inputs.settings.max_in_progress_minutes),
        });
    }

    // pending: parked work past the inactivity window.
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
        let updated_ms = iso_to_ms(&task.updated_at);
        if inputs.now_ms.saturating_sub(updated_ms) < inactive_ms {
            continue;
        }
        if already_reminded(&inputs.reminded, &task.task_id, updated_ms) {
            continue;
        }
        out.push(PlannedDispatch {
            kind: DispatchKind::Pending,
            target_agent_id: task.assigned_to.clone(),
            session_slug: "main".to_string(),
            task_id: Some(task.task_id.clone()),
            subject_agent_id: None,
            message: messages::pending_reminder(task),
        });
    }

    // blocked: escalate to the assignee's manager.
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Blocked) {
        let manager = agent_index
            .get(task.assigned_to.as_str())
            .and_then(|a| a.reports_to.clone());
        let Some(manager) = manager else {
            debug!(
                "blocked task {} has no manager to escalate to (assignee {})",
                task.task_id, task.assigned_to
            );
            continue;
        };
        out.push(PlannedDispatch {
            kind: DispatchKind::Blocked,
            target_agent_id: manager,
            session_slug: "main".to_string(),
            task_id: Some(task.task_id.clone()),
            subject_agent_id: Some(task.assigned_to.clone()),
            message: messages::blocked_escalation(task),
        });
    }

    // inactive: batched per manager, one notification listing all of that
    // manager's idle reportees.
    if strategies.bottom_up.enabled {
        let mut per_manager: HashMap<String, Vec<(String, u64)>> = HashMap::new();
        for agent in &inputs.agents {
            if Some(&agent.id) == inputs.default_agent.as_ref() {
                continue;
            }
            let Some(manager) = agent.reports_to.clone() else {
                continue;
            };
            let last = inputs
                .last_activity_ms
                .get(&agent.id)
                .copied()
                .unwrap_or(0);
            let idle = inputs.now_ms.saturating_sub(last);
            if idle < inactive_ms {
                continue;
            }
            let target = match strategies.bottom_up.inactive_agent_notification_target {
                NotificationTarget::AllManagers => manager,
                NotificationTarget::RootOnly => match inputs.default_agent.clone() {
                    Some(root) => root,
                    None => continue,
                },
            };
            per_manager
                .entry(target)
                .or_default()
                .push((agent.id.clone(), idle / 60_000));
        }
        let mut targets: Vec<String> = per_manager.keys().cloned().collect();
        targets.sort();
        for target in targets {
            let mut idle_agents = per_manager.remove(&target).unwrap_or_default();
            idle_agents.sort();
            out.push(PlannedDispatch {
                kind: DispatchKind::Inactive,
                target_agent_id: target.clone(),
                session_slug: format!("agent_{target}_notifications"),
                task_id: None,
                subject_agent_id: None,
                message: messages::inactive_notification(
                    &idle_agents,
                    strategies.bottom_up.max_inactivity_minutes,
                ),
            });
        }
    }

    // topdown: when the root's open queue runs dry, ask for new delegation.
    if strategies.top_down.enabled {
        if let Some(root) = &inputs.default_agent {
            let open = tasks
                .iter()
                .filter(|t| t.assigned_to == *root && t.status.is_open())
                .count();
            if open < strategies.top_down.open_tasks_threshold {
                out.push(PlannedDispatch {
                    kind: DispatchKind::Topdown,
                    target_agent_id: root.clone(),
                    session_slug: "main".to_string(),
                    task_id: None,
                    subject_agent_id: None,
                    message: messages::topdown_guidance(
                        open,
                        strategies.top_down.open_tasks_threshold,
                    ),
                });
            }
        }
    }

    out
}

/// Agents past the inactivity window, root excluded. Counted even when the
/// bottom-up strategy is off so the cycle report stays informative.
fn count_inactive_agents(inputs: &CycleInputs) -> usize {
    let inactive_ms = inputs
        .settings
        .task_delegation_strategies
        .bottom_up
        .max_inactivity_minutes
        * 60_000;
    inputs
        .agents
        .iter()
        .filter(|a| Some(&a.id) != inputs.default_agent.as_ref())
        .filter(|a| {
            let last = inputs.last_activity_ms.get(&a.id).copied().unwrap_or(0);
            inputs.now_ms.saturating_sub(last) >= inactive_ms
        })
        .count()
}

fn already_reminded(reminded: &HashMap<String, u64>, task_id: &str, updated_ms: u64) -> bool {
    reminded
        .get(task_id)
        .is_some_and(|reminded_at| *reminded_at >= updated_ms)
}

fn iso_to_ms(iso: &str) -> u64 {
    chrono::DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_millis().max(0) as u64)
        .unwrap_or(0)
}

/// Periodic scheduler: snapshots tasks and agents, plans a dispatch batch,
/// and delivers it under a global cap with per-agent serialization.
pub struct TaskCron {
    home: PathBuf,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentStore>,
    sessions: Arc<SessionStore>,
    port: Arc<dyn DispatchPort>,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    /// taskId -> epoch ms of the last successful doing/pending reminder.
    reminded: Mutex<HashMap<String, u64>>,
}

impl TaskCron {
    pub fn new(
        home: PathBuf,
        tasks: Arc<TaskStore>,
        agents: Arc<AgentStore>,
        sessions: Arc<SessionStore>,
        port: Arc<dyn DispatchPort>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            home,
            tasks,
            agents,
            sessions,
            port,
            settings,
            clock,
            reminded: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the background ticker should run a cycle right now. Explicit
    /// `runTaskCronCycle` calls bypass this.
    pub fn should_tick(&self) -> bool {
        let settings = self.settings.load();
        if !settings.task_cron_enabled {
            return false;
        }
        // First-run onboarding still pending: the root workspace keeps its
        // bootstrap sentinel until the first completed run.
        if let Some(root) = self.agents.default_agent_id() {
            let sentinel = crate::paths::workspaces_dir(&self.home)
                .join(&root)
                .join("BOOTSTRAP.md");
            if sentinel.exists() {
                return false;
            }
        }
        true
    }

    pub async fn run_cycle(&self, opts: CycleOptions) -> CycleReport {
        let mut settings = self.settings.load();
        if let Some(v) = opts.max_parallel_flows {
            settings.max_parallel_flows = v;
        }
        if let Some(v) = opts.in_progress_minutes {
            settings.max_in_progress_minutes = v;
        }
        if let Some(v) = opts.inactive_minutes {
            settings
                .task_delegation_strategies
                .bottom_up
                .max_inactivity_minutes = v;
        }

        let now_ms = self.clock.now_ms();
        let tasks = self.tasks.list(TaskFilter::default());
        let agents = self.agents.list().unwrap_or_else(|e| {
            warn!("task-cron: failed to list agents: {e}");
            Vec::new()
        });
        let last_activity_ms = self.snapshot_activity(&agents, now_ms);

        let inputs = CycleInputs {
            now_ms,
            tasks: tasks.clone(),
            agents,
            default_agent: self.agents.default_agent_id(),
            last_activity_ms,
            settings: settings.clone(),
            reminded: self.reminded.lock().await.clone(),
        };
        let planned = plan_cycle(&inputs);
        let inactive_agents = count_inactive_agents(&inputs);

        info!(
            "task-cron: {} tasks scanned, {} dispatches planned",
            tasks.len(),
            planned.len()
        );

        let results = self
            .execute(planned, settings.max_parallel_flows.max(1))
            .await;

        let mut reminded = self.reminded.lock().await;
        let mut sent = 0;
        let mut failed = 0;
        for result in &results {
            if result.ok {
                sent += 1;
                if matches!(result.dispatch.kind, DispatchKind::Doing | DispatchKind::Pending) {
                    if let Some(task_id) = &result.dispatch.task_id {
                        reminded.insert(task_id.clone(), now_ms);
                    }
                }
            } else {
                // Marker untouched: the next tick retries this reminder.
                failed += 1;
            }
        }
        drop(reminded);

        CycleReport {
            ran_at: self.clock.now_iso(),
            scanned_tasks: tasks.len(),
            todo_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Todo).count(),
            doing_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Doing).count(),
            blocked_tasks: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Blocked)
                .count(),
            inactive_agents,
            sent,
            failed,
            dispatches: results,
        }
    }

    /// Deliver the batch. Two-level gate: a global semaphore caps total
    /// in-flight dispatches, and each target agent's queue drains strictly
    /// in order, one at a time.
    async fn execute(
        &self,
        planned: Vec<PlannedDispatch>,
        max_parallel: usize,
    ) -> Vec<DispatchResult> {
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut per_target: Vec<(String, Vec<(usize, PlannedDispatch)>)> = Vec::new();
        for (idx, dispatch) in planned.into_iter().enumerate() {
            match per_target
                .iter_mut()
                .find(|(target, _)| *target == dispatch.target_agent_id)
            {
                Some((_, queue)) => queue.push((idx, dispatch)),
                None => per_target.push((dispatch.target_agent_id.clone(), vec![(idx, dispatch)])),
            }
        }

        let mut handles = Vec::new();
        for (_target, queue) in per_target {
            let port = self.port.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                for (idx, dispatch) in queue {
                    // The semaphore is never closed; acquire cannot fail.
                    let permit = semaphore.clone().acquire_owned().await.ok();
                    let outcome = port
                        .dispatch(
                            &dispatch.target_agent_id,
                            &dispatch.session_slug,
                            &dispatch.message,
                        )
                        .await;
                    drop(permit);
                    let session_ref =
                        format!("agent:{}:{}", dispatch.target_agent_id, dispatch.session_slug);
                    results.push((
                        idx,
                        match outcome {
                            Ok(()) => DispatchResult {
                                dispatch,
                                session_ref,
                                ok: true,
                                error: None,
                            },
                            Err(e) => DispatchResult {
                                dispatch,
                                session_ref,
                                ok: false,
                                error: Some(e.to_string()),
                            },
                        },
                    ));
                }
                results
            }));
        }

        let mut indexed = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(results) => indexed.extend(results),
                Err(e) => warn!("task-cron: dispatch worker panicked: {e}"),
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    /// Most recent session activity per agent; agents with no sessions fall
    /// back to their config-file mtime so fresh installs are not flagged.
    fn snapshot_activity(&self, agents: &[AgentConfig], now_ms: u64) -> HashMap<String, u64> {
        let mut out = HashMap::new();
        let sessions = self.sessions.list(None).unwrap_or_default();
        for meta in sessions {
            let entry = out.entry(meta.agent_id.clone()).or_insert(0u64);
            *entry = (*entry).max(meta.updated_at);
        }
        for agent in agents {
            out.entry(agent.id.clone()).or_insert_with(|| {
                let config = crate::paths::agents_dir(&self.home)
                    .join(&agent.id)
                    .join("config.json");
                config
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(now_ms)
            });
        }
        out
    }
}
