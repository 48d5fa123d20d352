use crate::agents::{
    AgentConfig, AgentInfo, AgentPatch, AgentStore, AgentType, CreateAgentOptions,
    CreateAgentReport, DeleteAgentReport, RuntimeHook,
};
use crate::cron::{AgentDispatch, CycleOptions, CycleReport, TaskCron, TICK_INTERVAL_SECS};
use crate::errors::{Error, Result};
use crate::locks::KeyedLocks;
use crate::openclaw::cli::{GatewayConfig, OpenClawCli, ProcessRunner};
use crate::openclaw::reconciler::{OpenClawReconciler, SyncOutcome};
use crate::providers::{ProviderDescriptor, ProviderRegistry, RunEvent};
use crate::sessions::dispatcher::{Dispatcher, RunOptions, RunOutcome};
use crate::sessions::{PrepareOptions, SessionMeta, SessionRunInfo, SessionStore, TranscriptLine};
use crate::settings::{GatewaySettings, Settings, SettingsStore};
use crate::skills::{InstallSkillRequest, SkillRecord, SkillScope, SkillService};
use crate::tasks::{NewTask, Task, TaskFilter, TaskStatus, TaskStore};
use crate::util::{Clock, SystemClock};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEFAULT_ROOT_AGENT_NAME: &str = "Goat";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeReport {
    pub default_agent: String,
    pub created_root: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAction {
    pub agent_id: String,
    pub session_key: String,
    pub title: String,
    pub updated_at: u64,
}

/// The single public surface of the control plane. External interfaces (the
/// HTTP layer, the CLI) consume this object and nothing below it.
pub struct OpenGoatService {
    home: PathBuf,
    settings: Arc<SettingsStore>,
    providers: Arc<ProviderRegistry>,
    agents: Arc<AgentStore>,
    tasks: Arc<TaskStore>,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Option<Arc<OpenClawReconciler>>,
    skills: SkillService,
    cron: Arc<TaskCron>,
    agent_locks: KeyedLocks,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl OpenGoatService {
    /// Production wiring: OpenClaw CLI + builtin providers.
    pub fn new(home: PathBuf) -> Result<Arc<Self>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let settings = Arc::new(SettingsStore::new(&home));
        let gateway = settings.load().openclaw_gateway.map(|g| GatewayConfig {
            url: g.url,
            token: g.token,
        });
        let cli = Arc::new(OpenClawCli::new(Arc::new(ProcessRunner), gateway));
        let providers = Arc::new(ProviderRegistry::builtin(cli.clone()));
        let reconciler = Arc::new(OpenClawReconciler::new(
            home.clone(),
            cli,
            providers.clone(),
        ));
        Self::assemble(home, clock, settings, providers, reconciler.clone(), Some(reconciler))
    }

    fn assemble(
        home: PathBuf,
        clock: Arc<dyn Clock>,
        settings: Arc<SettingsStore>,
        providers: Arc<ProviderRegistry>,
        runtime: Arc<dyn RuntimeHook>,
        reconciler: Option<Arc<OpenClawReconciler>>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&home)?;
        let agents = Arc::new(AgentStore::new(home.clone(), providers.clone(), runtime));
        let tasks = Arc::new(TaskStore::new(
            crate::paths::tasks_dir(&home),
            clock.clone(),
        )?);
        let sessions = Arc::new(SessionStore::new(home.clone(), clock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            home.clone(),
            providers.clone(),
            sessions.clone(),
            clock.clone(),
        ));
        let cron = Arc::new(TaskCron::new(
            home.clone(),
            tasks.clone(),
            agents.clone(),
            sessions.clone(),
            Arc::new(AgentDispatch::new(agents.clone(), dispatcher.clone())),
            settings.clone(),
            clock.clone(),
        ));
        let skills = SkillService::new(home.clone(), agents.clone());
        Ok(Arc::new(Self {
            home,
            settings,
            providers,
            agents,
            tasks,
            sessions,
            dispatcher,
            reconciler,
            skills,
            cron,
            agent_locks: KeyedLocks::new(),
            ticker: Mutex::new(None),
        }))
    }

    pub fn home(&self) -> &PathBuf {
        &self.home
    }

    // ------------------------------------------------------------------
    // Runtime lifecycle
    // ------------------------------------------------------------------

    /// First-run bootstrap: home layout, settings, and the root agent with
    /// its onboarding sentinel.
    pub async fn initialize(&self) -> Result<InitializeReport> {
        for dir in [
            crate::paths::agents_dir(&self.home),
            crate::paths::workspaces_dir(&self.home),
            crate::paths::sessions_dir(&self.home),
            crate::paths::tasks_dir(&self.home),
            crate::paths::global_skills_dir(&self.home),
            crate::paths::organization_dir(&self.home).join("wiki"),
            crate::paths::logs_dir(&self.home),
        ] {
            fs::create_dir_all(dir)?;
        }
        if !crate::paths::settings_path(&self.home).exists() {
            self.settings.save(&Settings::default())?;
        }

        let root_id = self
            .agents
            .default_agent_id()
            .unwrap_or_else(|| crate::util::slugify(DEFAULT_ROOT_AGENT_NAME));

        let created_root = if self.agents.exists(&root_id) {
            false
        } else {
            let _lock = self.agent_locks.acquire(&root_id).await;
            let display_name = if root_id == crate::util::slugify(DEFAULT_ROOT_AGENT_NAME) {
                DEFAULT_ROOT_AGENT_NAME.to_string()
            } else {
                root_id.clone()
            };
            let report = self
                .agents
                .create(
                    &display_name,
                    CreateAgentOptions {
                        agent_type: Some(AgentType::Manager),
                        skills: vec![crate::providers::MANAGER_ROLE_SKILL.to_string()],
                        ..Default::default()
                    },
                )
                .await?;
            // Onboarding sentinel: parks the task-cron until the first
            // completed root run.
            let sentinel = self.agents.workspace(&report.agent.id).join("BOOTSTRAP.md");
            if !sentinel.exists() {
                fs::write(&sentinel, bootstrap_md(&report.agent.id))?;
            }
            true
        };
        self.agents.set_default_agent(&root_id)?;
        info!("initialized OpenGoat home at {}", self.home.display());
        Ok(InitializeReport {
            default_agent: root_id,
            created_root,
        })
    }

    /// Start the background task-cron ticker. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return;
        }
        let service = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !service.cron.should_tick() {
                    continue;
                }
                let report = service.cron.run_cycle(CycleOptions::default()).await;
                if report.failed > 0 {
                    warn!(
                        "task-cron cycle: {} sent, {} failed",
                        report.sent, report.failed
                    );
                }
            }
        }));
    }

    /// Stop background loops. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn sync_runtime_defaults(&self) -> Result<SyncOutcome> {
        let Some(reconciler) = &self.reconciler else {
            return Err(Error::validation(
                "no OpenClaw reconciler configured in this process",
            ));
        };
        let agents = self.agents.list()?;
        let default_agent = self.agents.default_agent_id();
        Ok(reconciler
            .sync_runtime_defaults(&agents, default_agent.as_deref())
            .await)
    }

    pub async fn run_task_cron_cycle(&self, opts: CycleOptions) -> CycleReport {
        self.cron.run_cycle(opts).await
    }

    /// Wipe every piece of persisted state and re-bootstrap.
    pub async fn hard_reset(&self) -> Result<InitializeReport> {
        self.shutdown().await;
        for dir in [
            crate::paths::agents_dir(&self.home),
            crate::paths::workspaces_dir(&self.home),
            crate::paths::sessions_dir(&self.home),
            crate::paths::tasks_dir(&self.home),
            crate::paths::global_skills_dir(&self.home),
            crate::paths::organization_dir(&self.home),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        for file in [
            crate::paths::root_config_path(&self.home),
            crate::paths::settings_path(&self.home),
        ] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        self.tasks.reload()?;
        self.initialize().await
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub fn list_agents(&self) -> Result<Vec<AgentConfig>> {
        self.agents.list()
    }

    pub fn get_agent(&self, id: &str) -> Result<AgentConfig> {
        self.agents.load(id)
    }

    pub async fn create_agent(
        &self,
        name: &str,
        mut opts: CreateAgentOptions,
    ) -> Result<CreateAgentReport> {
        let id = crate::util::slugify(name);
        let _lock = self.agent_locks.acquire(&id).await;
        // New non-root agents report to the root unless told otherwise.
        if opts.reports_to.is_none() {
            let root = self.agents.default_agent_id();
            if root.as_deref() != Some(id.as_str()) {
                opts.reports_to = root;
            }
        }
        self.agents.create(name, opts).await
    }

    pub async fn delete_agent(&self, id: &str, force: bool) -> Result<DeleteAgentReport> {
        let _lock = self.agent_locks.acquire(id).await;
        self.agents.delete(id, force).await
    }

    pub async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<AgentConfig> {
        let _lock = self.agent_locks.acquire(id).await;
        self.agents.update(id, patch)
    }

    pub async fn set_manager(&self, id: &str, new_manager: &str) -> Result<()> {
        let _lock = self.agent_locks.acquire(id).await;
        self.agents.set_manager(id, new_manager)
    }

    pub async fn set_provider(&self, id: &str, provider_id: &str) -> Result<()> {
        let _lock = self.agent_locks.acquire(id).await;
        self.agents.set_provider(id, provider_id)
    }

    pub fn list_direct_reportees(&self, id: &str) -> Result<Vec<AgentConfig>> {
        self.agents.list_direct_reportees(id)
    }

    pub fn list_all_reportees(&self, id: &str) -> Result<Vec<AgentConfig>> {
        self.agents.list_all_reportees(id)
    }

    pub fn get_agent_info(&self, id: &str) -> Result<AgentInfo> {
        self.agents.get_info(id)
    }

    pub fn get_last_action(&self, agent_id: &str) -> Result<Option<LastAction>> {
        if !self.agents.exists(agent_id) {
            return Err(Error::not_found("agent", agent_id));
        }
        Ok(self.sessions.last_activity(agent_id)?.map(|meta| LastAction {
            agent_id: meta.agent_id.clone(),
            session_key: format!("agent:{}:{}", meta.agent_id, meta.slug),
            title: meta.title,
            updated_at: meta.updated_at,
        }))
    }

    // ------------------------------------------------------------------
    // Sessions & runs
    // ------------------------------------------------------------------

    pub fn list_sessions(&self, agent_id: Option<&str>) -> Result<Vec<SessionMeta>> {
        self.sessions.list(agent_id)
    }

    pub fn prepare_session(
        &self,
        agent_id: &str,
        opts: PrepareOptions,
    ) -> Result<SessionRunInfo> {
        let agent = self.agents.load(agent_id)?;
        let provider = self.providers.get(&agent.provider_id)?;
        let workspace = self.agents.workspace(agent_id);
        self.sessions
            .prepare(&agent, provider.profile(), &workspace, opts)
    }

    pub fn session_history(
        &self,
        agent_id: &str,
        session_ref: &str,
        limit: Option<usize>,
        include_compaction: bool,
    ) -> Result<Vec<TranscriptLine>> {
        let key = crate::sessions::SessionKey::parse(session_ref)?;
        self.sessions
            .history(agent_id, &key.slug, limit, include_compaction)
    }

    pub fn rename_session(&self, agent_id: &str, session_ref: &str, title: &str) -> Result<()> {
        let key = crate::sessions::SessionKey::parse(session_ref)?;
        self.sessions.rename(agent_id, &key.slug, title)
    }

    pub fn remove_session(&self, agent_id: &str, session_ref: &str) -> Result<()> {
        let key = crate::sessions::SessionKey::parse(session_ref)?;
        self.sessions.remove(agent_id, &key.slug)
    }

    pub async fn run_agent(&self, agent_id: &str, opts: RunOptions) -> Result<RunOutcome> {
        let agent = self.agents.load(agent_id)?;
        let outcome = self.dispatcher.run_agent(&agent, opts).await?;
        if outcome.code == 0 {
            self.clear_bootstrap_sentinel(agent_id);
        }
        Ok(outcome)
    }

    /// Streaming variant: events arrive on the returned channel while the
    /// run is in flight; the handle resolves to the final outcome.
    pub fn run_agent_stream(
        self: &Arc<Self>,
        agent_id: &str,
        mut opts: RunOptions,
    ) -> Result<(
        mpsc::UnboundedReceiver<RunEvent>,
        JoinHandle<Result<RunOutcome>>,
    )> {
        let agent = self.agents.load(agent_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        opts.events = Some(tx);
        let service = self.clone();
        let agent_id = agent_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = service.dispatcher.run_agent(&agent, opts).await?;
            if outcome.code == 0 {
                service.clear_bootstrap_sentinel(&agent_id);
            }
            Ok(outcome)
        });
        Ok((rx, handle))
    }

    /// The bootstrap sentinel lives only until the first completed root run.
    fn clear_bootstrap_sentinel(&self, agent_id: &str) {
        if self.agents.default_agent_id().as_deref() != Some(agent_id) {
            return;
        }
        let sentinel = self.agents.workspace(agent_id).join("BOOTSTRAP.md");
        if sentinel.exists() {
            if let Err(e) = fs::remove_file(&sentinel) {
                warn!("failed to clear bootstrap sentinel: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub fn list_tasks(&self, filter: TaskFilter) -> Vec<Task> {
        self.tasks.list(filter)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks.get(id)
    }

    pub fn create_task(&self, actor: &str, new: NewTask) -> Result<Task> {
        self.tasks.create(actor, new, self.agents.as_ref())
    }

    pub fn delete_tasks(&self, actor: &str, ids: &[String]) -> Result<Vec<String>> {
        self.tasks.delete(actor, ids)
    }

    pub fn update_task_status(
        &self,
        actor: &str,
        id: &str,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<Task> {
        self.tasks.update_status(actor, id, status, reason)
    }

    pub fn add_task_blocker(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.tasks.add_blocker(actor, id, content)
    }

    pub fn add_task_artifact(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.tasks.add_artifact(actor, id, content)
    }

    pub fn add_task_worklog(&self, actor: &str, id: &str, content: &str) -> Result<Task> {
        self.tasks.add_worklog(actor, id, content)
    }

    // ------------------------------------------------------------------
    // Skills
    // ------------------------------------------------------------------

    pub async fn install_skill(&self, req: InstallSkillRequest) -> Result<SkillRecord> {
        self.skills.install(req).await
    }

    pub fn remove_skill(
        &self,
        scope: SkillScope,
        agent_id: Option<&str>,
        skill_id: &str,
    ) -> Result<()> {
        self.skills.remove(scope, agent_id, skill_id)
    }

    pub fn list_skills(&self, agent_id: &str) -> Result<Vec<SkillRecord>> {
        self.skills.list_for_agent(agent_id)
    }

    pub fn list_global_skills(&self) -> Vec<SkillRecord> {
        self.skills.list_global()
    }

    // ------------------------------------------------------------------
    // Providers & settings
    // ------------------------------------------------------------------

    pub fn list_providers(&self) -> Vec<ProviderDescriptor> {
        self.providers.list()
    }

    pub fn get_openclaw_gateway_config(&self) -> Option<GatewaySettings> {
        self.settings.load().openclaw_gateway
    }

    /// Persisted immediately; the CLI handle picks it up on the next
    /// process start.
    pub fn set_openclaw_gateway_config(&self, gateway: Option<GatewaySettings>) -> Result<Settings> {
        let mut settings = self.settings.load();
        settings.openclaw_gateway = gateway;
        self.settings.save(&settings)?;
        Ok(settings)
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.load()
    }

    pub fn update_settings(&self, patch: serde_json::Value) -> Result<Settings> {
        self.settings.update(patch)
    }
}

fn bootstrap_md(agent_id: &str) -> String {
    format!(
        "# Welcome aboard\n\n\
You are `{agent_id}`, the root agent of this OpenGoat installation.\n\n\
This file marks onboarding as incomplete; it disappears after your first\n\
completed run. Until then the task scheduler stays parked.\n\n\
Start by reading `AGENTS.md`, then describe your organization's first\n\
goal so it can be broken into tasks.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::RecordingRuntime;
    use crate::providers::testing::FakeProvider;
    use crate::providers::Provider;

    struct Fixture {
        service: Arc<OpenGoatService>,
        runtime: Arc<RecordingRuntime>,
        provider: Arc<FakeProvider>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(crate::util::testing::ManualClock::at(1_000_000));
        let provider = Arc::new(FakeProvider::new("openclaw", true));
        let providers: Vec<Arc<dyn Provider>> = vec![
            provider.clone(),
            Arc::new(crate::providers::model_cli::ModelCliProvider::codex()),
            Arc::new(crate::providers::model_cli::ModelCliProvider::claude_code()),
        ];
        let registry = Arc::new(ProviderRegistry::new(providers));
        let runtime = RecordingRuntime::new();
        let settings = Arc::new(SettingsStore::new(dir.path()));
        let service = OpenGoatService::assemble(
            dir.path().to_path_buf(),
            clock,
            settings,
            registry,
            runtime.clone(),
            None,
        )
        .unwrap();
        Fixture {
            service,
            runtime,
            provider,
            _dir: dir,
        }
    }

    // Bootstrap: a fresh home yields exactly one manager root agent whose
    // assigned skills carry the manager role skill.
    #[tokio::test]
    async fn bootstrap_creates_the_root_agent() {
        let f = fixture().await;
        let report = f.service.initialize().await.unwrap();
        assert_eq!(report.default_agent, "goat");
        assert!(report.created_root);

        let agents = f.service.list_agents().unwrap();
        assert_eq!(agents.len(), 1);
        let root = &agents[0];
        assert_eq!(root.agent_type, AgentType::Manager);
        assert!(root.reports_to.is_none());
        assert!(root
            .runtime
            .skills
            .assigned
            .contains(&crate::providers::MANAGER_ROLE_SKILL.to_string()));
        assert!(f
            .service
            .home()
            .join("workspaces/goat/BOOTSTRAP.md")
            .exists());

        // Second initialize is a no-op.
        let report = f.service.initialize().await.unwrap();
        assert!(!report.created_root);
        assert_eq!(f.service.list_agents().unwrap().len(), 1);
    }

    // Create + delete: config, symlink, and runtime calls line up.
    #[tokio::test]
    async fn create_and_delete_agent_round_trip() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        let report = f
            .service
            .create_agent(
                "Research Analyst",
                CreateAgentOptions {
                    agent_type: Some(AgentType::Individual),
                    skills: vec!["research".to_string()],
                    role: Some("Developer".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.agent.reports_to.as_deref(), Some("goat"));
        assert_eq!(report.agent.runtime.skills.assigned, vec!["research"]);
        assert!(f
            .service
            .home()
            .join("workspaces/goat/reportees/research-analyst")
            .symlink_metadata()
            .is_ok());
        assert_eq!(
            f.runtime
                .created
                .lock()
                .unwrap()
                .iter()
                .filter(|id| id.as_str() == "research-analyst")
                .count(),
            1
        );

        f.service.delete_agent("research-analyst", false).await.unwrap();
        assert!(!f.service.home().join("agents/research-analyst").exists());
        assert!(f
            .service
            .home()
            .join("workspaces/goat/reportees/research-analyst")
            .symlink_metadata()
            .is_err());
    }

    // Manager ineligibility: a codex-bound agent cannot take reportees and
    // the error names the provider.
    #[tokio::test]
    async fn manager_ineligibility_references_the_provider() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        f.service
            .create_agent("Lead", CreateAgentOptions::default())
            .await
            .unwrap();
        f.service
            .create_agent("Engineer", CreateAgentOptions::default())
            .await
            .unwrap();
        f.service.set_provider("lead", "codex").await.unwrap();

        let err = f.service.set_manager("engineer", "lead").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("codex"));
    }

    // Task authority: T1 across the tree.
    #[tokio::test]
    async fn task_authority_follows_reporting_lines() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        f.service
            .create_agent(
                "CTO",
                CreateAgentOptions {
                    agent_type: Some(AgentType::Manager),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.service
            .create_agent(
                "Engineer",
                CreateAgentOptions {
                    reports_to: Some("cto".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.service
            .create_agent("QA", CreateAgentOptions::default())
            .await
            .unwrap();

        let err = f
            .service
            .create_task(
                "cto",
                NewTask {
                    title: "Audit the release".into(),
                    assigned_to: Some("qa".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::AuthorityDenied(_)));

        let task = f
            .service
            .create_task(
                "goat",
                NewTask {
                    title: "Build the feature".into(),
                    assigned_to: Some("engineer".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.assigned_to, "engineer");
    }

    // Blocked escalation: one dispatch to the assignee's manager carrying
    // the blocker text and the task id.
    #[tokio::test]
    async fn blocked_escalation_reaches_the_manager() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        f.service
            .create_agent("Engineer", CreateAgentOptions::default())
            .await
            .unwrap();
        // Onboarding done: let the cron run.
        std::fs::remove_file(f.service.home().join("workspaces/goat/BOOTSTRAP.md")).unwrap();

        let task = f
            .service
            .create_task(
                "goat",
                NewTask {
                    title: "Integrate payments".into(),
                    assigned_to: Some("engineer".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        f.service
            .update_task_status("engineer", &task.task_id, TaskStatus::Doing, None)
            .unwrap();
        f.service
            .update_task_status(
                "engineer",
                &task.task_id,
                TaskStatus::Blocked,
                Some("Waiting for approvals".into()),
            )
            .unwrap();

        // Suppress the unrelated kinds for a focused assertion.
        f.service
            .update_settings(serde_json::json!({
                "taskDelegationStrategies": {
                    "topDown": {"enabled": false},
                    "bottomUp": {"enabled": false}
                }
            }))
            .unwrap();

        let report = f.service.run_task_cron_cycle(CycleOptions::default()).await;
        let blocked: Vec<_> = report
            .dispatches
            .iter()
            .filter(|d| d.dispatch.kind == crate::cron::DispatchKind::Blocked)
            .collect();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].dispatch.target_agent_id, "goat");
        assert!(blocked[0].dispatch.message.contains("Waiting for approvals"));
        assert!(blocked[0].dispatch.message.contains(&task.task_id));
        assert!(blocked[0].ok);

        // The manager actually received a run on its main session.
        let delivered = f.provider.messages_for("goat");
        assert!(delivered.iter().any(|m| m.contains(&task.task_id)));
    }

    #[tokio::test]
    async fn successful_root_run_clears_bootstrap_sentinel() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        let sentinel = f.service.home().join("workspaces/goat/BOOTSTRAP.md");
        assert!(sentinel.exists());

        f.service
            .run_agent(
                "goat",
                RunOptions {
                    message: "hello".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!sentinel.exists());

        let last = f.service.get_last_action("goat").unwrap().unwrap();
        assert_eq!(last.session_key, "agent:goat:main");
    }

    #[tokio::test]
    async fn run_stream_delivers_events_and_outcome() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        let (mut rx, handle) = f
            .service
            .run_agent_stream(
                "goat",
                RunOptions {
                    message: "stream me".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.code, 0);
        let mut saw_started = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RunEvent::RunStarted { .. }) {
                saw_started = true;
            }
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn hard_reset_wipes_and_rebootstraps() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        f.service
            .create_agent("Engineer", CreateAgentOptions::default())
            .await
            .unwrap();
        f.service
            .create_task(
                "goat",
                NewTask {
                    title: "doomed".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let report = f.service.hard_reset().await.unwrap();
        assert_eq!(report.default_agent, "goat");
        assert!(report.created_root);
        assert_eq!(f.service.list_agents().unwrap().len(), 1);
        assert!(f.service.list_tasks(TaskFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn gateway_config_round_trips_through_settings() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        assert!(f.service.get_openclaw_gateway_config().is_none());
        f.service
            .set_openclaw_gateway_config(Some(GatewaySettings {
                url: "http://127.0.0.1:8317".into(),
                token: Some("secret".into()),
            }))
            .unwrap();
        let loaded = f.service.get_openclaw_gateway_config().unwrap();
        assert_eq!(loaded.url, "http://127.0.0.1:8317");
    }

    #[tokio::test]
    async fn agent_profile_patch_round_trips() {
        let f = fixture().await;
        f.service.initialize().await.unwrap();
        f.service
            .create_agent("Engineer", CreateAgentOptions::default())
            .await
            .unwrap();
        let updated = f
            .service
            .update_agent(
                "engineer",
                AgentPatch {
                    display_name: Some("Engineer Prime".into()),
                    role: Some(" Staff Engineer ".into()),
                    tags: Some(vec!["rust".into(), "  ".into()]),
                    priority: Some(2),
                    discoverable: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fetched = f.service.get_agent("engineer").unwrap();
        assert_eq!(fetched.display_name, updated.display_name);
        assert_eq!(fetched.role.as_deref(), Some("Staff Engineer"));
        assert_eq!(fetched.tags, vec!["rust"]);
        assert_eq!(fetched.priority, 2);
        assert!(!fetched.discoverable);
    }
}
