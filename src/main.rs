mod agents;
mod cron;
mod errors;
mod locks;
mod logging;
mod openclaw;
mod paths;
mod providers;
mod service;
mod sessions;
mod settings;
mod skills;
mod tasks;
mod util;

use agents::{AgentPatch, AgentType, CreateAgentOptions};
use anyhow::Result;
use clap::{Parser, Subcommand};
use cron::CycleOptions;
use service::OpenGoatService;
use sessions::dispatcher::RunOptions;
use std::path::PathBuf;
use tasks::{NewTask, TaskFilter, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "goat", version = version())]
#[command(about = "OpenGoat — a local control plane for fleets of AI agents", long_about = None)]
struct Cli {
    /// OpenGoat home directory. Defaults to $OPENGOAT_HOME or ~/.opengoat.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

fn version() -> &'static str {
    static VERSION: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    VERSION
        .get_or_init(|| {
            std::env::var("OPENGOAT_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
        })
        .as_str()
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap the home directory and the root agent
    Init,
    /// Run the task-cron ticker in the foreground
    Serve,
    /// Send a message to an agent and print the reply
    Run {
        /// Target agent id
        agent: String,
        /// The message to deliver
        message: String,
        /// Session reference (defaults to the agent's main session)
        #[arg(long)]
        session: Option<String>,
    },
    /// Reconcile the OpenClaw runtime with local state
    Sync,
    /// Run one task-cron cycle immediately
    Cron,
    /// Wipe all local state and re-bootstrap
    Reset {
        /// Skip the confirmation prompt
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Manage tasks
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Manage skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
    /// List configured providers
    Providers,
}

#[derive(Subcommand, Debug)]
enum AgentsAction {
    /// List all agents
    List,
    /// Show an agent's org position
    Info { id: String },
    /// Create an agent
    Create {
        /// Display name; the id is derived from it
        name: String,
        #[arg(long, value_parser = ["manager", "individual"])]
        r#type: Option<String>,
        #[arg(long)]
        reports_to: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Skill ids to assign (repeatable)
        #[arg(long = "skill")]
        skills: Vec<String>,
    },
    /// Delete an agent
    Delete {
        id: String,
        /// Ignore runtime delete failures and root protection
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Change an agent's manager
    SetManager { id: String, manager: String },
    /// Change an agent's provider
    SetProvider { id: String, provider: String },
    /// Update profile fields
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum TasksAction {
    /// List tasks, oldest first
    List {
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one task
    Get { id: String },
    /// Create a task
    Create {
        /// Acting agent id (owner)
        #[arg(long)]
        actor: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        assign_to: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Change a task's status
    Status {
        #[arg(long)]
        actor: String,
        id: String,
        #[arg(value_parser = ["todo", "doing", "pending", "blocked", "done", "cancelled"])]
        status: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Append a blocker
    Blocker {
        #[arg(long)]
        actor: String,
        id: String,
        content: String,
    },
    /// Append an artifact
    Artifact {
        #[arg(long)]
        actor: String,
        id: String,
        content: String,
    },
    /// Append a worklog entry
    Worklog {
        #[arg(long)]
        actor: String,
        id: String,
        content: String,
    },
    /// Delete tasks
    Delete {
        #[arg(long)]
        actor: String,
        ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// List sessions, most recent first
    List {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print a session transcript
    History {
        agent: String,
        #[arg(long, default_value = "agent:main")]
        session: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        include_compaction: bool,
    },
    /// Rename a session
    Rename {
        agent: String,
        session: String,
        title: String,
    },
    /// Remove a session and its transcript
    Remove { agent: String, session: String },
}

#[derive(Subcommand, Debug)]
enum SkillsAction {
    /// Install a skill from a file, URL, or inline content
    Add {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Install into one agent's workspace instead of globally
        #[arg(long)]
        agent: Option<String>,
        /// Assign a global skill to every agent
        #[arg(long, default_value_t = false)]
        all_agents: bool,
    },
    /// Remove a skill
    Remove {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// List skills
    List {
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = cli
        .home
        .clone()
        .unwrap_or_else(|| paths::opengoat_home().clone());

    // The guard must outlive every command or tail-end log lines are lost.
    let _log_guard = match logging::init(&paths::logs_dir(&home), cli.log_level.as_deref()) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("logging disabled: {err}");
            None
        }
    };

    let service = OpenGoatService::new(home)?;

    match cli.cmd {
        Command::Init => {
            let report = service.initialize().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve => {
            service.initialize().await?;
            service.start().await;
            tracing::info!("task-cron ticker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            service.shutdown().await;
        }
        Command::Run {
            agent,
            message,
            session,
        } => {
            let outcome = service
                .run_agent(
                    &agent,
                    RunOptions {
                        message,
                        session_ref: session,
                        ..Default::default()
                    },
                )
                .await?;
            if !outcome.output.is_empty() {
                println!("{}", outcome.output);
            }
            if outcome.code != 0 {
                eprintln!("{}", outcome.stderr);
                std::process::exit(outcome.code.clamp(1, 125));
            }
        }
        Command::Sync => {
            let outcome = service.sync_runtime_defaults().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Cron => {
            let report = service.run_task_cron_cycle(CycleOptions::default()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset without --yes");
            }
            let report = service.hard_reset().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Agents { action } => run_agents(&service, action).await?,
        Command::Tasks { action } => run_tasks(&service, action)?,
        Command::Sessions { action } => run_sessions(&service, action)?,
        Command::Skills { action } => run_skills(&service, action).await?,
        Command::Providers => {
            for descriptor in service.list_providers() {
                println!(
                    "{:<12} {:<12} {:?}",
                    descriptor.id, descriptor.display_name, descriptor.kind
                );
            }
        }
    }

    Ok(())
}

async fn run_agents(service: &OpenGoatService, action: AgentsAction) -> Result<()> {
    match action {
        AgentsAction::List => {
            for agent in service.list_agents()? {
                println!(
                    "{:<24} {:<10} {:<12} reports_to={}",
                    agent.id,
                    match agent.agent_type {
                        AgentType::Manager => "manager",
                        AgentType::Individual => "individual",
                    },
                    agent.provider_id,
                    agent.reports_to.as_deref().unwrap_or("-")
                );
            }
        }
        AgentsAction::Info { id } => {
            let info = service.get_agent_info(&id)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        AgentsAction::Create {
            name,
            r#type,
            reports_to,
            provider,
            role,
            description,
            skills,
        } => {
            let report = service
                .create_agent(
                    &name,
                    CreateAgentOptions {
                        agent_type: r#type.as_deref().map(|t| match t {
                            "manager" => AgentType::Manager,
                            _ => AgentType::Individual,
                        }),
                        reports_to,
                        provider_id: provider,
                        role,
                        description,
                        skills,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        AgentsAction::Delete { id, force } => {
            let report = service.delete_agent(&id, force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        AgentsAction::SetManager { id, manager } => {
            service.set_manager(&id, &manager).await?;
            println!("{id} now reports to {manager}");
        }
        AgentsAction::SetProvider { id, provider } => {
            service.set_provider(&id, &provider).await?;
            println!("{id} now runs on {provider}");
        }
        AgentsAction::Update {
            id,
            name,
            role,
            description,
            priority,
        } => {
            let agent = service
                .update_agent(
                    &id,
                    AgentPatch {
                        display_name: name,
                        role,
                        description,
                        priority,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
    }
    Ok(())
}

fn run_tasks(service: &OpenGoatService, action: TasksAction) -> Result<()> {
    match action {
        TasksAction::List { assignee, limit } => {
            for task in service.list_tasks(TaskFilter { assignee, limit }) {
                println!(
                    "{:<38} {:<9} {:<16} {}",
                    task.task_id, task.status, task.assigned_to, task.title
                );
            }
        }
        TasksAction::Get { id } => {
            println!("{}", serde_json::to_string_pretty(&service.get_task(&id)?)?);
        }
        TasksAction::Create {
            actor,
            title,
            description,
            assign_to,
            project,
        } => {
            let task = service.create_task(
                &actor,
                NewTask {
                    title,
                    description,
                    assigned_to: assign_to,
                    status: None,
                    project,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TasksAction::Status {
            actor,
            id,
            status,
            reason,
        } => {
            let status = match status.as_str() {
                "todo" => TaskStatus::Todo,
                "doing" => TaskStatus::Doing,
                "pending" => TaskStatus::Pending,
                "blocked" => TaskStatus::Blocked,
                "done" => TaskStatus::Done,
                _ => TaskStatus::Cancelled,
            };
            let task = service.update_task_status(&actor, &id, status, reason)?;
            println!("{} -> {}", task.task_id, task.status);
        }
        TasksAction::Blocker { actor, id, content } => {
            service.add_task_blocker(&actor, &id, &content)?;
        }
        TasksAction::Artifact { actor, id, content } => {
            service.add_task_artifact(&actor, &id, &content)?;
        }
        TasksAction::Worklog { actor, id, content } => {
            service.add_task_worklog(&actor, &id, &content)?;
        }
        TasksAction::Delete { actor, ids } => {
            let removed = service.delete_tasks(&actor, &ids)?;
            println!("removed {} task(s)", removed.len());
        }
    }
    Ok(())
}

fn run_sessions(service: &OpenGoatService, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List { agent } => {
            for meta in service.list_sessions(agent.as_deref())? {
                println!(
                    "agent:{}:{:<24} {:<24} updated_at={}",
                    meta.agent_id, meta.slug, meta.title, meta.updated_at
                );
            }
        }
        SessionsAction::History {
            agent,
            session,
            limit,
            include_compaction,
        } => {
            for line in service.session_history(&agent, &session, limit, include_compaction)? {
                let role = line.role.as_deref().unwrap_or("compaction");
                println!("[{role}] {}", line.content);
            }
        }
        SessionsAction::Rename {
            agent,
            session,
            title,
        } => {
            service.rename_session(&agent, &session, &title)?;
        }
        SessionsAction::Remove { agent, session } => {
            service.remove_session(&agent, &session)?;
        }
    }
    Ok(())
}

async fn run_skills(service: &OpenGoatService, action: SkillsAction) -> Result<()> {
    match action {
        SkillsAction::Add {
            name,
            path,
            url,
            content,
            description,
            agent,
            all_agents,
        } => {
            let record = service
                .install_skill(skills::InstallSkillRequest {
                    scope: if agent.is_some() {
                        skills::SkillScope::Agent
                    } else {
                        skills::SkillScope::Global
                    },
                    agent_id: agent,
                    skill_name: name,
                    source_path: path,
                    source_url: url,
                    content,
                    description,
                    assign_to_all_agents: all_agents,
                })
                .await?;
            println!("installed {} at {}", record.id, record.path.display());
        }
        SkillsAction::Remove { id, agent } => {
            let scope = if agent.is_some() {
                skills::SkillScope::Agent
            } else {
                skills::SkillScope::Global
            };
            service.remove_skill(scope, agent.as_deref(), &id)?;
        }
        SkillsAction::List { agent } => {
            let records = match agent {
                Some(agent) => service.list_skills(&agent)?,
                None => service.list_global_skills(),
            };
            for record in records {
                println!("{:<24} {}", record.id, record.description);
            }
        }
    }
    Ok(())
}
