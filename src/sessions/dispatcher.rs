use crate::agents::AgentConfig;
use crate::errors::{Error, Result};
use crate::locks::KeyedLocks;
use crate::openclaw::logs::translate_runtime_lines;
use crate::providers::{InvokeRequest, ProviderRegistry, RunEvent};
use crate::sessions::{PrepareOptions, SessionStore};
use crate::util::{self, Clock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub message: String,
    pub session_ref: Option<String>,
    pub cwd: Option<PathBuf>,
    pub images: Vec<PathBuf>,
    pub abort: Option<CancellationToken>,
    pub events: Option<mpsc::UnboundedSender<RunEvent>>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub code: i32,
    /// Canonical assistant output: gateway payloads when present, otherwise
    /// sanitized plain text.
    pub output: String,
    pub stderr: String,
    pub session_key: String,
    pub provider_session_id: Option<String>,
    pub run_id: String,
}

/// Invokes a provider for (agent, message, session): resolves the session,
/// streams events, extracts OpenClaw runtime activity, and records the
/// exchange. Runs against the same session are serialized.
pub struct Dispatcher {
    home: PathBuf,
    providers: Arc<ProviderRegistry>,
    sessions: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    session_locks: KeyedLocks,
}

impl Dispatcher {
    pub fn new(
        home: PathBuf,
        providers: Arc<ProviderRegistry>,
        sessions: Arc<SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            home,
            providers,
            sessions,
            clock,
            session_locks: KeyedLocks::new(),
        }
    }

    pub async fn run_agent(&self, agent: &AgentConfig, opts: RunOptions) -> Result<RunOutcome> {
        if opts.message.trim().is_empty() {
            return Err(Error::validation("message must not be empty"));
        }
        let provider = self.providers.get(&agent.provider_id)?;
        let workspace = crate::paths::workspaces_dir(&self.home).join(&agent.id);

        let info = self.sessions.prepare(
            agent,
            provider.profile(),
            &workspace,
            PrepareOptions {
                session_ref: opts.session_ref.clone(),
                force_new: false,
                project_path: None,
            },
        )?;
        let session_key = info.key.canonical(&agent.id);
        let _guard = self.session_locks.acquire(&session_key).await;

        let run_id = format!("run-{}-{}", agent.id, self.clock.now_ms());
        emit(
            &opts.events,
            RunEvent::RunStarted {
                agent_id: agent.id.clone(),
                session_key: session_key.clone(),
                run_id: run_id.clone(),
            },
        );

        // OpenClaw writes run activity to its own log channel; tail it while
        // the invocation is in flight and translate lines into events.
        let tail_stop = CancellationToken::new();
        let tail_task = provider.runtime_log_path().and_then(|path| {
            opts.events.as_ref().map(|events| {
                tokio::spawn(tail_runtime_log(
                    path,
                    run_id.clone(),
                    self.clock.now_ms(),
                    events.clone(),
                    tail_stop.clone(),
                ))
            })
        });

        let abort = opts.abort.clone().unwrap_or_default();
        let mut env = HashMap::new();
        env.insert(
            "OPENGOAT_HOME".to_string(),
            self.home.to_string_lossy().to_string(),
        );
        env.insert("OPENGOAT_AGENT_ID".to_string(), agent.id.clone());
        env.insert("OPENGOAT_SESSION".to_string(), session_key.clone());
        env.insert("OPENGOAT_RUN_ID".to_string(), run_id.clone());

        // An explicit cwd wins; otherwise the session's resolved working
        // directory (which a project-scoped session may have overridden).
        let cwd = opts
            .cwd
            .clone()
            .or_else(|| Some(info.meta.workspace_path.clone()));
        let invoke_result = provider
            .invoke(InvokeRequest {
                agent_id: agent.id.clone(),
                workspace: workspace.clone(),
                message: opts.message.clone(),
                provider_session_id: info.meta.session_id.clone(),
                cwd,
                env,
                images: opts.images.clone(),
                abort: abort.clone(),
                events: opts.events.clone(),
            })
            .await;

        tail_stop.cancel();
        if let Some(task) = tail_task {
            let _ = task.await;
        }

        let outcome = match invoke_result {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => crate::providers::InvokeOutcome {
                code: 130,
                stdout: String::new(),
                stderr: "aborted".to_string(),
                provider_id: agent.provider_id.clone(),
                provider_session_id: None,
            },
            Err(e) => {
                emit(&opts.events, RunEvent::RunCompleted { code: -1 });
                return Err(e);
            }
        };

        emit(
            &opts.events,
            RunEvent::ProviderInvocationCompleted { code: outcome.code },
        );

        // A gateway JSON envelope wins over plain text; otherwise strip ANSI
        // and runtime noise from what the provider printed.
        let output = extract_gateway_payloads(&outcome.stdout)
            .unwrap_or_else(|| util::sanitize_run_output(&outcome.stdout));

        let mut stderr = util::strip_ansi(&outcome.stderr);
        if abort.is_cancelled() && !stderr.contains("aborted") {
            stderr = if stderr.is_empty() {
                "aborted".to_string()
            } else {
                format!("{stderr}\naborted")
            };
        }

        // Partial output still lands in the transcript; a cancelled run
        // leaves the session consistent.
        if let Err(e) = self.sessions.record_exchange(
            &agent.id,
            &info.key.slug,
            &opts.message,
            &output,
            outcome.provider_session_id.as_deref(),
        ) {
            warn!("Failed to record session exchange for {}: {e}", agent.id);
        }

        emit(&opts.events, RunEvent::RunCompleted { code: outcome.code });

        Ok(RunOutcome {
            code: outcome.code,
            output,
            stderr,
            session_key,
            provider_session_id: outcome.provider_session_id,
            run_id,
        })
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Gateway JSON envelope: `{runId, status, result: {payloads: [{text}]}}`.
/// Extracted texts joined by blank lines become the canonical output.
pub fn extract_gateway_payloads(stdout: &str) -> Option<String> {
    let value = crate::openclaw::cli::extract_first_json(stdout)?;
    value.get("runId")?;
    value.get("status")?;
    let payloads = value.get("result")?.get("payloads")?.as_array()?;
    let texts: Vec<String> = payloads
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .map(|t| t.to_string())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n\n"))
    }
}

/// Poll the OpenClaw runtime log, translating fresh lines into `Activity`
/// events. The fallback run id binds across polls (§ runtime-log contract).
async fn tail_runtime_log(
    path: PathBuf,
    run_id: String,
    started_at_ms: u64,
    events: mpsc::UnboundedSender<RunEvent>,
    stop: CancellationToken,
) {
    let mut consumed_lines = 0usize;
    let mut fallback: Option<String> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(300)) => {}
        }
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                debug!("runtime log unreadable at {}: {e}", path.display());
                continue;
            }
        };
        let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        if lines.len() <= consumed_lines {
            continue;
        }
        let fresh = lines[consumed_lines..].to_vec();
        consumed_lines = lines.len();
        let translation =
            translate_runtime_lines(&run_id, fallback.as_deref(), started_at_ms, &fresh);
        fallback = translation.next_fallback_run_id;
        for activity in translation.activities {
            let _ = events.send(RunEvent::Activity { message: activity });
        }
    }
}
