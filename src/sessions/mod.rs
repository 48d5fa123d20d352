pub mod dispatcher;

use crate::agents::AgentConfig;
use crate::errors::{Error, Result};
use crate::providers::{RuntimeProfile, WorkingDirPolicy};
use crate::util::{self, Clock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    Agent,
    Workspace,
    Project,
}

impl SessionScope {
    fn as_str(&self) -> &'static str {
        match self {
            SessionScope::Agent => "agent",
            SessionScope::Workspace => "workspace",
            SessionScope::Project => "project",
        }
    }
}

/// A session reference: `<scope>:<slug>`. Agent-scoped keys canonically
/// carry the agent id in the middle (`agent:<agentId>:<slug>`); parsing
/// accepts both spellings plus a bare slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub scope: SessionScope,
    pub slug: String,
}

impl SessionKey {
    pub fn agent(slug: &str) -> Self {
        Self {
            scope: SessionScope::Agent,
            slug: slug.to_string(),
        }
    }

    pub fn parse(reference: &str) -> Result<Self> {
        let parts: Vec<&str> = reference.split(':').collect();
        let (scope_str, slug) = match parts.as_slice() {
            [slug] => ("agent", *slug),
            [scope, slug] => (*scope, *slug),
            [scope, _agent_id, slug] => (*scope, *slug),
            _ => {
                return Err(Error::validation(format!(
                    "malformed session reference: {reference}"
                )))
            }
        };
        let scope = match scope_str {
            "agent" => SessionScope::Agent,
            "workspace" => SessionScope::Workspace,
            "project" => SessionScope::Project,
            other => {
                return Err(Error::validation(format!(
                    "unknown session scope '{other}' in reference: {reference}"
                )))
            }
        };
        let slug = slug.trim();
        if slug.is_empty() || slug.contains("..") || slug.contains('/') || slug.contains('\\') {
            return Err(Error::validation(format!(
                "invalid session slug in reference: {reference}"
            )));
        }
        Ok(Self {
            scope,
            slug: slug.to_string(),
        })
    }

    pub fn canonical(&self, agent_id: &str) -> String {
        match self.scope {
            SessionScope::Agent => format!("agent:{agent_id}:{}", self.slug),
            _ => format!("{}:{}", self.scope.as_str(), self.slug),
        }
    }
}

/// `meta.json` of one session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub agent_id: String,
    pub scope: SessionScope,
    pub slug: String,
    /// Provider-assigned conversation id, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub title: String,
    pub updated_at: u64,
    pub transcript_path: PathBuf,
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub input_chars: u64,
    #[serde(default)]
    pub output_chars: u64,
    #[serde(default)]
    pub total_chars: u64,
    #[serde(default)]
    pub compaction_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Message,
    Compaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    #[serde(rename = "type")]
    pub kind: TranscriptKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub session_ref: Option<String>,
    pub force_new: bool,
    pub project_path: Option<PathBuf>,
}

/// What a run needs to know about its session.
#[derive(Debug, Clone)]
pub struct SessionRunInfo {
    pub key: SessionKey,
    pub meta: SessionMeta,
    pub dir: PathBuf,
}

/// Flat-file session store.
///
/// Directory layout:
/// ```text
/// <home>/sessions/
///   <agent_id>/
///     <slug>/
///       meta.json
///       transcript.jsonl   # one TranscriptLine per line, append-only
/// ```
pub struct SessionStore {
    home: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(home: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { home, clock }
    }

    fn session_dir(&self, agent_id: &str, slug: &str) -> PathBuf {
        crate::paths::sessions_dir(&self.home).join(agent_id).join(slug)
    }

    /// Ensure the named session exists and return its run info. The working
    /// directory comes from the provider profile unless a project path is
    /// given.
    pub fn prepare(
        &self,
        agent: &AgentConfig,
        profile: &RuntimeProfile,
        workspace: &Path,
        opts: PrepareOptions,
    ) -> Result<SessionRunInfo> {
        let key = match &opts.session_ref {
            Some(reference) => SessionKey::parse(reference)?,
            None => SessionKey::agent("main"),
        };
        let dir = self.session_dir(&agent.id, &key.slug);
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join("meta.json");
        let mut meta = if meta_path.exists() {
            util::read_json::<SessionMeta>(&meta_path)?
        } else {
            SessionMeta {
                agent_id: agent.id.clone(),
                scope: key.scope,
                slug: key.slug.clone(),
                session_id: None,
                title: key.slug.clone(),
                updated_at: self.clock.now_ms(),
                transcript_path: dir.join("transcript.jsonl"),
                workspace_path: workspace.to_path_buf(),
                input_chars: 0,
                output_chars: 0,
                total_chars: 0,
                compaction_count: 0,
            }
        };

        if opts.force_new {
            meta.session_id = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.workspace_path = match (&opts.project_path, profile.working_dir) {
            (Some(project), _) => project.clone(),
            (None, WorkingDirPolicy::AgentWorkspace) => workspace.to_path_buf(),
            (None, WorkingDirPolicy::ProviderDefault) => meta.workspace_path.clone(),
        };

        util::write_json_atomic(&meta_path, &meta)?;
        if !meta.transcript_path.exists() {
            fs::write(&meta.transcript_path, "")?;
        }
        Ok(SessionRunInfo { key, meta, dir })
    }

    pub fn load(&self, agent_id: &str, slug: &str) -> Result<SessionMeta> {
        let meta_path = self.session_dir(agent_id, slug).join("meta.json");
        if !meta_path.exists() {
            return Err(Error::not_found("session", format!("{agent_id}/{slug}")));
        }
        util::read_json(&meta_path).map_err(Into::into)
    }

    /// Sessions, newest-activity first. `agent_id = None` lists everything.
    pub fn list(&self, agent_id: Option<&str>) -> Result<Vec<SessionMeta>> {
        let root = crate::paths::sessions_dir(&self.home);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for agent_entry in fs::read_dir(&root)? {
            let agent_entry = agent_entry?;
            if !agent_entry.file_type()?.is_dir() {
                continue;
            }
            let name = agent_entry.file_name().to_string_lossy().to_string();
            if agent_id.is_some_and(|id| id != name) {
                continue;
            }
            for session_entry in fs::read_dir(agent_entry.path())? {
                let session_entry = session_entry?;
                let meta_path = session_entry.path().join("meta.json");
                if !meta_path.exists() {
                    continue;
                }
                match util::read_json::<SessionMeta>(&meta_path) {
                    Ok(meta) => out.push(meta),
                    Err(e) => {
                        warn!("Skipping corrupt session meta at {}: {e}", meta_path.display());
                    }
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub fn rename(&self, agent_id: &str, slug: &str, new_title: &str) -> Result<()> {
        let mut meta = self.load(agent_id, slug)?;
        meta.title = new_title.to_string();
        let meta_path = self.session_dir(agent_id, slug).join("meta.json");
        util::write_json_atomic(&meta_path, &meta).map_err(Into::into)
    }

    pub fn remove(&self, agent_id: &str, slug: &str) -> Result<()> {
        let dir = self.session_dir(agent_id, slug);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Tail of the transcript; compaction lines are filtered out unless
    /// requested.
    pub fn history(
        &self,
        agent_id: &str,
        slug: &str,
        limit: Option<usize>,
        include_compaction: bool,
    ) -> Result<Vec<TranscriptLine>> {
        let meta = self.load(agent_id, slug)?;
        if !meta.transcript_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&meta.transcript_path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(trimmed) {
                Ok(entry) => {
                    if include_compaction || entry.kind == TranscriptKind::Message {
                        lines.push(entry);
                    }
                }
                Err(e) => warn!("Skipping corrupt transcript line: {e}"),
            }
        }
        if let Some(limit) = limit {
            if lines.len() > limit {
                lines.drain(..lines.len() - limit);
            }
        }
        Ok(lines)
    }

    /// Append one exchange and update the session counters. `updated_at`
    /// is strictly monotonic even if the clock stalls.
    pub fn record_exchange(
        &self,
        agent_id: &str,
        slug: &str,
        input: &str,
        output: &str,
        provider_session_id: Option<&str>,
    ) -> Result<SessionMeta> {
        let mut meta = self.load(agent_id, slug)?;
        let now = self.clock.now_ms();
        self.append_line(
            &meta,
            &TranscriptLine {
                kind: TranscriptKind::Message,
                role: Some("user".to_string()),
                content: input.to_string(),
                timestamp: now,
            },
        )?;
        if !output.is_empty() {
            self.append_line(
                &meta,
                &TranscriptLine {
                    kind: TranscriptKind::Message,
                    role: Some("assistant".to_string()),
                    content: output.to_string(),
                    timestamp: now,
                },
            )?;
        }
        meta.input_chars += input.chars().count() as u64;
        meta.output_chars += output.chars().count() as u64;
        meta.total_chars = meta.input_chars + meta.output_chars;
        meta.updated_at = now.max(meta.updated_at + 1);
        if let Some(sid) = provider_session_id {
            meta.session_id = Some(sid.to_string());
        }
        let meta_path = self.session_dir(agent_id, slug).join("meta.json");
        util::write_json_atomic(&meta_path, &meta)?;
        Ok(meta)
    }

    pub fn record_compaction(&self, agent_id: &str, slug: &str, summary: &str) -> Result<()> {
        let mut meta = self.load(agent_id, slug)?;
        let now = self.clock.now_ms();
        self.append_line(
            &meta,
            &TranscriptLine {
                kind: TranscriptKind::Compaction,
                role: None,
                content: summary.to_string(),
                timestamp: now,
            },
        )?;
        meta.compaction_count += 1;
        meta.updated_at = now.max(meta.updated_at + 1);
        let meta_path = self.session_dir(agent_id, slug).join("meta.json");
        util::write_json_atomic(&meta_path, &meta)?;
        Ok(())
    }

    fn append_line(&self, meta: &SessionMeta, line: &TranscriptLine) -> Result<()> {
        if let Some(parent) = meta.transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(line)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&meta.transcript_path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Most recent activity across the agent's sessions.
    pub fn last_activity(&self, agent_id: &str) -> Result<Option<SessionMeta>> {
        Ok(self.list(Some(agent_id))?.into_iter().next())
    }
}
