use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static OPENGOAT_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the OpenGoat home directory (`~/.opengoat/`).
/// Supports `$OPENGOAT_HOME` env override. Cached via `OnceLock`.
pub fn opengoat_home() -> &'static PathBuf {
    OPENGOAT_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("OPENGOAT_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".opengoat")
    })
}

/// `<home>/agents/`
pub fn agents_dir(home: &Path) -> PathBuf {
    home.join("agents")
}

/// `<home>/workspaces/`
pub fn workspaces_dir(home: &Path) -> PathBuf {
    home.join("workspaces")
}

/// `<home>/sessions/`
pub fn sessions_dir(home: &Path) -> PathBuf {
    home.join("sessions")
}

/// `<home>/tasks/`
pub fn tasks_dir(home: &Path) -> PathBuf {
    home.join("tasks")
}

/// `<home>/skills/` — global skills.
pub fn global_skills_dir(home: &Path) -> PathBuf {
    home.join("skills")
}

/// `<home>/organization/` — shared org state, symlinked into every workspace.
pub fn organization_dir(home: &Path) -> PathBuf {
    home.join("organization")
}

/// `<home>/logs/`
pub fn logs_dir(home: &Path) -> PathBuf {
    home.join("logs")
}

/// `<home>/config.json` — `{"defaultAgent": "<id>"}`.
pub fn root_config_path(home: &Path) -> PathBuf {
    home.join("config.json")
}

/// `<home>/ui-settings.json`
pub fn settings_path(home: &Path) -> PathBuf {
    home.join("ui-settings.json")
}
