use crate::errors::Result;
use crate::util;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// UI settings persisted at `<home>/ui-settings.json`.
///
/// Field names are fixed: the file is shared with the UI layer, so renames
/// would silently reset user preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub task_cron_enabled: bool,
    #[serde(default = "default_in_progress_minutes")]
    pub max_in_progress_minutes: u64,
    #[serde(default = "default_parallel_flows")]
    pub max_parallel_flows: usize,
    #[serde(default)]
    pub task_delegation_strategies: TaskDelegationStrategies,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openclaw_gateway: Option<GatewaySettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDelegationStrategies {
    #[serde(default)]
    pub top_down: TopDownStrategy,
    #[serde(default)]
    pub bottom_up: BottomUpStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopDownStrategy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_open_tasks_threshold")]
    pub open_tasks_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BottomUpStrategy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_inactivity_minutes")]
    pub max_inactivity_minutes: u64,
    #[serde(default)]
    pub inactive_agent_notification_target: NotificationTarget,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationTarget {
    #[default]
    #[serde(rename = "all-managers")]
    AllManagers,
    #[serde(rename = "root-only")]
    RootOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_in_progress_minutes() -> u64 {
    240
}

fn default_parallel_flows() -> usize {
    3
}

fn default_open_tasks_threshold() -> usize {
    5
}

fn default_inactivity_minutes() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            task_cron_enabled: true,
            max_in_progress_minutes: default_in_progress_minutes(),
            max_parallel_flows: default_parallel_flows(),
            task_delegation_strategies: TaskDelegationStrategies::default(),
            authentication: Authentication::default(),
            openclaw_gateway: None,
        }
    }
}

impl Default for TopDownStrategy {
    fn default() -> Self {
        Self {
            enabled: true,
            open_tasks_threshold: default_open_tasks_threshold(),
        }
    }
}

impl Default for BottomUpStrategy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_inactivity_minutes: default_inactivity_minutes(),
            inactive_agent_notification_target: NotificationTarget::AllManagers,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(home: &Path) -> Self {
        Self {
            path: crate::paths::settings_path(home),
        }
    }

    /// Load settings, applying legacy-key migration. A missing or corrupt
    /// file yields defaults.
    pub fn load(&self) -> Settings {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Settings::default(),
        };
        let raw: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Corrupt ui-settings.json, using defaults: {e}");
                return Settings::default();
            }
        };
        Self::from_raw(raw)
    }

    fn from_raw(mut raw: serde_json::Value) -> Settings {
        // Legacy key: notifyManagersOfInactiveAgents predates the
        // taskDelegationStrategies block and maps onto bottomUp.enabled.
        let legacy_notify = raw
            .get("notifyManagersOfInactiveAgents")
            .and_then(|v| v.as_bool());
        if let Some(obj) = raw.as_object_mut() {
            obj.remove("notifyManagersOfInactiveAgents");
        }
        let mut settings: Settings = match serde_json::from_value(raw.clone()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Unreadable ui-settings.json, using defaults: {e}");
                Settings::default()
            }
        };
        if legacy_notify.is_some() && raw.get("taskDelegationStrategies").is_none() {
            settings.task_delegation_strategies.bottom_up.enabled = legacy_notify.unwrap();
        }
        settings
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        util::write_json_atomic(&self.path, settings).map_err(Into::into)
    }

    /// Merge a partial update (JSON object) over the stored settings.
    pub fn update(&self, patch: serde_json::Value) -> Result<Settings> {
        let current = self.load();
        let mut raw = serde_json::to_value(&current)?;
        merge_objects(&mut raw, patch);
        let updated = Self::from_raw(raw);
        self.save(&updated)?;
        Ok(updated)
    }
}

fn merge_objects(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        merge_objects(slot, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, patch) => *base_slot = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SettingsStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SettingsStore::new(dir.path()), dir)
    }

    #[test]
    fn defaults_when_missing() {
        let (store, _dir) = store();
        let s = store.load();
        assert!(s.task_cron_enabled);
        assert_eq!(s.max_in_progress_minutes, 240);
        assert_eq!(s.max_parallel_flows, 3);
        assert!(s.task_delegation_strategies.top_down.enabled);
        assert_eq!(s.task_delegation_strategies.top_down.open_tasks_threshold, 5);
        assert!(s.task_delegation_strategies.bottom_up.enabled);
        assert_eq!(
            s.task_delegation_strategies.bottom_up.max_inactivity_minutes,
            30
        );
    }

    #[test]
    fn save_load_round_trip_uses_expected_keys() {
        let (store, dir) = store();
        let mut s = Settings::default();
        s.max_parallel_flows = 7;
        s.task_delegation_strategies.bottom_up.inactive_agent_notification_target =
            NotificationTarget::RootOnly;
        store.save(&s).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("ui-settings.json")).unwrap();
        assert!(raw.contains("\"taskCronEnabled\""));
        assert!(raw.contains("\"maxParallelFlows\": 7"));
        assert!(raw.contains("\"root-only\""));

        assert_eq!(store.load(), s);
    }

    #[test]
    fn legacy_notify_key_maps_to_bottom_up() {
        let (store, dir) = store();
        std::fs::write(
            dir.path().join("ui-settings.json"),
            r#"{"taskCronEnabled": true, "notifyManagersOfInactiveAgents": false}"#,
        )
        .unwrap();
        let s = store.load();
        assert!(!s.task_delegation_strategies.bottom_up.enabled);
        // Defaults elsewhere are untouched.
        assert!(s.task_delegation_strategies.top_down.enabled);
    }

    #[test]
    fn legacy_cron_disable_wins_over_strategy_defaults() {
        let (store, dir) = store();
        std::fs::write(
            dir.path().join("ui-settings.json"),
            r#"{"taskCronEnabled": false}"#,
        )
        .unwrap();
        let s = store.load();
        assert!(!s.task_cron_enabled);
        assert!(s.task_delegation_strategies.top_down.enabled);
        assert!(s.task_delegation_strategies.bottom_up.enabled);
    }

    #[test]
    fn update_merges_nested_objects() {
        let (store, _dir) = store();
        store.save(&Settings::default()).unwrap();
        let updated = store
            .update(serde_json::json!({
                "taskDelegationStrategies": {"topDown": {"enabled": false}}
            }))
            .unwrap();
        assert!(!updated.task_delegation_strategies.top_down.enabled);
        // Sibling values survive the merge.
        assert_eq!(
            updated.task_delegation_strategies.top_down.open_tasks_threshold,
            5
        );
        assert!(updated.task_delegation_strategies.bottom_up.enabled);
    }
}
