use anyhow::Result;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

const FILE_STEM: &str = "goat";
const KEEP_DAYS: u64 = 7;

/// Install the tracing subscriber: compact stdout plus a daily-rolled file
/// under `dir`. Returns the appender guard; hold it for the life of the
/// process or buffered lines are lost on exit.
pub fn init(dir: &Path, level: Option<&str>) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;

    let crate_filter = |level: &str| {
        EnvFilter::new(format!(
            "opengoat={level},goat={level},hyper=warn,hyper_util=warn,reqwest=warn,mio=warn"
        ))
    };
    // An explicit --log-level beats RUST_LOG; RUST_LOG beats the default.
    let filter = match level {
        Some(level) => crate_filter(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| crate_filter("info")),
    };

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, FILE_STEM));
    let timer = ChronoUtc::new("%Y-%m-%d %H:%M:%S".to_string());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_timer(timer.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer)
                .with_timer(timer),
        )
        .try_init();

    // Now that the subscriber is live, pruning can report through it.
    prune_rolled_logs(dir);

    Ok(guard)
}

/// Delete rolled log files that fell out of the retention window. Best
/// effort: anything we cannot stat or remove stays for the next start.
fn prune_rolled_logs(dir: &Path) {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(KEEP_DAYS * 24 * 60 * 60))
    else {
        return;
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("log directory not prunable: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_STEM));
        if !ours || !path.is_file() {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|stamp| stamp <= cutoff)
            .unwrap_or(false);
        if expired {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("stale log {} not removed: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_spares_fresh_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join(format!("{FILE_STEM}.2026-08-01"));
        let foreign = dir.path().join("unrelated.txt");
        std::fs::write(&fresh, "log line\n").unwrap();
        std::fs::write(&foreign, "keep me\n").unwrap();

        prune_rolled_logs(dir.path());

        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn prune_tolerates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        prune_rolled_logs(&dir.path().join("never-created"));
    }
}
