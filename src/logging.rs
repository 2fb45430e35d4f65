use crate::config::LoggingConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// The guard keeps the background log writer alive; it must live as long as
// the process.
static WORKER: OnceLock<WorkerGuard> = OnceLock::new();

const FILE_PREFIX: &str = "carapace.log";
const DEFAULT_RETENTION_DAYS: u64 = 14;

/// Install the global subscriber: a compact stdout layer plus a
/// daily-rolling file under the data root. Returns the log directory.
/// A second call is an error.
pub fn init(config: &LoggingConfig) -> Result<PathBuf> {
    let dir = resolve_dir(config.directory.as_deref())?;
    prune_stale(&dir, config.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS));

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, FILE_PREFIX));
    WORKER
        .set(guard)
        .map_err(|_| anyhow!("logging initialized twice"))?;

    // An explicit config level beats RUST_LOG; otherwise RUST_LOG beats the
    // built-in default. HTTP internals stay at warn either way.
    let directive = |level: &str| {
        format!("carapace={level},axum=warn,hyper=warn,hyper_util=warn,reqwest=warn,tower_http=warn")
    };
    let filter = match config.level.as_deref() {
        Some(level) => EnvFilter::try_new(directive(level))
            .with_context(|| format!("bad logging level: {level}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directive("info"))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install subscriber: {e}"))?;

    Ok(dir)
}

fn resolve_dir(configured: Option<&str>) -> Result<PathBuf> {
    let dir = match configured {
        Some(path) => expand_home(path),
        None => crate::paths::logs_dir(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    Ok(dir)
}

// ~ expansion only; anything fancier belongs in the shell.
fn expand_home(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|rest| dirs::home_dir().map(|home| home.join(rest)))
        .unwrap_or_else(|| PathBuf::from(path))
}

/// Delete rolled files that aged out of the retention window. Not worth
/// failing startup over, so problems go to stderr and we move on.
fn prune_stale(dir: &Path, retention_days: u64) {
    let window = Duration::from_secs(retention_days.max(1) * 24 * 60 * 60);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        let ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(FILE_PREFIX));
        if !ours || !path.is_file() {
            continue;
        }
        let aged_out = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > window);
        if aged_out {
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("could not remove stale log {}: {e}", path.display());
            }
        }
    }
}
