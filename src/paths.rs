use std::path::PathBuf;
use std::sync::OnceLock;

static DATA_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Returns the Carapace data root (`~/.carapace/`).
/// Supports `$CARAPACE_DATA_DIR` env override. Cached via `OnceLock`.
pub fn data_root() -> &'static PathBuf {
    DATA_ROOT.get_or_init(|| {
        if let Ok(val) = std::env::var("CARAPACE_DATA_DIR") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".carapace")
    })
}

/// Pin the data root explicitly (`--data-dir`). Must be called before the
/// first `data_root()` read; a later call is ignored.
pub fn set_data_root(root: PathBuf) {
    let _ = DATA_ROOT.set(root);
}

/// `<root>/config.yaml`
pub fn config_file() -> PathBuf {
    data_root().join("config.yaml")
}

/// `<root>/rules.yaml`
pub fn rules_file() -> PathBuf {
    data_root().join("rules.yaml")
}

/// `<root>/server.token`
pub fn token_file() -> PathBuf {
    data_root().join("server.token")
}

/// `<root>/sessions/`
pub fn sessions_dir() -> PathBuf {
    data_root().join("sessions")
}

/// `<root>/logs/`
pub fn logs_dir() -> PathBuf {
    data_root().join("logs")
}
