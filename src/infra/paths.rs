// src/infra/paths.rs — XDG-compliant path management
//
// All paths respect the AGENTDECK_HOME environment variable for isolation.
// When AGENTDECK_HOME is set, config and data live under that directory.
// When unset, config uses ~/.agentdeck/ and data uses XDG_DATA_HOME/agentdeck.

use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::OnceLock;

static PROJECT_DIRS: OnceLock<Option<ProjectDirs>> = OnceLock::new();

fn project_dirs() -> Option<&'static ProjectDirs> {
    PROJECT_DIRS
        .get_or_init(|| ProjectDirs::from("", "", "agentdeck"))
        .as_ref()
}

/// Returns the AGENTDECK_HOME override, if set.
fn agentdeck_home() -> Option<PathBuf> {
    std::env::var_os("AGENTDECK_HOME").map(PathBuf::from)
}

/// Configuration directory: $AGENTDECK_HOME/ or ~/.agentdeck/
pub fn config_dir() -> PathBuf {
    if let Some(home) = agentdeck_home() {
        return home;
    }
    dirs_home().join(".agentdeck")
}

/// Data directory: $AGENTDECK_HOME/data/ or ~/.local/share/agentdeck/
pub fn data_dir() -> PathBuf {
    if let Some(home) = agentdeck_home() {
        return home.join("data");
    }
    match project_dirs() {
        Some(dirs) => dirs.data_local_dir().to_path_buf(),
        None => config_dir().join("data"),
    }
}

/// Home directory (falls back to the current directory when none is known)
pub fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Database path
pub fn db_path() -> PathBuf {
    data_dir().join("agentdeck.db")
}

/// Config directory handed to agent processes, isolated from the user's own.
pub fn agent_config_dir() -> PathBuf {
    data_dir().join("agent-config")
}

/// Config file path
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Ensure all required directories exist
pub async fn ensure_dirs() -> anyhow::Result<()> {
    let dirs = [config_dir(), data_dir(), agent_config_dir()];

    for dir in &dirs {
        tokio::fs::create_dir_all(dir).await?;
    }

    Ok(())
}
