// src/cli/doctor.rs — Environment diagnostics

use crate::infra::config::Config;
use crate::infra::paths;
use crate::memory;

/// Check the agent executable, config and database.
pub async fn run_doctor(config: &Config) -> anyhow::Result<()> {
    println!("agentdeck doctor v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let mut problems = 0;

    eprint!("  Checking agent executable... ");
    match which::which(&config.agent.executable) {
        Ok(path) => eprintln!("{}", path.display()),
        Err(_) => {
            problems += 1;
            eprintln!("NOT FOUND");
            eprintln!(
                "    '{}' is not on PATH. Install it or set [agent] executable in config.toml.",
                config.agent.executable
            );
        }
    }

    let config_path = paths::config_file_path();
    if config_path.exists() {
        eprintln!("  Config:  {} (loaded)", config_path.display());
    } else {
        eprintln!("  Config:  (using defaults)");
    }

    eprint!("  Checking database... ");
    let db_path = paths::db_path();
    match memory::open_store(&db_path).and_then(|store| store.list_sessions(true)) {
        Ok(sessions) => eprintln!("ok ({} session(s), {})", sessions.len(), db_path.display()),
        Err(e) => {
            problems += 1;
            eprintln!("FAILED");
            eprintln!("    {}: {}", db_path.display(), e);
        }
    }

    eprintln!("  Agent config dir: {}", paths::agent_config_dir().display());

    println!();
    if problems == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{} problem(s) found", problems)
    }
}
