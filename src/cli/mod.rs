// src/cli/mod.rs — CLI definition (clap derive)

pub mod doctor;
pub mod send;
pub mod sessions;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agentdeck",
    about = "Run, fork and rewind coding-agent sessions",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message and stream the agent's response
    Send {
        /// Resume this session (omit to start a new one)
        #[arg(long)]
        session: Option<String>,
        /// Working directory for a new session (defaults to the current one)
        #[arg(long)]
        folder: Option<String>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
        /// Message text. May be empty when resuming a rewound session.
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Branch a session; the parent is hidden unless --keep-parent is given
    Fork {
        id: String,
        #[arg(long)]
        keep_parent: bool,
    },
    /// Branch a session at a checkpoint and queue a replacement message
    Rewind {
        id: String,
        /// User-message uuid to rewind to
        checkpoint: String,
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Show a session's ancestors, newest first
    Lineage { id: String },
    /// List sessions
    Sessions {
        /// Include hidden sessions
        #[arg(long)]
        all: bool,
    },
    /// Show one session with usage and children
    Show { id: String },
    Hide { id: String },
    Unhide { id: String },
    Archive { id: String },
    Unarchive { id: String },
    Pin { id: String },
    Unpin { id: String },
    /// Check the agent executable and the database
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_send_collects_message_words() {
        let cli = Cli::parse_from(["agentdeck", "send", "--session", "S1", "fix", "the", "bug"]);
        match cli.command {
            Commands::Send {
                session, message, ..
            } => {
                assert_eq!(session.as_deref(), Some("S1"));
                assert_eq!(message.join(" "), "fix the bug");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_rewind_requires_message() {
        assert!(Cli::try_parse_from(["agentdeck", "rewind", "S1", "u1"]).is_err());
        let cli = Cli::try_parse_from(["agentdeck", "rewind", "S1", "u1", "again"]).unwrap();
        assert!(matches!(cli.command, Commands::Rewind { .. }));
    }
}
