// src/cli/send.rs — Send a message and stream events until the run completes

use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::infra::config::Config;
use crate::memory::StoreHandle;
use crate::process::{BroadcastSink, ProcessManager, SendRequest, SessionEvent};

pub struct SendArgs {
    pub session: Option<String>,
    pub folder: Option<String>,
    pub message: String,
    pub json: bool,
}

pub async fn run_send(config: Config, store: StoreHandle, args: SendArgs) -> anyhow::Result<()> {
    if args.session.is_none() && args.message.trim().is_empty() {
        anyhow::bail!("A message is required to start a new session.");
    }
    let folder_path = match args.folder {
        Some(folder) => folder,
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };

    let sink = Arc::new(BroadcastSink::default());
    let mut events = sink.subscribe();
    let manager = ProcessManager::new(config, store, sink);

    let outcome = manager
        .send_message(SendRequest {
            session_id: args.session,
            folder_path,
            message: args.message,
        })
        .await?;

    let mut failure: Option<String> = None;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    render(&event, args.json)?;
                    if let SessionEvent::Complete { success, error, .. } = event {
                        if !success {
                            failure = Some(error.unwrap_or_else(|| "agent run failed".into()));
                        }
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nAborting...");
                manager.abort(&outcome.handle.key()).await;
            }
        }
    }

    match failure {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

fn render(event: &SessionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        SessionEvent::Init { session_id, tools } => {
            eprintln!("[session {}] {} tool(s)", session_id, tools.len());
        }
        SessionEvent::Chunk { text, .. } => {
            print!("{text}");
            std::io::stdout().flush()?;
        }
        SessionEvent::ToolUse { name, .. } => eprintln!("\n[tool] {name}"),
        SessionEvent::ToolResult {
            tool_use_id,
            is_error: true,
            ..
        } => eprintln!("[tool {tool_use_id} failed]"),
        SessionEvent::Result {
            success,
            cost_usd,
            tokens,
            ..
        } => {
            println!();
            eprintln!(
                "[{}] {} in / {} out tokens, ${:.4}",
                if *success { "done" } else { "failed" },
                tokens.input,
                tokens.output,
                cost_usd
            );
        }
        SessionEvent::Error { message, .. } => eprintln!("[error] {message}"),
        SessionEvent::Complete {
            session_id,
            success: true,
            ..
        } => eprintln!("[session {session_id} complete]"),
        _ => {}
    }
    Ok(())
}
