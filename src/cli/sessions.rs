// src/cli/sessions.rs — Session listing, lineage and flag commands

use crate::infra::session::Session;
use crate::memory::store_server::SessionFlag;
use crate::memory::StoreHandle;

pub async fn list_sessions(store: &StoreHandle, include_hidden: bool) -> anyhow::Result<()> {
    let sessions = store.list_sessions(include_hidden).await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for s in &sessions {
        println!("{}  {:<24}  {}", s.id, flags(s), s.folder_path);
    }
    Ok(())
}

pub async fn show_session(store: &StoreHandle, id: &str) -> anyhow::Result<()> {
    let Some(session) = store.get_session(id.to_string()).await? else {
        anyhow::bail!("Session '{}' not found", id);
    };

    println!("Session {}", session.id);
    println!("  Folder:     {}", session.folder_path);
    println!("  Created:    {}", session.created_at);
    println!("  Updated:    {}", session.updated_at);
    println!(
        "  Accessed:   {}",
        session.last_accessed_at.as_deref().unwrap_or("never")
    );
    if let Some(parent) = &session.forked_from_session_id {
        println!("  Forked from {parent}");
    }
    let f = flags(&session);
    if !f.is_empty() {
        println!("  Flags:      {f}");
    }

    if let Some(meta) = store.get_metadata(id.to_string()).await? {
        println!(
            "  Usage:      {} in / {} out tokens, ${:.4}",
            meta.total_input_tokens, meta.total_output_tokens, meta.total_cost_usd
        );
        if let Some(model) = &meta.model {
            println!("  Model:      {model}");
        }
    }

    let children = store.list_children(id.to_string()).await?;
    if !children.is_empty() {
        println!("  Children:");
        for child in &children {
            println!("    {}  {}", child.id, flags(child));
        }
    }
    Ok(())
}

pub async fn show_lineage(store: &StoreHandle, id: &str) -> anyhow::Result<()> {
    let lineage = store.get_lineage(id.to_string()).await?;
    for (depth, ancestor) in lineage.iter().enumerate() {
        println!("{}{}", "  ".repeat(depth), ancestor);
    }
    Ok(())
}

pub async fn fork(store: &StoreHandle, id: &str, keep_parent: bool) -> anyhow::Result<()> {
    let child = store.fork_session(id.to_string(), !keep_parent).await?;
    println!("{child}");
    Ok(())
}

pub async fn rewind(
    store: &StoreHandle,
    id: &str,
    checkpoint: &str,
    message: &str,
) -> anyhow::Result<()> {
    let child = store
        .rewind_session(id.to_string(), checkpoint.to_string(), message.to_string())
        .await?;
    println!("{child}");
    eprintln!("Run `agentdeck send --session {child}` to replay from the checkpoint.");
    Ok(())
}

pub async fn set_flag(
    store: &StoreHandle,
    id: &str,
    flag: SessionFlag,
    value: bool,
) -> anyhow::Result<()> {
    store.set_flag(id.to_string(), flag, value).await
}

fn flags(s: &Session) -> String {
    let mut out = Vec::new();
    if s.is_pinned {
        out.push("pinned");
    }
    if s.archived {
        out.push("archived");
    }
    if s.is_hidden {
        out.push("hidden");
    }
    if s.is_fork() {
        out.push("fork");
    }
    out.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_render() {
        let mut s = Session::forked_from("p", "/w");
        s.is_pinned = true;
        s.is_hidden = true;
        assert_eq!(flags(&s), "pinned,hidden,fork");
        assert_eq!(flags(&Session::new("/w")), "");
    }
}
