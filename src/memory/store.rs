// src/memory/store.rs — SQLite operations

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::infra::errors::DeckError;
use crate::infra::session::{MetadataDelta, RewindContext, Session, SessionMetadata};

/// Maximum number of ancestors followed by `get_lineage`. Guards against
/// self-referential or cyclic parent pointers.
pub const MAX_LINEAGE_DEPTH: usize = 100;

const SESSION_COLUMNS: &str = "id, folder_path, created_at, updated_at, last_accessed_at,
     archived, is_pinned, forked_from_session_id, is_hidden";

/// Low-level SQLite operations for sessions, metadata and rewind contexts.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    // -- Sessions --

    pub fn insert_session(&self, session: &Session) -> anyhow::Result<()> {
        insert_session_row(&self.conn, session)?;
        Ok(())
    }

    /// Insert a new root session for `folder_path` and return its id.
    pub fn create_session(&self, folder_path: &str) -> anyhow::Result<String> {
        let session = Session::new(folder_path);
        self.insert_session(&session)?;
        Ok(session.id)
    }

    /// Insert a root session under a known id if it does not exist yet.
    /// Returns true when a row was inserted.
    pub fn ensure_session(&self, id: &str, folder_path: &str) -> anyhow::Result<bool> {
        let s = Session::with_id(id, folder_path);
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sessions (id, folder_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![s.id, s.folder_path, s.created_at, s.updated_at],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let session = self
            .conn
            .query_row(&sql, [id], session_from_row)
            .optional()?;
        Ok(session)
    }

    /// Sessions ordered pinned-first, then most recently updated.
    pub fn list_sessions(&self, include_hidden: bool) -> anyhow::Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE ?1 OR is_hidden = 0
             ORDER BY is_pinned DESC, updated_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([include_hidden], session_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Direct forks of `id`, oldest first.
    pub fn list_children(&self, id: &str) -> anyhow::Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE forked_from_session_id = ?1
             ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([id], session_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn touch_session(&self, id: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE sessions SET last_accessed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        require_changed(changed, id)
    }

    pub fn set_hidden(&self, id: &str, hidden: bool) -> anyhow::Result<()> {
        self.set_flag(id, "is_hidden", hidden)
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> anyhow::Result<()> {
        self.set_flag(id, "archived", archived)
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) -> anyhow::Result<()> {
        self.set_flag(id, "is_pinned", pinned)
    }

    fn set_flag(&self, id: &str, column: &'static str, value: bool) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let sql = format!("UPDATE sessions SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let changed = self.conn.execute(&sql, params![value, now, id])?;
        require_changed(changed, id)
    }

    // -- Lineage --

    /// Create a child of `parent_id` in the parent's folder, optionally hiding
    /// the parent. Both writes share one transaction.
    pub fn fork_session(&self, parent_id: &str, hide_parent: bool) -> anyhow::Result<String> {
        let tx = self.conn.unchecked_transaction()?;
        let child = insert_fork(&tx, parent_id, hide_parent)?;
        tx.commit()?;
        Ok(child.id)
    }

    /// Fork `session_id` (always hiding it) and attach replay instructions to
    /// the new session in the same transaction.
    pub fn rewind_session(
        &self,
        session_id: &str,
        checkpoint_uuid: &str,
        new_message: &str,
    ) -> anyhow::Result<String> {
        let tx = self.conn.unchecked_transaction()?;
        let child = insert_fork(&tx, session_id, true)?;
        tx.execute(
            "INSERT INTO rewind_context (session_id, checkpoint_uuid, new_message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![child.id, checkpoint_uuid, new_message, child.created_at],
        )?;
        tx.commit()?;
        Ok(child.id)
    }

    /// Ancestor chain of `id`: the session itself first, the oldest ancestor
    /// last. Truncated at `MAX_LINEAGE_DEPTH` entries.
    pub fn get_lineage(&self, id: &str) -> anyhow::Result<Vec<String>> {
        if !session_exists(&self.conn, id)? {
            return Err(DeckError::SessionNotFound { id: id.to_string() }.into());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT forked_from_session_id FROM sessions WHERE id = ?1")?;

        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(session_id) = current {
            if chain.len() >= MAX_LINEAGE_DEPTH {
                warn!(
                    "Lineage of session {} truncated at depth {}",
                    id, MAX_LINEAGE_DEPTH
                );
                break;
            }
            current = stmt
                .query_row([&session_id], |r| r.get::<_, Option<String>>(0))
                .optional()?
                .flatten();
            chain.push(session_id);
        }
        Ok(chain)
    }

    // -- Metadata --

    /// Add `delta` onto the session's cumulative usage. A supplied model
    /// replaces the stored one; an absent model keeps it.
    pub fn upsert_metadata(&self, session_id: &str, delta: &MetadataDelta) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        if !session_exists(&tx, session_id)? {
            return Err(DeckError::SessionNotFound {
                id: session_id.to_string(),
            }
            .into());
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO session_metadata
                (session_id, total_input_tokens, total_output_tokens, total_cost_usd, model, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                total_input_tokens = total_input_tokens + excluded.total_input_tokens,
                total_output_tokens = total_output_tokens + excluded.total_output_tokens,
                total_cost_usd = total_cost_usd + excluded.total_cost_usd,
                model = COALESCE(excluded.model, session_metadata.model),
                updated_at = excluded.updated_at",
            params![
                session_id,
                delta.input_tokens,
                delta.output_tokens,
                delta.cost_usd,
                delta.model,
                now
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_metadata(&self, session_id: &str) -> anyhow::Result<Option<SessionMetadata>> {
        let metadata = self
            .conn
            .query_row(
                "SELECT session_id, total_input_tokens, total_output_tokens, total_cost_usd,
                 model, updated_at
                 FROM session_metadata WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok(SessionMetadata {
                        session_id: row.get(0)?,
                        total_input_tokens: row.get(1)?,
                        total_output_tokens: row.get(2)?,
                        total_cost_usd: row.get(3)?,
                        model: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    // -- Rewind contexts --

    pub fn get_rewind_context(&self, session_id: &str) -> anyhow::Result<Option<RewindContext>> {
        let ctx = self
            .conn
            .query_row(
                "SELECT session_id, checkpoint_uuid, new_message, created_at
                 FROM rewind_context WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok(RewindContext {
                        session_id: row.get(0)?,
                        checkpoint_uuid: row.get(1)?,
                        new_message: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(ctx)
    }

    /// Read and delete the session's rewind context, so it is replayed once.
    pub fn take_rewind_context(&self, session_id: &str) -> anyhow::Result<Option<RewindContext>> {
        let tx = self.conn.unchecked_transaction()?;
        let ctx = self.get_rewind_context(session_id)?;
        if ctx.is_some() {
            tx.execute(
                "DELETE FROM rewind_context WHERE session_id = ?1",
                [session_id],
            )?;
        }
        tx.commit()?;
        Ok(ctx)
    }

    /// Get a reference to the underlying connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn insert_session_row(conn: &Connection, s: &Session) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO sessions (id, folder_path, created_at, updated_at, last_accessed_at,
         archived, is_pinned, forked_from_session_id, is_hidden)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            s.id,
            s.folder_path,
            s.created_at,
            s.updated_at,
            s.last_accessed_at,
            s.archived,
            s.is_pinned,
            s.forked_from_session_id,
            s.is_hidden
        ],
    )
}

/// Shared body of fork and rewind. Runs inside the caller's transaction.
fn insert_fork(conn: &Connection, parent_id: &str, hide_parent: bool) -> anyhow::Result<Session> {
    let folder: Option<String> = conn
        .query_row(
            "SELECT folder_path FROM sessions WHERE id = ?1",
            [parent_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(folder) = folder else {
        return Err(DeckError::ParentNotFound {
            id: parent_id.to_string(),
        }
        .into());
    };

    let child = Session::forked_from(parent_id, &folder);
    insert_session_row(conn, &child)?;

    if hide_parent {
        conn.execute(
            "UPDATE sessions SET is_hidden = 1, updated_at = ?1 WHERE id = ?2",
            params![child.created_at, parent_id],
        )?;
    }
    Ok(child)
}

fn session_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
        [id],
        |r| r.get(0),
    )
}

fn require_changed(changed: usize, id: &str) -> anyhow::Result<()> {
    if changed == 0 {
        return Err(DeckError::SessionNotFound { id: id.to_string() }.into());
    }
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        folder_path: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        last_accessed_at: row.get(4)?,
        archived: row.get(5)?,
        is_pinned: row.get(6)?,
        forked_from_session_id: row.get(7)?,
        is_hidden: row.get(8)?,
    })
}
