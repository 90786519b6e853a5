// src/memory/store_server.rs — Async message passing for Store

use crate::infra::session::{MetadataDelta, RewindContext, Session, SessionMetadata};
use crate::memory::store::Store;
use tokio::sync::{mpsc, oneshot};

/// Boolean session attributes toggled from the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    Hidden,
    Archived,
    Pinned,
}

#[derive(Debug)]
pub enum StoreCommand {
    CreateSession {
        folder_path: String,
        resp: oneshot::Sender<anyhow::Result<String>>,
    },
    EnsureSession {
        id: String,
        folder_path: String,
        resp: oneshot::Sender<anyhow::Result<bool>>,
    },
    GetSession {
        id: String,
        resp: oneshot::Sender<anyhow::Result<Option<Session>>>,
    },
    ListSessions {
        include_hidden: bool,
        resp: oneshot::Sender<anyhow::Result<Vec<Session>>>,
    },
    ListChildren {
        id: String,
        resp: oneshot::Sender<anyhow::Result<Vec<Session>>>,
    },
    TouchSession {
        id: String,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    SetFlag {
        id: String,
        flag: SessionFlag,
        value: bool,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    ForkSession {
        parent_id: String,
        hide_parent: bool,
        resp: oneshot::Sender<anyhow::Result<String>>,
    },
    RewindSession {
        session_id: String,
        checkpoint_uuid: String,
        new_message: String,
        resp: oneshot::Sender<anyhow::Result<String>>,
    },
    GetLineage {
        id: String,
        resp: oneshot::Sender<anyhow::Result<Vec<String>>>,
    },
    UpsertMetadata {
        session_id: String,
        delta: MetadataDelta,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    GetMetadata {
        session_id: String,
        resp: oneshot::Sender<anyhow::Result<Option<SessionMetadata>>>,
    },
    GetRewindContext {
        session_id: String,
        resp: oneshot::Sender<anyhow::Result<Option<RewindContext>>>,
    },
    TakeRewindContext {
        session_id: String,
        resp: oneshot::Sender<anyhow::Result<Option<RewindContext>>>,
    },
}

/// A handle to the Store that uses message passing.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> StoreCommand,
    ) -> anyhow::Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx.send(build(resp_tx)).await?;
        resp_rx.await?
    }

    pub async fn create_session(&self, folder_path: String) -> anyhow::Result<String> {
        self.request(|resp| StoreCommand::CreateSession { folder_path, resp })
            .await
    }

    pub async fn ensure_session(&self, id: String, folder_path: String) -> anyhow::Result<bool> {
        self.request(|resp| StoreCommand::EnsureSession {
            id,
            folder_path,
            resp,
        })
        .await
    }

    pub async fn get_session(&self, id: String) -> anyhow::Result<Option<Session>> {
        self.request(|resp| StoreCommand::GetSession { id, resp })
            .await
    }

    pub async fn list_sessions(&self, include_hidden: bool) -> anyhow::Result<Vec<Session>> {
        self.request(|resp| StoreCommand::ListSessions {
            include_hidden,
            resp,
        })
        .await
    }

    pub async fn list_children(&self, id: String) -> anyhow::Result<Vec<Session>> {
        self.request(|resp| StoreCommand::ListChildren { id, resp })
            .await
    }

    pub async fn touch_session(&self, id: String) -> anyhow::Result<()> {
        self.request(|resp| StoreCommand::TouchSession { id, resp })
            .await
    }

    pub async fn set_flag(&self, id: String, flag: SessionFlag, value: bool) -> anyhow::Result<()> {
        self.request(|resp| StoreCommand::SetFlag {
            id,
            flag,
            value,
            resp,
        })
        .await
    }

    pub async fn fork_session(&self, parent_id: String, hide_parent: bool) -> anyhow::Result<String> {
        self.request(|resp| StoreCommand::ForkSession {
            parent_id,
            hide_parent,
            resp,
        })
        .await
    }

    pub async fn rewind_session(
        &self,
        session_id: String,
        checkpoint_uuid: String,
        new_message: String,
    ) -> anyhow::Result<String> {
        self.request(|resp| StoreCommand::RewindSession {
            session_id,
            checkpoint_uuid,
            new_message,
            resp,
        })
        .await
    }

    pub async fn get_lineage(&self, id: String) -> anyhow::Result<Vec<String>> {
        self.request(|resp| StoreCommand::GetLineage { id, resp })
            .await
    }

    pub async fn upsert_metadata(
        &self,
        session_id: String,
        delta: MetadataDelta,
    ) -> anyhow::Result<()> {
        self.request(|resp| StoreCommand::UpsertMetadata {
            session_id,
            delta,
            resp,
        })
        .await
    }

    pub async fn get_metadata(&self, session_id: String) -> anyhow::Result<Option<SessionMetadata>> {
        self.request(|resp| StoreCommand::GetMetadata { session_id, resp })
            .await
    }

    pub async fn get_rewind_context(
        &self,
        session_id: String,
    ) -> anyhow::Result<Option<RewindContext>> {
        self.request(|resp| StoreCommand::GetRewindContext { session_id, resp })
            .await
    }

    pub async fn take_rewind_context(
        &self,
        session_id: String,
    ) -> anyhow::Result<Option<RewindContext>> {
        self.request(|resp| StoreCommand::TakeRewindContext { session_id, resp })
            .await
    }
}

/// Spawn the background task that owns the Store.
pub fn spawn_store_server(store: Store) -> (StoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(100);
    let handle = StoreHandle::new(tx);
    let join_handle = tokio::spawn(run_store_server(store, rx));
    (handle, join_handle)
}

/// The background task that owns the Store. Commands run one at a time, so
/// SQLite access is serialized.
pub async fn run_store_server(store: Store, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::CreateSession { folder_path, resp } => {
                let _ = resp.send(store.create_session(&folder_path));
            }
            StoreCommand::EnsureSession {
                id,
                folder_path,
                resp,
            } => {
                let _ = resp.send(store.ensure_session(&id, &folder_path));
            }
            StoreCommand::GetSession { id, resp } => {
                let _ = resp.send(store.get_session(&id));
            }
            StoreCommand::ListSessions {
                include_hidden,
                resp,
            } => {
                let _ = resp.send(store.list_sessions(include_hidden));
            }
            StoreCommand::ListChildren { id, resp } => {
                let _ = resp.send(store.list_children(&id));
            }
            StoreCommand::TouchSession { id, resp } => {
                let _ = resp.send(store.touch_session(&id));
            }
            StoreCommand::SetFlag {
                id,
                flag,
                value,
                resp,
            } => {
                let res = match flag {
                    SessionFlag::Hidden => store.set_hidden(&id, value),
                    SessionFlag::Archived => store.set_archived(&id, value),
                    SessionFlag::Pinned => store.set_pinned(&id, value),
                };
                let _ = resp.send(res);
            }
            StoreCommand::ForkSession {
                parent_id,
                hide_parent,
                resp,
            } => {
                let _ = resp.send(store.fork_session(&parent_id, hide_parent));
            }
            StoreCommand::RewindSession {
                session_id,
                checkpoint_uuid,
                new_message,
                resp,
            } => {
                let res = store.rewind_session(&session_id, &checkpoint_uuid, &new_message);
                let _ = resp.send(res);
            }
            StoreCommand::GetLineage { id, resp } => {
                let _ = resp.send(store.get_lineage(&id));
            }
            StoreCommand::UpsertMetadata {
                session_id,
                delta,
                resp,
            } => {
                let _ = resp.send(store.upsert_metadata(&session_id, &delta));
            }
            StoreCommand::GetMetadata { session_id, resp } => {
                let _ = resp.send(store.get_metadata(&session_id));
            }
            StoreCommand::GetRewindContext { session_id, resp } => {
                let _ = resp.send(store.get_rewind_context(&session_id));
            }
            StoreCommand::TakeRewindContext { session_id, resp } => {
                let _ = resp.send(store.take_rewind_context(&session_id));
            }
        }
    }
    tracing::debug!("Store server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::schema;
    use rusqlite::Connection;

    fn test_handle() -> StoreHandle {
        let conn = Connection::open_in_memory().unwrap();
        schema::run_migrations(&conn).unwrap();
        let (handle, _join) = spawn_store_server(Store::new(conn));
        handle
    }

    #[tokio::test]
    async fn test_fork_through_handle() {
        let store = test_handle();
        let parent = store.create_session("/p".into()).await.unwrap();
        let child = store.fork_session(parent.clone(), true).await.unwrap();

        let child_row = store.get_session(child.clone()).await.unwrap().unwrap();
        assert_eq!(child_row.forked_from_session_id.as_deref(), Some(parent.as_str()));
        assert_eq!(child_row.folder_path, "/p");

        let lineage = store.get_lineage(child.clone()).await.unwrap();
        assert_eq!(lineage, vec![child, parent]);
    }

    #[tokio::test]
    async fn test_set_flag_through_handle() {
        let store = test_handle();
        let id = store.create_session("/p".into()).await.unwrap();
        store
            .set_flag(id.clone(), SessionFlag::Pinned, true)
            .await
            .unwrap();
        store
            .set_flag(id.clone(), SessionFlag::Archived, true)
            .await
            .unwrap();

        let row = store.get_session(id).await.unwrap().unwrap();
        assert!(row.is_pinned);
        assert!(row.archived);
        assert!(!row.is_hidden);
    }

    #[tokio::test]
    async fn test_missing_session_error_crosses_handle() {
        let store = test_handle();
        let err = store
            .upsert_metadata("ghost".into(), MetadataDelta::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
