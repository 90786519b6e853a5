// tests/process_test.rs — Integration test: agent processes against fake agent scripts

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use agentdeck::infra::config::Config;
use agentdeck::infra::errors::DeckError;
use agentdeck::memory::{in_memory_store, store_server::spawn_store_server, StoreHandle};
use agentdeck::process::{
    BroadcastSink, InstanceState, ProcessManager, SendRequest, SessionEvent,
};

const HAPPY_AGENT: &str = r#"#!/bin/sh
cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"real-1","tools":["Bash"]}'
echo '{"type":"user","uuid":"u1","message":{"role":"user","content":"hi"}}'
echo '{"type":"assistant","message":{"model":"m1","content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":3,"output_tokens":2}}}'
echo '{"type":"result","subtype":"success","cost_usd":0.01,"duration_ms":7}'
"#;

const SLOW_AGENT: &str = r#"#!/bin/sh
cat > /dev/null
exec sleep 30
"#;

const FAILING_AGENT: &str = r#"#!/bin/sh
cat > /dev/null
echo "boom" >&2
exit 3
"#;

/// Leaves a background child holding stdout and stderr open after exit.
const BACKGROUNDING_AGENT: &str = r#"#!/bin/sh
cat > /dev/null
sleep 8 &
echo '{"type":"system","subtype":"init","session_id":"bg-1","tools":[]}'
echo '{"type":"result","subtype":"success","cost_usd":0.0,"duration_ms":1}'
exit 0
"#;

/// Closes stdin before reading anything.
const DEAF_AGENT: &str = r#"#!/bin/sh
exec 0<&-
exec sleep 5
"#;

struct Harness {
    manager: ProcessManager,
    store: StoreHandle,
    events: broadcast::Receiver<SessionEvent>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("fake-agent");
        std::fs::write(&agent, script).unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.agent.executable = agent.to_string_lossy().into_owned();
        let (store, _join) = spawn_store_server(in_memory_store().unwrap());
        let sink = Arc::new(BroadcastSink::default());
        let events = sink.subscribe();
        let agent_dir = dir.path().join("agent-config");
        let manager = ProcessManager::new(config, store.clone(), sink)
            .with_spawner(|s| s.with_agent_config_dir(agent_dir));

        Self {
            manager,
            store,
            events,
            dir,
        }
    }

    fn folder(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    fn request(&self, session_id: Option<&str>, message: &str) -> SendRequest {
        SendRequest {
            session_id: session_id.map(str::to_string),
            folder_path: self.folder(),
            message: message.into(),
        }
    }

    /// Collect events up to and including the first `complete`.
    async fn until_complete(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        let collect = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        let done = event.is_complete();
                        seen.push(event);
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("agent run did not complete");
        seen
    }

    /// Collect events until both `close` and `complete` have been seen.
    async fn until_closed_and_complete(&mut self) -> Vec<SessionEvent> {
        let mut seen: Vec<SessionEvent> = Vec::new();
        let collect = async {
            loop {
                let closed = seen.iter().any(|e| matches!(e, SessionEvent::Close { .. }));
                if closed && seen.iter().any(|e| e.is_complete()) {
                    break;
                }
                match self.events.recv().await {
                    Ok(event) => seen.push(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("agent run did not close");
        seen
    }

    /// Everything already buffered on the event channel.
    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut rest = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            rest.push(event);
        }
        rest
    }
}

fn assert_dir_exists(path: &Path) {
    assert!(path.is_dir(), "{} should exist", path.display());
}

#[tokio::test]
async fn test_new_session_is_rekeyed_to_announced_id() {
    let mut h = Harness::new(HAPPY_AGENT);
    let outcome = h.manager.send_message(h.request(None, "hi")).await.unwrap();
    assert!(outcome.key.starts_with("pending-"));

    let events = h.until_complete().await;
    assert!(events.iter().all(|e| e.session_id() == "real-1"));
    assert!(matches!(&events[0], SessionEvent::Init { tools, .. } if tools == &vec!["Bash".to_string()]));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Chunk { text, .. } if text == "hello")));

    // result and close precede complete
    let n = events.len();
    assert!(matches!(events[n - 3], SessionEvent::Result { success: true, .. }));
    assert!(matches!(events[n - 2], SessionEvent::Close { .. }));
    assert!(matches!(
        events[n - 1],
        SessionEvent::Complete { success: true, error: None, .. }
    ));
    assert_eq!(
        events.iter().filter(|e| e.is_complete()).count(),
        1,
        "exactly one terminal event"
    );

    assert!(h.manager.active_sessions().is_empty());
    assert_eq!(h.manager.instance_state("real-1"), InstanceState::Idle);
    assert_eq!(h.manager.instance_state(&outcome.key), InstanceState::Idle);
    assert_eq!(outcome.handle.key(), "real-1");
    assert!(h.manager.checkpoints("real-1").is_empty());

    let session = h.store.get_session("real-1".into()).await.unwrap().unwrap();
    assert_eq!(session.folder_path, h.folder());
    let meta = h.store.get_metadata("real-1".into()).await.unwrap().unwrap();
    assert_eq!(meta.total_input_tokens, 3);
    assert_eq!(meta.total_output_tokens, 2);
    assert_eq!(meta.model.as_deref(), Some("m1"));
    assert_dir_exists(&h.dir.path().join("agent-config"));
}

#[tokio::test]
async fn test_second_send_while_running_is_busy() {
    let mut h = Harness::new(SLOW_AGENT);
    h.manager
        .send_message(h.request(Some("S1"), "first"))
        .await
        .unwrap();
    assert_eq!(h.manager.instance_state("S1"), InstanceState::Working);

    let err = h
        .manager
        .send_message(h.request(Some("S1"), "second"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeckError::Busy { .. }));
    assert!(err.to_string().contains("still being generated"));
    assert_eq!(h.manager.active_sessions(), vec!["S1".to_string()]);

    assert!(h.manager.abort("S1").await);
    let events = h.until_complete().await;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Complete { success: false, .. })
    ));
    assert!(!h.manager.is_active("S1"));
    assert_eq!(h.manager.instance_state("S1"), InstanceState::Idle);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let h = Harness::new(SLOW_AGENT);
    h.manager
        .send_message(h.request(Some("A"), "go"))
        .await
        .unwrap();
    h.manager
        .send_message(h.request(Some("B"), "go"))
        .await
        .unwrap();
    assert_eq!(h.manager.active_sessions().len(), 2);

    assert_eq!(h.manager.shutdown().await, 2);
    assert!(h.manager.active_sessions().is_empty());
}

#[tokio::test]
async fn test_nonzero_exit_reports_code_and_stderr() {
    let mut h = Harness::new(FAILING_AGENT);
    h.manager
        .send_message(h.request(Some("S2"), "go"))
        .await
        .unwrap();

    let events = h.until_complete().await;
    match events.last() {
        Some(SessionEvent::Complete {
            success: false,
            error: Some(error),
            ..
        }) => {
            assert!(error.contains("code 3"), "{error}");
            assert!(error.contains("boom"), "{error}");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert_eq!(h.manager.instance_state("S2"), InstanceState::Error);
    assert_eq!(h.manager.acknowledge_error("S2"), InstanceState::Idle);
}

#[tokio::test]
async fn test_background_child_does_not_hold_the_session() {
    let mut h = Harness::new(BACKGROUNDING_AGENT);
    let started = Instant::now();
    h.manager.send_message(h.request(None, "go")).await.unwrap();

    let events = h.until_complete().await;
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(5),
        "complete took {elapsed:?} with a background child alive"
    );

    let n = events.len();
    assert!(matches!(events[n - 2], SessionEvent::Close { .. }));
    assert!(matches!(
        events[n - 1],
        SessionEvent::Complete { success: true, .. }
    ));
    assert!(!h.manager.is_active("bg-1"));
    assert!(h.manager.active_sessions().is_empty());
    assert_eq!(h.manager.instance_state("bg-1"), InstanceState::Idle);
}

#[tokio::test]
async fn test_stdin_write_failure_reports_once() {
    let mut h = Harness::new(DEAF_AGENT);
    let message = "x".repeat(1024 * 1024);
    h.manager
        .send_message(h.request(Some("W1"), &message))
        .await
        .unwrap();

    let mut events = h.until_closed_and_complete().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    events.extend(h.drain());

    let completes: Vec<_> = events.iter().filter(|e| e.is_complete()).collect();
    assert_eq!(completes.len(), 1, "{events:?}");
    match completes[0] {
        SessionEvent::Complete {
            success: false,
            error: Some(error),
            session_id,
        } => {
            assert_eq!(session_id, "W1");
            assert!(error.contains("Failed to write message"), "{error}");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(!h.manager.is_active("W1"));
}
