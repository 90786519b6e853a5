// src/process/events.rs — Session events and the sinks that receive them

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Token totals carried by a terminal `result` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

/// Everything the core publishes about a live session. The `session_id` is
/// whichever key the stream knows at emission time (a placeholder until the
/// agent announces its real id).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Init {
        session_id: String,
        tools: Vec<String>,
    },
    User {
        session_id: String,
        uuid: String,
        text: String,
    },
    Chunk {
        session_id: String,
        role: String,
        text: String,
    },
    ToolUse {
        session_id: String,
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        session_id: String,
        tool_use_id: String,
        content: serde_json::Value,
        is_error: bool,
    },
    /// Protocol-level completion. At most one per stream.
    Result {
        session_id: String,
        success: bool,
        duration_ms: Option<u64>,
        cost_usd: f64,
        tokens: TokenTotals,
    },
    /// Output could not be read. The stream still closes normally.
    Error {
        session_id: String,
        message: String,
    },
    Close {
        session_id: String,
    },
    /// Process-level completion. Exactly one per spawned process.
    Complete {
        session_id: String,
        success: bool,
        error: Option<String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Init { session_id, .. }
            | SessionEvent::User { session_id, .. }
            | SessionEvent::Chunk { session_id, .. }
            | SessionEvent::ToolUse { session_id, .. }
            | SessionEvent::ToolResult { session_id, .. }
            | SessionEvent::Result { session_id, .. }
            | SessionEvent::Error { session_id, .. }
            | SessionEvent::Close { session_id }
            | SessionEvent::Complete { session_id, .. } => session_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, SessionEvent::Complete { .. })
    }
}

/// Where the core publishes events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Fan-out sink backed by a tokio broadcast channel.
pub struct BroadcastSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine: nobody is watching this session.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory. Useful for embedding and tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::Result {
            session_id: "s1".into(),
            success: true,
            duration_ms: Some(1200),
            cost_usd: 0.05,
            tokens: TokenTotals {
                input: 300,
                output: 150,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["tokens"]["input"], 300);
        assert_eq!(json["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(SessionEvent::Close {
            session_id: "s1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::default();
        sink.emit(SessionEvent::Close {
            session_id: "s1".into(),
        });
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.emit(SessionEvent::Close {
            session_id: "a".into(),
        });
        sink.emit(SessionEvent::Complete {
            session_id: "a".into(),
            success: true,
            error: None,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_complete());
    }
}
