// src/stream/decoder.rs — stream-json decoder for one agent process
//
// Reads the agent's stdout line by line, turns records into SessionEvents,
// records checkpoints, accumulates usage, and persists the totals when the
// stream closes. A bad line is logged and skipped; it never ends the stream.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::lines::{LineReader, DEFAULT_MAX_LINE_BYTES};
use super::protocol::{self, AgentRecord, ContentBlock, SYSTEM_INIT};
use crate::infra::errors::DeckError;
use crate::infra::session::MetadataDelta;
use crate::memory::StoreHandle;
use crate::process::checkpoints::CheckpointLedger;
use crate::process::events::{EventSink, SessionEvent, TokenTotals};

/// Notified when the agent announces its session id. The decoder waits for
/// the hook before reading the next line.
#[async_trait]
pub trait IdentityHook: Send + Sync {
    async fn session_identified(&self, session_id: &str);
}

/// Hook that does nothing.
pub struct NoIdentityHook;

#[async_trait]
impl IdentityHook for NoIdentityHook {
    async fn session_identified(&self, _session_id: &str) {}
}

/// Usage accumulated over one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: Option<String>,
}

impl StreamTotals {
    pub fn tokens(&self) -> TokenTotals {
        TokenTotals {
            input: self.input_tokens,
            output: self.output_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }

    fn to_delta(&self) -> MetadataDelta {
        MetadataDelta {
            input_tokens: i64::try_from(self.input_tokens).unwrap_or(i64::MAX),
            output_tokens: i64::try_from(self.output_tokens).unwrap_or(i64::MAX),
            cost_usd: self.cost_usd,
            model: self.model.clone(),
        }
    }
}

pub struct StreamDecoder {
    session_id: String,
    checkpoints: Arc<CheckpointLedger>,
    sink: Arc<dyn EventSink>,
    store: Option<StoreHandle>,
    identity: Arc<dyn IdentityHook>,
    totals: StreamTotals,
    result_seen: bool,
    max_line: usize,
}

impl StreamDecoder {
    pub fn new(
        session_id: impl Into<String>,
        checkpoints: Arc<CheckpointLedger>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            checkpoints,
            sink,
            store: None,
            identity: Arc::new(NoIdentityHook),
            totals: StreamTotals::default(),
            result_seen: false,
            max_line: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Persist totals to this store when the stream closes.
    pub fn with_store(mut self, store: StoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    /// Cut lines longer than `max` bytes.
    pub fn with_max_line(mut self, max: usize) -> Self {
        self.max_line = max;
        self
    }

    pub fn with_identity_hook(mut self, hook: Arc<dyn IdentityHook>) -> Self {
        self.identity = hook;
        self
    }

    /// The session id used for emissions (a placeholder until `init`).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn totals(&self) -> &StreamTotals {
        &self.totals
    }

    pub fn result_seen(&self) -> bool {
        self.result_seen
    }

    /// Read `reader` to the end, then close the stream. Returns the totals.
    pub async fn run<R: AsyncRead + Unpin>(self, reader: R) -> StreamTotals {
        self.run_until(reader, std::future::pending()).await
    }

    /// Like `run`, but stops reading once `stop` resolves, even if the pipe
    /// is still open (a grandchild can hold it after the agent exits).
    pub async fn run_until<R, F>(mut self, reader: R, stop: F) -> StreamTotals
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = LineReader::with_max_line(reader, self.max_line);
        tokio::pin!(stop);
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut stop => {
                    warn!("Agent output for {} still open after exit, closing", self.session_id);
                    break;
                }
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("Reading agent output for {} failed: {}", self.session_id, e);
                    self.emit(SessionEvent::Error {
                        session_id: self.session_id.clone(),
                        message: format!("Failed to read agent output: {e}"),
                    });
                    break;
                }
            }
        }
        self.finish().await
    }

    /// Decode and apply a single line.
    pub async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match protocol::decode_line(line) {
            Ok(record) => self.handle_record(record).await,
            Err(e) => warn!(
                "Skipping malformed agent output line for {}: {} ({})",
                self.session_id,
                e,
                preview(line)
            ),
        }
    }

    async fn handle_record(&mut self, record: AgentRecord) {
        match record {
            AgentRecord::System(sys) => {
                if sys.subtype != SYSTEM_INIT {
                    debug!("Ignoring system record with subtype {:?}", sys.subtype);
                    return;
                }
                let Some(announced) = sys.session_id.clone().filter(|s| !s.is_empty()) else {
                    warn!("init record without a session id");
                    return;
                };
                self.session_id = announced;
                self.identity.session_identified(&self.session_id).await;
                self.emit(SessionEvent::Init {
                    session_id: self.session_id.clone(),
                    tools: sys.tool_names(),
                });
            }
            AgentRecord::User(user) => {
                if let Some(uuid) = user.uuid.as_deref() {
                    self.checkpoints.add(&self.session_id, uuid);
                    self.emit(SessionEvent::User {
                        session_id: self.session_id.clone(),
                        uuid: uuid.to_string(),
                        text: user.message.content.text(),
                    });
                }
                for block in user.message.content.blocks() {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        self.emit_tool_result(tool_use_id, content.clone(), *is_error);
                    }
                }
            }
            AgentRecord::Assistant(assistant) => {
                let message = assistant.message;
                if self.totals.model.is_none() {
                    self.totals.model = message.model.filter(|m| !m.is_empty());
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.emit(SessionEvent::Chunk {
                            session_id: self.session_id.clone(),
                            role: "text".into(),
                            text,
                        }),
                        ContentBlock::ToolUse { id, name, input } => {
                            self.emit(SessionEvent::ToolUse {
                                session_id: self.session_id.clone(),
                                id,
                                name,
                                input,
                            })
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => self.emit_tool_result(&tool_use_id, content, is_error),
                        ContentBlock::Other => {}
                    }
                }
                if let Some(usage) = message.usage {
                    self.totals.input_tokens =
                        self.totals.input_tokens.saturating_add(usage.input_tokens);
                    self.totals.output_tokens =
                        self.totals.output_tokens.saturating_add(usage.output_tokens);
                }
            }
            AgentRecord::ToolResult(result) => {
                self.emit_tool_result(&result.tool_use_id, result.content, result.is_error);
            }
            AgentRecord::Result(result) => {
                if self.result_seen {
                    debug!("Ignoring duplicate result for {}", self.session_id);
                    return;
                }
                self.result_seen = true;
                self.totals.cost_usd = result.cost();
                self.emit(SessionEvent::Result {
                    session_id: self.session_id.clone(),
                    success: result.is_success(),
                    duration_ms: result.duration_ms,
                    cost_usd: self.totals.cost_usd,
                    tokens: self.totals.tokens(),
                });
            }
            AgentRecord::Other => debug!("Ignoring unrecognized agent record"),
        }
    }

    /// End of stream: persist totals, drop checkpoints, emit `close`.
    pub async fn finish(self) -> StreamTotals {
        if !self.totals.is_empty() {
            self.persist_totals().await;
        }
        self.checkpoints.clear(&self.session_id);
        self.emit(SessionEvent::Close {
            session_id: self.session_id.clone(),
        });
        self.totals
    }

    async fn persist_totals(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store
            .upsert_metadata(self.session_id.clone(), self.totals.to_delta())
            .await;
        match result {
            Ok(()) => debug!(
                "Recorded {} in / {} out tokens, ${:.4} for {}",
                self.totals.input_tokens,
                self.totals.output_tokens,
                self.totals.cost_usd,
                self.session_id
            ),
            Err(e) => match e.downcast_ref::<DeckError>() {
                Some(DeckError::SessionNotFound { .. }) => warn!(
                    "Session {} is not in storage; usage not recorded",
                    self.session_id
                ),
                _ => warn!("Failed to record usage for {}: {}", self.session_id, e),
            },
        }
    }

    fn emit_tool_result(&self, tool_use_id: &str, content: serde_json::Value, is_error: bool) {
        self.emit(SessionEvent::ToolResult {
            session_id: self.session_id.clone(),
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error,
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.sink.emit(event);
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 120;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_string(),
    }
}
