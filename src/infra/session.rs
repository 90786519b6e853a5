// src/infra/session.rs — Session records

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted conversation. `forked_from_session_id` links it to at most one
/// parent; root sessions leave it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub folder_path: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_accessed_at: Option<String>,
    pub archived: bool,
    pub is_pinned: bool,
    pub forked_from_session_id: Option<String>,
    pub is_hidden: bool,
}

impl Session {
    pub fn new(folder_path: &str) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), folder_path)
    }

    pub fn with_id(id: &str, folder_path: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: id.to_string(),
            folder_path: folder_path.to_string(),
            created_at: now.clone(),
            updated_at: now,
            last_accessed_at: None,
            archived: false,
            is_pinned: false,
            forked_from_session_id: None,
            is_hidden: false,
        }
    }

    /// A child of `parent` in the same folder.
    pub fn forked_from(parent_id: &str, folder_path: &str) -> Self {
        Self {
            forked_from_session_id: Some(parent_id.to_string()),
            ..Self::new(folder_path)
        }
    }

    pub fn is_fork(&self) -> bool {
        self.forked_from_session_id.is_some()
    }
}

/// Cumulative usage for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: f64,
    pub model: Option<String>,
    pub updated_at: Option<String>,
}

/// Usage accumulated over one stream, added onto `SessionMetadata`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataDelta {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub model: Option<String>,
}

impl MetadataDelta {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }
}

/// Replay instructions attached to a session created by a rewind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewindContext {
    pub session_id: String,
    pub checkpoint_uuid: String,
    pub new_message: String,
    pub created_at: String,
}
