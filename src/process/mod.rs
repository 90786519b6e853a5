// src/process/mod.rs — Agent process lifecycle

pub mod checkpoints;
pub mod events;
pub mod handle;
pub mod instance;
pub mod manager;
pub mod registry;
pub mod spawner;
pub mod stderr;

pub use events::{BroadcastSink, EventSink, RecordingSink, SessionEvent};
pub use handle::ProcessHandle;
pub use instance::{InstanceEvent, InstanceState};
pub use manager::{ProcessManager, SendOutcome, SendRequest};
