// src/stream/mod.rs — Agent stdout protocol

pub mod decoder;
pub mod lines;
pub mod protocol;

pub use decoder::{IdentityHook, StreamDecoder, StreamTotals};
