// src/lib.rs — Library root for agentdeck

pub mod cli;
pub mod infra;
pub mod memory;
pub mod process;
pub mod stream;
