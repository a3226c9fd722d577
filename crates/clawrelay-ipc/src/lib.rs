//! Filesystem command channel: agents drop JSON requests into
//! `data/ipc/<folder>/{messages,tasks}/` and the host carries them out.

pub mod commands;
pub mod processor;

pub use commands::{IpcError, IpcRequest, Requester};
pub use processor::{process_once, run_ipc_watcher, IpcStats};
