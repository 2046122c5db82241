//! I/O for the orchestrator: files, Task Memory, transport, workers.

pub mod acceptance;
pub mod config;
pub mod context_builder;
pub mod design;
pub mod hashing;
pub mod observer;
pub mod report;
pub mod task_memory;
pub mod transport;
pub mod worker;
