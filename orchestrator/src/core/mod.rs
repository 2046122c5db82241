//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod acceptance;
pub mod budget;
pub mod graph;
pub mod invariants;
pub mod ledger;
pub mod stage;
pub mod transitions;
pub mod types;
