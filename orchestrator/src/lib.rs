//! Distributed saga orchestrator for a hardware verification pipeline.
//!
//! Every design node walks a fixed pipeline (implement, lint, testbench,
//! testbench lint, simulate, accept) with repair loops driven by debug
//! rounds. The crate keeps the same split as any deterministic runner:
//!
//! - **[`core`]**: pure logic (stage keys, transition table, retry ledger,
//!   dependency graph, acceptance comparisons). No I/O.
//! - **[`io`]**: side effects (documents, Task Memory, transport, workers,
//!   observers, reports).
//!
//! [`engine`] applies results to the state machine, [`run_loop`] drives it,
//! and [`start`] assembles both for a run.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod messages;
pub mod run_loop;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
