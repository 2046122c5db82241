//! `vflow`: offline tooling around orchestrator runs.
//!
//! Validates run inputs, renders a node's audit trail from Task Memory, and
//! re-runs acceptance gating for a node without a broker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::exit_codes;
use orchestrator::io::acceptance::{AcceptanceGate, GateTarget, NO_CRITERIA_LOG};
use orchestrator::io::config::load_config;
use orchestrator::io::context_builder::ContextBuilder;
use orchestrator::io::design::load_design_context;
use orchestrator::io::report::render_trail;
use orchestrator::io::task_memory::TaskMemory;
use orchestrator::logging;
use orchestrator::start::RunInputs;

#[derive(Parser)]
#[command(
    name = "vflow",
    version,
    about = "Verification pipeline orchestrator tooling"
)]
struct Cli {
    /// Orchestrator config (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "vflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the DAG and design context against schemas and graph invariants.
    Validate {
        #[arg(long)]
        dag: PathBuf,
        #[arg(long)]
        design_context: PathBuf,
    },
    /// Print a node's audit trail (journal and per-stage logs) as Markdown.
    Trail {
        /// Task Memory root; defaults to `task_memory_root` from the config.
        #[arg(long)]
        task_memory: Option<PathBuf>,
        node_id: String,
    },
    /// Run acceptance gating for one node against Task Memory.
    Gate {
        #[arg(long)]
        task_memory: Option<PathBuf>,
        #[arg(long)]
        design_context: PathBuf,
        #[arg(long)]
        rtl_root: PathBuf,
        /// Attempt whose stage logs to gate; latest unattempted logs otherwise.
        #[arg(long)]
        attempt: Option<u32>,
        node_id: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate {
            dag,
            design_context,
        } => cmd_validate(&dag, &design_context),
        Command::Trail {
            task_memory,
            node_id,
        } => {
            let memory = task_memory_for(&cli.config, task_memory)?;
            print!("{}", render_trail(&memory, &node_id)?);
            Ok(exit_codes::OK)
        }
        Command::Gate {
            task_memory,
            design_context,
            rtl_root,
            attempt,
            node_id,
        } => cmd_gate(
            &cli.config,
            task_memory,
            &design_context,
            rtl_root,
            attempt,
            &node_id,
        ),
    }
}

fn cmd_validate(dag: &Path, design_context: &Path) -> Result<i32> {
    let inputs = RunInputs::load(dag, design_context, PathBuf::new())?;
    let problems = inputs.problems();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("- {problem}");
        }
        return Ok(exit_codes::INVALID);
    }
    let roots: Vec<&str> = inputs
        .dag
        .nodes
        .iter()
        .filter(|node| node.deps.is_empty())
        .map(|node| node.id.as_str())
        .collect();
    println!(
        "ok: {} nodes, design context {}, roots: {}",
        inputs.dag.nodes.len(),
        inputs.design.design_context_hash,
        roots.join(", ")
    );
    Ok(exit_codes::OK)
}

fn cmd_gate(
    config: &Path,
    task_memory: Option<PathBuf>,
    design_context: &Path,
    rtl_root: PathBuf,
    attempt: Option<u32>,
    node_id: &str,
) -> Result<i32> {
    let cfg = load_config(config)?;
    let memory = match task_memory {
        Some(root) => TaskMemory::new(root),
        None => TaskMemory::new(&cfg.task_memory_root),
    };
    let design = load_design_context(design_context)?;
    let criteria = design
        .node(node_id)
        .with_context(|| format!("node '{node_id}' is not in the design context"))?
        .acceptance()?;
    if criteria.is_empty() {
        println!("{NO_CRITERIA_LOG}");
        return Ok(exit_codes::OK);
    }
    let context = ContextBuilder::new(design, rtl_root).build(node_id)?;
    let mut target = GateTarget::from_context(&context);
    target.attempt = attempt;

    let gate = AcceptanceGate::new(memory, cfg.acceptance.relax_coverage_gating);
    let report = gate.evaluate(&target, &criteria)?;
    println!("{report}");
    Ok(if report.passed() {
        exit_codes::OK
    } else {
        exit_codes::GATE_FAILED
    })
}

fn task_memory_for(config: &Path, task_memory: Option<PathBuf>) -> Result<TaskMemory> {
    if let Some(root) = task_memory {
        return Ok(TaskMemory::new(root));
    }
    let cfg = load_config(config)?;
    Ok(TaskMemory::new(cfg.task_memory_root))
}
