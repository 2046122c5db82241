//! CLI tests for `vflow`.
//!
//! Spawns the binary in a fixture directory and checks exit codes and output.

use std::fs;
use std::process::Command;

use orchestrator::core::stage::{StageKey, StageKind};
use orchestrator::core::types::NodeState;
use orchestrator::exit_codes;
use orchestrator::io::task_memory::{JournalEntry, TaskMemory};
use orchestrator::test_support::DesignFixture;
use serde_json::json;

fn vflow(fixture: &DesignFixture) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vflow"));
    cmd.current_dir(fixture.root());
    cmd
}

#[test]
fn validate_accepts_a_sound_design() {
    let fixture = DesignFixture::new().node("top", &["alu"]).node("alu", &[]);
    let (dag, design) = fixture.write_inputs();

    let output = vflow(&fixture)
        .arg("validate")
        .arg("--dag")
        .arg(&dag)
        .arg("--design-context")
        .arg(&design)
        .output()
        .expect("vflow validate");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok: 2 nodes"), "{stdout}");
    assert!(stdout.contains("roots: alu"), "{stdout}");
}

#[test]
fn validate_rejects_a_cycle() {
    let fixture = DesignFixture::new().node("a", &["b"]).node("b", &["a"]);
    let (dag, design) = fixture.write_inputs();

    let output = vflow(&fixture)
        .arg("validate")
        .arg("--dag")
        .arg(&dag)
        .arg("--design-context")
        .arg(&design)
        .output()
        .expect("vflow validate");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("graph has no root nodes"), "{stderr}");
}

#[test]
fn gate_reports_failed_metrics() {
    let fixture = DesignFixture::new().node("alu", &[]).acceptance(
        "alu",
        json!({
            "acceptance_metrics": [{
                "metric_id": "mismatches",
                "operator": "==",
                "target_value": 0,
                "metric_source": "sim_log"
            }]
        }),
    );
    let (_, design) = fixture.write_inputs();
    let memory = TaskMemory::new(fixture.memory_root());
    let log = memory
        .stage_paths("alu", StageKey::attempted(StageKind::Sim, 1))
        .log_path;
    fs::create_dir_all(log.parent().expect("stage dir")).expect("create stage dir");
    fs::write(&log, "mismatches = 2\n").expect("write sim log");

    let output = vflow(&fixture)
        .arg("gate")
        .arg("--task-memory")
        .arg(fixture.memory_root())
        .arg("--design-context")
        .arg(&design)
        .arg("--rtl-root")
        .arg(fixture.rtl_root())
        .args(["--attempt", "1", "alu"])
        .output()
        .expect("vflow gate");

    assert_eq!(output.status.code(), Some(exit_codes::GATE_FAILED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Metric 'mismatches' failed"), "{stdout}");
}

#[test]
fn trail_renders_the_journal() {
    let fixture = DesignFixture::new().node("alu", &[]);
    let memory = TaskMemory::new(fixture.memory_root());
    memory
        .append_journal(
            "alu",
            &JournalEntry::now(NodeState::Failed, None, Some("stage lint failed".to_string())),
        )
        .expect("journal");

    let output = vflow(&fixture)
        .arg("trail")
        .arg("--task-memory")
        .arg(fixture.memory_root())
        .arg("alu")
        .output()
        .expect("vflow trail");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("# Audit trail: alu"), "{stdout}");
    assert!(stdout.contains("stage lint failed"), "{stdout}");
}
