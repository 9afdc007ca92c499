mod common;

use std::io::{BufReader, Cursor};

use mutator::wire::{self, ControlCommand, Inbound, TestDescription, WireError, FRAME_END, FRAME_START};
use mutator::worker;
use serde_json::json;
use tempfile::TempDir;

fn framed(payloads: &[serde_json::Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        wire::write_frame(&mut out, payload).unwrap();
    }
    out
}

// --- Framing ---

#[test]
fn frame_is_three_lines() {
    let job = TestDescription::new("suite.json", vec!["AddTest".into()], 500);
    let mut out = Vec::new();
    wire::write_frame(&mut out, &job).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], FRAME_START);
    assert_eq!(lines[2], FRAME_END);
    let decoded: TestDescription = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(decoded, job);
}

#[test]
fn stray_lines_before_frame_are_skipped() {
    let job = TestDescription::new("suite.json", vec![], 0);
    let mut bytes = b"warning: something printed\n\n".to_vec();
    wire::write_frame(&mut bytes, &job).unwrap();
    let mut reader = Cursor::new(bytes);
    let decoded: TestDescription = wire::read_frame(&mut reader).unwrap();
    assert_eq!(decoded.uid, job.uid);
    assert!(matches!(
        wire::read_frame::<_, TestDescription>(&mut reader),
        Err(WireError::Closed)
    ));
}

#[test]
fn truncated_and_unterminated_frames_are_errors() {
    let mut reader = Cursor::new(format!("{}\n", FRAME_START).into_bytes());
    assert!(matches!(
        wire::read_frame::<_, serde_json::Value>(&mut reader),
        Err(WireError::Truncated)
    ));

    let mut reader = Cursor::new(format!("{}\n{{}}\nnot the end\n", FRAME_START).into_bytes());
    assert!(matches!(
        wire::read_frame::<_, serde_json::Value>(&mut reader),
        Err(WireError::MissingEnd(line)) if line == "not the end"
    ));

    let mut reader = Cursor::new(format!("{}\n{{oops\n{}\n", FRAME_START, FRAME_END).into_bytes());
    assert!(matches!(
        wire::read_frame::<_, serde_json::Value>(&mut reader),
        Err(WireError::Malformed(_))
    ));
}

#[test]
fn inbound_distinguishes_stop_from_jobs() {
    let stop = serde_json::to_value(Inbound::Command(ControlCommand::Stop)).unwrap();
    assert_eq!(stop, json!({ "command": "stop" }));

    let mut reader = Cursor::new(framed(&[
        json!({ "command": "stop" }),
        json!({ "uid": "42", "assembly_path": "x.json", "time_budget_ms": 10 }),
    ]));
    let first: Inbound = wire::read_frame(&mut reader).unwrap();
    assert_eq!(first, Inbound::Command(ControlCommand::Stop));
    let second: Inbound = wire::read_frame(&mut reader).unwrap();
    match second {
        Inbound::Job(job) => {
            assert_eq!(job.uid, "42");
            assert!(job.tests_to_run.is_empty());
            assert!(!job.tests_pass);
        }
        other => panic!("expected a job, got {:?}", other),
    }
}

#[test]
fn uids_are_unique() {
    let a = TestDescription::new("s", vec![], 0);
    let b = TestDescription::new("s", vec![], 0);
    assert_ne!(a.uid, b.uid);
    assert_eq!(a.uid.len(), 16);
}

#[test]
fn failed_verdict_keeps_identity() {
    let job = TestDescription::new("s.json", vec!["T".into()], 100);
    let failed = job.failed(false, Some("no worker".into()));
    assert_eq!(failed.uid, job.uid);
    assert_eq!(failed.tests_to_run, job.tests_to_run);
    assert!(!failed.tests_pass);
    assert!(!failed.exited_in_time);
    assert_eq!(failed.error.as_deref(), Some("no worker"));
}

// --- Worker ---

fn suite_path(dir: &TempDir, add_case: (i64, i64, i64)) -> String {
    common::write_project(dir.path(), common::suite_json(add_case))
        .to_string_lossy()
        .into_owned()
}

#[test]
fn passing_suite_reports_pass() {
    let dir = TempDir::new().unwrap();
    let mut job = TestDescription::new(suite_path(&dir, (3, 4, 7)), vec![], 5_000);
    worker::run_job(&mut job);
    assert!(job.tests_pass);
    assert!(job.exited_in_time);
    assert!(job.error.is_none());
    assert!(job.elapsed_ms.is_some());
}

#[test]
fn failing_test_reports_fail_in_time() {
    let dir = TempDir::new().unwrap();
    let mut job = TestDescription::new(suite_path(&dir, (3, 4, 8)), vec!["AddTest".into()], 5_000);
    worker::run_job(&mut job);
    assert!(!job.tests_pass);
    assert!(job.exited_in_time);
}

#[test]
fn only_requested_tests_run() {
    let dir = TempDir::new().unwrap();
    let mut job = TestDescription::new(suite_path(&dir, (3, 4, 8)), vec!["MaxTest".into()], 5_000);
    worker::run_job(&mut job);
    assert!(job.tests_pass);
}

#[test]
fn setup_failures_are_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let mut unknown = TestDescription::new(suite_path(&dir, (3, 4, 7)), vec!["Nope".into()], 0);
    worker::run_job(&mut unknown);
    assert!(!unknown.tests_pass);
    assert!(unknown.error.as_deref().unwrap().contains("Nope"));

    let mut missing = TestDescription::new(dir.path().join("missing.json").to_string_lossy(), vec![], 0);
    worker::run_job(&mut missing);
    assert!(!missing.tests_pass);
    assert!(missing.error.is_some());
}

#[test]
fn looping_test_exceeds_budget() {
    let dir = TempDir::new().unwrap();
    let mut module = common::calc_json();
    module["methods"].as_array_mut().unwrap().push(json!({
        "name": "Spin",
        "returns": "int64",
        "body": {
            "instructions": [
                { "offset": 0, "opcode": "nop" },
                { "offset": 1, "opcode": "br.s", "operand": { "target": 0 } }
            ]
        }
    }));
    std::fs::create_dir_all(dir.path().join("bin")).unwrap();
    std::fs::write(dir.path().join("bin/Calc.json"), module.to_string()).unwrap();
    let suite = dir.path().join("spin.tests.json");
    std::fs::write(
        &suite,
        json!({
            "module": "bin/Calc.json",
            "tests": [ { "name": "SpinTest", "steps": [ { "call": "Spin" } ] } ]
        })
        .to_string(),
    )
    .unwrap();

    let mut job = TestDescription::new(suite.to_string_lossy(), vec![], 50);
    worker::run_job(&mut job);
    assert!(!job.tests_pass);
    assert!(!job.exited_in_time);
}

#[test]
fn serve_answers_every_job_then_exits_on_close() {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, (3, 4, 7));
    let jobs = [
        TestDescription::new(path.clone(), vec!["AddTest".into()], 5_000),
        TestDescription::new(path, vec!["Missing".into()], 5_000),
    ];
    let mut input = Vec::new();
    for job in &jobs {
        wire::write_frame(&mut input, job).unwrap();
    }

    let mut output = Vec::new();
    worker::serve(&mut BufReader::new(Cursor::new(input)), &mut output).unwrap();

    let mut reader = Cursor::new(output);
    let first: TestDescription = wire::read_frame(&mut reader).unwrap();
    let second: TestDescription = wire::read_frame(&mut reader).unwrap();
    assert_eq!(first.uid, jobs[0].uid);
    assert!(first.tests_pass);
    assert_eq!(second.uid, jobs[1].uid);
    assert!(!second.tests_pass);
    assert!(second.error.is_some());
}
