mod common;

use std::path::Path;

use mutator::config::{ConfigError, Isolation, MutationConfig};
use mutator::dispatcher::{DispatchError, InlineExecutor, TestExecutor};
use mutator::mutants::MutantStatus;
use mutator::report::MutationReport;
use mutator::runner::{self, MethodOutcome, MutationError};
use mutator::turtles::TurtleKind;
use mutator::wire::TestDescription;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

struct Project {
    dir: TempDir,
    scratch: TempDir,
    suite: std::path::PathBuf,
}

fn project(add_case: (i64, i64, i64)) -> Project {
    let dir = TempDir::new().unwrap();
    let suite = common::write_project(dir.path(), common::suite_json(add_case));
    Project {
        dir,
        scratch: TempDir::new().unwrap(),
        suite,
    }
}

fn config(project: &Project, methods: &[&str], turtles: &[TurtleKind]) -> MutationConfig {
    let mut config = MutationConfig::new(&project.suite);
    config.methods = methods.iter().map(|m| m.to_string()).collect();
    config.turtles = turtles.to_vec();
    config.isolation = Isolation::InProcess;
    config.scratch_root = Some(project.scratch.path().to_path_buf());
    config
}

/// Runs jobs inline but reports a tool failure for anything outside `suite`.
struct BrokenMutantRuns {
    inner: InlineExecutor,
    suite: String,
}

impl TestExecutor for BrokenMutantRuns {
    fn submit(&self, mut job: TestDescription) -> Result<(), DispatchError> {
        if job.assembly_path != self.suite {
            job.assembly_path = "/nonexistent/suite.json".into();
        }
        self.inner.submit(job)
    }

    fn next_result(&self) -> Result<TestDescription, DispatchError> {
        self.inner.next_result()
    }
}

/// Hands back the newest verdict first, like a pool finishing out of order.
#[derive(Default)]
struct NewestFirst {
    inner: InlineExecutor,
    done: Mutex<Vec<TestDescription>>,
}

impl TestExecutor for NewestFirst {
    fn submit(&self, job: TestDescription) -> Result<(), DispatchError> {
        self.inner.submit(job)?;
        let verdict = self.inner.next_result()?;
        self.done.lock().push(verdict);
        Ok(())
    }

    fn next_result(&self) -> Result<TestDescription, DispatchError> {
        self.done.lock().pop().ok_or(DispatchError::Idle)
    }
}

/// Two methods with identical `a + b` bodies and a test for each.
fn twin_project(dir: &Path) -> std::path::PathBuf {
    let body = json!({
        "instructions": [
            { "offset": 0, "opcode": "ldarg.0", "sequence_point": {
                "document": "Twin.cs", "start_line": 1, "start_column": 1, "end_line": 1, "end_column": 10
            } },
            { "offset": 1, "opcode": "ldarg.1" },
            { "offset": 2, "opcode": "add" },
            { "offset": 3, "opcode": "ret" }
        ]
    });
    let method = |name: &str| {
        json!({
            "name": name,
            "parameters": [ { "name": "a", "ty": "int64" }, { "name": "b", "ty": "int64" } ],
            "returns": "int64",
            "body": body.clone()
        })
    };
    let module = json!({ "name": "Twin", "methods": [method("A"), method("B")] });
    let suite = json!({
        "module": "bin/Twin.json",
        "tests": [
            { "name": "ATest", "steps": [ { "call": "A", "args": [3, 4], "expect": 7 } ] },
            { "name": "BTest", "steps": [ { "call": "B", "args": [3, 4], "expect": 7 } ] }
        ]
    });
    std::fs::create_dir_all(dir.join("bin")).unwrap();
    std::fs::write(dir.join("bin/Twin.json"), module.to_string()).unwrap();
    let suite_path = dir.join("Twin.tests.json");
    std::fs::write(&suite_path, suite.to_string()).unwrap();
    suite_path
}

// --- Pass criterion ---

#[test]
fn passes_requires_attempted_mutants() {
    assert!(!runner::passes(0, 0, None));
    assert!(!runner::passes(0, 0, Some(0.0)));
    assert!(runner::passes(4, 4, None));
    assert!(!runner::passes(4, 3, None));
    assert!(runner::passes(4, 3, Some(0.75)));
    assert!(!runner::passes(4, 3, Some(0.8)));
}

// --- Orchestration ---

#[test]
fn weak_test_lets_subtraction_survive() {
    // 3 - 0 == 3 == 3 + 0
    let project = project((3, 0, 3));
    let report = MutationReport::new();
    let outcome = runner::run_mutation_tests(
        &config(&project, &["Add"], &[TurtleKind::Arithmetic]),
        &InlineExecutor::new(),
        &report,
    )
    .unwrap();

    assert_eq!(outcome.attempted(), 4);
    let survivors: Vec<_> = outcome
        .results
        .iter()
        .filter(|r| r.status == MutantStatus::Survived)
        .map(|r| r.description.as_str())
        .collect();
    assert_eq!(survivors, vec!["0002: add => sub"]);
    assert_eq!(outcome.killed(), 3);
    assert!((outcome.score - 0.75).abs() < 1e-9);
    assert!(!outcome.passed);

    let summary = report.summary();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.killed, 3);
    let document = report.to_document();
    assert_eq!(document.source_files[0].url, "Calc.cs");
    assert_eq!(document.source_files[0].sequence_points[0].span.start_line, 10);
}

#[test]
fn strong_test_kills_every_arithmetic_mutant() {
    let project = project((3, 4, 7));
    let report = MutationReport::new();
    let outcome = runner::run_mutation_tests(
        &config(&project, &["Add"], &[TurtleKind::Arithmetic]),
        &InlineExecutor::new(),
        &report,
    )
    .unwrap();
    assert_eq!(outcome.attempted(), 4);
    assert_eq!(outcome.killed(), 4);
    assert!(outcome.passed);
    match &outcome.methods[0].outcome {
        MethodOutcome::Tested {
            tests,
            baseline_ms,
            time_budget_ms,
            mutants,
        } => {
            assert_eq!(tests, &vec!["AddTest".to_string()]);
            assert_eq!(*mutants, 4);
            // budget is the scaled baseline plus the grace period
            assert!(*time_budget_ms >= baseline_ms + 2000);
        }
        MethodOutcome::NoTests => panic!("Add has a test"),
    }
}

#[test]
fn min_score_accepts_survivors() {
    let project = project((3, 0, 3));
    let mut settings = config(&project, &["Add"], &[TurtleKind::Arithmetic]);
    settings.min_score = Some(0.7);
    let outcome = runner::run_mutation_tests(&settings, &InlineExecutor::new(), &MutationReport::new()).unwrap();
    assert!(outcome.passed);
}

#[test]
fn untested_method_is_recorded_and_not_mutated() {
    let project = project((3, 4, 7));
    let report = MutationReport::new();
    let outcome = runner::run_mutation_tests(
        &config(&project, &["Mask"], &[TurtleKind::Bitwise]),
        &InlineExecutor::new(),
        &report,
    )
    .unwrap();
    assert_eq!(outcome.attempted(), 0);
    assert_eq!(outcome.methods_without_tests(), vec!["Mask"]);
    assert_eq!(report.methods_without_tests(), vec!["Mask"]);
    assert!(report.is_empty());
    // nothing attempted is not a pass
    assert!(!outcome.passed);
}

#[test]
fn declared_coverage_selects_tests() {
    let project = project((3, 4, 7));
    let outcome = runner::run_mutation_tests(
        &config(&project, &["Double"], &[TurtleKind::Arithmetic]),
        &InlineExecutor::new(),
        &MutationReport::new(),
    )
    .unwrap();
    match &outcome.methods[0].outcome {
        MethodOutcome::Tested { tests, mutants, .. } => {
            assert_eq!(tests, &vec!["DoubleTest".to_string()]);
            assert_eq!(*mutants, 4);
        }
        MethodOutcome::NoTests => panic!("Double has a covering test"),
    }
    assert_eq!(outcome.killed(), 4);
}

#[test]
fn scratch_copies_are_removed_after_verdicts() {
    let project = project((3, 0, 3));
    runner::run_mutation_tests(
        &config(&project, &["Add", "Max"], &TurtleKind::ALL),
        &InlineExecutor::new(),
        &MutationReport::new(),
    )
    .unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(project.scratch.path()).unwrap().collect();
    assert!(leftovers.is_empty());
    // the original module is untouched
    let original: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(project.dir.path().join("bin/Calc.json")).unwrap()).unwrap();
    assert_eq!(original, common::calc_json());
}

#[test]
fn every_selected_method_is_reported() {
    let project = project((3, 4, 7));
    let outcome = runner::run_mutation_tests(
        &config(&project, &[], &TurtleKind::ALL),
        &InlineExecutor::new(),
        &MutationReport::new(),
    )
    .unwrap();
    let names: Vec<_> = outcome.methods.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(names, vec!["Add", "Max", "Increment", "Double", "Mask"]);
    assert_eq!(outcome.methods_without_tests(), vec!["Mask"]);
    assert!(outcome.attempted() > 0);
    assert_eq!(outcome.attempted(), outcome.killed() + outcome.survived());
}

#[test]
fn identical_methods_without_symbols_keep_every_verdict() {
    let dir = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let mut settings = MutationConfig::new(twin_project(dir.path()));
    settings.turtles = vec![TurtleKind::Arithmetic];
    settings.isolation = Isolation::InProcess;
    settings.load_symbols = false;
    settings.scratch_root = Some(scratch.path().to_path_buf());
    let report = MutationReport::new();
    let outcome = runner::run_mutation_tests(&settings, &InlineExecutor::new(), &report).unwrap();
    assert_eq!(outcome.attempted(), 8);
    assert_eq!(report.len(), 8);
    assert_eq!(report.summary().total, 8);
    assert_eq!(report.to_document().source_files.len(), 2);
}

#[test]
fn results_follow_yield_order_when_verdicts_arrive_out_of_order() {
    let project = project((3, 0, 3));
    let mut settings = config(&project, &["Add"], &[TurtleKind::Arithmetic]);
    settings.isolation = Isolation::Pool;
    settings.pool_size = 4;
    settings.max_busy = 4;
    let report = MutationReport::new();
    let outcome = runner::run_mutation_tests(&settings, &NewestFirst::default(), &report).unwrap();

    let yielded = vec!["0002: add => sub", "0002: add => mul", "0002: add => div", "0002: add => rem"];
    let results: Vec<_> = outcome.results.iter().map(|r| r.description.as_str()).collect();
    assert_eq!(results, yielded);
    let document = report.to_document();
    let reported: Vec<_> = document.source_files[0].sequence_points[0]
        .applied_mutants
        .iter()
        .map(|m| m.description.as_str())
        .collect();
    assert_eq!(reported, yielded);
}

// --- Failures ---

#[test]
fn failing_baseline_stops_the_run() {
    let project = project((3, 4, 8));
    let err = runner::run_mutation_tests(
        &config(&project, &["Add"], &[TurtleKind::Arithmetic]),
        &InlineExecutor::new(),
        &MutationReport::new(),
    )
    .unwrap_err();
    assert!(matches!(err, MutationError::BaselineFailed(_)));
}

#[test]
fn unknown_or_bodiless_methods_are_rejected() {
    let project = project((3, 4, 7));
    for method in ["Nope", "Extern"] {
        let err = runner::run_mutation_tests(
            &config(&project, &[method], &[TurtleKind::Arithmetic]),
            &InlineExecutor::new(),
            &MutationReport::new(),
        )
        .unwrap_err();
        match err {
            MutationError::UnknownMethod { method: name, available } => {
                assert_eq!(name, method);
                assert!(available.contains("Add"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

#[test]
fn invalid_config_is_rejected_before_loading() {
    let mut settings = MutationConfig::new(Path::new("/nonexistent/suite.json"));
    settings.pool_size = 0;
    let err = runner::run_mutation_tests(&settings, &InlineExecutor::new(), &MutationReport::new()).unwrap_err();
    assert!(matches!(err, MutationError::Config(ConfigError::PoolSize)));
}

#[test]
fn missing_suite_is_a_load_error() {
    let scratch = TempDir::new().unwrap();
    let settings = MutationConfig::new(scratch.path().join("missing.json"));
    let err = runner::run_mutation_tests(&settings, &InlineExecutor::new(), &MutationReport::new()).unwrap_err();
    assert!(matches!(err, MutationError::Load(_)));
}

#[test]
fn worker_errors_abort_as_tool_failures() {
    let project = project((3, 4, 7));
    let executor = BrokenMutantRuns {
        inner: InlineExecutor::new(),
        suite: project.suite.to_string_lossy().into_owned(),
    };
    let err = runner::run_mutation_tests(
        &config(&project, &["Add"], &[TurtleKind::Arithmetic]),
        &executor,
        &MutationReport::new(),
    )
    .unwrap_err();
    assert!(matches!(err, MutationError::ToolFailure { ref mutant, .. } if mutant.starts_with("0002: add")));
}
