//! Mutation test orchestration: baseline, test resolution, mutant
//! generation, dispatch and verdict recording.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use thiserror::Error;

use crate::bytecode::{LoadError, Module};
use crate::config::{ConfigError, MutationConfig};
use crate::copy_tree::Materializer;
use crate::dispatcher::{DispatchError, TestExecutor};
use crate::mutants::{Mutant, MutantResult, MutantStatus};
use crate::report::{AppliedMutant, MutationReport};
use crate::suite::TestSuite;
use crate::turtles::MaterializeError;
use crate::wire::TestDescription;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("tests fail before mutation: {0}")]
    BaselineFailed(String),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("tool failure while testing mutant '{mutant}': {detail}")]
    ToolFailure { mutant: String, detail: String },
    #[error("method '{method}' not found or has no body. Available: {available}")]
    UnknownMethod { method: String, available: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodOutcome {
    /// No test exercises the method; nothing was mutated.
    NoTests,
    Tested {
        tests: Vec<String>,
        baseline_ms: u64,
        time_budget_ms: u64,
        mutants: usize,
    },
}

#[derive(Debug, Clone)]
pub struct MethodReport {
    pub method: String,
    pub outcome: MethodOutcome,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub methods: Vec<MethodReport>,
    pub results: Vec<MutantResult>,
    pub score: f64,
    pub passed: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn count(&self, status: MutantStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn killed(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_killed()).count()
    }

    pub fn survived(&self) -> usize {
        self.count(MutantStatus::Survived)
    }

    pub fn methods_without_tests(&self) -> Vec<&str> {
        self.methods
            .iter()
            .filter(|m| m.outcome == MethodOutcome::NoTests)
            .map(|m| m.method.as_str())
            .collect()
    }
}

/// A passing run attempted at least one mutant and either killed them all
/// or reached `min_score`.
pub fn passes(attempted: usize, killed: usize, min_score: Option<f64>) -> bool {
    if attempted == 0 {
        return false;
    }
    let score = killed as f64 / attempted as f64;
    killed == attempted || min_score.is_some_and(|min| score >= min)
}

/// Run the unmutated tests once and return how long they took.
pub fn run_baseline(
    executor: &dyn TestExecutor,
    suite_path: &Path,
    tests: &[String],
    time_budget_ms: u64,
) -> Result<u64, MutationError> {
    let started = Instant::now();
    let job = TestDescription::new(suite_path.to_string_lossy(), tests.to_vec(), time_budget_ms);
    executor.submit(job)?;
    let verdict = executor.next_result()?;
    if let Some(error) = verdict.error {
        return Err(MutationError::BaselineFailed(error));
    }
    if !verdict.exited_in_time {
        return Err(MutationError::BaselineFailed(format!(
            "tests did not finish within {} ms",
            time_budget_ms
        )));
    }
    if !verdict.tests_pass {
        let scope = if tests.is_empty() {
            "the full suite".to_string()
        } else {
            tests.join(", ")
        };
        return Err(MutationError::BaselineFailed(format!("failing tests in {}", scope)));
    }
    Ok(verdict
        .elapsed_ms
        .unwrap_or_else(|| started.elapsed().as_millis() as u64))
}

fn selected_methods(
    config: &MutationConfig,
    module: &Module,
) -> Result<Vec<String>, MutationError> {
    let available = module.mutable_methods();
    if config.methods.is_empty() {
        return Ok(available);
    }
    for method in &config.methods {
        if !available.contains(method) {
            return Err(MutationError::UnknownMethod {
                method: method.clone(),
                available: available.join(", "),
            });
        }
    }
    Ok(config.methods.clone())
}

/// Wait for one verdict and pair it with the yield index of the mutant that
/// produced it.
fn collect_one(
    executor: &dyn TestExecutor,
    in_flight: &mut HashMap<String, (usize, Mutant)>,
    verdicts: &mut Vec<(usize, MutantResult)>,
) -> Result<(), MutationError> {
    let verdict = executor.next_result()?;
    let Some((yielded, mutant)) = in_flight.remove(&verdict.uid) else {
        log::warn!("ignoring verdict for unknown job {}", verdict.uid);
        return Ok(());
    };
    if let Some(detail) = verdict.error {
        return Err(MutationError::ToolFailure {
            mutant: mutant.description.clone(),
            detail,
        });
    }
    let status = MutantStatus::from_verdict(verdict.tests_pass, verdict.exited_in_time);
    log::debug!("{} {}: {:?}", mutant.method, mutant.description, status);
    let result = MutantResult::new(&mutant, status, verdict.elapsed_ms.unwrap_or(0));
    verdicts.push((yielded, result));
    // Dropping the mutant removes its scratch directory.
    Ok(())
}

/// Record one turtle's verdicts in the order its mutants were yielded.
fn record_in_yield_order(
    mut verdicts: Vec<(usize, MutantResult)>,
    report: &MutationReport,
    results: &mut Vec<MutantResult>,
) {
    verdicts.sort_by_key(|(yielded, _)| *yielded);
    for (_, result) in verdicts {
        report.add_result(
            &result.method,
            result.sequence_point.as_ref(),
            AppliedMutant {
                description: result.description.clone(),
                generic_description: result.generic_description.to_string(),
                killed: result.status.is_killed(),
            },
        );
        results.push(result);
    }
}

pub fn run_mutation_tests(
    config: &MutationConfig,
    executor: &dyn TestExecutor,
    report: &MutationReport,
) -> Result<RunOutcome, MutationError> {
    config.validate()?;
    let started = Instant::now();

    let suite = TestSuite::load(&config.suite_path)?;
    let module_rel = suite.module_rel()?;
    let mut module = Module::load(&suite.module_path(&config.suite_path)?, config.load_symbols)?;
    module.simplify();
    let methods = selected_methods(config, &module)?;

    run_baseline(executor, &config.suite_path, &[], config.baseline_timeout_ms)?;

    let materializer = Materializer::new(&config.suite_path, &module_rel, &config.session)
        .with_scratch_root(config.scratch_root.clone());
    let window = config.window();
    let mut reports = Vec::with_capacity(methods.len());
    let mut results = Vec::new();

    for method in methods {
        let tests = suite.resolve_tests(&module, &method);
        if tests.is_empty() {
            log::info!("{}: no tests found", method);
            report.add_method_without_tests(&method);
            reports.push(MethodReport {
                method,
                outcome: MethodOutcome::NoTests,
            });
            continue;
        }

        let baseline_ms =
            run_baseline(executor, &config.suite_path, &tests, config.baseline_timeout_ms)?;
        let time_budget_ms = config.time_budget_ms(baseline_ms);
        log::info!(
            "{}: {} tests, baseline {} ms, budget {} ms",
            method,
            tests.len(),
            baseline_ms,
            time_budget_ms
        );

        let first = results.len();
        for kind in &config.turtles {
            let strategy = kind.strategy();
            let Some(stream) = strategy.mutate(&mut module, &method, &materializer) else {
                continue;
            };
            let mut in_flight: HashMap<String, (usize, Mutant)> = HashMap::new();
            let mut verdicts = Vec::new();
            for (yielded, mutant) in stream.enumerate() {
                let mutant = mutant?;
                let job = TestDescription::new(
                    mutant.scratch.suite_path.to_string_lossy(),
                    tests.clone(),
                    time_budget_ms,
                );
                in_flight.insert(job.uid.clone(), (yielded, mutant));
                executor.submit(job)?;
                while in_flight.len() >= window {
                    collect_one(executor, &mut in_flight, &mut verdicts)?;
                }
            }
            while !in_flight.is_empty() {
                collect_one(executor, &mut in_flight, &mut verdicts)?;
            }
            record_in_yield_order(verdicts, report, &mut results);
        }

        reports.push(MethodReport {
            method,
            outcome: MethodOutcome::Tested {
                tests,
                baseline_ms,
                time_budget_ms,
                mutants: results.len() - first,
            },
        });
    }

    let attempted = results.len();
    let killed = results.iter().filter(|r| r.status.is_killed()).count();
    let score = if attempted > 0 {
        killed as f64 / attempted as f64
    } else {
        1.0
    };
    Ok(RunOutcome {
        methods: reports,
        results,
        score,
        passed: passes(attempted, killed, config.min_score),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
