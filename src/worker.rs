//! Test runner: executes one job against the module its suite references.

use std::io::{BufRead, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::bytecode::{LoadError, Module};
use crate::interpreter::{Budget, Interpreter};
use crate::suite::{CaseOutcome, TestCase, TestSuite};
use crate::wire::{self, TestDescription, WireError};

/// Step cap for jobs without a time budget, so a hanging mutant still ends.
pub const UNBUDGETED_STEP_LIMIT: u64 = 50_000_000;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("no test named '{0}' in suite")]
    UnknownTest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub tests_pass: bool,
    pub exited_in_time: bool,
}

/// Run `job` and fill in its result fields. Setup failures land in
/// `job.error` with a failed verdict.
pub fn run_job(job: &mut TestDescription) {
    let started = Instant::now();
    match execute(job) {
        Ok(verdict) => {
            job.tests_pass = verdict.tests_pass;
            job.exited_in_time = verdict.exited_in_time;
            job.error = None;
        }
        Err(e) => {
            log::warn!("job {} could not run: {}", job.uid, e);
            job.tests_pass = false;
            job.exited_in_time = true;
            job.error = Some(e.to_string());
        }
    }
    job.elapsed_ms = Some(started.elapsed().as_millis() as u64);
}

fn execute(job: &TestDescription) -> Result<Verdict, WorkerError> {
    let suite_path = Path::new(&job.assembly_path);
    let suite = TestSuite::load(suite_path)?;
    let module = Module::load(&suite.module_path(suite_path)?, false)?;

    let cases: Vec<&TestCase> = if job.tests_to_run.is_empty() {
        suite.tests.iter().collect()
    } else {
        job.tests_to_run
            .iter()
            .map(|name| suite.test(name).ok_or_else(|| WorkerError::UnknownTest(name.clone())))
            .collect::<Result<_, _>>()?
    };

    let budget = if job.time_budget_ms == 0 {
        Budget {
            deadline: None,
            max_steps: Some(UNBUDGETED_STEP_LIMIT),
        }
    } else {
        Budget {
            deadline: Some(Instant::now() + Duration::from_millis(job.time_budget_ms)),
            max_steps: None,
        }
    };
    let mut interpreter = Interpreter::new(&module, budget);

    for case in cases {
        match case.run(&mut interpreter) {
            CaseOutcome::Passed => {}
            CaseOutcome::Failed(reason) => {
                log::debug!("{} failed: {}", case.name, reason);
                return Ok(Verdict {
                    tests_pass: false,
                    exited_in_time: true,
                });
            }
            CaseOutcome::Cancelled => {
                log::debug!("{} ran out of budget after {} steps", case.name, interpreter.steps());
                return Ok(Verdict {
                    tests_pass: false,
                    exited_in_time: false,
                });
            }
        }
    }
    Ok(Verdict {
        tests_pass: true,
        exited_in_time: true,
    })
}

/// Answer jobs until the inbound stream closes.
pub fn serve<R: BufRead + ?Sized, W: Write + ?Sized>(
    input: &mut R,
    output: &mut W,
) -> Result<(), WireError> {
    loop {
        let mut job: TestDescription = match wire::read_frame(input) {
            Ok(job) => job,
            Err(WireError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        run_job(&mut job);
        wire::write_frame(output, &job)?;
    }
}
